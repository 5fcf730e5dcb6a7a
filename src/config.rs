// Copyright 2024 Mikael Lund
//
// Licensed under the Apache license, version 2.0 (the "license");
// you may not use this file except in compliance with the license.
// You may obtain a copy of the license at
//
//     http://www.apache.org/licenses/license-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the license is distributed on an "as is" basis,
// without warranties or conditions of any kind, either express or implied.
// See the license for the specific language governing permissions and
// limitations under the license.

//! YAML run configuration for the demo driver.
//!
//! Example:
//!
//! ```yaml
//! particles: 1000
//! types:
//!   - { name: rod, semi_axes: [1.5, 0.5, 0.5] }
//!   - { name: bead, semi_axes: [0.5, 0.5, 0.5] }
//! cutoff: 4.0
//! gpu_split: -1.0
//! neighbor_mode: host
//! ```

use crate::{backend::NeighborMode, form::FormMatrix};
use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Relative tolerance when comparing semi-axes
const SHAPE_TOLERANCE: f64 = 1e-9;

/// Particle type with its ellipsoid semi-axes
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParticleType {
    pub name: String,
    pub semi_axes: [f64; 3],
}

impl ParticleType {
    /// Spheres have three equal semi-axes
    pub fn is_ellipsoid(&self) -> bool {
        let [a, b, c] = self.semi_axes;
        let close = |x: f64, y: f64| (x - y).abs() <= SHAPE_TOLERANCE * x.abs().max(y.abs());
        !(close(a, b) && close(b, c))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub particles: usize,
    /// Particle types, numbered from 1 in the order given
    pub types: Vec<ParticleType>,
    /// Interaction cutoff
    pub cutoff: f64,
    /// Neighbor list skin added to the cutoff
    pub skin: f64,
    /// Side length of the cubic, non-periodic simulation box
    pub box_length: f64,
    /// Initial neighbor row capacity; rows grow when needed
    pub max_neighbors: usize,
    pub max_specials: usize,
    /// Fraction of particles on the accelerator; negative for dynamic balancing
    pub gpu_split: f64,
    pub neighbor_mode: NeighborMode,
    /// Steps between neighbor list rebuilds
    pub rebuild_every: usize,
    pub steps: usize,
    /// Largest random displacement per step and dimension
    pub displacement: f64,
    pub seed: u64,
    /// Device memory budget; unlimited if absent
    pub memory_mb: Option<f64>,
    pub block_size: usize,
    pub threads_per_atom: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            particles: 1000,
            types: vec![
                ParticleType {
                    name: "rod".to_string(),
                    semi_axes: [1.5, 0.5, 0.5],
                },
                ParticleType {
                    name: "bead".to_string(),
                    semi_axes: [0.5, 0.5, 0.5],
                },
            ],
            cutoff: 4.0,
            skin: 0.3,
            box_length: 30.0,
            max_neighbors: 64,
            max_specials: 0,
            gpu_split: 1.0,
            neighbor_mode: NeighborMode::Host,
            rebuild_every: 10,
            steps: 100,
            displacement: 0.05,
            seed: 42,
            memory_mb: None,
            block_size: 64,
            threads_per_atom: 1,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read configuration {}", path.display()))?;
        Self::from_yaml(&yaml).with_context(|| format!("in {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.types.is_empty(), "at least one particle type is required");
        for kind in &self.types {
            ensure!(
                kind.semi_axes.iter().all(|&r| r > 0.0),
                "semi-axes of '{}' must be positive",
                kind.name
            );
        }
        ensure!(self.cutoff > 0.0, "cutoff must be positive");
        ensure!(self.skin >= 0.0, "skin cannot be negative");
        ensure!(self.box_length > 0.0, "box length must be positive");
        ensure!(
            self.gpu_split < 0.0 || (self.gpu_split > 0.0 && self.gpu_split <= 1.0),
            "gpu_split must be in (0, 1] or negative, got {}",
            self.gpu_split
        );
        ensure!(self.rebuild_every > 0, "rebuild_every must be at least 1");
        ensure!(self.block_size > 0, "block size must be positive");
        ensure!(
            self.threads_per_atom > 0 && self.threads_per_atom <= self.block_size,
            "threads per atom must be in 1..={}",
            self.block_size
        );
        if let Some(mb) = self.memory_mb {
            ensure!(mb > 0.0, "memory budget must be positive");
        }
        Ok(())
    }

    /// Number of types including the reserved type 0
    pub fn n_types(&self) -> usize {
        self.types.len() + 1
    }

    /// Neighbor cutoff including skin
    pub fn cell_size(&self) -> f64 {
        self.cutoff + self.skin
    }

    /// Form of every type pair from the particle shapes
    pub fn form_matrix(&self) -> FormMatrix {
        let shapes = std::iter::once(true)
            .chain(self.types.iter().map(ParticleType::is_ellipsoid))
            .collect::<Vec<_>>();
        FormMatrix::from_shapes(&shapes)
    }

    pub fn memory_bytes(&self) -> Option<usize> {
        self.memory_mb.map(|mb| (mb * 1024.0 * 1024.0) as usize)
    }
}
