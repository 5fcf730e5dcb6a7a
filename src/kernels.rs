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

//! Lifecycle of the compiled accelerator programs.

use crate::{backend::Device, EngineError, Result};

/// Neighbor packing program, always compiled alongside the pair programs
pub const ELLIPSOID_NBOR_SOURCE: &str = include_str!("cl/ellipsoid_nbor.cl");
/// Interaction-counting ellipsoid program used by the demo driver
pub const COUNT_ELLIPSOID_SOURCE: &str = include_str!("cl/count_ellipsoid.cl");
/// Interaction-counting mixed-form program used by the demo driver
pub const COUNT_LJ_SOURCE: &str = include_str!("cl/count_lj.cl");

/// Compiler flags passed to every program
pub const COMPILE_FLAGS: &str = "-cl-fast-relaxed-math -cl-mad-enable -D_SINGLE_SINGLE";

/// Opaque handle of a program compiled by a [`Device`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProgramHandle(pub usize);

/// Entry point inside a compiled program
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Kernel {
    pub program: ProgramHandle,
    pub name: &'static str,
}

/// Launch geometry: `grid` blocks of `block` threads
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Grid {
    pub grid: usize,
    pub block: usize,
}

impl Grid {
    /// Enough blocks to cover `n` particles with `threads_per_atom` threads each
    pub fn covering(n: usize, block: usize, threads_per_atom: usize) -> Self {
        let atoms_per_block = (block / threads_per_atom.max(1)).max(1);
        Self {
            grid: n.div_ceil(atoms_per_block),
            block,
        }
    }

    /// Number of particles the grid covers
    pub fn capacity(&self, threads_per_atom: usize) -> usize {
        self.grid * (self.block / threads_per_atom.max(1)).max(1)
    }
}

/// User supplied pair program sources
#[derive(Clone, Copy, Debug)]
pub struct KernelSource<'a> {
    /// Must define `kernel_ellipsoid`
    pub ellipsoid: &'a str,
    /// Must define `kernel_sphere_ellipsoid`, `kernel_lj_fast` and `kernel_lj`
    pub lj: &'a str,
}

impl KernelSource<'static> {
    /// The interaction-counting programs shipped with the crate
    pub fn counting() -> Self {
        Self {
            ellipsoid: COUNT_ELLIPSOID_SOURCE,
            lj: COUNT_LJ_SOURCE,
        }
    }
}

/// Lifecycle of the program set
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ProgramState {
    #[default]
    Uninitialized,
    Compiled,
    TornDown,
}

/// Handles of all compiled programs and their kernels
#[derive(Clone, Debug)]
pub struct ProgramSet {
    programs: [ProgramHandle; 3],
    pub nbor_fast: Kernel,
    pub nbor: Kernel,
    pub ellipsoid: Kernel,
    pub sphere_ellipsoid: Kernel,
    pub lj_fast: Kernel,
    pub lj: Kernel,
}

/// Programs compiled at most once per initialization
#[derive(Debug, Default)]
pub struct KernelPrograms {
    state: ProgramState,
    set: Option<ProgramSet>,
}

impl KernelPrograms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ProgramState {
        self.state
    }

    /// Compile the neighbor, ellipsoid and LJ programs. Does nothing if
    /// already compiled. On failure nothing stays compiled.
    pub fn compile<D: Device>(&mut self, device: &mut D, source: &KernelSource) -> Result<()> {
        if self.state == ProgramState::Compiled {
            return Ok(());
        }
        let mut compiled = Vec::with_capacity(3);
        let result = Self::compile_all(device, source, &mut compiled);
        match result {
            Ok(set) => {
                debug!("compiled {} accelerator programs", compiled.len());
                self.set = Some(set);
                self.state = ProgramState::Compiled;
                Ok(())
            }
            Err(err) => {
                compiled.into_iter().for_each(|program| device.release(program));
                Err(err)
            }
        }
    }

    fn compile_all<D: Device>(
        device: &mut D,
        source: &KernelSource,
        compiled: &mut Vec<ProgramHandle>,
    ) -> Result<ProgramSet> {
        let mut build = |name: &str, text: &str| -> Result<ProgramHandle> {
            let program = device
                .compile(text, COMPILE_FLAGS)
                .map_err(|e| match e {
                    EngineError::Compile { message, .. } => EngineError::compile(name, message),
                    other => other,
                })?;
            compiled.push(program);
            Ok(program)
        };
        let nbor_program = build("ellipsoid_nbor", ELLIPSOID_NBOR_SOURCE)?;
        let ellipsoid_program = build("ellipsoid", source.ellipsoid)?;
        let lj_program = build("lj", source.lj)?;

        Ok(ProgramSet {
            programs: [nbor_program, ellipsoid_program, lj_program],
            nbor_fast: device.kernel(nbor_program, "kernel_nbor_fast")?,
            nbor: device.kernel(nbor_program, "kernel_nbor")?,
            ellipsoid: device.kernel(ellipsoid_program, "kernel_ellipsoid")?,
            sphere_ellipsoid: device.kernel(lj_program, "kernel_sphere_ellipsoid")?,
            lj_fast: device.kernel(lj_program, "kernel_lj_fast")?,
            lj: device.kernel(lj_program, "kernel_lj")?,
        })
    }

    /// The compiled set, if any
    pub fn get(&self) -> Result<&ProgramSet> {
        self.set
            .as_ref()
            .ok_or_else(|| EngineError::compile("ellipsoid", "programs are not compiled"))
    }

    /// Release all programs. Only a compiled set moves to `TornDown`.
    pub fn clear<D: Device>(&mut self, device: &mut D) {
        if let Some(set) = self.set.take() {
            set.programs
                .into_iter()
                .for_each(|program| device.release(program));
            self.state = ProgramState::TornDown;
        }
    }
}
