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

//! Particle index list ordered by interaction form.

use crate::{EngineError, Result};

/// Host-side copy of the particle index list with pure ellipsoid-ellipsoid
/// particles first and mixed-form particles after.
///
/// The partition is stable: within each group the host ordering is kept.
#[derive(Clone, Debug, Default)]
pub struct OrderedIndexList {
    indices: Vec<usize>,
    n_pure: usize,
}

impl OrderedIndexList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make room for at least `size` indices without further allocation
    pub fn reserve(&mut self, size: usize) -> Result<()> {
        let additional = size.saturating_sub(self.indices.len());
        self.indices
            .try_reserve(additional)
            .map_err(|_| EngineError::resize("ordered index list", size, self.indices.capacity()))
    }

    /// Number of indices the list can hold without reallocating
    pub fn capacity(&self) -> usize {
        self.indices.capacity()
    }

    /// Replace the content with `ilist` partitioned by `is_pure`, returning
    /// the number of pure particles (the boundary index).
    pub fn partition(&mut self, ilist: &[usize], is_pure: impl Fn(usize) -> bool) -> usize {
        self.indices.clear();
        self.indices.extend(ilist.iter().copied().filter(|&i| is_pure(i)));
        self.n_pure = self.indices.len();
        self.indices.extend(ilist.iter().copied().filter(|&i| !is_pure(i)));
        trace!(
            "ordered {} particles: {} pure, {} mixed",
            ilist.len(),
            self.n_pure,
            ilist.len() - self.n_pure
        );
        self.n_pure
    }

    /// Index of the first mixed-form particle
    pub fn n_pure(&self) -> usize {
        self.n_pure
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.indices
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn clear(&mut self) {
        self.indices.clear();
        self.indices.shrink_to_fit();
        self.n_pure = 0;
    }
}

impl std::ops::Deref for OrderedIndexList {
    type Target = [usize];
    fn deref(&self) -> &[usize] {
        &self.indices
    }
}
