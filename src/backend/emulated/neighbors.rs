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

use super::MemoryBudget;
use crate::{
    backend::{AtomBuffers, BuildRequest, NeighborList, PackedAtom, SubDomain},
    timing::Timer,
    EngineError, Result,
};
use get_size::GetSize;
use itertools::Itertools;
use rayon::prelude::*;
use std::{ops::Range, sync::Arc};

/// Bytes of a neighbor row header (particle index and count)
const ROW_HEADER_BYTES: usize = 2 * 4;
/// Bytes per neighbor entry, unpacked plus packed copy
const ENTRY_BYTES: usize = 2 * 4;

/// Uniform binning of particles into cubic cells of at least the cutoff.
///
/// Particles outside the grid (far ghosts) are clamped into the boundary
/// cells, which keeps the search correct at the cost of larger edge cells.
struct CellGrid {
    lo: [f64; 3],
    bin_size: f64,
    dims: [usize; 3],
    /// `starts[c]..starts[c + 1]` indexes `particles` for cell `c`
    starts: Vec<usize>,
    particles: Vec<usize>,
}

impl CellGrid {
    fn new(positions: &[PackedAtom], domain: &SubDomain, cutoff: f64) -> Self {
        let lo = domain.lo.map(|x| x - cutoff);
        let hi = domain.hi.map(|x| x + cutoff);
        let dims = [0, 1, 2].map(|d| (((hi[d] - lo[d]) / cutoff).floor() as usize).max(1));
        let bin_size = cutoff;
        let mut grid = Self {
            lo,
            bin_size,
            dims,
            starts: Vec::new(),
            particles: Vec::new(),
        };
        // Counting sort of particles by cell
        let cells = positions.iter().map(|p| grid.cell_of(p)).collect_vec();
        let n_cells = dims.iter().product::<usize>();
        let mut counts = vec![0usize; n_cells + 1];
        cells.iter().for_each(|&c| counts[c + 1] += 1);
        for c in 0..n_cells {
            counts[c + 1] += counts[c];
        }
        let mut fill = counts.clone();
        let mut particles = vec![0; positions.len()];
        for (i, &c) in cells.iter().enumerate() {
            particles[fill[c]] = i;
            fill[c] += 1;
        }
        grid.starts = counts;
        grid.particles = particles;
        grid
    }

    fn coords_of(&self, p: &PackedAtom) -> [usize; 3] {
        let x = [p.x as f64, p.y as f64, p.z as f64];
        [0, 1, 2].map(|d| {
            let bin = ((x[d] - self.lo[d]) / self.bin_size).floor().max(0.0) as usize;
            bin.min(self.dims[d] - 1)
        })
    }

    fn cell_of(&self, p: &PackedAtom) -> usize {
        let [ix, iy, iz] = self.coords_of(p);
        ix + self.dims[0] * (iy + self.dims[1] * iz)
    }

    /// Indices within `cutoff_sq` of particle `i`, sorted, excluding `i`
    fn neighbors_of(&self, positions: &[PackedAtom], i: usize, cutoff_sq: f32) -> Vec<usize> {
        let [cx, cy, cz] = self.coords_of(&positions[i]);
        let span = |c: usize, n: usize| c.saturating_sub(1)..=(c + 1).min(n - 1);
        let mut found = Vec::new();
        for iz in span(cz, self.dims[2]) {
            for iy in span(cy, self.dims[1]) {
                for ix in span(cx, self.dims[0]) {
                    let c = ix + self.dims[0] * (iy + self.dims[1] * iz);
                    found.extend(
                        self.particles[self.starts[c]..self.starts[c + 1]]
                            .iter()
                            .copied()
                            .filter(|&j| {
                                j != i && positions[i].distance_squared(&positions[j]) < cutoff_sq
                            }),
                    );
                }
            }
        }
        found.sort_unstable();
        found
    }
}

/// Neighbor rows of particles `0..n_rows` against all `positions`.
///
/// `exclude(i, j)` removes additional pairs, e.g. bonded specials.
pub fn build_neighbor_rows(
    positions: &[PackedAtom],
    n_rows: usize,
    domain: &SubDomain,
    cutoff: f64,
    exclude: impl Fn(usize, usize) -> bool + Sync,
) -> Result<Vec<Vec<usize>>> {
    if !(cutoff > 0.0) {
        return Err(EngineError::InvalidInput(format!(
            "neighbor cutoff must be positive, got {cutoff}"
        )));
    }
    if n_rows > positions.len() {
        return Err(EngineError::InvalidInput(format!(
            "{n_rows} rows requested for {} particles",
            positions.len()
        )));
    }
    let grid = CellGrid::new(positions, domain, cutoff);
    let cutoff_sq = (cutoff * cutoff) as f32;
    Ok((0..n_rows)
        .into_par_iter()
        .map(|i| {
            let mut row = grid.neighbors_of(positions, i, cutoff_sq);
            row.retain(|&j| !exclude(i, j));
            row
        })
        .collect())
}

/// Host-visible rows of the particles left to the host
#[derive(Clone, Debug, Default, GetSize)]
struct HostRows {
    ilist: Vec<usize>,
    numj: Vec<usize>,
    firstneigh: Vec<Vec<usize>>,
}

/// Neighbor list manager of the emulated device.
///
/// Rows are addressed by slot; `dev_ilist[slot]` is the particle of a slot.
pub struct EmulatedNeighbors {
    budget: Arc<MemoryBudget>,
    cutoff: f64,
    max_atoms: usize,
    max_nbors: usize,
    staged_ilist: Vec<usize>,
    staged_rows: Vec<Vec<usize>>,
    dev_ilist: Vec<usize>,
    dev_nbor: Vec<Vec<usize>>,
    dev_packed: Vec<Vec<usize>>,
    host: HostRows,
    device_built: bool,
    ingests: usize,
    builds: usize,
    time_copy: Timer,
    time_build: Timer,
}

impl EmulatedNeighbors {
    pub(crate) fn new(budget: Arc<MemoryBudget>) -> Self {
        Self {
            budget,
            cutoff: 0.0,
            max_atoms: 0,
            max_nbors: 0,
            staged_ilist: Vec::new(),
            staged_rows: Vec::new(),
            dev_ilist: Vec::new(),
            dev_nbor: Vec::new(),
            dev_packed: Vec::new(),
            host: HostRows::default(),
            device_built: false,
            ingests: 0,
            builds: 0,
            time_copy: Timer::default(),
            time_build: Timer::default(),
        }
    }

    pub(crate) fn set_cutoff(&mut self, cutoff: f64) {
        self.cutoff = cutoff;
    }

    fn gpu_bytes_for(rows: usize, width: usize) -> usize {
        rows * (ROW_HEADER_BYTES + width * ENTRY_BYTES)
    }

    /// Rows resident on the device
    pub fn rows(&self) -> usize {
        self.dev_ilist.len()
    }

    /// Particle of a slot
    pub fn slot_particle(&self, slot: usize) -> usize {
        self.dev_ilist[slot]
    }

    /// Slot-to-particle map of the resident rows
    pub fn device_ilist(&self) -> &[usize] {
        &self.dev_ilist
    }

    pub fn unpacked(&self, slot: usize) -> &[usize] {
        &self.dev_nbor[slot]
    }

    pub fn packed(&self, slot: usize) -> &[usize] {
        &self.dev_packed[slot]
    }

    /// Times rows were ingested from the host
    pub fn ingests(&self) -> usize {
        self.ingests
    }

    /// Times rows were built on the device
    pub fn builds(&self) -> usize {
        self.builds
    }

    /// Filter the unpacked rows of `slots` into the packed rows
    pub(crate) fn pack(&mut self, slots: Range<usize>, keep: impl Fn(usize, usize) -> bool + Sync) {
        let ilist = &self.dev_ilist[slots.clone()];
        let unpacked = &self.dev_nbor[slots.clone()];
        self.dev_packed[slots]
            .par_iter_mut()
            .zip(unpacked.par_iter().zip(ilist.par_iter()))
            .for_each(|(packed, (row, &i))| {
                packed.clear();
                packed.extend(row.iter().copied().filter(|&j| keep(i, j)));
            });
    }

    pub(crate) fn packed_counts(&self, slots: Range<usize>) -> Vec<usize> {
        self.dev_packed[slots].iter().map(Vec::len).collect()
    }
}

impl NeighborList for EmulatedNeighbors {
    fn resize(&mut self, inum: usize, host_inum: usize, max_nbors: usize) -> Result<()> {
        let rows = (inum + host_inum).max(self.max_atoms);
        let width = max_nbors.max(self.max_nbors);
        if rows > self.max_atoms || width > self.max_nbors {
            self.budget.grow(
                "neighbor list",
                Self::gpu_bytes_for(self.max_atoms, self.max_nbors),
                Self::gpu_bytes_for(rows, width),
            )?;
            trace!("neighbor list grown to {rows} rows of {width}");
            self.max_atoms = rows;
            self.max_nbors = width;
        }
        Ok(())
    }

    fn max_nbor_loop(&self, ilist: &[usize], neighbors: &[Vec<usize>]) -> usize {
        ilist
            .iter()
            .map(|&i| neighbors.get(i).map_or(0, Vec::len))
            .max()
            .unwrap_or(0)
    }

    fn get_host(&mut self, ilist: &[usize], neighbors: &[Vec<usize>], _block_size: usize) {
        self.time_copy.start();
        self.staged_ilist.clear();
        self.staged_ilist.extend_from_slice(ilist);
        self.staged_rows.clear();
        self.staged_rows
            .extend(ilist.iter().map(|&i| neighbors[i].clone()));
        self.device_built = false;
        self.ingests += 1;
        self.time_copy.stop();
    }

    fn build<A: AtomBuffers>(&mut self, atoms: &A, request: &BuildRequest<'_>) -> Result<usize> {
        self.time_build.start();
        let n_local = request.inum + request.host_inum;
        let tags = request.tags;
        let specials = request.specials;
        let rows = build_neighbor_rows(
            atoms.device_x(),
            n_local,
            request.domain,
            self.cutoff,
            |i, j| {
                specials
                    .get(i)
                    .zip(tags.get(j))
                    .is_some_and(|(excluded, tag)| excluded.contains(tag))
            },
        );
        self.time_build.stop();
        let mut rows = rows?;
        let max_nbor = rows.iter().map(Vec::len).max().unwrap_or(0);
        if max_nbor > self.max_nbors {
            self.resize(request.inum, request.host_inum, max_nbor)?;
        }

        let host_rows = rows.split_off(request.inum);
        self.host.ilist = (request.inum..n_local).collect();
        self.host.numj = host_rows.iter().map(Vec::len).collect();
        self.host.firstneigh = host_rows;
        self.staged_ilist = (0..request.inum).collect();
        self.staged_rows = rows;
        self.device_built = true;
        self.builds += 1;
        Ok(max_nbor)
    }

    fn copy_unpacked(&mut self, inum: usize, _max_nbor: usize) {
        self.time_copy.start();
        self.dev_ilist = std::mem::take(&mut self.staged_ilist);
        self.dev_nbor = std::mem::take(&mut self.staged_rows);
        self.dev_ilist.truncate(inum);
        self.dev_nbor.truncate(inum);
        self.dev_packed.resize_with(inum, Vec::new);
        self.dev_packed.truncate(inum);
        self.dev_packed.iter_mut().for_each(Vec::clear);
        self.time_copy.stop();
    }

    fn nbor_pitch(&self) -> usize {
        self.max_atoms
    }

    fn max_nbors(&self) -> usize {
        self.max_nbors
    }

    fn max_atoms(&self) -> usize {
        self.max_atoms
    }

    fn gpu_bytes(&self) -> usize {
        Self::gpu_bytes_for(self.max_atoms, self.max_nbors)
    }

    fn bytes_per_atom(&self, max_nbors: usize) -> usize {
        ROW_HEADER_BYTES + max_nbors * ENTRY_BYTES
    }

    fn host_memory_usage(&self) -> usize {
        self.host.get_heap_size()
            + self.staged_ilist.get_heap_size()
            + self.staged_rows.get_heap_size()
            + std::mem::size_of::<Self>()
    }

    fn host_ilist(&self) -> &[usize] {
        &self.host.ilist
    }

    fn host_numj(&self) -> &[usize] {
        &self.host.numj
    }

    fn host_firstneigh(&self) -> &[Vec<usize>] {
        &self.host.firstneigh
    }

    fn copy_time(&self) -> f64 {
        self.time_copy.total_seconds()
    }

    fn build_time(&self) -> f64 {
        self.time_build.total_seconds()
    }

    fn is_device_built(&self) -> bool {
        self.device_built
    }

    fn acc_timers(&mut self) {
        self.time_copy.add_to_total();
        self.time_build.add_to_total();
    }

    fn clear(&mut self) {
        self.budget.release(self.gpu_bytes());
        let cutoff = self.cutoff;
        *self = Self::new(self.budget.clone());
        self.cutoff = cutoff;
    }
}
