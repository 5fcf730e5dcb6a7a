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

//! Host-memory backend emulating an accelerator.
//!
//! Buffers live in ordinary vectors and kernels run synchronously on the
//! host, parallelized with rayon. Programs are "compiled" by scanning their
//! source for `__kernel` entry points; the emulated pair kernels count
//! interactions instead of evaluating a potential, writing the count into the
//! energy slot. All device allocations draw from a shared [`MemoryBudget`] so
//! that out-of-memory conditions can be reproduced.

mod answers;
mod atoms;
mod neighbors;

pub use answers::EmulatedAnswers;
pub use atoms::EmulatedAtoms;
pub use neighbors::{build_neighbor_rows, EmulatedNeighbors};

use super::{
    Answers, AtomBuffers, Device, DeviceInit, LaunchArgs, NeighborList, NeighborMode, Replica,
    SingleReplica,
};
use crate::{
    form::Form,
    kernels::{Grid, Kernel, ProgramHandle},
    EngineError, Result,
};
use rayon::prelude::*;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

/// Default threads per block
const DEFAULT_BLOCK_SIZE: usize = 64;
/// Emulated launch overhead per kernel (s)
const LAUNCH_OVERHEAD: f64 = 5.0e-6;
/// Emulated driver time per kernel (s)
const DRIVER_OVERHEAD: f64 = 1.0e-6;

/// Device memory shared by all buffers of one emulated device
#[derive(Debug)]
pub struct MemoryBudget {
    limit: usize,
    used: AtomicUsize,
}

impl MemoryBudget {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit,
            used: AtomicUsize::new(0),
        })
    }

    pub fn unlimited() -> Arc<Self> {
        Self::new(usize::MAX)
    }

    /// Grow an allocation of `from` bytes to `to` bytes
    pub fn grow(&self, what: &'static str, from: usize, to: usize) -> Result<()> {
        let extra = to.saturating_sub(from);
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(extra).filter(|&total| total <= self.limit)
            })
            .map(|_| ())
            .map_err(|used| EngineError::resize(what, to, from + self.limit.saturating_sub(used)))
    }

    pub fn release(&self, bytes: usize) {
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                Some(used.saturating_sub(bytes))
            })
            .ok();
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// One kernel launch as seen by the emulated device
#[derive(Clone, Debug, PartialEq)]
pub struct LaunchRecord {
    pub kernel: &'static str,
    pub start: usize,
    pub end: usize,
    pub grid: Grid,
}

/// Emulated accelerator context
pub struct EmulatedDevice {
    mode: NeighborMode,
    block_size: usize,
    threads_per_atom: usize,
    budget: Arc<MemoryBudget>,
    atoms: EmulatedAtoms,
    programs: HashMap<ProgramHandle, Vec<String>>,
    next_program: usize,
    compiles: usize,
    compile_attempts: usize,
    compile_failure: Option<usize>,
    fail_init: bool,
    initialized: bool,
    launches: Vec<LaunchRecord>,
    answer_batches: Vec<usize>,
    replica: Box<dyn Replica + Send + Sync>,
}

impl EmulatedDevice {
    /// Device with unlimited memory and a single replica
    pub fn new(mode: NeighborMode) -> Self {
        let budget = MemoryBudget::unlimited();
        Self {
            mode,
            block_size: DEFAULT_BLOCK_SIZE,
            threads_per_atom: 1,
            atoms: EmulatedAtoms::new(budget.clone()),
            budget,
            programs: HashMap::new(),
            next_program: 0,
            compiles: 0,
            compile_attempts: 0,
            compile_failure: None,
            fail_init: false,
            initialized: false,
            launches: Vec::new(),
            answer_batches: Vec::new(),
            replica: Box::new(SingleReplica),
        }
    }

    /// Cap device memory at `bytes`
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.budget = MemoryBudget::new(bytes);
        self.atoms = EmulatedAtoms::new(self.budget.clone());
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    pub fn with_threads_per_atom(mut self, threads: usize) -> Self {
        self.threads_per_atom = threads.max(1);
        self
    }

    pub fn with_replica(mut self, replica: impl Replica + Send + Sync + 'static) -> Self {
        self.replica = Box::new(replica);
        self
    }

    /// Let the `nth` compilation (counting from zero) fail
    pub fn with_compile_failure(mut self, nth: usize) -> Self {
        self.compile_failure = Some(nth);
        self
    }

    /// Refuse the next `init`
    pub fn with_init_failure(mut self) -> Self {
        self.fail_init = true;
        self
    }

    pub fn budget(&self) -> &Arc<MemoryBudget> {
        &self.budget
    }

    /// All launches since the device was created
    pub fn launches(&self) -> &[LaunchRecord] {
        &self.launches
    }

    /// Number of successful compilations
    pub fn compiles(&self) -> usize {
        self.compiles
    }

    /// Programs compiled and not yet released
    pub fn live_programs(&self) -> usize {
        self.programs.len()
    }

    /// `inum` of every answer set queued with `add_answers`
    pub fn answer_batches(&self) -> &[usize] {
        &self.answer_batches
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Entry points declared in a program source
    fn entry_points(source: &str) -> Vec<String> {
        source
            .split("__kernel")
            .skip(1)
            .filter_map(|decl| {
                let decl = decl.trim_start().strip_prefix("void")?;
                let name = decl.trim_start().split('(').next()?.trim();
                (!name.is_empty()).then(|| name.to_string())
            })
            .collect()
    }

    fn launch_error(kernel: &Kernel, message: impl Into<String>) -> EngineError {
        EngineError::Launch {
            kernel: kernel.name.to_string(),
            message: message.into(),
        }
    }
}

impl Device for EmulatedDevice {
    type Atoms = EmulatedAtoms;
    type Answers = EmulatedAnswers;
    type Neighbors = EmulatedNeighbors;

    fn create_answers(&self) -> EmulatedAnswers {
        EmulatedAnswers::new(self.budget.clone())
    }

    fn create_neighbors(&self) -> EmulatedNeighbors {
        EmulatedNeighbors::new(self.budget.clone())
    }

    fn init(
        &mut self,
        answers: &mut EmulatedAnswers,
        nbor: &mut EmulatedNeighbors,
        params: &DeviceInit,
    ) -> Result<()> {
        if std::mem::take(&mut self.fail_init) {
            return Err(EngineError::DeviceInit("emulated init failure".to_string()));
        }
        if !(params.cell_size > 0.0) {
            return Err(EngineError::DeviceInit(format!(
                "cell size must be positive, got {}",
                params.cell_size
            )));
        }
        self.atoms.resize(params.nall)?;
        answers.resize(params.nlocal)?;
        nbor.set_cutoff(params.cell_size);
        nbor.resize(params.nlocal, params.host_nlocal, params.max_nbors)?;
        self.initialized = true;
        debug!(
            "emulated device: {} local, {} total, {} max neighbors, {:.1} kB in use",
            params.nlocal,
            params.nall,
            params.max_nbors,
            self.budget.used() as f64 / 1024.0
        );
        Ok(())
    }

    fn mode(&self) -> NeighborMode {
        self.mode
    }

    fn threads_per_atom(&self) -> usize {
        self.threads_per_atom
    }

    fn pair_block_size(&self) -> usize {
        self.block_size
    }

    fn atoms(&self) -> &EmulatedAtoms {
        &self.atoms
    }

    fn atoms_mut(&mut self) -> &mut EmulatedAtoms {
        &mut self.atoms
    }

    fn compile(&mut self, source: &str, flags: &str) -> Result<ProgramHandle> {
        let attempt = self.compile_attempts;
        self.compile_attempts += 1;
        if self.compile_failure == Some(attempt) {
            self.compile_failure = None;
            return Err(EngineError::compile("", "emulated build failure"));
        }
        let entries = Self::entry_points(source);
        if entries.is_empty() {
            return Err(EngineError::compile("", "source defines no kernels"));
        }
        trace!("compiling {} kernels with '{flags}'", entries.len());
        let handle = ProgramHandle(self.next_program);
        self.next_program += 1;
        self.compiles += 1;
        self.programs.insert(handle, entries);
        Ok(handle)
    }

    fn kernel(&self, program: ProgramHandle, name: &'static str) -> Result<Kernel> {
        let entries = self
            .programs
            .get(&program)
            .ok_or_else(|| EngineError::compile(name, "program not compiled"))?;
        if entries.iter().any(|entry| entry == name) {
            Ok(Kernel { program, name })
        } else {
            Err(EngineError::compile(name, "no such kernel in program"))
        }
    }

    fn release(&mut self, program: ProgramHandle) {
        self.programs.remove(&program);
    }

    fn launch(
        &mut self,
        kernel: &Kernel,
        grid: Grid,
        args: &LaunchArgs<'_>,
        nbor: &mut EmulatedNeighbors,
        answers: &mut EmulatedAnswers,
    ) -> Result<()> {
        if !self.programs.contains_key(&kernel.program) {
            return Err(Self::launch_error(kernel, "program was released"));
        }
        let n = args.end.saturating_sub(args.start);
        if grid.capacity(self.threads_per_atom) < n {
            return Err(Self::launch_error(kernel, "grid does not cover the range"));
        }
        if args.end > nbor.rows() || args.end > answers.capacity() {
            return Err(Self::launch_error(kernel, "range exceeds buffer size"));
        }
        let range = args.start..args.end;
        let x = self.atoms.device_x();
        let form_of = |i: usize, j: usize| args.forms.get(x[i].kind(), x[j].kind());
        match kernel.name {
            "kernel_nbor" | "kernel_nbor_fast" => {
                nbor.pack(range, |i, j| {
                    let form = form_of(i, j);
                    form >= args.form_low && form <= args.form_high
                });
            }
            "kernel_ellipsoid" | "kernel_sphere_ellipsoid" => {
                let counts = nbor.packed_counts(range.clone());
                answers.write_slots(range.start, &counts, args.flags);
            }
            "kernel_lj" | "kernel_lj_fast" => {
                let counts = range
                    .clone()
                    .into_par_iter()
                    .map(|slot| {
                        let i = nbor.slot_particle(slot);
                        nbor.unpacked(slot)
                            .iter()
                            .filter(|&&j| form_of(i, j) == Form::SphereSphere)
                            .count()
                    })
                    .collect::<Vec<_>>();
                answers.add_slots(range.start, &counts, args.flags);
            }
            _ => return Err(Self::launch_error(kernel, "unknown kernel")),
        }
        self.launches.push(LaunchRecord {
            kernel: kernel.name,
            start: args.start,
            end: args.end,
            grid,
        });
        Ok(())
    }

    fn add_answers(&mut self, answers: &EmulatedAnswers) {
        self.answer_batches.push(answers.inum());
    }

    fn estimate_overhead(&mut self, kernels: usize) -> (f64, f64) {
        (
            LAUNCH_OVERHEAD * kernels as f64,
            DRIVER_OVERHEAD * kernels as f64,
        )
    }

    fn replica(&self) -> &dyn Replica {
        self.replica.as_ref()
    }

    fn procs_per_gpu(&self) -> usize {
        1
    }

    fn clear(&mut self) {
        self.atoms.clear();
        self.programs.clear();
        self.initialized = false;
    }
}
