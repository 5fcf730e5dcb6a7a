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

//! Per-step orchestration of ellipsoid pair styles on an accelerator.
//!
//! [`BaseEllipsoid`] splits the local particles between host and accelerator,
//! keeps the neighbor list alive across steps, orders particles by
//! interaction form and launches the pair kernels. It offers two entry
//! points: [`BaseEllipsoid::compute_host_list`] when the host builds the
//! neighbor list and [`BaseEllipsoid::compute_device_list`] when the
//! accelerator builds it from positions.

use crate::{
    backend::{
        Answers, AtomBuffers, BuildRequest, Device, DeviceInit, EnergyFlags, LaunchArgs,
        NeighborList, NeighborMode, SubDomain,
    },
    balance::{HostDeviceBalancer, LoadBalancer},
    form::{Form, FormMatrix},
    kernels::{Grid, Kernel, KernelPrograms, KernelSource, ProgramState},
    ordering::OrderedIndexList,
    timing::{TimeSummary, TimingLedger},
    EngineError, Result, UnitQuaternion, Vector3,
};
use itertools::Itertools;
use std::io::Write;

/// Largest number of types whose parameters fit in block-shared memory
const MAX_SHARED_TYPES: usize = 8;
/// Kernel launches per step assumed when estimating overhead
const KERNELS_PER_STEP: usize = 2;

/// Lifecycle of the neighbor list
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum NeighborState {
    /// No usable list; the next step must rebuild
    #[default]
    Uninitialized,
    /// Freshly built or ingested this step
    Built,
    /// Reused from an earlier step
    Stale,
    /// A rebuild is in progress
    Rebuilding,
}

/// Arguments of [`BaseEllipsoid::init_base`]
pub struct InitParams<'a> {
    /// Local particles
    pub nlocal: usize,
    /// Local plus ghost particles
    pub nall: usize,
    pub max_nbors: usize,
    pub max_specials: usize,
    /// Neighbor cutoff including skin
    pub cell_size: f64,
    /// Fraction of particles on the accelerator; negative for dynamic balancing
    pub gpu_split: f64,
    /// Sink for the timing report
    pub screen: Option<Box<dyn Write + Send>>,
    /// Interaction form of every type pair, including the reserved type 0
    pub forms: FormMatrix,
    pub source: KernelSource<'a>,
}

/// Input of a step with a host-built neighbor list
#[derive(Clone, Copy, Debug)]
pub struct HostListStep<'a> {
    /// Steps since the last neighbor list rebuild
    pub ago: usize,
    /// Positions of local and ghost particles
    pub x: &'a [Vector3],
    pub types: &'a [usize],
    pub quat: &'a [UnitQuaternion],
    /// Local particles in host order
    pub ilist: &'a [usize],
    /// Neighbors of every particle, indexed by particle
    pub neighbors: &'a [Vec<usize>],
    pub flags: EnergyFlags,
    /// Host time of the previous step (s)
    pub cpu_time: f64,
}

/// Input of a step with an accelerator-built neighbor list
#[derive(Clone, Copy, Debug)]
pub struct DeviceListStep<'a> {
    pub ago: usize,
    /// Local particles; these are `0..inum_full`
    pub inum_full: usize,
    pub x: &'a [Vector3],
    pub types: &'a [usize],
    pub quat: &'a [UnitQuaternion],
    pub domain: SubDomain,
    /// Global tag of every particle
    pub tags: &'a [usize],
    /// Tags excluded from each local particle's neighbors
    pub specials: &'a [Vec<usize>],
    pub flags: EnergyFlags,
    pub cpu_time: f64,
}

/// Neighbors of the particles left to the host after an accelerator build
#[derive(Clone, Copy, Debug)]
pub struct DeviceNeighbors<'a> {
    pub ilist: &'a [usize],
    pub numj: &'a [usize],
    pub firstneigh: &'a [Vec<usize>],
    /// First particle the host must evaluate
    pub host_start: usize,
}

/// Split decided by the last step
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StepOutcome {
    /// Particles evaluated on the accelerator
    pub inum: usize,
    /// Index where host particles begin in the returned list
    pub host_start: usize,
    /// The neighbor list was rebuilt
    pub cold: bool,
}

/// Orchestrator for ellipsoid pair styles.
///
/// Owns its device, answer accumulator, neighbor list and balancer; several
/// instances can coexist. Everything is released by [`Self::clear_base`],
/// which also runs on drop.
pub struct BaseEllipsoid<D: Device, B: LoadBalancer = HostDeviceBalancer> {
    device: D,
    answers: D::Answers,
    nbor: D::Neighbors,
    balancer: B,
    programs: KernelPrograms,
    ledger: TimingLedger,
    forms: Option<FormMatrix>,
    multiple_forms: bool,
    ordered: OrderedIndexList,
    last_ellipse: usize,
    max_last_ellipse: usize,
    nbor_state: NeighborState,
    /// Accelerator particles of the last rebuild
    built_inum: usize,
    /// Local plus ghost particles of the last rebuild
    built_nall: usize,
    nbor_time_avail: bool,
    block_size: usize,
    threads_per_atom: usize,
    shared_types: bool,
    max_an_bytes: usize,
    max_bytes: usize,
    gpu_overhead: f64,
    driver_overhead: f64,
    screen: Option<Box<dyn Write + Send>>,
    initialized: bool,
    last_step: StepOutcome,
}

impl<D: Device> BaseEllipsoid<D> {
    /// Orchestrator with the default host/accelerator balancer
    pub fn new(device: D) -> Self {
        Self::with_balancer(device, HostDeviceBalancer::new())
    }
}

impl<D: Device, B: LoadBalancer> BaseEllipsoid<D, B> {
    pub fn with_balancer(device: D, balancer: B) -> Self {
        let answers = device.create_answers();
        let nbor = device.create_neighbors();
        Self {
            device,
            answers,
            nbor,
            balancer,
            programs: KernelPrograms::new(),
            ledger: TimingLedger::default(),
            forms: None,
            multiple_forms: false,
            ordered: OrderedIndexList::new(),
            last_ellipse: 0,
            max_last_ellipse: 0,
            nbor_state: NeighborState::Uninitialized,
            built_inum: 0,
            built_nall: 0,
            nbor_time_avail: false,
            block_size: 0,
            threads_per_atom: 1,
            shared_types: false,
            max_an_bytes: 0,
            max_bytes: 0,
            gpu_overhead: 0.0,
            driver_overhead: 0.0,
            screen: None,
            initialized: false,
            last_step: StepOutcome::default(),
        }
    }

    /// Prepare device, buffers, programs and balancer for a run.
    ///
    /// Calling this again re-initializes from scratch. Multiple interaction
    /// forms together with accelerator-built neighbor lists is a fatal
    /// configuration error. Any other failure leaves the instance cleared.
    pub fn init_base(&mut self, params: InitParams<'_>) -> Result<()> {
        if self.initialized {
            self.clear_base();
        }
        let device_nbor = self.device.mode() == NeighborMode::Device;
        if params.forms.multiple_forms() && device_nbor {
            return Err(EngineError::MultipleFormsWithDeviceNeighbors);
        }
        let result = self.init_device(params, device_nbor);
        if result.is_err() {
            self.clear_base();
        }
        result
    }

    fn init_device(&mut self, params: InitParams<'_>, device_nbor: bool) -> Result<()> {
        let host_nlocal =
            self.balancer
                .first_host_count(params.nlocal, params.gpu_split, device_nbor);
        let init = DeviceInit {
            nlocal: params.nlocal,
            host_nlocal,
            nall: params.nall,
            max_nbors: params.max_nbors,
            max_specials: params.max_specials,
            cell_size: params.cell_size,
            rot: true,
        };
        self.device.init(&mut self.answers, &mut self.nbor, &init)?;

        self.block_size = self.device.pair_block_size();
        self.threads_per_atom = self.device.threads_per_atom();
        let n_types = params.forms.n_types();
        self.shared_types = n_types <= MAX_SHARED_TYPES && self.block_size >= MAX_SHARED_TYPES;
        self.programs.compile(&mut self.device, &params.source)?;

        self.balancer.init(device_nbor, params.gpu_split);
        self.ledger.clear();
        self.multiple_forms = params.forms.multiple_forms();
        self.forms = Some(params.forms);
        if self.multiple_forms {
            self.answers.zero();
        }
        self.ordered.reserve(self.nbor.max_atoms())?;
        self.max_an_bytes = self.answers.gpu_bytes() + self.nbor.gpu_bytes();
        self.screen = params.screen;
        self.estimate_gpu_overhead();
        self.initialized = true;
        info!(
            "ellipsoid accelerator: {} types, {}, {} neighbor lists, block {} x {}",
            n_types,
            if self.multiple_forms {
                "multiple forms"
            } else {
                "single form"
            },
            if device_nbor { "device" } else { "host" },
            self.block_size,
            self.threads_per_atom
        );
        Ok(())
    }

    /// Ask the device for per-step launch and driver overhead
    pub fn estimate_gpu_overhead(&mut self) {
        let (gpu, driver) = self.device.estimate_overhead(KERNELS_PER_STEP);
        self.gpu_overhead = gpu;
        self.driver_overhead = driver;
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(EngineError::NotInitialized)
        }
    }

    /// Fold the previous step's device timers into the totals
    fn acc_timers(&mut self) {
        self.nbor.acc_timers();
        self.ledger
            .accumulate(self.nbor_time_avail, self.multiple_forms);
        self.nbor_time_avail = false;
        self.device.atoms_mut().acc_timers();
        self.answers.acc_timers();
    }

    fn zero_timers(&mut self) {
        self.ledger.zero();
        self.nbor_time_avail = false;
        self.device.atoms_mut().zero_timers();
        self.answers.zero_timers();
    }

    fn zero_work(&mut self) {
        self.zero_timers();
        self.last_step = StepOutcome::default();
    }

    /// A warm step needs a list built for at least `inum` particles out of
    /// the same `nall`
    fn reuse_nbors(&mut self, inum: usize, nall: usize) -> Result<()> {
        match self.nbor_state {
            NeighborState::Built | NeighborState::Stale => {}
            _ => return Err(EngineError::NoNeighborList),
        }
        if inum > self.built_inum {
            return Err(EngineError::InvalidInput(format!(
                "{inum} accelerator particles but the neighbor list holds {}",
                self.built_inum
            )));
        }
        if nall != self.built_nall {
            return Err(EngineError::InvalidInput(format!(
                "{nall} particles but the neighbor list was built for {}",
                self.built_nall
            )));
        }
        self.nbor_state = NeighborState::Stale;
        Ok(())
    }

    fn track_bytes(&mut self) {
        let bytes = self.answers.gpu_bytes() + self.nbor.gpu_bytes();
        self.max_an_bytes = self.max_an_bytes.max(bytes);
    }

    /// Ingest the host neighbor list, ordering particles by form first
    fn reset_nbors(&mut self, step: &HostListStep<'_>, inum: usize) -> Result<()> {
        self.nbor_state = NeighborState::Rebuilding;
        self.nbor_time_avail = true;
        let max_nbor = self.nbor.max_nbor_loop(&step.ilist[..inum], step.neighbors);
        let resized = self
            .device
            .atoms_mut()
            .resize(step.x.len())
            .and_then(|_| self.answers.resize(inum))
            .and_then(|_| self.nbor.resize(inum, 0, max_nbor))
            .and_then(|_| self.ordered.reserve(step.ilist.len()));
        if let Err(err) = resized {
            self.nbor_state = NeighborState::Uninitialized;
            warn!("neighbor list reset failed: {err}");
            return Err(err);
        }

        if self.multiple_forms {
            let forms = self.forms.as_ref().ok_or(EngineError::NotInitialized)?;
            let types = step.types;
            self.max_last_ellipse = self
                .ordered
                .partition(step.ilist, |i| forms.is_pure_type(types[i]));
            self.last_ellipse = inum.min(self.max_last_ellipse);
            self.nbor
                .get_host(&self.ordered[..inum], step.neighbors, self.block_size);
        } else {
            self.last_ellipse = inum;
            self.max_last_ellipse = inum;
            self.nbor
                .get_host(&step.ilist[..inum], step.neighbors, self.block_size);
        }
        self.nbor.copy_unpacked(inum, max_nbor);
        self.built_inum = inum;
        self.built_nall = step.x.len();
        self.nbor_state = NeighborState::Built;
        self.track_bytes();
        debug!(
            "ingested neighbor list: {inum} of {} particles, {} pure, {max_nbor} max neighbors",
            step.ilist.len(),
            self.max_last_ellipse
        );
        Ok(())
    }

    /// Build the neighbor list on the accelerator from positions.
    /// Positions are cast and uploaded as part of the build.
    fn build_nbor_list(
        &mut self,
        step: &DeviceListStep<'_>,
        inum: usize,
        host_inum: usize,
    ) -> Result<()> {
        self.nbor_state = NeighborState::Rebuilding;
        self.nbor_time_avail = true;
        let max_nbors = self.nbor.max_nbors();
        let resized = self
            .device
            .atoms_mut()
            .resize(step.x.len())
            .and_then(|_| self.answers.resize(inum))
            .and_then(|_| self.nbor.resize(inum, host_inum, max_nbors));
        if let Err(err) = resized {
            self.nbor_state = NeighborState::Uninitialized;
            warn!("neighbor list build failed: {err}");
            return Err(err);
        }

        let atoms = self.device.atoms_mut();
        atoms.cast_x(step.x, step.types);
        atoms.add_x();
        let request = BuildRequest {
            inum,
            host_inum,
            domain: &step.domain,
            tags: step.tags,
            specials: step.specials,
        };
        let max_nbor = match self.nbor.build(self.device.atoms(), &request) {
            Ok(max_nbor) => max_nbor,
            Err(err) => {
                self.nbor_state = NeighborState::Uninitialized;
                return Err(err);
            }
        };
        self.nbor.copy_unpacked(inum, max_nbor);
        self.last_ellipse = inum;
        self.max_last_ellipse = inum;
        self.built_inum = inum;
        self.built_nall = step.x.len();
        self.nbor_state = NeighborState::Built;
        self.track_bytes();
        debug!("built neighbor list: {inum} accelerator, {host_inum} host, {max_nbor} max neighbors");
        Ok(())
    }

    fn check_types(&self, types: &[usize]) -> Result<()> {
        let n_types = self.forms.as_ref().map_or(0, FormMatrix::n_types);
        match types.iter().find(|&&t| t >= n_types) {
            Some(t) => Err(EngineError::InvalidInput(format!(
                "particle type {t} outside 0..{n_types}"
            ))),
            None => Ok(()),
        }
    }

    fn check_host_step(&self, step: &HostListStep<'_>) -> Result<()> {
        let nall = step.x.len();
        if step.types.len() != nall || step.quat.len() != nall {
            return Err(EngineError::InvalidInput(format!(
                "{nall} positions but {} types and {} orientations",
                step.types.len(),
                step.quat.len()
            )));
        }
        if step.ilist.len() > nall {
            return Err(EngineError::InvalidInput(format!(
                "{} local particles exceed {nall} particles",
                step.ilist.len()
            )));
        }
        if let Some(i) = step.ilist.iter().find(|&&i| i >= nall) {
            return Err(EngineError::InvalidInput(format!(
                "local particle {i} outside 0..{nall}"
            )));
        }
        if !step.ilist.iter().all_unique() {
            return Err(EngineError::InvalidInput(
                "local particle list has duplicates".to_string(),
            ));
        }
        let bad_row = step.ilist.iter().find(|&&i| {
            step.neighbors
                .get(i)
                .map_or(true, |row| row.iter().any(|&j| j >= nall))
        });
        if let Some(i) = bad_row {
            return Err(EngineError::InvalidInput(format!(
                "particle {i} has no valid neighbor row"
            )));
        }
        self.check_types(step.types)
    }

    fn check_device_step(&self, step: &DeviceListStep<'_>) -> Result<()> {
        let nall = step.x.len();
        if step.types.len() != nall || step.quat.len() != nall || step.tags.len() != nall {
            return Err(EngineError::InvalidInput(format!(
                "{nall} positions but {} types, {} orientations and {} tags",
                step.types.len(),
                step.quat.len(),
                step.tags.len()
            )));
        }
        if step.inum_full > nall {
            return Err(EngineError::InvalidInput(format!(
                "{} local particles exceed {nall} particles",
                step.inum_full
            )));
        }
        self.check_types(step.types)
    }

    /// Step with a host-built neighbor list.
    ///
    /// Returns the particle list in the order the answers were written; the
    /// host evaluates entries from `last_step().host_start` onwards. Returns
    /// `None` if there are no local particles.
    pub fn compute_host_list<'s>(
        &'s mut self,
        step: &HostListStep<'s>,
    ) -> Result<Option<&'s [usize]>> {
        self.ensure_initialized()?;
        self.acc_timers();
        let inum_full = step.ilist.len();
        if inum_full == 0 {
            self.zero_work();
            return Ok(None);
        }
        self.check_host_step(step)?;

        let ago = self.balancer.ago_first(step.ago);
        let inum = self.balancer.balance(ago, inum_full, step.cpu_time);
        if ago == 0 {
            self.reset_nbors(step, inum)?;
        } else {
            self.reuse_nbors(inum, step.x.len())?;
        }
        self.answers.set_inum(inum);
        self.last_ellipse = inum.min(self.max_last_ellipse);

        let atoms = self.device.atoms_mut();
        atoms.cast_x(step.x, step.types);
        atoms.cast_quat(step.quat);
        self.balancer.start_timer();
        let atoms = self.device.atoms_mut();
        atoms.add_x();
        atoms.add_quat();
        self.dispatch_loop(inum, step.flags)?;

        let list = if self.multiple_forms {
            self.ordered.as_slice()
        } else {
            step.ilist
        };
        self.answers.copy_answers(step.flags, Some(list));
        self.device.add_answers(&self.answers);
        self.balancer.stop_timer();
        self.last_step = StepOutcome {
            inum,
            host_start: inum,
            cold: ago == 0,
        };
        Ok(Some(list))
    }

    /// Step with an accelerator-built neighbor list.
    ///
    /// Local particles are `0..inum_full`; the accelerator evaluates the
    /// first `inum` and the returned lists cover the rest. Returns `None` if
    /// there are no local particles.
    pub fn compute_device_list(
        &mut self,
        step: &DeviceListStep<'_>,
    ) -> Result<Option<DeviceNeighbors<'_>>> {
        self.ensure_initialized()?;
        self.acc_timers();
        if step.inum_full == 0 {
            self.zero_work();
            return Ok(None);
        }
        self.check_device_step(step)?;

        self.balancer.balance_time(step.cpu_time);
        let inum = self.balancer.gpu_count(step.ago, step.inum_full);
        if step.ago == 0 {
            self.build_nbor_list(step, inum, step.inum_full - inum)?;
        } else {
            self.reuse_nbors(inum, step.x.len())?;
        }
        self.answers.set_inum(inum);
        self.last_ellipse = inum.min(self.max_last_ellipse);

        if step.ago == 0 {
            self.device.atoms_mut().cast_quat(step.quat);
            self.balancer.start_timer();
        } else {
            let atoms = self.device.atoms_mut();
            atoms.cast_x(step.x, step.types);
            atoms.cast_quat(step.quat);
            self.balancer.start_timer();
            self.device.atoms_mut().add_x();
        }
        self.device.atoms_mut().add_quat();
        self.dispatch_loop(inum, step.flags)?;

        self.answers.copy_answers(step.flags, None);
        self.device.add_answers(&self.answers);
        self.balancer.stop_timer();
        self.last_step = StepOutcome {
            inum,
            host_start: inum,
            cold: step.ago == 0,
        };
        Ok(Some(DeviceNeighbors {
            ilist: self.nbor.host_ilist(),
            numj: self.nbor.host_numj(),
            firstneigh: self.nbor.host_firstneigh(),
            host_start: inum,
        }))
    }

    fn launch(
        &mut self,
        kernel: Kernel,
        start: usize,
        end: usize,
        (form_low, form_high): (Form, Form),
        flags: EnergyFlags,
    ) -> Result<()> {
        let forms = self.forms.as_ref().ok_or(EngineError::NotInitialized)?;
        let grid = Grid::covering(end - start, self.block_size, self.threads_per_atom);
        let args = LaunchArgs {
            start,
            end,
            form_low,
            form_high,
            forms,
            flags,
        };
        self.device
            .launch(&kernel, grid, &args, &mut self.nbor, &mut self.answers)?;
        self.ledger.record_dispatch();
        Ok(())
    }

    /// Pack the neighbors of slots `start..end` that fall in a form range
    fn pack_nbors(
        &mut self,
        start: usize,
        end: usize,
        forms: (Form, Form),
        flags: EnergyFlags,
    ) -> Result<()> {
        let set = self.programs.get()?;
        let kernel = if self.shared_types {
            set.nbor_fast
        } else {
            set.nbor
        };
        trace!("packing slots {start}..{end} for forms {forms:?}");
        self.launch(kernel, start, end, forms, flags)
    }

    /// Launch the pair kernels for the `inum` accelerator particles
    fn dispatch_loop(&mut self, inum: usize, flags: EnergyFlags) -> Result<()> {
        let set = self.programs.get()?.clone();
        let all = (Form::SphereSphere, Form::EllipseEllipse);
        if !self.multiple_forms {
            self.ledger.nbor1.start();
            self.pack_nbors(0, inum, all, flags)?;
            self.ledger.nbor1.stop();
            self.ledger.ellipsoid.start();
            self.launch(set.ellipsoid, 0, inum, all, flags)?;
            self.ledger.ellipsoid.stop();
            return Ok(());
        }

        let last = self.last_ellipse;
        if last > 0 {
            let ellipse = (Form::EllipseSphere, Form::EllipseEllipse);
            self.ledger.nbor1.start();
            self.pack_nbors(0, last, ellipse, flags)?;
            self.ledger.nbor1.stop();
            self.ledger.ellipsoid.start();
            self.launch(set.ellipsoid, 0, last, ellipse, flags)?;
            self.ledger.ellipsoid.stop();
        } else {
            self.answers.zero();
        }
        if last < inum {
            let sphere = (Form::SphereEllipse, Form::SphereEllipse);
            self.ledger.nbor2.start();
            self.pack_nbors(last, inum, sphere, flags)?;
            self.ledger.nbor2.stop();
            self.ledger.ellipsoid2.start();
            self.launch(set.sphere_ellipsoid, last, inum, sphere, flags)?;
            self.ledger.ellipsoid2.stop();
            let lj = if self.shared_types {
                set.lj_fast
            } else {
                set.lj
            };
            self.ledger.lj.start();
            self.launch(lj, last, inum, (Form::SphereSphere, Form::SphereSphere), flags)?;
            self.ledger.lj.stop();
        }
        Ok(())
    }

    /// Reduce the timers over all replicas and write the report.
    ///
    /// Resets the ledger and the interval memory maximum. Returns `None` if
    /// the reduction failed.
    pub fn output_times(&mut self) -> Option<TimeSummary> {
        let summary = match self.reduce_times() {
            Ok(summary) => Some(summary),
            Err(err) => {
                warn!("skipping accelerator timing report: {err}");
                None
            }
        };
        if let Some(summary) = &summary {
            let rank = self.device.replica().rank();
            if let (0, Some(screen)) = (rank, self.screen.as_mut()) {
                if summary.cast > 0.0 {
                    if let Err(err) = summary.write_to(&mut **screen) {
                        warn!("failed to write timing report: {err}");
                    }
                }
            }
        }
        self.ledger.clear();
        self.max_bytes = 0;
        summary
    }

    fn reduce_times(&mut self) -> Result<TimeSummary> {
        let atoms = self.device.atoms();
        let single = [
            atoms.transfer_time() + self.answers.transfer_time(),
            self.nbor.copy_time(),
            self.ledger.nbor1.total_seconds()
                + self.ledger.nbor2.total_seconds()
                + self.nbor.build_time(),
            self.ledger.ellipsoid.total_seconds() + self.ledger.ellipsoid2.total_seconds(),
            if self.multiple_forms {
                self.ledger.lj.total_seconds()
            } else {
                0.0
            },
            atoms.cast_time() + self.answers.cast_time(),
            self.gpu_overhead,
            self.driver_overhead,
            self.answers.cpu_idle_time(),
        ];
        debug_assert_eq!(single.len(), TimeSummary::N_PHASES);
        self.max_bytes = self.max_bytes.max(self.max_an_bytes + atoms.max_gpu_bytes());

        let replica = self.device.replica();
        let size = replica.size();
        let sums = replica.sum(&single)?;
        let split = replica.sum(&[self.balancer.all_avg_split()])?;
        let max_bytes = replica.max(self.max_bytes as f64)?;

        let mut summary = TimeSummary::from_sums(&sums, size);
        summary.average_split = split.first().copied().unwrap_or(0.0) / size.max(1) as f64;
        summary.max_mb = max_bytes / (1024.0 * 1024.0);
        summary.device_neighbors = self.nbor.is_device_built();
        summary.exclusive_device = self.device.procs_per_gpu() == 1;
        Ok(summary)
    }

    /// Release everything. Safe to call repeatedly and without init.
    pub fn clear_base(&mut self) {
        if self.initialized {
            self.output_times();
        }
        self.ordered.clear();
        self.programs.clear(&mut self.device);
        self.ledger.clear();
        self.balancer.clear();
        self.nbor.clear();
        self.answers.clear();
        self.device.clear();
        self.forms = None;
        self.multiple_forms = false;
        self.last_ellipse = 0;
        self.max_last_ellipse = 0;
        self.nbor_state = NeighborState::Uninitialized;
        self.built_inum = 0;
        self.built_nall = 0;
        self.nbor_time_avail = false;
        self.max_an_bytes = 0;
        self.max_bytes = 0;
        self.screen = None;
        self.last_step = StepOutcome::default();
        if self.initialized {
            debug!("ellipsoid accelerator released");
        }
        self.initialized = false;
    }

    /// Device bytes needed per particle with rows of `max_nbors`
    pub fn bytes_per_atom(&self, max_nbors: usize) -> usize {
        self.device.atoms().bytes_per_atom()
            + self.answers.bytes_per_atom()
            + self.nbor.bytes_per_atom(max_nbors)
    }

    /// Host bytes held by the orchestrator and its buffers
    pub fn host_memory_usage_base(&self) -> usize {
        self.device.atoms().host_memory_usage()
            + self.answers.host_memory_usage()
            + self.nbor.host_memory_usage()
            + self.ordered.capacity() * std::mem::size_of::<usize>()
            + std::mem::size_of::<Self>()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// True if some pair of real types is not ellipsoid-ellipsoid
    pub fn multiple_forms(&self) -> bool {
        self.multiple_forms
    }

    /// Accelerator slots `0..last_ellipse` hold pure ellipsoid particles
    pub fn last_ellipse(&self) -> usize {
        self.last_ellipse
    }

    /// Pure ellipsoid particles at the last rebuild
    pub fn max_last_ellipse(&self) -> usize {
        self.max_last_ellipse
    }

    pub fn ordered_list(&self) -> &[usize] {
        self.ordered.as_slice()
    }

    pub fn neighbor_state(&self) -> NeighborState {
        self.nbor_state
    }

    pub fn program_state(&self) -> ProgramState {
        self.programs.state()
    }

    pub fn ledger(&self) -> &TimingLedger {
        &self.ledger
    }

    /// Run maximum of answer plus neighbor list device bytes
    pub fn max_an_bytes(&self) -> usize {
        self.max_an_bytes
    }

    pub fn last_step(&self) -> StepOutcome {
        self.last_step
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn answers(&self) -> &D::Answers {
        &self.answers
    }

    pub fn neighbors(&self) -> &D::Neighbors {
        &self.nbor
    }

    pub fn balancer(&self) -> &B {
        &self.balancer
    }
}

impl<D: Device, B: LoadBalancer> Drop for BaseEllipsoid<D, B> {
    fn drop(&mut self) {
        self.clear_base();
    }
}
