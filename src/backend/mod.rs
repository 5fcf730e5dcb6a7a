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

//! Accelerator backend abstraction.
//!
//! The orchestrator drives four collaborators through the traits in this
//! module: the [`Device`] context (which owns the per-atom [`AtomBuffers`]),
//! the [`Answers`] accumulator, the [`NeighborList`] manager and a
//! [`Replica`] group used for reporting. A backend provides one type for each.
//! [`emulated`] runs everything in host memory, parallelized with rayon.

pub mod emulated;

use crate::{
    form::{Form, FormMatrix},
    kernels::{Grid, Kernel, ProgramHandle},
    Result, UnitQuaternion, Vector3,
};
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// Where neighbor lists are built
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NeighborMode {
    /// The host builds lists and the orchestrator ingests them
    #[default]
    Host,
    /// Lists are built on the accelerator from positions
    Device,
}

/// Which quantities to compute and read back
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EnergyFlags {
    /// Total energy
    pub eflag: bool,
    /// Total virial
    pub vflag: bool,
    /// Per-atom energy
    pub eatom: bool,
    /// Per-atom virial
    pub vatom: bool,
}

impl EnergyFlags {
    /// Energies, total and per atom
    pub const fn energy() -> Self {
        Self {
            eflag: true,
            vflag: false,
            eatom: true,
            vatom: false,
        }
    }
}

/// Device-layout particle record: position and type
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct PackedAtom {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    /// Particle type, stored as float like the position
    pub kind: f32,
}

impl PackedAtom {
    pub fn new(pos: &Vector3, kind: usize) -> Self {
        Self {
            x: pos.x as f32,
            y: pos.y as f32,
            z: pos.z as f32,
            kind: kind as f32,
        }
    }

    pub fn kind(&self) -> usize {
        self.kind as usize
    }

    pub fn distance_squared(&self, other: &Self) -> f32 {
        let (dx, dy, dz) = (self.x - other.x, self.y - other.y, self.z - other.z);
        dx * dx + dy * dy + dz * dz
    }
}

/// Device-layout orientation record (w, i, j, k)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct PackedQuat(pub [f32; 4]);

impl From<&UnitQuaternion> for PackedQuat {
    fn from(q: &UnitQuaternion) -> Self {
        Self([q.w as f32, q.i as f32, q.j as f32, q.k as f32])
    }
}

/// Sizes handed to [`Device::init`]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DeviceInit {
    pub nlocal: usize,
    /// Local particles the host may evaluate with device-built lists
    pub host_nlocal: usize,
    pub nall: usize,
    pub max_nbors: usize,
    pub max_specials: usize,
    /// Neighbor cutoff including skin
    pub cell_size: f64,
    /// Particles carry orientations
    pub rot: bool,
}

/// Spatial domain of this process, excluding ghosts
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SubDomain {
    pub lo: [f64; 3],
    pub hi: [f64; 3],
}

/// Input for building a neighbor list on the device
#[derive(Clone, Copy, Debug)]
pub struct BuildRequest<'a> {
    /// Particles evaluated on the device, `0..inum`
    pub inum: usize,
    /// Particles left to the host, `inum..inum + host_inum`
    pub host_inum: usize,
    pub domain: &'a SubDomain,
    /// Global tag of every particle, local and ghost
    pub tags: &'a [usize],
    /// Tags excluded from the neighbor list of each local particle
    pub specials: &'a [Vec<usize>],
}

/// Kernel arguments beyond the buffers the device already owns
#[derive(Clone, Copy, Debug)]
pub struct LaunchArgs<'a> {
    /// Slot range `[start, end)` of the neighbor list
    pub start: usize,
    pub end: usize,
    /// Inclusive range of forms to keep when packing
    pub form_low: Form,
    pub form_high: Form,
    pub forms: &'a FormMatrix,
    pub flags: EnergyFlags,
}

/// Per-atom position, type and orientation storage on the device.
pub trait AtomBuffers {
    /// Grow to hold `nall` particles. Never shrinks.
    fn resize(&mut self, nall: usize) -> Result<()>;
    /// Particles currently held
    fn nall(&self) -> usize;
    fn capacity(&self) -> usize;
    fn bytes_per_atom(&self) -> usize;
    /// Convert positions and types to device layout in host staging memory
    fn cast_x(&mut self, x: &[Vector3], types: &[usize]);
    fn cast_quat(&mut self, quat: &[UnitQuaternion]);
    /// Upload staged positions
    fn add_x(&mut self);
    /// Upload staged orientations
    fn add_quat(&mut self);
    /// Positions as currently resident on the device
    fn device_x(&self) -> &[PackedAtom];
    fn transfer_time(&self) -> f64;
    fn cast_time(&self) -> f64;
    /// Largest device footprint since the last reset (bytes)
    fn max_gpu_bytes(&self) -> usize;
    fn host_memory_usage(&self) -> usize;
    fn acc_timers(&mut self);
    fn zero_timers(&mut self);
    fn clear(&mut self);
}

/// Force/energy/virial storage for the particles evaluated on the device.
pub trait Answers {
    /// Particles evaluated on the device this step
    fn set_inum(&mut self, inum: usize);
    fn inum(&self) -> usize;
    /// Grow to hold `inum` answers. Never shrinks.
    fn resize(&mut self, inum: usize) -> Result<()>;
    fn capacity(&self) -> usize;
    /// Zero the device-side answers
    fn zero(&mut self);
    /// Read back answers; slot `i` belongs to particle `list[i]`, or to
    /// particle `i` when no list is given.
    fn copy_answers(&mut self, flags: EnergyFlags, list: Option<&[usize]>);
    /// Host time spent waiting for the device
    fn cpu_idle_time(&self) -> f64;
    fn transfer_time(&self) -> f64;
    fn cast_time(&self) -> f64;
    fn gpu_bytes(&self) -> usize;
    fn bytes_per_atom(&self) -> usize;
    fn host_memory_usage(&self) -> usize;
    fn acc_timers(&mut self);
    fn zero_timers(&mut self);
    fn clear(&mut self);
}

/// Pairwise neighbor storage, ingested from the host or built on the device.
pub trait NeighborList {
    /// Grow to `inum + host_inum` rows of at least `max_nbors` entries
    fn resize(&mut self, inum: usize, host_inum: usize, max_nbors: usize) -> Result<()>;
    /// Longest neighbor row among `ilist`
    fn max_nbor_loop(&self, ilist: &[usize], neighbors: &[Vec<usize>]) -> usize;
    /// Stage the host rows of `ilist`, in that order, for the device
    fn get_host(&mut self, ilist: &[usize], neighbors: &[Vec<usize>], block_size: usize);
    /// Build rows for all particles of `request` from the positions on the
    /// device. Returns the longest row.
    fn build<A: AtomBuffers>(&mut self, atoms: &A, request: &BuildRequest<'_>) -> Result<usize>;
    /// Unpack staged or built rows into the device layout
    fn copy_unpacked(&mut self, inum: usize, max_nbor: usize);
    /// Stride between consecutive entries of one row
    fn nbor_pitch(&self) -> usize;
    /// Row capacity
    fn max_nbors(&self) -> usize;
    /// Row count capacity
    fn max_atoms(&self) -> usize;
    fn gpu_bytes(&self) -> usize;
    fn bytes_per_atom(&self, max_nbors: usize) -> usize;
    fn host_memory_usage(&self) -> usize;
    /// Host particles of the last device build and their rows
    fn host_ilist(&self) -> &[usize];
    fn host_numj(&self) -> &[usize];
    fn host_firstneigh(&self) -> &[Vec<usize>];
    /// Time spent copying host rows
    fn copy_time(&self) -> f64;
    /// Time spent building rows on the device
    fn build_time(&self) -> f64;
    /// Rows were built on the device rather than ingested
    fn is_device_built(&self) -> bool;
    fn acc_timers(&mut self);
    fn clear(&mut self);
}

/// Group of cooperating processes sharing a report.
pub trait Replica {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    /// Element-wise sum over all replicas
    fn sum(&self, values: &[f64]) -> Result<Vec<f64>>;
    /// Maximum over all replicas
    fn max(&self, value: f64) -> Result<f64>;
}

/// A replica group of one
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleReplica;

impl Replica for SingleReplica {
    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn sum(&self, values: &[f64]) -> Result<Vec<f64>> {
        Ok(values.to_vec())
    }
    fn max(&self, value: f64) -> Result<f64> {
        Ok(value)
    }
}

/// Accelerator context: buffers, program compilation and kernel launch.
pub trait Device {
    type Atoms: AtomBuffers;
    type Answers: Answers;
    type Neighbors: NeighborList;

    /// Fresh accumulator bound to this device
    fn create_answers(&self) -> Self::Answers;
    /// Fresh neighbor list bound to this device
    fn create_neighbors(&self) -> Self::Neighbors;

    /// Size the device, the accumulator and the neighbor list for a run
    fn init(
        &mut self,
        answers: &mut Self::Answers,
        nbor: &mut Self::Neighbors,
        params: &DeviceInit,
    ) -> Result<()>;
    fn mode(&self) -> NeighborMode;
    fn threads_per_atom(&self) -> usize;
    fn pair_block_size(&self) -> usize;
    fn atoms(&self) -> &Self::Atoms;
    fn atoms_mut(&mut self) -> &mut Self::Atoms;

    fn compile(&mut self, source: &str, flags: &str) -> Result<ProgramHandle>;
    /// Look up an entry point of a compiled program
    fn kernel(&self, program: ProgramHandle, name: &'static str) -> Result<Kernel>;
    fn release(&mut self, program: ProgramHandle);
    /// Enqueue a kernel
    fn launch(
        &mut self,
        kernel: &Kernel,
        grid: Grid,
        args: &LaunchArgs<'_>,
        nbor: &mut Self::Neighbors,
        answers: &mut Self::Answers,
    ) -> Result<()>;

    /// Queue freshly produced answers for later aggregation
    fn add_answers(&mut self, answers: &Self::Answers);
    /// Per-step launch overhead and driver time (seconds) for `kernels` launches
    fn estimate_overhead(&mut self, kernels: usize) -> (f64, f64);
    fn replica(&self) -> &dyn Replica;
    fn procs_per_gpu(&self) -> usize;
    fn clear(&mut self);
}
