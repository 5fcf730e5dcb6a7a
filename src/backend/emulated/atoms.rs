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
    backend::{AtomBuffers, PackedAtom, PackedQuat},
    timing::Timer,
    Result, UnitQuaternion, Vector3,
};
use std::{mem::size_of, sync::Arc};

/// Positions, types and orientations in device layout.
///
/// Casting fills host staging vectors; `add_x`/`add_quat` copy them to the
/// "device" vectors read by the emulated kernels.
pub struct EmulatedAtoms {
    budget: Arc<MemoryBudget>,
    capacity: usize,
    nall: usize,
    host_x: Vec<PackedAtom>,
    host_quat: Vec<PackedQuat>,
    dev_x: Vec<PackedAtom>,
    dev_quat: Vec<PackedQuat>,
    transferred_bytes: usize,
    max_gpu_bytes: usize,
    time_cast: Timer,
    time_transfer: Timer,
}

impl EmulatedAtoms {
    pub(crate) fn new(budget: Arc<MemoryBudget>) -> Self {
        Self {
            budget,
            capacity: 0,
            nall: 0,
            host_x: Vec::new(),
            host_quat: Vec::new(),
            dev_x: Vec::new(),
            dev_quat: Vec::new(),
            transferred_bytes: 0,
            max_gpu_bytes: 0,
            time_cast: Timer::default(),
            time_transfer: Timer::default(),
        }
    }

    fn gpu_bytes(&self) -> usize {
        self.capacity * self.bytes_per_atom()
    }

    /// Orientations as currently resident on the device
    pub fn device_quat(&self) -> &[PackedQuat] {
        &self.dev_quat
    }

    /// Bytes uploaded since creation
    pub fn transferred_bytes(&self) -> usize {
        self.transferred_bytes
    }
}

impl AtomBuffers for EmulatedAtoms {
    fn resize(&mut self, nall: usize) -> Result<()> {
        if nall > self.capacity {
            let per_atom = self.bytes_per_atom();
            self.budget
                .grow("atom buffers", self.capacity * per_atom, nall * per_atom)?;
            self.capacity = nall;
            self.max_gpu_bytes = self.max_gpu_bytes.max(self.gpu_bytes());
        }
        self.nall = nall;
        Ok(())
    }

    fn nall(&self) -> usize {
        self.nall
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn bytes_per_atom(&self) -> usize {
        size_of::<PackedAtom>() + size_of::<PackedQuat>()
    }

    fn cast_x(&mut self, x: &[Vector3], types: &[usize]) {
        self.time_cast.start();
        self.host_x.clear();
        self.host_x.extend(
            x.iter()
                .zip(types)
                .take(self.nall)
                .map(|(pos, &kind)| PackedAtom::new(pos, kind)),
        );
        self.time_cast.stop();
    }

    fn cast_quat(&mut self, quat: &[UnitQuaternion]) {
        self.time_cast.start();
        self.host_quat.clear();
        self.host_quat
            .extend(quat.iter().take(self.nall).map(PackedQuat::from));
        self.time_cast.stop();
    }

    fn add_x(&mut self) {
        self.time_transfer.start();
        self.dev_x.clear();
        self.dev_x.extend_from_slice(&self.host_x);
        self.transferred_bytes += bytemuck::cast_slice::<PackedAtom, u8>(&self.host_x).len();
        self.time_transfer.stop();
    }

    fn add_quat(&mut self) {
        self.time_transfer.start();
        self.dev_quat.clear();
        self.dev_quat.extend_from_slice(&self.host_quat);
        self.transferred_bytes += bytemuck::cast_slice::<PackedQuat, u8>(&self.host_quat).len();
        self.time_transfer.stop();
    }

    fn device_x(&self) -> &[PackedAtom] {
        &self.dev_x
    }

    fn transfer_time(&self) -> f64 {
        self.time_transfer.total_seconds()
    }

    fn cast_time(&self) -> f64 {
        self.time_cast.total_seconds()
    }

    fn max_gpu_bytes(&self) -> usize {
        self.max_gpu_bytes
    }

    fn host_memory_usage(&self) -> usize {
        (self.host_x.capacity() + self.dev_x.capacity()) * size_of::<PackedAtom>()
            + (self.host_quat.capacity() + self.dev_quat.capacity()) * size_of::<PackedQuat>()
            + size_of::<Self>()
    }

    fn acc_timers(&mut self) {
        self.time_cast.add_to_total();
        self.time_transfer.add_to_total();
    }

    fn zero_timers(&mut self) {
        self.time_cast.zero();
        self.time_transfer.zero();
    }

    fn clear(&mut self) {
        self.budget.release(self.gpu_bytes());
        self.capacity = 0;
        self.nall = 0;
        self.max_gpu_bytes = 0;
        self.host_x = Vec::new();
        self.host_quat = Vec::new();
        self.dev_x = Vec::new();
        self.dev_quat = Vec::new();
        self.time_cast.clear();
        self.time_transfer.clear();
    }
}
