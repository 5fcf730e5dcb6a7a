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
    backend::{Answers, EnergyFlags},
    timing::Timer,
    Result,
};
use get_size::GetSize;
use std::sync::Arc;

/// Force (4 floats) and energy/virial (7 floats) per answer slot
const BYTES_PER_ANSWER: usize = 4 * 4 + 7 * 4;

/// Answers read back to the host, indexed by particle
#[derive(Clone, Debug, Default, GetSize)]
struct HostAnswers {
    energy: Vec<f64>,
    /// Particles in slot order of the last readback
    particles: Vec<usize>,
}

/// Answer accumulator of the emulated device.
pub struct EmulatedAnswers {
    budget: Arc<MemoryBudget>,
    capacity: usize,
    inum: usize,
    dev_engv: Vec<f64>,
    host: HostAnswers,
    total_energy: f64,
    time_idle: Timer,
    time_transfer: Timer,
    time_cast: Timer,
}

impl EmulatedAnswers {
    pub(crate) fn new(budget: Arc<MemoryBudget>) -> Self {
        Self {
            budget,
            capacity: 0,
            inum: 0,
            dev_engv: Vec::new(),
            host: HostAnswers::default(),
            total_energy: 0.0,
            time_idle: Timer::default(),
            time_transfer: Timer::default(),
            time_cast: Timer::default(),
        }
    }

    /// Overwrite slots `start..start + values.len()`
    pub(crate) fn write_slots(&mut self, start: usize, values: &[usize], flags: EnergyFlags) {
        if flags.eflag || flags.eatom {
            self.dev_engv[start..start + values.len()]
                .iter_mut()
                .zip(values)
                .for_each(|(slot, &n)| *slot = n as f64);
        }
    }

    /// Accumulate into slots `start..start + values.len()`
    pub(crate) fn add_slots(&mut self, start: usize, values: &[usize], flags: EnergyFlags) {
        if flags.eflag || flags.eatom {
            self.dev_engv[start..start + values.len()]
                .iter_mut()
                .zip(values)
                .for_each(|(slot, &n)| *slot += n as f64);
        }
    }

    /// Per-particle energy of the last readback; zero for particles the
    /// device did not evaluate.
    pub fn energy(&self, particle: usize) -> f64 {
        self.host.energy.get(particle).copied().unwrap_or(0.0)
    }

    /// Particles of the last readback, in slot order
    pub fn evaluated(&self) -> &[usize] {
        &self.host.particles
    }

    pub fn total_energy(&self) -> f64 {
        self.total_energy
    }
}

impl Answers for EmulatedAnswers {
    fn set_inum(&mut self, inum: usize) {
        self.inum = inum;
    }

    fn inum(&self) -> usize {
        self.inum
    }

    fn resize(&mut self, inum: usize) -> Result<()> {
        if inum > self.capacity {
            self.budget.grow(
                "answers",
                self.capacity * BYTES_PER_ANSWER,
                inum * BYTES_PER_ANSWER,
            )?;
            self.capacity = inum;
            self.dev_engv.resize(inum, 0.0);
        }
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn zero(&mut self) {
        self.dev_engv.iter_mut().for_each(|e| *e = 0.0);
    }

    fn copy_answers(&mut self, flags: EnergyFlags, list: Option<&[usize]>) {
        self.time_idle.start();
        let inum = self.inum.min(self.capacity);
        self.time_idle.stop();

        self.time_transfer.start();
        let slots = &self.dev_engv[..inum];
        self.time_transfer.stop();

        self.time_cast.start();
        self.host.particles.clear();
        self.host
            .particles
            .extend((0..inum).map(|slot| list.map_or(slot, |list| list[slot])));
        self.host.energy.clear();
        if flags.eatom {
            let n = self.host.particles.iter().max().map_or(0, |&max| max + 1);
            self.host.energy.resize(n, 0.0);
            for (&particle, &energy) in self.host.particles.iter().zip(slots) {
                self.host.energy[particle] = energy;
            }
        }
        self.total_energy = if flags.eflag {
            slots.iter().sum()
        } else {
            0.0
        };
        self.time_cast.stop();
    }

    fn cpu_idle_time(&self) -> f64 {
        self.time_idle.total_seconds()
    }

    fn transfer_time(&self) -> f64 {
        self.time_transfer.total_seconds()
    }

    fn cast_time(&self) -> f64 {
        self.time_cast.total_seconds()
    }

    fn gpu_bytes(&self) -> usize {
        self.capacity * BYTES_PER_ANSWER
    }

    fn bytes_per_atom(&self) -> usize {
        BYTES_PER_ANSWER
    }

    fn host_memory_usage(&self) -> usize {
        self.host.get_heap_size() + self.dev_engv.capacity() * std::mem::size_of::<f64>()
    }

    fn acc_timers(&mut self) {
        self.time_idle.add_to_total();
        self.time_transfer.add_to_total();
        self.time_cast.add_to_total();
    }

    fn zero_timers(&mut self) {
        self.time_idle.zero();
        self.time_transfer.zero();
        self.time_cast.zero();
    }

    fn clear(&mut self) {
        self.budget.release(self.gpu_bytes());
        self.capacity = 0;
        self.inum = 0;
        self.dev_engv = Vec::new();
        self.host = HostAnswers::default();
        self.total_energy = 0.0;
        self.time_idle.clear();
        self.time_transfer.clear();
        self.time_cast.clear();
    }
}
