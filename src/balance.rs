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

//! Host/accelerator load balancing.
//!
//! The balancer decides, step by step, how many of the local particles are
//! evaluated on the accelerator. The remainder is left to the host.

use crate::timing::Timer;
use average::{Estimate, Mean};

/// Rebalance every this many steps once the warm-up is over
const BALANCE_EVERY: usize = 25;
/// Number of initial steps that are always measured
const WARMUP_STEPS: u64 = 11;
/// Bias of the measured split towards the accelerator
const BALANCE_GAP: f64 = 1.10;
/// Initial split when balancing dynamically
const INITIAL_DYNAMIC_SPLIT: f64 = 0.90;
/// Host share reserved at init for dynamic balancing with device neighbor lists
const INITIAL_HOST_SHARE: f64 = 0.05;

/// Adaptive split engine used by the orchestrator.
pub trait LoadBalancer {
    /// Prepare for a run. A negative `split` requests dynamic balancing.
    fn init(&mut self, device_nbor: bool, split: f64);

    /// Number of local particles the host must be prepared to handle at init
    fn first_host_count(&self, nlocal: usize, split: f64, device_nbor: bool) -> usize;

    /// May turn a warm step into a cold one so that the first measured split
    /// is adopted immediately.
    fn ago_first(&self, ago: usize) -> usize;

    /// Feed back the host time of the previous step
    fn balance_time(&mut self, cpu_time: f64);

    /// Accelerator particle count for this step, in `[0, inum_full]`
    fn gpu_count(&mut self, ago: usize, inum_full: usize) -> usize;

    /// Combined feedback and count, as used with host-built neighbor lists
    fn balance(&mut self, ago: usize, inum_full: usize, cpu_time: f64) -> usize {
        self.balance_time(cpu_time);
        self.gpu_count(ago, inum_full)
    }

    /// Bracket the accelerator part of a step
    fn start_timer(&mut self);
    fn stop_timer(&mut self);

    /// Average split of this process since init
    fn all_avg_split(&self) -> f64;

    fn clear(&mut self);
}

/// Balancer with either a fixed split or a split measured from timings.
#[derive(Clone, Debug)]
pub struct HostDeviceBalancer {
    load_balance: bool,
    device_nbor: bool,
    desired_split: f64,
    actual_split: f64,
    max_split: f64,
    avg_split: Mean,
    timestep: usize,
    measure_this_step: bool,
    inum: usize,
    inum_full: usize,
    device_time: Timer,
}

impl Default for HostDeviceBalancer {
    fn default() -> Self {
        Self {
            load_balance: false,
            device_nbor: false,
            desired_split: 1.0,
            actual_split: 1.0,
            max_split: 1.0,
            avg_split: Mean::new(),
            timestep: 0,
            measure_this_step: false,
            inum: 0,
            inum_full: 0,
            device_time: Timer::default(),
        }
    }
}

impl HostDeviceBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split requested for the next rebuild
    pub fn desired_split(&self) -> f64 {
        self.desired_split
    }

    /// Split in effect this step
    pub fn actual_split(&self) -> f64 {
        self.actual_split
    }

    pub fn is_dynamic(&self) -> bool {
        self.load_balance
    }

    fn measure(&mut self, cpu_time: f64) {
        let gpu_time = self.device_time.seconds();
        self.device_time.zero();
        if self.inum_full == self.inum {
            // No host work to compare against
            self.desired_split = 1.0;
            return;
        }
        let cpu_time_per_atom = cpu_time / (self.inum_full - self.inum) as f64;
        if cpu_time_per_atom <= 0.0 || !cpu_time_per_atom.is_finite() {
            debug!("no usable host timing; keeping split {:.3}", self.desired_split);
            return;
        }
        // Host particles that fit into the time the accelerator needed
        let host_inum = (gpu_time / cpu_time_per_atom).floor();
        let split = (self.inum_full as f64 - host_inum) / self.inum_full as f64;
        self.desired_split = (split * BALANCE_GAP).clamp(0.0, 1.0);
        if !self.device_nbor {
            self.actual_split = self.desired_split.min(self.max_split);
        }
        trace!(
            "measured split {:.3} (accelerator {gpu_time:.2e} s, host {cpu_time:.2e} s)",
            self.desired_split
        );
    }
}

impl LoadBalancer for HostDeviceBalancer {
    fn init(&mut self, device_nbor: bool, split: f64) {
        *self = Self::default();
        self.device_nbor = device_nbor;
        if split < 0.0 {
            self.load_balance = true;
            self.desired_split = INITIAL_DYNAMIC_SPLIT;
        } else {
            self.desired_split = split.min(1.0);
        }
        self.actual_split = self.desired_split;
        self.max_split = self.desired_split;
        info!(
            "{} host/accelerator split, initial {:.2}",
            if self.load_balance { "dynamic" } else { "fixed" },
            self.actual_split
        );
    }

    fn first_host_count(&self, nlocal: usize, split: f64, device_nbor: bool) -> usize {
        if !device_nbor || split == 1.0 {
            return 0;
        }
        let share = if split > 0.0 {
            1.0 - split
        } else {
            INITIAL_HOST_SHARE
        };
        ((share * nlocal as f64).ceil() as usize).min(nlocal)
    }

    fn ago_first(&self, ago: usize) -> usize {
        if self.avg_split.len() == 1 && self.actual_split < self.desired_split {
            0
        } else {
            ago
        }
    }

    fn balance_time(&mut self, cpu_time: f64) {
        if self.measure_this_step {
            self.measure_this_step = false;
            self.measure(cpu_time);
        }
        self.avg_split.add(self.desired_split);
    }

    fn gpu_count(&mut self, ago: usize, inum_full: usize) -> usize {
        self.measure_this_step = false;
        if self.load_balance {
            if self.avg_split.len() < WARMUP_STEPS || self.timestep % BALANCE_EVERY == 0 {
                self.measure_this_step = true;
                self.inum_full = inum_full;
            }
            if ago == 0 {
                self.actual_split = self.desired_split;
                self.max_split = self.desired_split;
            }
        }
        let inum = (self.actual_split * inum_full as f64).floor() as usize;
        self.inum = inum.max(1).min(inum_full);
        self.timestep += 1;
        self.inum
    }

    fn start_timer(&mut self) {
        if self.measure_this_step {
            self.device_time.start();
        }
    }

    fn stop_timer(&mut self) {
        if self.measure_this_step {
            self.device_time.stop();
        }
    }

    fn all_avg_split(&self) -> f64 {
        if self.load_balance && !self.avg_split.is_empty() {
            self.avg_split.mean()
        } else {
            self.actual_split
        }
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}
