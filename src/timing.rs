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

//! Per-phase timers and the human readable timing summary.

use nu_ansi_term::Color::Cyan;
use serde::Serialize;
use std::{
    io::Write,
    time::{Duration, Instant},
};

/// Interval timer with a running total.
///
/// `start`/`stop` measure the current interval which is only folded into the
/// total by `add_to_total`. This mirrors how device timers are read back one
/// step late, after the work they measured has been synchronized.
#[derive(Clone, Debug, Default)]
pub struct Timer {
    started: Option<Instant>,
    interval: Duration,
    total: Duration,
}

impl Timer {
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    pub fn stop(&mut self) {
        if let Some(started) = self.started.take() {
            self.interval += started.elapsed();
        }
    }

    /// Seconds in the current, not yet accumulated, interval
    pub fn seconds(&self) -> f64 {
        self.interval.as_secs_f64()
    }

    pub fn add_to_total(&mut self) {
        self.total += self.interval;
        self.interval = Duration::ZERO;
    }

    /// Discard the current interval
    pub fn zero(&mut self) {
        self.started = None;
        self.interval = Duration::ZERO;
    }

    pub fn total_seconds(&self) -> f64 {
        self.total.as_secs_f64()
    }

    /// Discard interval and total
    pub fn clear(&mut self) {
        self.zero();
        self.total = Duration::ZERO;
    }

    pub(crate) fn is_zero(&self) -> bool {
        self.interval.is_zero() && self.total.is_zero()
    }
}

/// Timers owned by the orchestrator, one per kernel phase.
#[derive(Clone, Debug, Default)]
pub struct TimingLedger {
    /// Packing of the pure ellipsoid neighbor range
    pub nbor1: Timer,
    pub ellipsoid: Timer,
    /// Packing of the mixed-form neighbor range
    pub nbor2: Timer,
    pub ellipsoid2: Timer,
    pub lj: Timer,
    dispatches: usize,
}

impl TimingLedger {
    /// Fold the last step's intervals into the totals
    pub fn accumulate(&mut self, nbor_time_avail: bool, multiple_forms: bool) {
        if nbor_time_avail {
            self.nbor1.add_to_total();
            self.nbor2.add_to_total();
        } else {
            self.nbor1.zero();
            self.nbor2.zero();
        }
        self.ellipsoid.add_to_total();
        self.ellipsoid2.add_to_total();
        if multiple_forms {
            self.lj.add_to_total();
        } else {
            self.lj.zero();
        }
    }

    /// Discard the current intervals
    pub fn zero(&mut self) {
        self.timers_mut().for_each(Timer::zero);
    }

    /// Reset everything, including the dispatch count
    pub fn clear(&mut self) {
        self.timers_mut().for_each(Timer::clear);
        self.dispatches = 0;
    }

    pub(crate) fn record_dispatch(&mut self) {
        self.dispatches += 1;
    }

    /// Kernel launches issued since the last report
    pub fn dispatches(&self) -> usize {
        self.dispatches
    }

    /// True if no time has been recorded since the last reset
    pub fn is_zero(&self) -> bool {
        self.timers().all(Timer::is_zero)
    }

    fn timers(&self) -> impl Iterator<Item = &Timer> {
        [&self.nbor1, &self.ellipsoid, &self.nbor2, &self.ellipsoid2, &self.lj].into_iter()
    }

    fn timers_mut(&mut self) -> impl Iterator<Item = &mut Timer> {
        [
            &mut self.nbor1,
            &mut self.ellipsoid,
            &mut self.nbor2,
            &mut self.ellipsoid2,
            &mut self.lj,
        ]
        .into_iter()
    }
}

/// Replica-averaged timing for one report interval (seconds unless noted)
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TimeSummary {
    pub transfer: f64,
    pub neighbor_copy: f64,
    pub neighbor_build: f64,
    pub force: f64,
    pub lj: f64,
    pub cast: f64,
    pub gpu_overhead: f64,
    pub driver_overhead: f64,
    pub cpu_idle: f64,
    pub average_split: f64,
    /// Largest device footprint over all replicas (MB)
    pub max_mb: f64,
    pub replicas: usize,
    /// Neighbor lists were built on the device rather than unpacked
    pub device_neighbors: bool,
    /// Per-phase lines are only meaningful with one process per device
    pub exclusive_device: bool,
}

impl TimeSummary {
    /// Number of reduced per-phase quantities
    pub(crate) const N_PHASES: usize = 9;

    /// Build from replica-summed phase times
    pub(crate) fn from_sums(sums: &[f64], replicas: usize) -> Self {
        let n = replicas.max(1) as f64;
        let avg = |i: usize| sums.get(i).copied().unwrap_or(0.0) / n;
        Self {
            transfer: avg(0),
            neighbor_copy: avg(1),
            neighbor_build: avg(2),
            force: avg(3),
            lj: avg(4),
            cast: avg(5),
            gpu_overhead: avg(6),
            driver_overhead: avg(7),
            cpu_idle: avg(8),
            replicas,
            ..Default::default()
        }
    }

    /// Write the table
    pub fn write_to(&self, out: &mut dyn Write) -> std::io::Result<()> {
        let rule = "-".repeat(69);
        writeln!(out, "\n\n{rule}")?;
        writeln!(out, "      {}", Cyan.bold().paint("Accelerator Time Info (average):"))?;
        writeln!(out, "{rule}")?;
        if self.exclusive_device {
            writeln!(out, "Data Transfer:   {:.4} s.", self.transfer)?;
            writeln!(out, "Data Cast/Pack:  {:.4} s.", self.cast)?;
            writeln!(out, "Neighbor copy:   {:.4} s.", self.neighbor_copy)?;
            if self.device_neighbors {
                writeln!(out, "Neighbor build:  {:.4} s.", self.neighbor_build)?;
            } else {
                writeln!(out, "Neighbor unpack: {:.4} s.", self.neighbor_build)?;
            }
            writeln!(out, "Force calc:      {:.4} s.", self.force)?;
            writeln!(out, "LJ calc:         {:.4} s.", self.lj)?;
        }
        writeln!(out, "Device Overhead: {:.4} s.", self.gpu_overhead)?;
        writeln!(out, "Average split:   {:.4}.", self.average_split)?;
        writeln!(out, "Max Mem / Proc:  {:.2} MB.", self.max_mb)?;
        writeln!(out, "CPU Driver_Time: {:.4} s.", self.driver_overhead)?;
        writeln!(out, "CPU Idle_Time:   {:.4} s.", self.cpu_idle)?;
        writeln!(out, "{rule}\n")?;
        Ok(())
    }
}
