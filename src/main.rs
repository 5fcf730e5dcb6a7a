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

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use ellipsoid_accel::{
    backend::{
        emulated::{build_neighbor_rows, EmulatedDevice},
        EnergyFlags, NeighborMode, PackedAtom, SubDomain,
    },
    config::EngineConfig,
    kernels::KernelSource,
    timing::TimeSummary,
    BaseEllipsoid, DeviceListStep, HostListStep, InitParams, UnitQuaternion, Vector3,
};
use indicatif::ProgressIterator;
use itertools::Itertools;
use log::{info, warn};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::{f64::consts::PI, fs::File, path::PathBuf, time::Instant};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    /// Neighbor lists built by the host
    Host,
    /// Neighbor lists built on the accelerator
    Device,
}

impl From<Mode> for NeighborMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Host => NeighborMode::Host,
            Mode::Device => NeighborMode::Device,
        }
    }
}

/// Run ellipsoid pair steps on an emulated accelerator and report timings
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short = 'i', long)]
    config: Option<PathBuf>,
    /// Number of steps
    #[arg(short, long)]
    steps: Option<usize>,
    /// Number of particles
    #[arg(short = 'n', long)]
    particles: Option<usize>,
    /// Accelerator fraction; negative for dynamic balancing
    #[arg(long, allow_hyphen_values = true)]
    gpu_split: Option<f64>,
    /// Where neighbor lists are built
    #[arg(long, value_enum)]
    mode: Option<Mode>,
    /// Write the timing summary as JSON
    #[arg(long)]
    json: Option<PathBuf>,
}

impl Cli {
    fn config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::load(path)?,
            None => EngineConfig::default(),
        };
        config.steps = self.steps.unwrap_or(config.steps);
        config.particles = self.particles.unwrap_or(config.particles);
        config.gpu_split = self.gpu_split.unwrap_or(config.gpu_split);
        config.neighbor_mode = self.mode.map_or(config.neighbor_mode, NeighborMode::from);
        config.validate()?;
        Ok(config)
    }
}

/// Particles in a cubic box
struct System {
    x: Vec<Vector3>,
    types: Vec<usize>,
    quat: Vec<UnitQuaternion>,
    box_length: f64,
}

impl System {
    fn random(config: &EngineConfig, rng: &mut SmallRng) -> Self {
        let box_length = config.box_length;
        let x = (0..config.particles)
            .map(|_| Vector3::from_fn(|_, _| rng.gen_range(0.0..box_length)))
            .collect_vec();
        let types = (0..config.particles)
            .map(|_| rng.gen_range(1..config.n_types()))
            .collect_vec();
        let quat = (0..config.particles)
            .map(|_| {
                UnitQuaternion::from_euler_angles(
                    rng.gen_range(-PI..PI),
                    rng.gen_range(-PI / 2.0..PI / 2.0),
                    rng.gen_range(-PI..PI),
                )
            })
            .collect_vec();
        Self {
            x,
            types,
            quat,
            box_length,
        }
    }

    /// Random displacement, kept inside the box
    fn jitter(&mut self, rng: &mut SmallRng, amplitude: f64) {
        if amplitude <= 0.0 {
            return;
        }
        let upper = self.box_length * (1.0 - f64::EPSILON);
        for pos in self.x.iter_mut() {
            *pos = pos.map(|c| (c + rng.gen_range(-amplitude..amplitude)).clamp(0.0, upper));
        }
    }

    fn packed(&self) -> Vec<PackedAtom> {
        self.x
            .iter()
            .zip(&self.types)
            .map(|(pos, &kind)| PackedAtom::new(pos, kind))
            .collect()
    }

    fn domain(&self) -> SubDomain {
        SubDomain {
            lo: [0.0; 3],
            hi: [self.box_length; 3],
        }
    }
}

fn run(config: &EngineConfig) -> Result<Option<TimeSummary>> {
    let mut rng = SmallRng::seed_from_u64(config.seed);
    let mut system = System::random(config, &mut rng);
    let n = config.particles;

    let mut device = EmulatedDevice::new(config.neighbor_mode)
        .with_block_size(config.block_size)
        .with_threads_per_atom(config.threads_per_atom);
    if let Some(bytes) = config.memory_bytes() {
        device = device.with_memory_limit(bytes);
    }
    let mut engine = BaseEllipsoid::new(device);
    engine
        .init_base(InitParams {
            nlocal: n,
            nall: n,
            max_nbors: config.max_neighbors,
            max_specials: config.max_specials,
            cell_size: config.cell_size(),
            gpu_split: config.gpu_split,
            screen: None,
            forms: config.form_matrix(),
            source: KernelSource::counting(),
        })
        .context("cannot initialize the accelerator")?;

    let ilist = (0..n).collect_vec();
    let flags = EnergyFlags::energy();
    let mut rows: Vec<Vec<usize>> = Vec::new();
    let mut cpu_time = 0.0;
    let mut mismatches = 0;

    for step in (0..config.steps).progress_count(config.steps as u64) {
        let ago = step % config.rebuild_every;
        if ago == 0 || rows.len() != n {
            rows = build_neighbor_rows(
                &system.packed(),
                n,
                &system.domain(),
                config.cell_size(),
                |_, _| false,
            )?;
        }
        let expected: usize = rows.iter().map(Vec::len).sum();

        let (device_part, host_part) = match config.neighbor_mode {
            NeighborMode::Host => {
                let input = HostListStep {
                    ago,
                    x: &system.x,
                    types: &system.types,
                    quat: &system.quat,
                    ilist: &ilist,
                    neighbors: &rows,
                    flags,
                    cpu_time,
                };
                let Some(list) = engine.compute_host_list(&input)? else {
                    continue;
                };
                let list = list.to_vec();
                let host_start = engine.last_step().host_start;
                let started = Instant::now();
                let host_part: usize = list[host_start..].iter().map(|&i| rows[i].len()).sum();
                cpu_time = started.elapsed().as_secs_f64();
                let device_part: f64 = list[..host_start]
                    .iter()
                    .map(|&i| engine.answers().energy(i))
                    .sum();
                (device_part, host_part)
            }
            NeighborMode::Device => {
                let input = DeviceListStep {
                    ago,
                    inum_full: n,
                    x: &system.x,
                    types: &system.types,
                    quat: &system.quat,
                    domain: system.domain(),
                    tags: &ilist,
                    specials: &[],
                    flags,
                    cpu_time,
                };
                let Some(host) = engine.compute_device_list(&input)? else {
                    continue;
                };
                let started = Instant::now();
                let host_part: usize = host.numj.iter().sum();
                let host_start = host.host_start;
                cpu_time = started.elapsed().as_secs_f64();
                let device_part: f64 = (0..host_start).map(|i| engine.answers().energy(i)).sum();
                (device_part, host_part)
            }
        };
        if device_part as usize + host_part != expected {
            mismatches += 1;
            warn!(
                "step {step}: {device_part} accelerator + {host_part} host pairs, expected {expected}"
            );
        }
        system.jitter(&mut rng, config.displacement);
    }

    info!(
        "{} steps, {} kernel launches, last split {} of {}",
        config.steps,
        engine.ledger().dispatches(),
        engine.last_step().inum,
        n
    );
    if mismatches > 0 {
        bail!("{mismatches} steps did not evaluate every neighbor pair exactly once");
    }
    Ok(engine.output_times())
}

fn main() -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    pretty_env_logger::init();

    let cli = Cli::parse();
    let config = cli.config()?;
    info!(
        "{} particles of {} types, {:?} neighbor lists, split {}",
        config.particles,
        config.types.len(),
        config.neighbor_mode,
        config.gpu_split
    );

    let Some(summary) = run(&config)? else {
        warn!("no timing summary available");
        return Ok(());
    };
    summary.write_to(&mut std::io::stdout().lock())?;
    if let Some(path) = &cli.json {
        let file = File::create(path).with_context(|| format!("cannot create {}", path.display()))?;
        serde_json::to_writer_pretty(file, &summary)?;
        info!("wrote timing summary to {}", path.display());
    }
    Ok(())
}
