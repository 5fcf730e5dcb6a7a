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

use approx::assert_relative_eq;
use ellipsoid_accel::{
    backend::{
        emulated::{build_neighbor_rows, EmulatedDevice},
        Answers, AtomBuffers, Device, EnergyFlags, NeighborList, NeighborMode, PackedAtom,
        Replica, SubDomain,
    },
    balance::LoadBalancer,
    kernels::{KernelSource, ProgramState},
    BaseEllipsoid, DeviceListStep, EngineError, FormMatrix, HostListStep, InitParams,
    NeighborState, Result, UnitQuaternion, Vector3,
};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::{
    io::Write,
    sync::{Arc, Mutex},
};

const CUTOFF: f64 = 1.5;

/// Balancer that always puts a fixed number of particles on the accelerator
#[derive(Default)]
struct FixedBalancer(usize);

impl LoadBalancer for FixedBalancer {
    fn init(&mut self, _device_nbor: bool, _split: f64) {}
    fn first_host_count(&self, _nlocal: usize, _split: f64, _device_nbor: bool) -> usize {
        0
    }
    fn ago_first(&self, ago: usize) -> usize {
        ago
    }
    fn balance_time(&mut self, _cpu_time: f64) {}
    fn gpu_count(&mut self, _ago: usize, inum_full: usize) -> usize {
        self.0.min(inum_full)
    }
    fn start_timer(&mut self) {}
    fn stop_timer(&mut self) {}
    fn all_avg_split(&self) -> f64 {
        1.0
    }
    fn clear(&mut self) {}
}

/// Replica group whose communication always fails
struct FailingReplica;

impl Replica for FailingReplica {
    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        2
    }
    fn sum(&self, _values: &[f64]) -> Result<Vec<f64>> {
        Err(EngineError::Reduction("link down".to_string()))
    }
    fn max(&self, _value: f64) -> Result<f64> {
        Err(EngineError::Reduction("link down".to_string()))
    }
}

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Host-side particle data of one step
struct Frame {
    x: Vec<Vector3>,
    types: Vec<usize>,
    quat: Vec<UnitQuaternion>,
    ilist: Vec<usize>,
    neighbors: Vec<Vec<usize>>,
}

impl Frame {
    fn new(x: Vec<Vector3>, types: Vec<usize>) -> Self {
        let n = x.len();
        let packed = x
            .iter()
            .zip(&types)
            .map(|(pos, &kind)| PackedAtom::new(pos, kind))
            .collect::<Vec<_>>();
        let hi = x.iter().map(|p| p.max()).fold(1.0, f64::max);
        let domain = SubDomain {
            lo: [0.0; 3],
            hi: [hi; 3],
        };
        let neighbors = build_neighbor_rows(&packed, n, &domain, CUTOFF, |_, _| false).unwrap();
        Self {
            x,
            types,
            quat: vec![UnitQuaternion::identity(); n],
            ilist: (0..n).collect(),
            neighbors,
        }
    }

    /// Particles on a line with unit spacing; neighbors are `i ± 1`
    fn chain(types: Vec<usize>) -> Self {
        let x = (0..types.len())
            .map(|i| Vector3::new(i as f64, 0.0, 0.0))
            .collect();
        Self::new(x, types)
    }

    fn random(n: usize, n_types: usize, seed: u64) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let x = (0..n)
            .map(|_| Vector3::from_fn(|_, _| rng.gen_range(0.0..5.0)))
            .collect();
        let types = (0..n).map(|_| rng.gen_range(1..n_types)).collect();
        Self::new(x, types)
    }

    fn step(&self, ago: usize) -> HostListStep<'_> {
        HostListStep {
            ago,
            x: &self.x,
            types: &self.types,
            quat: &self.quat,
            ilist: &self.ilist,
            neighbors: &self.neighbors,
            flags: EnergyFlags::energy(),
            cpu_time: 0.0,
        }
    }

    fn n_pairs(&self) -> usize {
        self.neighbors.iter().map(Vec::len).sum()
    }
}

fn init<B: LoadBalancer>(
    engine: &mut BaseEllipsoid<EmulatedDevice, B>,
    nlocal: usize,
    forms: FormMatrix,
    gpu_split: f64,
) -> Result<()> {
    engine.init_base(InitParams {
        nlocal,
        nall: nlocal,
        max_nbors: 4,
        max_specials: 0,
        cell_size: CUTOFF,
        gpu_split,
        screen: None,
        forms,
        source: KernelSource::counting(),
    })
}

fn run_host<B: LoadBalancer>(
    engine: &mut BaseEllipsoid<EmulatedDevice, B>,
    frame: &Frame,
    ago: usize,
) -> Result<Option<Vec<usize>>> {
    let step = frame.step(ago);
    Ok(engine.compute_host_list(&step)?.map(<[usize]>::to_vec))
}

/// Types 1 and 3 are ellipsoids, type 2 is a sphere
fn mixed_forms() -> FormMatrix {
    FormMatrix::from_shapes(&[true, true, false, true])
}

#[test]
fn zero_work_step_dispatches_nothing() {
    let mut engine = BaseEllipsoid::new(EmulatedDevice::new(NeighborMode::Host));
    init(&mut engine, 10, FormMatrix::uniform(2), 1.0).unwrap();
    let mut frame = Frame::chain(vec![1; 10]);
    frame.ilist.clear();
    assert_eq!(run_host(&mut engine, &frame, 0).unwrap(), None);
    assert_eq!(engine.last_step().host_start, 0);
    assert_eq!(engine.ledger().dispatches(), 0);
    assert!(engine.ledger().is_zero());
    assert!(engine.device().launches().is_empty());
    assert_eq!(engine.neighbor_state(), NeighborState::Uninitialized);

    let mut engine = BaseEllipsoid::new(EmulatedDevice::new(NeighborMode::Device));
    init(&mut engine, 10, FormMatrix::uniform(2), 1.0).unwrap();
    let step = DeviceListStep {
        ago: 0,
        inum_full: 0,
        x: &frame.x,
        types: &frame.types,
        quat: &frame.quat,
        domain: SubDomain {
            lo: [0.0; 3],
            hi: [10.0; 3],
        },
        tags: &frame.ilist,
        specials: &[],
        flags: EnergyFlags::energy(),
        cpu_time: 0.0,
    };
    assert!(engine.compute_device_list(&step).unwrap().is_none());
    assert!(engine.device().launches().is_empty());
}

#[test]
fn multiple_forms_is_fixed_at_init() {
    let mut engine = BaseEllipsoid::new(EmulatedDevice::new(NeighborMode::Host));
    init(&mut engine, 10, mixed_forms(), 1.0).unwrap();
    assert!(engine.multiple_forms());
    let frame = Frame::chain(vec![1; 10]);
    for ago in 0..4 {
        run_host(&mut engine, &frame, ago).unwrap();
        assert!(engine.multiple_forms());
    }

    init(&mut engine, 10, FormMatrix::uniform(3), 1.0).unwrap();
    assert!(!engine.multiple_forms());
}

#[test]
fn cold_step_orders_pure_particles_first() {
    let forms = mixed_forms();
    let mut frame = Frame::random(40, 4, 7);
    frame.ilist.reverse();
    let mut engine = BaseEllipsoid::new(EmulatedDevice::new(NeighborMode::Host));
    init(&mut engine, 40, forms.clone(), 0.5).unwrap();
    let list = run_host(&mut engine, &frame, 0).unwrap().unwrap();

    let is_pure = |i: usize| forms.is_pure_type(frame.types[i]);
    let pure = frame.ilist.iter().copied().filter(|&i| is_pure(i));
    let mixed = frame.ilist.iter().copied().filter(|&i| !is_pure(i));
    let expected = pure.chain(mixed).collect::<Vec<_>>();
    assert_eq!(list, expected);
    assert_eq!(engine.ordered_list(), expected.as_slice());

    let max_last = engine.max_last_ellipse();
    assert_eq!(max_last, frame.ilist.iter().filter(|&&i| is_pure(i)).count());
    assert!(list[..max_last].iter().all(|&i| is_pure(i)));
    assert!(list[max_last..].iter().all(|&i| !is_pure(i)));

    let inum = engine.last_step().inum;
    assert_eq!(inum, 20);
    assert_eq!(engine.last_ellipse(), inum.min(max_last));
    assert!(engine.last_ellipse() <= max_last);
    assert_eq!(engine.neighbor_state(), NeighborState::Built);
}

#[test]
fn clear_base_twice() {
    let mut engine = BaseEllipsoid::new(EmulatedDevice::new(NeighborMode::Host));
    init(&mut engine, 10, mixed_forms(), 1.0).unwrap();
    run_host(&mut engine, &Frame::chain(vec![1; 10]), 0).unwrap();
    engine.clear_base();
    engine.clear_base();
    assert!(!engine.is_initialized());
    assert_eq!(engine.program_state(), ProgramState::TornDown);
    assert_eq!(engine.device().live_programs(), 0);
    assert_eq!(engine.device().budget().used(), 0);
    assert_eq!(engine.neighbor_state(), NeighborState::Uninitialized);
    assert_eq!(
        run_host(&mut engine, &Frame::chain(vec![1; 10]), 0).unwrap_err(),
        EngineError::NotInitialized
    );

    // Re-initialization after teardown compiles again
    init(&mut engine, 10, mixed_forms(), 1.0).unwrap();
    assert_eq!(engine.program_state(), ProgramState::Compiled);
    assert_eq!(engine.device().compiles(), 6);
}

#[test]
fn capacities_only_grow() {
    let mut engine = BaseEllipsoid::new(EmulatedDevice::new(NeighborMode::Host));
    init(&mut engine, 4, FormMatrix::uniform(2), 1.0).unwrap();
    run_host(&mut engine, &Frame::chain(vec![1; 12]), 0).unwrap();
    let answers = engine.answers().capacity();
    let rows = engine.neighbors().max_atoms();
    let atoms = engine.device().atoms().capacity();
    let max_an_bytes = engine.max_an_bytes();
    assert_eq!(answers, 12);
    assert!(rows >= 12);

    run_host(&mut engine, &Frame::chain(vec![1; 5]), 0).unwrap();
    assert_eq!(engine.answers().capacity(), answers);
    assert_eq!(engine.neighbors().max_atoms(), rows);
    assert_eq!(engine.device().atoms().capacity(), atoms);
    assert_eq!(engine.max_an_bytes(), max_an_bytes);
    assert_eq!(
        max_an_bytes,
        engine.answers().gpu_bytes() + engine.neighbors().gpu_bytes()
    );

    let summary = engine.output_times().unwrap();
    let reported = summary.max_mb * 1024.0 * 1024.0;
    assert!(reported >= max_an_bytes as f64);
    assert_eq!(engine.ledger().dispatches(), 0);
}

#[test]
fn warm_steps_reuse_the_list() {
    let frame = Frame::random(30, 4, 11);
    let mut engine = BaseEllipsoid::new(EmulatedDevice::new(NeighborMode::Host));
    init(&mut engine, 30, mixed_forms(), 1.0).unwrap();
    let cold = run_host(&mut engine, &frame, 0).unwrap().unwrap();
    let max_last = engine.max_last_ellipse();
    let last = engine.last_ellipse();
    assert!(engine.last_step().cold);

    for ago in 1..4 {
        let warm = run_host(&mut engine, &frame, ago).unwrap().unwrap();
        assert_eq!(warm, cold);
        assert_eq!(engine.max_last_ellipse(), max_last);
        assert_eq!(engine.last_ellipse(), last);
        assert_eq!(engine.neighbor_state(), NeighborState::Stale);
        assert!(!engine.last_step().cold);
    }
    assert_eq!(engine.neighbors().ingests(), 1);
    assert_eq!(engine.device().answer_batches(), &[30, 30, 30, 30]);
}

#[test]
fn single_type_ten_particles() {
    let frame = Frame::chain(vec![1; 10]);
    let mut engine = BaseEllipsoid::new(EmulatedDevice::new(NeighborMode::Host));
    init(&mut engine, 10, FormMatrix::uniform(2), 1.0).unwrap();
    assert!(!engine.multiple_forms());
    for ago in 0..5 {
        let list = run_host(&mut engine, &frame, ago).unwrap().unwrap();
        assert_eq!(list, frame.ilist);
        assert_eq!(engine.last_ellipse(), 10);
        assert_eq!(engine.max_last_ellipse(), 10);
        assert_eq!(engine.last_step().host_start, 10);
    }

    let mut engine = BaseEllipsoid::with_balancer(
        EmulatedDevice::new(NeighborMode::Host),
        FixedBalancer(6),
    );
    init(&mut engine, 10, FormMatrix::uniform(2), 1.0).unwrap();
    for ago in 0..3 {
        run_host(&mut engine, &frame, ago).unwrap();
        assert_eq!(engine.last_ellipse(), 6);
        assert_eq!(engine.max_last_ellipse(), 6);
    }
    // Only the ellipsoid kernel runs without multiple forms
    assert!(engine
        .device()
        .launches()
        .iter()
        .all(|l| matches!(l.kernel, "kernel_nbor_fast" | "kernel_ellipsoid")));
}

#[test]
fn two_types_ten_particles_with_six_on_the_accelerator() {
    // Types 1 (ellipsoid) and 2 (sphere); only the (1, 2) pair is mixed
    let forms = FormMatrix::from_shapes(&[true, true, false]);
    assert!(forms.multiple_forms());
    let frame = Frame::chain(vec![2, 1, 2, 2, 1, 1, 2, 1, 2, 2]);
    let mut engine = BaseEllipsoid::with_balancer(
        EmulatedDevice::new(NeighborMode::Host),
        FixedBalancer(6),
    );
    init(&mut engine, 10, forms, 1.0).unwrap();
    let list = run_host(&mut engine, &frame, 0).unwrap().unwrap();

    let pure = vec![1, 4, 5, 7];
    assert_eq!(&list[..4], pure.as_slice());
    assert_eq!(&list[4..], &[0, 2, 3, 6, 8, 9]);
    assert_eq!(engine.max_last_ellipse(), 4);
    assert_eq!(engine.last_ellipse(), 4);
    assert_eq!(engine.last_step().host_start, 6);

    // Every accelerator particle sees each of its neighbors exactly once
    for &i in &list[..6] {
        assert_relative_eq!(engine.answers().energy(i), frame.neighbors[i].len() as f64);
    }
    for &i in &list[6..] {
        assert_relative_eq!(engine.answers().energy(i), 0.0);
    }
    let kernels = engine
        .device()
        .launches()
        .iter()
        .map(|l| (l.kernel, l.start, l.end))
        .collect::<Vec<_>>();
    assert_eq!(
        kernels,
        vec![
            ("kernel_nbor_fast", 0, 4),
            ("kernel_ellipsoid", 0, 4),
            ("kernel_nbor_fast", 4, 6),
            ("kernel_sphere_ellipsoid", 4, 6),
            ("kernel_lj_fast", 4, 6),
        ]
    );
    assert_eq!(engine.ledger().dispatches(), 5);
}

#[test]
fn only_spheres_on_the_accelerator() {
    let forms = FormMatrix::from_shapes(&[true, true, false]);
    let frame = Frame::chain(vec![2; 8]);
    let mut engine = BaseEllipsoid::new(EmulatedDevice::new(NeighborMode::Host));
    init(&mut engine, 8, forms, 1.0).unwrap();
    run_host(&mut engine, &frame, 0).unwrap();
    assert_eq!(engine.last_ellipse(), 0);
    for i in 0..8 {
        assert_relative_eq!(engine.answers().energy(i), frame.neighbors[i].len() as f64);
    }
    assert_eq!(engine.device().launches()[0].kernel, "kernel_nbor_fast");
    assert_eq!(engine.device().launches()[1].kernel, "kernel_sphere_ellipsoid");
}

#[test]
fn resize_failure_aborts_the_step() {
    // Enough memory for two particles, not for ten
    let device = EmulatedDevice::new(NeighborMode::Host).with_memory_limit(256);
    let mut engine = BaseEllipsoid::new(device);
    engine
        .init_base(InitParams {
            nlocal: 2,
            nall: 2,
            max_nbors: 2,
            max_specials: 0,
            cell_size: CUTOFF,
            gpu_split: 1.0,
            screen: None,
            forms: FormMatrix::uniform(2),
            source: KernelSource::counting(),
        })
        .unwrap();
    let frame = Frame::chain(vec![1; 10]);
    let err = run_host(&mut engine, &frame, 0).unwrap_err();
    assert!(matches!(err, EngineError::Resize { .. }));
    assert!(err.is_resource());
    assert_eq!(engine.ledger().dispatches(), 0);
    assert!(engine.device().launches().is_empty());
    assert!(engine.device().answer_batches().is_empty());
    assert!(engine.device().atoms().device_x().is_empty());
    assert_eq!(engine.neighbor_state(), NeighborState::Uninitialized);

    // The failed rebuild leaves nothing to reuse
    assert_eq!(
        run_host(&mut engine, &frame, 1).unwrap_err(),
        EngineError::NoNeighborList
    );
}

#[test]
fn device_build_failure_aborts_the_step() {
    let device = EmulatedDevice::new(NeighborMode::Device).with_memory_limit(256);
    let mut engine = BaseEllipsoid::new(device);
    engine
        .init_base(InitParams {
            nlocal: 2,
            nall: 2,
            max_nbors: 2,
            max_specials: 0,
            cell_size: CUTOFF,
            gpu_split: 1.0,
            screen: None,
            forms: FormMatrix::uniform(2),
            source: KernelSource::counting(),
        })
        .unwrap();
    let frame = Frame::chain(vec![1; 10]);
    let err = engine.compute_device_list(&device_step(&frame, 0)).unwrap_err();
    assert!(matches!(err, EngineError::Resize { .. }));
    assert_eq!(engine.ledger().dispatches(), 0);
    assert!(engine.device().launches().is_empty());
    assert!(engine.device().answer_batches().is_empty());
    assert_eq!(engine.neighbors().builds(), 0);
    assert_eq!(engine.neighbor_state(), NeighborState::Uninitialized);
    assert_eq!(engine.answers().inum(), 0);
    assert_eq!(engine.last_ellipse(), 0);

    assert_eq!(
        engine.compute_device_list(&device_step(&frame, 1)).unwrap_err(),
        EngineError::NoNeighborList
    );
}

#[test]
fn warm_step_with_other_particle_count_is_rejected() {
    let forms = FormMatrix::from_shapes(&[true, true, false]);
    let frame = Frame::chain(vec![2, 1, 2, 2, 1, 1, 2, 1, 2, 2]);
    let mut engine = BaseEllipsoid::with_balancer(
        EmulatedDevice::new(NeighborMode::Host),
        FixedBalancer(6),
    );
    init(&mut engine, 10, forms, 1.0).unwrap();
    run_host(&mut engine, &frame, 0).unwrap();
    assert_eq!(engine.last_ellipse(), 4);
    assert_eq!(engine.answers().inum(), 6);
    let launches = engine.device().launches().len();

    // Rows of the last rebuild reference particles this step does not have
    let shorter = Frame::chain(vec![2, 1, 2]);
    assert!(matches!(
        run_host(&mut engine, &shorter, 1),
        Err(EngineError::InvalidInput(_))
    ));
    assert_eq!(engine.last_ellipse(), 4);
    assert_eq!(engine.answers().inum(), 6);
    assert_eq!(engine.device().launches().len(), launches);
    assert_eq!(engine.neighbor_state(), NeighborState::Built);

    run_host(&mut engine, &frame, 1).unwrap();
    assert_eq!(engine.neighbor_state(), NeighborState::Stale);
}

/// Device-list step over a whole frame
fn device_step(frame: &Frame, ago: usize) -> DeviceListStep<'_> {
    let n = frame.x.len();
    DeviceListStep {
        ago,
        inum_full: n,
        x: &frame.x,
        types: &frame.types,
        quat: &frame.quat,
        domain: SubDomain {
            lo: [0.0; 3],
            hi: [n as f64; 3],
        },
        tags: &frame.ilist,
        specials: &[],
        flags: EnergyFlags::energy(),
        cpu_time: 0.0,
    }
}

#[test]
fn warm_device_step_with_other_particle_count_is_rejected() {
    let n = 10;
    let long = Frame::chain(vec![1; n]);
    let short = Frame::chain(vec![1; 5]);
    let mut engine = BaseEllipsoid::new(EmulatedDevice::new(NeighborMode::Device));
    init(&mut engine, n, FormMatrix::uniform(2), 1.0).unwrap();
    engine.compute_device_list(&device_step(&long, 0)).unwrap();
    assert!(matches!(
        engine.compute_device_list(&device_step(&short, 1)),
        Err(EngineError::InvalidInput(_))
    ));
    assert_eq!(engine.answers().inum(), n);
    engine.compute_device_list(&device_step(&long, 1)).unwrap();
}

#[test]
fn warm_step_without_list_is_rejected() {
    let mut engine = BaseEllipsoid::new(EmulatedDevice::new(NeighborMode::Host));
    init(&mut engine, 10, FormMatrix::uniform(2), 1.0).unwrap();
    let frame = Frame::chain(vec![1; 10]);
    assert_eq!(
        run_host(&mut engine, &frame, 3).unwrap_err(),
        EngineError::NoNeighborList
    );
    run_host(&mut engine, &frame, 0).unwrap();
    run_host(&mut engine, &frame, 1).unwrap();
}

#[test]
fn malformed_input_is_rejected() {
    let mut engine = BaseEllipsoid::new(EmulatedDevice::new(NeighborMode::Host));
    init(&mut engine, 10, FormMatrix::uniform(2), 1.0).unwrap();
    let mut frame = Frame::chain(vec![1; 10]);
    frame.types[3] = 5;
    assert!(matches!(
        run_host(&mut engine, &frame, 0),
        Err(EngineError::InvalidInput(_))
    ));
    frame.types[3] = 1;
    frame.quat.pop();
    assert!(matches!(
        run_host(&mut engine, &frame, 0),
        Err(EngineError::InvalidInput(_))
    ));

    // Local particles outside the position arrays, or listed twice
    let mut engine = BaseEllipsoid::new(EmulatedDevice::new(NeighborMode::Host));
    init(&mut engine, 5, mixed_forms(), 1.0).unwrap();
    let mut frame = Frame::chain(vec![1, 2, 1, 3, 2]);
    frame.ilist = vec![0, 1, 2, 3, 7];
    frame.neighbors.resize(8, Vec::new());
    assert!(matches!(
        run_host(&mut engine, &frame, 0),
        Err(EngineError::InvalidInput(_))
    ));
    frame.ilist = vec![0, 1, 1, 3, 4];
    assert!(matches!(
        run_host(&mut engine, &frame, 0),
        Err(EngineError::InvalidInput(_))
    ));
    assert!(engine.device().launches().is_empty());
    frame.ilist = vec![0, 1, 2, 3, 4];
    run_host(&mut engine, &frame, 0).unwrap();
}

#[test]
fn multiple_forms_with_device_lists_is_fatal() {
    let mut engine = BaseEllipsoid::new(EmulatedDevice::new(NeighborMode::Device));
    let err = init(&mut engine, 10, mixed_forms(), 0.8).unwrap_err();
    assert_eq!(err, EngineError::MultipleFormsWithDeviceNeighbors);
    assert!(err.is_fatal());
    assert!(!engine.is_initialized());
    assert_eq!(engine.program_state(), ProgramState::Uninitialized);

    // The same forms are fine with host-built lists
    let mut engine = BaseEllipsoid::new(EmulatedDevice::new(NeighborMode::Host));
    init(&mut engine, 10, mixed_forms(), 0.8).unwrap();
}

#[test]
fn failing_reduction_skips_the_report() {
    let device = EmulatedDevice::new(NeighborMode::Host).with_replica(FailingReplica);
    let mut engine = BaseEllipsoid::new(device);
    init(&mut engine, 10, FormMatrix::uniform(2), 1.0).unwrap();
    run_host(&mut engine, &Frame::chain(vec![1; 10]), 0).unwrap();
    assert!(engine.ledger().dispatches() > 0);
    assert!(engine.output_times().is_none());
    assert_eq!(engine.ledger().dispatches(), 0);
    engine.clear_base();
}

#[test]
fn report_is_written_to_the_sink() {
    let sink = SharedBuffer::default();
    let mut engine = BaseEllipsoid::new(EmulatedDevice::new(NeighborMode::Host));
    engine
        .init_base(InitParams {
            nlocal: 10,
            nall: 10,
            max_nbors: 4,
            max_specials: 0,
            cell_size: CUTOFF,
            gpu_split: 1.0,
            screen: Some(Box::new(sink.clone())),
            forms: FormMatrix::uniform(2),
            source: KernelSource::counting(),
        })
        .unwrap();
    let frame = Frame::chain(vec![1; 10]);
    for ago in 0..3 {
        run_host(&mut engine, &frame, ago).unwrap();
    }
    let summary = engine.output_times().unwrap();
    assert_eq!(summary.replicas, 1);
    assert!(summary.exclusive_device);
    assert!(!summary.device_neighbors);
    assert_relative_eq!(summary.average_split, 1.0);
    let text = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
    if summary.cast > 0.0 {
        assert!(text.contains("Accelerator Time Info"));
        assert!(text.contains("Average split:   1.0000."));
    } else {
        assert!(text.is_empty());
    }
}

#[test]
fn every_pair_is_evaluated_exactly_once() {
    let frame = Frame::random(60, 4, 3);
    let mut engine = BaseEllipsoid::with_balancer(
        EmulatedDevice::new(NeighborMode::Host).with_block_size(16),
        FixedBalancer(42),
    );
    init(&mut engine, 60, mixed_forms(), 1.0).unwrap();
    for ago in 0..3 {
        let list = run_host(&mut engine, &frame, ago).unwrap().unwrap();
        let host_start = engine.last_step().host_start;
        assert_eq!(host_start, 42);
        let device: f64 = list[..host_start]
            .iter()
            .map(|&i| engine.answers().energy(i))
            .sum();
        let host: usize = list[host_start..]
            .iter()
            .map(|&i| frame.neighbors[i].len())
            .sum();
        assert_eq!(device as usize + host, frame.n_pairs());
        assert_relative_eq!(engine.answers().total_energy(), device);
    }
}

#[test]
fn dynamic_balancing_stays_in_bounds() {
    let frame = Frame::random(50, 3, 5);
    let mut engine = BaseEllipsoid::new(EmulatedDevice::new(NeighborMode::Host));
    init(&mut engine, 50, FormMatrix::uniform(3), -1.0).unwrap();
    for step in 0..30 {
        let list = run_host(&mut engine, &frame, step % 5).unwrap().unwrap();
        let outcome = engine.last_step();
        assert!(outcome.inum >= 1 && outcome.inum <= 50);
        assert_eq!(list.len(), 50);
        assert_eq!(engine.last_ellipse(), outcome.inum);
    }
    let split = engine.balancer().all_avg_split();
    assert!((0.0..=1.0).contains(&split));
}

#[test]
fn device_built_lists() {
    let n = 20;
    let x = (0..n)
        .map(|i| Vector3::new(i as f64, 0.0, 0.0))
        .collect::<Vec<_>>();
    let types = vec![1; n];
    let quat = vec![UnitQuaternion::identity(); n];
    let tags = (0..n).map(|i| 100 + i).collect::<Vec<_>>();
    // Particle 1 does not interact with particle 2
    let mut specials = vec![Vec::new(); n];
    specials[1] = vec![102];

    let mut engine = BaseEllipsoid::new(EmulatedDevice::new(NeighborMode::Device));
    init(&mut engine, n, FormMatrix::uniform(2), 0.5).unwrap();
    let step = |ago: usize| DeviceListStep {
        ago,
        inum_full: n,
        x: &x,
        types: &types,
        quat: &quat,
        domain: SubDomain {
            lo: [0.0; 3],
            hi: [n as f64; 3],
        },
        tags: &tags,
        specials: &specials,
        flags: EnergyFlags::energy(),
        cpu_time: 0.0,
    };

    for ago in 0..3 {
        let host = engine.compute_device_list(&step(ago)).unwrap().unwrap();
        assert_eq!(host.host_start, 10);
        assert_eq!(host.ilist, (10..20).collect::<Vec<_>>().as_slice());
        assert_eq!(host.numj.iter().sum::<usize>(), 19);
        assert_eq!(host.firstneigh[0], vec![9, 11]);

        assert_relative_eq!(engine.answers().energy(0), 1.0);
        assert_relative_eq!(engine.answers().energy(1), 1.0);
        assert_relative_eq!(engine.answers().energy(2), 2.0);
        assert_relative_eq!(engine.answers().total_energy(), 18.0);
        assert_eq!(engine.last_ellipse(), 10);
        assert_eq!(engine.max_last_ellipse(), 10);
    }
    assert_eq!(engine.neighbors().builds(), 1);
    assert!(engine.neighbors().is_device_built());
    assert_eq!(engine.neighbor_state(), NeighborState::Stale);

    let summary = engine.output_times().unwrap();
    assert!(summary.device_neighbors);
}
