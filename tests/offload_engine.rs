use dagflow::data::HOST_DEVICE;
use dagflow::engine::TaskHandle;
use dagflow::error::DeviceError;
use dagflow::task::Incarnation;
use dagflow::{
    Coherency, DeviceClass, DeviceConfig, Engine, EngineConfig, Flow, FlowFlags, SchedulerKind,
    SimBackend, Task, TaskFunction, Topology,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const BLOCK: usize = 64;

/// Engine with one simulated accelerator whose pool holds `blocks`
/// copies of `BLOCK` bytes.
fn engine_with_device(workers: usize, blocks: i64) -> Arc<Engine> {
    engine_with_backends(
        workers,
        blocks,
        vec![Box::new(SimBackend::new("sim0", 1 << 20))],
    )
}

fn engine_with_backends(
    workers: usize,
    blocks: i64,
    backends: Vec<Box<dyn dagflow::DeviceBackend>>,
) -> Arc<Engine> {
    let config = EngineConfig::new(workers, SchedulerKind::Pbq).with_devices(DeviceConfig {
        memory_number_of_blocks: blocks,
        memory_block_size: BLOCK,
        ..DeviceConfig::default()
    });
    Engine::build_with_topology(config, Topology::with_nodes(workers, 1), backends)
}

/// Accelerator-only task function reading one datum.
fn reader_fn() -> Arc<TaskFunction> {
    Arc::new(TaskFunction::new(
        "read_one",
        vec![Flow::new(0, FlowFlags::READ, "in")],
        vec![Incarnation::accelerator(|_launch| Ok(()))],
    ))
}

/// Accelerator-only task function incrementing every byte of one datum.
fn incr_fn() -> Arc<TaskFunction> {
    Arc::new(TaskFunction::new(
        "incr_one",
        vec![Flow::new(0, FlowFlags::READ_WRITE, "buf")],
        vec![Incarnation::accelerator(|launch| {
            let buf = launch.flow_slice(0)?;
            for b in buf.iter_mut() {
                *b = b.wrapping_add(1);
            }
            Ok(())
        })],
    ))
}

#[test]
fn test_single_cpu_task_with_device_present() {
    // one CPU task under the absolute-priority scheduler; the device is
    // registered but stays untouched
    let config = EngineConfig::new(2, SchedulerKind::Ap).with_devices(DeviceConfig {
        memory_number_of_blocks: 4,
        memory_block_size: BLOCK,
        ..DeviceConfig::default()
    });
    let engine = Engine::build_with_topology(
        config,
        Topology::with_nodes(2, 1),
        vec![Box::new(SimBackend::new("sim0", 1 << 20))],
    );
    let function = Arc::new(TaskFunction::cpu_only("noop", vec![], |_| {}));
    engine.schedule(0, Task::new(function).with_priority(5), 0);

    assert!(engine.progress(0));
    assert_eq!(engine.executed_tasks(), 1);
    assert_eq!(engine.queued_tasks(), 0);

    let device = engine.accelerator(2).unwrap();
    let state = device.state.lock().unwrap();
    assert!(state.free_lru.is_empty());
    assert!(state.owned_lru.is_empty());
}

#[test]
fn test_lru_eviction_under_pressure() {
    // pool sized for exactly 2 copies, three read tasks on distinct
    // datums: the least recently used copy is evicted for the third
    let engine = engine_with_device(1, 2);
    for key in [1u64, 2, 3] {
        engine.register_data(key, vec![key as u8; BLOCK]);
    }

    let function = reader_fn();
    for key in [1u64, 2, 3] {
        let task = Task::new(function.clone())
            .with_class(DeviceClass::Accelerator)
            .bind(0, key);
        engine.schedule(0, task, 0);
        assert!(engine.progress(0));
    }

    assert_eq!(engine.executed_tasks(), 3);
    assert_eq!(engine.failed_tasks(), 0);

    engine.with_data(|table| {
        let on_device: Vec<u64> = [1u64, 2, 3]
            .into_iter()
            .filter(|&k| table.get_copy(k, 2).is_some())
            .collect();
        assert!(on_device.len() <= 2, "pool only holds two copies");
        assert!(
            table.get_copy(1, 2).is_none(),
            "oldest copy must have been evicted"
        );
        assert!(table.get_copy(2, 2).is_some());
        assert!(table.get_copy(3, 2).is_some());
    });

    let device = engine.accelerator(2).unwrap();
    assert_eq!(
        device.transferred_in.load(Ordering::SeqCst),
        3 * BLOCK as u64
    );
}

#[test]
fn test_coherence_write_after_read() {
    // A reads X, then B writes X. Host ends one version ahead and
    // shared; the retained device copy matches.
    let engine = engine_with_device(1, 4);
    engine.register_data(7, vec![10u8; BLOCK]);

    let read = Task::new(reader_fn())
        .with_class(DeviceClass::Accelerator)
        .bind(0, 7);
    engine.schedule(0, read, 0);
    assert!(engine.progress(0));

    let write = Task::new(incr_fn())
        .with_class(DeviceClass::Accelerator)
        .bind(0, 7);
    engine.schedule(0, write, 0);
    assert!(engine.progress(0));

    assert_eq!(engine.executed_tasks(), 2);
    assert_eq!(engine.failed_tasks(), 0);

    engine.with_data(|table| {
        let host = table.get_copy(7, HOST_DEVICE).unwrap();
        assert_eq!(host.version, 1);
        assert_eq!(host.coherency, Coherency::Shared);

        let gpu = table.get_copy(7, 2).expect("device copy retained");
        assert_eq!(gpu.version, 1);
        assert_eq!(gpu.coherency, Coherency::Shared);
    });
    assert_eq!(engine.host_bytes(7).unwrap(), vec![11u8; BLOCK]);
}

#[test]
fn test_read_only_roundtrip_preserves_host() {
    // read-only offloads leave the host copy untouched
    let engine = engine_with_device(1, 4);
    let pattern: Vec<u8> = (0..BLOCK as u8).collect();
    engine.register_data(5, pattern.clone());

    let function = reader_fn();
    for _ in 0..3 {
        let task = Task::new(function.clone())
            .with_class(DeviceClass::Accelerator)
            .bind(0, 5);
        engine.schedule(0, task, 0);
        assert!(engine.progress(0));
    }

    engine.with_data(|table| {
        let host = table.get_copy(5, HOST_DEVICE).unwrap();
        assert_eq!(host.version, 0);
    });
    assert_eq!(engine.host_bytes(5).unwrap(), pattern);
}

#[test]
fn test_driver_handover() {
    // while one worker holds the driver role, another worker's task
    // lands in the pending FIFO; the driver drains it

    let engine = engine_with_device(2, 4);
    engine.register_data(1, vec![0u8; BLOCK]);

    let device = engine.accelerator(2).unwrap().clone();
    assert!(device.try_become_driver(), "test takes the driver role");
    assert_eq!(device.takeovers.load(Ordering::SeqCst), 1);

    let function = reader_fn();
    let t1 = Task::new(function.clone())
        .with_class(DeviceClass::Accelerator)
        .bind(0, 1);
    engine.schedule(1, t1, 0);
    assert!(engine.progress(1));

    // worker 1 lost the election: its task waits in the pending FIFO
    assert_eq!(engine.executed_tasks(), 0);
    assert!(!device.pending.is_empty());

    device.release_driver();

    let t2 = Task::new(function)
        .with_class(DeviceClass::Accelerator)
        .bind(0, 1);
    engine.schedule(0, t2, 0);
    assert!(engine.progress(0));

    // the new driver drained both tasks exactly once
    assert_eq!(engine.executed_tasks(), 2);
    assert_eq!(device.takeovers.load(Ordering::SeqCst), 2);
    assert!(device.pending.is_empty());
    assert!(!device.is_driving());
}

#[test]
fn test_lazy_writeback_through_owned_lru() {
    // A task keeping its output on the device parks the copy on the
    // owned LRU; the idle driver synthesizes a write-back that mirrors
    // it to the host before relinquishing.
    let engine = engine_with_device(1, 4);
    engine.register_data(9, vec![1u8; BLOCK]);

    let task = Task::new(incr_fn())
        .with_class(DeviceClass::Accelerator)
        .bind(0, 9)
        .keep_on_device(0);
    engine.schedule(0, task, 0);
    assert!(engine.progress(0));

    assert_eq!(engine.executed_tasks(), 1);
    engine.with_data(|table| {
        let host = table.get_copy(9, HOST_DEVICE).unwrap();
        assert_eq!(host.coherency, Coherency::Shared);
        assert_eq!(host.version, 1);
        let gpu = table.get_copy(9, 2).unwrap();
        assert_eq!(gpu.coherency, Coherency::Shared);
        assert_eq!(gpu.readers, 0);
    });
    assert_eq!(engine.host_bytes(9).unwrap(), vec![2u8; BLOCK]);

    let device = engine.accelerator(2).unwrap();
    let state = device.state.lock().unwrap();
    assert!(state.owned_lru.is_empty());
    assert!(state.free_lru.contains(9));
}

#[test]
fn test_fatal_kernel_error_disables_device() {
    // A backend API failure from a kernel poisons the device; the task
    // is rerouted and falls back to its CPU incarnation.
    let engine = engine_with_device(1, 4);
    engine.register_data(3, vec![0u8; BLOCK]);

    let ran_on_cpu = Arc::new(AtomicUsize::new(0));
    let ran = ran_on_cpu.clone();
    let function = Arc::new(TaskFunction::new(
        "flaky",
        vec![Flow::new(0, FlowFlags::READ, "in")],
        vec![
            Incarnation::accelerator(|_launch| {
                Err(DeviceError::Api("kernel launch failed".into()))
            }),
            Incarnation::cpu(move |_task| {
                ran.fetch_add(1, Ordering::SeqCst);
            }),
        ],
    ));

    let task = Task::new(function)
        .with_class(DeviceClass::Accelerator)
        .bind(0, 3);
    engine.schedule(0, task, 0);
    assert!(engine.progress(0));

    let device = engine.accelerator(2).unwrap();
    assert!(!device.is_enabled(), "device must be poisoned");
    assert!(!device.is_driving());

    // the rerouted task is back in the scheduler; next progress runs it
    assert!(engine.progress(0));
    assert_eq!(ran_on_cpu.load(Ordering::SeqCst), 1);
    assert_eq!(engine.executed_tasks(), 1);
    assert_eq!(engine.failed_tasks(), 0);
}

#[test]
fn test_anti_dependency_fails_the_writer() {
    let engine = engine_with_device(1, 4);
    engine.register_data(4, vec![0u8; BLOCK]);

    // materialize a device copy, then pin it as if a reader were still
    // in flight
    let read = Task::new(reader_fn())
        .with_class(DeviceClass::Accelerator)
        .bind(0, 4);
    engine.schedule(0, read, 0);
    assert!(engine.progress(0));
    engine.with_data_mut(|table| {
        table.get_copy_mut(4, 2).unwrap().readers = 1;
    });

    let write = Task::new(incr_fn())
        .with_class(DeviceClass::Accelerator)
        .bind(0, 4);
    engine.schedule(0, write, 0);
    assert!(engine.progress(0));

    assert_eq!(engine.failed_tasks(), 1);
    assert_eq!(engine.executed_tasks(), 1);
    let device = engine.accelerator(2).unwrap();
    assert!(device.is_enabled(), "anti-dependency is not a device fault");
}

#[test]
fn test_pool_exhaustion_fails_after_retries() {
    // One segment, a task needing two: reserve can never succeed, so
    // the task bounces off the device a bounded number of times and
    // fails with a memory error instead of wedging the driver.
    let engine = engine_with_device(1, 1);
    engine.register_data(11, vec![0u8; BLOCK]);
    engine.register_data(12, vec![0u8; BLOCK]);

    let function = Arc::new(TaskFunction::new(
        "read_two",
        vec![
            Flow::new(0, FlowFlags::READ, "a"),
            Flow::new(1, FlowFlags::READ, "b"),
        ],
        vec![Incarnation::accelerator(|_launch| Ok(()))],
    ));
    let counter = dagflow::Counter::for_tasks(1);
    let task = Task::new(function)
        .with_class(DeviceClass::Accelerator)
        .with_counter(counter.clone())
        .bind(0, 11)
        .bind(1, 12);
    engine.schedule(0, task, 0);

    let mut rounds = 0;
    while engine.failed_tasks() == 0 {
        assert!(engine.progress(0), "task lost without failing");
        rounds += 1;
        assert!(rounds < 20, "retry bound not enforced");
    }

    assert_eq!(engine.failed_tasks(), 1);
    assert_eq!(engine.executed_tasks(), 0);
    // the batch counter still drained, with the failure on record
    assert!(counter.is_complete());
    assert_eq!(counter.failures(), 1);
    assert!(!counter.is_clean());
}

#[test]
fn test_write_owner_stickiness() {
    // Device 3 is nominally cheaper, but datum 20 is owned by device 2,
    // so a writer of 20 sticks to device 2.
    let engine = engine_with_backends(
        1,
        4,
        vec![
            Box::new(SimBackend::new("sim0", 1 << 20)),
            Box::new(SimBackend::new("sim1", 1 << 20).with_multiprocessors(1)),
        ],
    );
    engine.register_data(20, vec![0u8; BLOCK]);
    // pin the host copy so the idle driver does not write the datum
    // back (which would hand ownership to the host again)
    engine.with_data_mut(|table| {
        table.get_copy_mut(20, HOST_DEVICE).unwrap().readers = 1;
    });

    let write = Task::new(incr_fn())
        .with_class(DeviceClass::Accelerator)
        .bind(0, 20)
        .keep_on_device(0);
    // force placement on device 2 by masking device 3 away
    let mut write = write;
    write.devices_mask = 1 << 2;
    engine.schedule(0, write, 0);
    assert!(engine.progress(0));
    engine.with_data(|table| {
        assert_eq!(table.get(20).unwrap().owner_device, 2);
    });

    let next = Task::new(incr_fn())
        .with_class(DeviceClass::Accelerator)
        .bind(0, 20);
    assert_eq!(engine.best_device(&next), 2, "writer follows the owner");
}

#[test]
fn test_directed_offload_error_codes() {
    let engine = engine_with_device(1, 4);
    engine.register_data(40, vec![0u8; BLOCK]);

    // unknown device
    let task = Task::new(reader_fn())
        .with_class(DeviceClass::Accelerator)
        .bind(0, 40);
    assert!(matches!(
        engine.offload_to(0, task, 7),
        Err(dagflow::EngineError::NotFound(_))
    ));

    // CPU-only function has nothing to run on a device
    let cpu_only = Arc::new(TaskFunction::cpu_only("noop", vec![], |_| {}));
    assert!(matches!(
        engine.offload_to(0, Task::new(cpu_only), 2),
        Err(dagflow::EngineError::NotFound(_))
    ));

    // a healthy directed offload completes the task
    let task = Task::new(reader_fn())
        .with_class(DeviceClass::Accelerator)
        .bind(0, 40);
    engine.offload_to(0, task, 2).unwrap();
    assert_eq!(engine.executed_tasks(), 1);

    // poisoned devices are rejected
    let device = engine.accelerator(2).unwrap();
    device.enabled.store(false, Ordering::SeqCst);
    let task = Task::new(reader_fn())
        .with_class(DeviceClass::Accelerator)
        .bind(0, 40);
    assert!(matches!(
        engine.offload_to(0, task, 2),
        Err(dagflow::EngineError::DeviceDisabled(2))
    ));
}

#[test]
fn test_handle_registration_masks_unresolvable_devices() {
    let engine = engine_with_device(1, 4);

    let dyld_only = Arc::new(TaskFunction::new(
        "dyld_gemm",
        vec![],
        vec![
            Incarnation::accelerator(|_launch| Ok(())).with_dyld("no_such_kernel_symbol"),
        ],
    ));
    let handle = TaskHandle::new(vec![dyld_only]);
    engine.register_handle(&handle);
    assert_eq!(
        handle.mask() & (1 << 2),
        0,
        "unresolvable symbol clears the device bit"
    );

    let submit_only = Arc::new(TaskFunction::new(
        "closure_gemm",
        vec![],
        vec![Incarnation::accelerator(|_launch| Ok(()))],
    ));
    let handle = TaskHandle::new(vec![submit_only]);
    engine.register_handle(&handle);
    assert_ne!(handle.mask() & (1 << 2), 0);
}

#[test]
fn test_concurrent_offload_completes_all_tasks() {
    // Smoke test over real threads: many accelerator tasks from two
    // workers, every one completes exactly once.
    let engine = engine_with_device(2, 4);
    engine.register_data(30, vec![0u8; BLOCK]);

    let counter = dagflow::Counter::for_tasks(50);
    let function = reader_fn();
    for i in 0..50 {
        let task = Task::new(function.clone())
            .with_class(DeviceClass::Accelerator)
            .with_priority(i % 5)
            .with_counter(counter.clone())
            .bind(0, 30);
        engine.schedule(0, task, 0);
    }

    engine.start();
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while !counter.is_complete() && std::time::Instant::now() < deadline {
        std::thread::yield_now();
    }
    engine.stop();

    assert!(counter.is_complete());
    assert_eq!(engine.executed_tasks(), 50);
    let device = engine.accelerator(2).unwrap();
    assert!(device.takeovers.load(Ordering::SeqCst) >= 1);
}
