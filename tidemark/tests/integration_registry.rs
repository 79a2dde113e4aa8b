//! Integration tests for buffer ownership under concurrent first access.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, mpsc};
use std::thread;
use std::time::Duration;

use tidemark::{
    BufferConfig, ConfigError, DataSourceRegistry, IngestRouter, Key, QueryMode, Sample,
    TidemarkError, TimeSeriesBuffer,
};

#[test]
fn test_concurrent_first_access_creates_one_buffer() {
    const THREADS: usize = 16;

    let registry = DataSourceRegistry::new(BufferConfig::default());
    let constructed = Arc::new(AtomicUsize::new(0));
    registry
        .register_factory("depth", {
            let constructed = Arc::clone(&constructed);
            move |_key: &Key| {
                constructed.fetch_add(1, Ordering::SeqCst);
                TimeSeriesBuffer::new(64)
            }
        })
        .unwrap();

    let barrier = Barrier::new(THREADS);
    let buffers: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let registry = &registry;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    if i % 2 == 0 {
                        registry.write("depth", Sample::new(i as u64, 1.0)).unwrap();
                    } else {
                        registry.read("depth", &QueryMode::Latest { n: 1 }).unwrap();
                    }
                    registry.get_or_create("depth").unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(constructed.load(Ordering::SeqCst), 1);
    assert_eq!(registry.buffers_created(), 1);
    for buffer in &buffers[1..] {
        assert!(Arc::ptr_eq(&buffers[0], buffer));
    }
    assert_eq!(buffers[0].read().len(), THREADS / 2);
}

#[test]
fn test_concurrent_writers_on_distinct_keys() {
    let registry = Arc::new(DataSourceRegistry::new(BufferConfig::default()));
    let router = Arc::new(IngestRouter::new(Arc::clone(&registry)));

    thread::scope(|s| {
        for key in ["xd", "yd", "zd", "gd"] {
            let router = Arc::clone(&router);
            s.spawn(move || {
                for t in 0..1_000u64 {
                    router.ingest(key, 1.0, t).unwrap();
                }
            });
        }
    });

    assert_eq!(registry.len(), 4);
    for key in ["xd", "yd", "zd", "gd"] {
        let stats = registry.stats(key).unwrap();
        assert_eq!(stats.len, 1_000);
        assert_eq!(stats.out_of_order, 0);
    }
    assert_eq!(router.accepted(), 4_000);
}

#[test]
fn test_held_buffer_lock_does_not_stall_other_keys() {
    let registry = Arc::new(DataSourceRegistry::new(BufferConfig::default()));
    let router = IngestRouter::new(Arc::clone(&registry));
    router.ingest("a", 1.0, 0).unwrap();

    // A long-running reader of "a" keeps its buffer locked throughout.
    let a = registry.get_or_create("a").unwrap();
    let guard = a.write();

    let (done_tx, done_rx) = mpsc::channel();
    thread::scope(|s| {
        let router = &router;
        s.spawn(move || {
            for t in 0..1_000u64 {
                router.ingest("b", 1.0, t).unwrap();
            }
            done_tx.send(()).unwrap();
        });

        let finished = done_rx.recv_timeout(Duration::from_secs(5));
        drop(guard);
        assert!(finished.is_ok(), "ingest into \"b\" waited on \"a\"");
    });

    assert_eq!(registry.stats("b").unwrap().len, 1_000);
    assert_eq!(registry.stats("a").unwrap().len, 1);
}

#[test]
fn test_slow_factory_does_not_block_other_keys() {
    let registry = DataSourceRegistry::new(BufferConfig::default());
    let started = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));
    registry
        .register_factory("slow", {
            let started = Arc::clone(&started);
            let release = Arc::clone(&release);
            move |_key: &Key| {
                started.wait();
                release.wait();
                TimeSeriesBuffer::new(8)
            }
        })
        .unwrap();

    let (done_tx, done_rx) = mpsc::channel();
    thread::scope(|s| {
        let registry = &registry;
        let creator = s.spawn(move || registry.get_or_create("slow").unwrap());
        started.wait();

        // "slow" is mid-construction; other keys proceed.
        s.spawn(move || {
            registry.write("fast", Sample::new(1, 1.0)).unwrap();
            let _ = registry.get("slow");
            done_tx.send(()).unwrap();
        });
        let finished = done_rx.recv_timeout(Duration::from_secs(5));
        let published_early = registry.get("slow").is_some();
        release.wait();

        assert!(finished.is_ok(), "lookup of \"fast\" waited on a factory");
        assert!(!published_early);

        let slow = creator.join().unwrap();
        assert_eq!(slow.read().capacity(), 8);
    });

    assert_eq!(registry.len(), 2);
    assert_eq!(registry.buffers_created(), 2);
}

#[test]
fn test_factory_after_first_use_leaves_buffer_untouched() {
    let registry = DataSourceRegistry::new(BufferConfig::default());
    registry.write("lt", Sample::new(1, 1.0)).unwrap();
    registry.write("lt", Sample::new(2, 2.0)).unwrap();
    let before = registry.get("lt").unwrap();

    let result = registry.register_factory("lt", |_| TimeSeriesBuffer::new(1));
    assert!(matches!(
        result,
        Err(TidemarkError::Config(ConfigError::FactoryAfterCreation { .. }))
    ));

    let after = registry.get("lt").unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(
        registry.read("lt", &QueryMode::Latest { n: 10 }).unwrap(),
        vec![Sample::new(1, 1.0), Sample::new(2, 2.0)]
    );
}
