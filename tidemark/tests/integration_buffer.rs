//! Integration tests for buffer retention and window queries through the
//! registry and router.

use std::sync::Arc;

use tidemark::{
    BufferConfig, DataSourceRegistry, EvictionPolicy, IngestRouter, QueryMode, Sample,
    TimeSeriesBuffer,
};

fn router_with(key: &str, config: BufferConfig) -> IngestRouter {
    let registry = Arc::new(DataSourceRegistry::new(BufferConfig::default()));
    registry.register_config(key, config).unwrap();
    IngestRouter::new(registry)
}

#[test]
fn test_depth_scenario() {
    let router = router_with("depth", BufferConfig::new(2, EvictionPolicy::Fifo).unwrap());
    router.ingest("depth", 1.0, 0).unwrap();
    router.ingest("depth", 2.0, 10).unwrap();
    router.ingest("depth", 3.0, 20).unwrap();

    let registry = router.registry();
    let expected = vec![Sample::new(10, 2.0), Sample::new(20, 3.0)];

    assert_eq!(
        registry.read("depth", &QueryMode::Latest { n: 10 }).unwrap(),
        expected
    );
    assert_eq!(
        registry
            .read("depth", &QueryMode::Window { start: 0, end: 20 })
            .unwrap(),
        expected
    );
    assert_eq!(
        registry.read("depth", &QueryMode::Latest { n: 1 }).unwrap(),
        vec![Sample::new(20, 3.0)]
    );
}

#[test]
fn test_retains_most_recent_capacity_samples() {
    for capacity in [1usize, 3, 16] {
        let mut buffer = TimeSeriesBuffer::new(capacity);
        let appends = capacity * 3 + 1;

        for t in 0..appends as u64 {
            buffer.append(Sample::new(t, 0.0));
            assert!(buffer.len() <= capacity);
        }

        let kept: Vec<u64> = buffer.iter().map(|s| s.timestamp).collect();
        let expected: Vec<u64> = ((appends - capacity) as u64..appends as u64).collect();
        assert_eq!(kept, expected, "capacity {capacity}");
        assert_eq!(buffer.stats().total_evicted, (appends - capacity) as u64);
    }
}

#[test]
fn test_window_is_idempotent_and_exact() {
    let mut buffer = TimeSeriesBuffer::new(100);
    for t in (0..50u64).map(|i| i * 20) {
        buffer.append(Sample::new(t, 1.0));
    }

    let first = buffer.query_window(105, 400);
    let second = buffer.query_window(105, 400);
    assert_eq!(first, second);

    let expected: Vec<u64> = buffer
        .iter()
        .map(|s| s.timestamp)
        .filter(|t| (105..=400).contains(t))
        .collect();
    let got: Vec<u64> = first.iter().map(|s| s.timestamp).collect();
    assert_eq!(got, expected);
}

#[test]
fn test_latest_bounds() {
    let mut buffer = TimeSeriesBuffer::new(8);
    for t in 0..5 {
        buffer.append(Sample::new(t, 0.0));
    }

    assert_eq!(buffer.query_latest(5).len(), 5);
    assert_eq!(buffer.query_latest(500).len(), 5);
    assert!(buffer.query_latest(0).is_empty());
}

#[test]
fn test_out_of_order_then_recovery() {
    let mut buffer = TimeSeriesBuffer::new(3);
    buffer.append(Sample::new(10, 1.0));
    buffer.append(Sample::new(5, 2.0));
    buffer.append(Sample::new(20, 3.0));
    assert!(!buffer.is_monotonic());

    // Arrival order preserved, every in-range sample found.
    let window = buffer.query_window(0, 15);
    assert_eq!(window, vec![Sample::new(10, 1.0), Sample::new(5, 2.0)]);

    // Evict the disordered pair.
    buffer.append(Sample::new(30, 4.0));
    buffer.append(Sample::new(40, 5.0));
    assert!(buffer.is_monotonic());
    assert_eq!(
        buffer.query_window(25, 40),
        vec![Sample::new(30, 4.0), Sample::new(40, 5.0)]
    );
}

#[test]
fn test_max_age_eviction() {
    let router = router_with(
        "hd",
        BufferConfig::new(1_000, EvictionPolicy::MaxAge { max_age_ms: 100 }).unwrap(),
    );

    for t in [0u64, 50, 100, 150, 260] {
        router.ingest("hd", 1.0, t).unwrap();
    }

    let kept: Vec<u64> = router
        .registry()
        .read("hd", &QueryMode::Latest { n: 100 })
        .unwrap()
        .iter()
        .map(|s| s.timestamp)
        .collect();
    assert_eq!(kept, vec![260]);
}

#[test]
fn test_recent_follows_newest_sample() {
    let mut buffer = TimeSeriesBuffer::new(1_000);
    for t in (0..=100u64).map(|i| i * 100) {
        buffer.append(Sample::new(t, 0.0));
    }

    let recent = buffer.query_recent(1_000);
    assert_eq!(recent.first().map(|s| s.timestamp), Some(9_000));
    assert_eq!(recent.last().map(|s| s.timestamp), Some(10_000));
    assert_eq!(recent.len(), 11);
}

#[test]
fn test_vector_components() {
    let router = router_with("xd", BufferConfig::default());
    router.ingest("xd", [0.1, 0.2, 0.3], 5).unwrap();

    let samples = router
        .registry()
        .read("xd", &QueryMode::Latest { n: 1 })
        .unwrap();
    let value = &samples[0].value;
    assert_eq!(value.arity(), 3);
    assert_eq!(value.component(1), Some(0.2));
    assert_eq!(value.component(3), None);
}
