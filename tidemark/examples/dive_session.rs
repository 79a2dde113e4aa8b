//! Example of a dive session feeding a chart in another task.
//!
//! This example shows how to:
//! - Configure per-key buffers from JSON
//! - Ingest a burst of decoded vehicle messages
//! - Serve queries to a remote gateway over a channel transport
//! - Clear the session on disconnect

use tidemark::{DecodedMessage, QueryGateway, StoreConfig, TelemetryStore};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("tidemark dive session example");

    let config = StoreConfig::from_json(
        r#"{
            "default_buffer": { "capacity": 20000 },
            "gateway": { "query_timeout_ms": 2000 },
            "buffers": {
                "dp": { "capacity": 600 },
                "hd": { "capacity": 20000, "eviction": { "max_age": { "max_age_ms": 10000 } } }
            }
        }"#,
    )?;
    let store = TelemetryStore::open(config)?;

    // Simulate a one-minute descent reported at 10 Hz.
    let messages = (0u32..600).flat_map(|i| {
        let t = u64::from(i) * 100;
        let fi = f64::from(i);
        [
            DecodedMessage::new("dp", fi * 0.05, t),
            DecodedMessage::new("hd", (fi * 0.6) % 360.0, t),
            DecodedMessage::new("xd", [(fi * 0.01).sin(), (fi * 0.01).cos(), 0.0], t),
        ]
    });
    let report = store.ingest_batch(messages);
    println!(
        "\nIngested {} messages ({} rejected)",
        report.accepted, report.rejected
    );

    for key in store.registry().keys() {
        if let Some(stats) = store.registry().stats(key.as_str()) {
            println!(
                "  {key}: {} retained, {} evicted",
                stats.len, stats.total_evicted
            );
        }
    }

    // A chart in another task reads through a remote gateway.
    let chart = QueryGateway::remote(store.remote_client());

    let depth = chart.query_recent("dp", 5_000).await?;
    println!("\nLast 5 s of depth: {} samples", depth.len());
    if let (Some(first), Some(last)) = (depth.first(), depth.last()) {
        println!(
            "  {:.2} m at t={} ms -> {:.2} m at t={} ms",
            first.value.as_scalar().unwrap_or(f64::NAN),
            first.timestamp,
            last.value.as_scalar().unwrap_or(f64::NAN),
            last.timestamp
        );
    }

    let orientation = chart.query_latest("xd", 1).await?;
    if let Some(sample) = orientation.first() {
        println!(
            "Latest orientation x-axis: {:.3}",
            sample.value.component(0).unwrap_or(f64::NAN)
        );
    }

    let discarded = store.disconnect();
    println!("\nDisconnected; discarded {discarded} buffers");

    Ok(())
}
