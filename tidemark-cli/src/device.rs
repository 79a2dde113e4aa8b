//! Simulated device link for `tidemark serve`.
//!
//! Stands in for the vehicle: every poll request is answered with one
//! reading per requested key, timestamped with the current wall clock.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tidemark::{DecodedMessage, Key, PollSink, TelemetryStore, Value};
use tokio::sync::mpsc;

/// Keys the vehicle reports as x/y/z triples.
const VECTOR_KEYS: [&str; 5] = ["xd", "yd", "zd", "gd", "ad"];

/// Poll sink that forwards requests to the simulated device.
pub struct DeviceSink(mpsc::UnboundedSender<BTreeSet<Key>>);

impl PollSink for DeviceSink {
    fn request(&self, keys: &BTreeSet<Key>) {
        if self.0.send(keys.clone()).is_err() {
            tracing::debug!("simulated device is gone; dropping poll request");
        }
    }
}

/// The device end of the link.
pub struct SimulatedDevice {
    requests: mpsc::UnboundedReceiver<BTreeSet<Key>>,
}

/// Creates a connected sink/device pair.
pub fn link() -> (DeviceSink, SimulatedDevice) {
    let (tx, rx) = mpsc::unbounded_channel();
    (DeviceSink(tx), SimulatedDevice { requests: rx })
}

impl SimulatedDevice {
    /// Answers poll requests until the sink is dropped.
    pub async fn run(mut self, store: Arc<TelemetryStore>) {
        while let Some(keys) = self.requests.recv().await {
            let now = now_ms();
            let report = store.ingest_batch(keys.iter().map(|key| reading(key, now)));
            tracing::trace!(accepted = report.accepted, "device answered poll");
        }
    }
}

/// Produces a plausible reading for `key` at `now`.
#[allow(clippy::cast_precision_loss)] // phase only needs to be roughly right
fn reading(key: &Key, now: u64) -> DecodedMessage {
    let phase = (now % 60_000) as f64 / 60_000.0 * std::f64::consts::TAU;
    let value: Value = if VECTOR_KEYS.contains(&key.as_str()) {
        [phase.sin(), phase.cos(), (2.0 * phase).sin()].into()
    } else {
        (10.0 * phase.sin()).into()
    };
    DecodedMessage::new(key.as_str(), value, now)
}

/// Milliseconds since the Unix epoch.
#[allow(clippy::cast_possible_truncation)] // u64 millis last ~584 million years
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
