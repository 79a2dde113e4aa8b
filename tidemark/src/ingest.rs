//! Entry point for decoded device messages.
//!
//! The [`IngestRouter`] receives one decoded message at a time from the
//! device link (decoding and framing happen upstream) and appends it to the
//! buffer for its key. It checks key well-formedness and nothing else: value
//! shape is the concern of whoever reads the value back.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::error::Result;
use crate::poll::PollScheduler;
use crate::registry::DataSourceRegistry;
use crate::sample::{Sample, Value, validate_key};

/// A message as delivered by the device-link decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedMessage {
    /// Measurement key (device variable name).
    pub key: String,
    /// Decoded value.
    pub value: Value,
    /// Timestamp in milliseconds.
    pub timestamp: u64,
}

impl DecodedMessage {
    /// Creates a decoded message.
    pub fn new(key: impl Into<String>, value: impl Into<Value>, timestamp: u64) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            timestamp,
        }
    }
}

/// Outcome of [`IngestRouter::ingest_batch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Messages appended to a buffer.
    pub accepted: usize,
    /// Messages rejected for a malformed key.
    pub rejected: usize,
}

/// Routes decoded messages into the registry.
#[derive(Debug)]
pub struct IngestRouter {
    registry: Arc<DataSourceRegistry>,
    poll: Option<Arc<PollScheduler>>,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl IngestRouter {
    /// Creates a router writing into `registry`.
    pub fn new(registry: Arc<DataSourceRegistry>) -> Self {
        Self {
            registry,
            poll: None,
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Reports every ingested key to `scheduler`, so that an answered poll
    /// request stops being outstanding.
    pub fn with_poll_scheduler(mut self, scheduler: Arc<PollScheduler>) -> Self {
        self.poll = Some(scheduler);
        self
    }

    /// Appends one measurement.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::KeyError::InvalidKey`] for a malformed key.
    /// No buffer is touched in that case.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::sync::Arc;
    /// use tidemark::{BufferConfig, DataSourceRegistry, IngestRouter};
    ///
    /// let registry = Arc::new(DataSourceRegistry::new(BufferConfig::default()));
    /// let router = IngestRouter::new(Arc::clone(&registry));
    ///
    /// router.ingest("depth", 12.5, 1_000).unwrap();
    /// assert!(router.ingest("", 1.0, 1_000).is_err());
    /// assert_eq!(registry.len(), 1);
    /// ```
    pub fn ingest(&self, key: &str, value: impl Into<Value>, timestamp: u64) -> Result<()> {
        if let Err(e) = validate_key(key) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(key, "rejected message with malformed key");
            return Err(e.into());
        }

        self.registry.write(key, Sample::new(timestamp, value))?;
        self.accepted.fetch_add(1, Ordering::Relaxed);
        trace!(key, timestamp, "ingested sample");

        if let Some(poll) = &self.poll {
            poll.acknowledge(key);
        }

        Ok(())
    }

    /// Appends one decoded message.
    ///
    /// # Errors
    ///
    /// Same as [`IngestRouter::ingest`].
    pub fn ingest_message(&self, message: DecodedMessage) -> Result<()> {
        self.ingest(&message.key, message.value, message.timestamp)
    }

    /// Appends a burst of messages.
    ///
    /// Each message is handled on its own: a malformed message is counted
    /// and skipped, and never blocks the messages after it.
    pub fn ingest_batch<I>(&self, messages: I) -> IngestReport
    where
        I: IntoIterator<Item = DecodedMessage>,
    {
        let mut report = IngestReport::default();
        for message in messages {
            match self.ingest_message(message) {
                Ok(()) => report.accepted += 1,
                Err(_) => report.rejected += 1,
            }
        }
        report
    }

    /// Returns the registry this router writes to.
    pub fn registry(&self) -> &Arc<DataSourceRegistry> {
        &self.registry
    }

    /// Returns the number of accepted messages.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Returns the number of rejected messages.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferConfig;
    use crate::error::{KeyError, TidemarkError};
    use crate::query::QueryMode;

    fn router() -> IngestRouter {
        IngestRouter::new(Arc::new(DataSourceRegistry::new(BufferConfig::default())))
    }

    #[test]
    fn test_ingest_appends() {
        let router = router();

        router.ingest("depth", 1.0, 0).unwrap();
        router.ingest("depth", 2.0, 10).unwrap();

        let samples = router
            .registry()
            .read("depth", &QueryMode::Latest { n: 10 })
            .unwrap();
        assert_eq!(samples, vec![Sample::new(0, 1.0), Sample::new(10, 2.0)]);
        assert_eq!(router.accepted(), 2);
    }

    #[test]
    fn test_invalid_key_touches_nothing() {
        let router = router();

        let result = router.ingest("bad key", 1.0, 0);
        assert!(matches!(
            result,
            Err(TidemarkError::Key(KeyError::InvalidKey { .. }))
        ));
        assert!(router.registry().is_empty());
        assert_eq!(router.rejected(), 1);
    }

    #[test]
    fn test_values_are_not_inspected() {
        let router = router();

        router.ingest("ori", vec![0.0, 1.0, 2.0], 1).unwrap();
        router.ingest("ori", f64::NAN, 2).unwrap();
        router.ingest("ori", Vec::<f64>::new(), 3).unwrap();

        assert_eq!(router.registry().stats("ori").unwrap().len, 3);
    }

    #[test]
    fn test_batch_skips_malformed_messages() {
        let router = router();

        let report = router.ingest_batch(vec![
            DecodedMessage::new("a", 1.0, 1),
            DecodedMessage::new("", 2.0, 2),
            DecodedMessage::new("b", 3.0, 3),
            DecodedMessage::new("with space", 4.0, 4),
            DecodedMessage::new("a", 5.0, 5),
        ]);

        assert_eq!(report, IngestReport { accepted: 3, rejected: 2 });
        assert_eq!(router.registry().keys().len(), 2);
        assert_eq!(router.registry().stats("a").unwrap().len, 2);
    }

    #[test]
    fn test_decoded_message_json() {
        let message: DecodedMessage =
            serde_json::from_str(r#"{"key": "xd", "value": [1.0, 2.0, 3.0], "timestamp": 42}"#)
                .unwrap();
        assert_eq!(message, DecodedMessage::new("xd", vec![1.0, 2.0, 3.0], 42));
    }
}
