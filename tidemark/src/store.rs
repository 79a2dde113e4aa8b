//! Session handle tying the components together.
//!
//! A [`TelemetryStore`] lives for one device session. It owns the registry
//! and hands out the ingest router, the local query gateway and, when a
//! device link is attached, the poll scheduler.
//!
//! # Example
//!
//! ```rust
//! use tidemark::{StoreConfig, TelemetryStore};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> tidemark::Result<()> {
//! let store = TelemetryStore::open(StoreConfig::default())?;
//!
//! store.ingest("depth", 1.0, 0)?;
//! store.ingest("depth", 2.0, 10)?;
//!
//! let latest = store.gateway().query_latest("depth", 1).await?;
//! assert_eq!(latest.len(), 1);
//!
//! store.disconnect();
//! assert!(store.registry().is_empty());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tracing::info;

use crate::config::StoreConfig;
use crate::error::Result;
use crate::gateway::{QueryGateway, QueryServer, RemoteQueryClient};
use crate::ingest::{DecodedMessage, IngestReport, IngestRouter};
use crate::poll::{PollScheduler, PollSink, PollSpec, SubscriptionId};
use crate::registry::DataSourceRegistry;
use crate::sample::Value;
use crate::transport::connect_channel;

/// One device session's telemetry.
#[derive(Debug)]
pub struct TelemetryStore {
    config: StoreConfig,
    registry: Arc<DataSourceRegistry>,
    router: IngestRouter,
    gateway: QueryGateway,
    poll: Option<Arc<PollScheduler>>,
}

impl TelemetryStore {
    /// Opens a session without a poll scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::ConfigError`] if `config` fails validation.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let registry = Arc::new(DataSourceRegistry::from_config(&config)?);
        let router = IngestRouter::new(Arc::clone(&registry));
        let gateway = QueryGateway::local(Arc::clone(&registry));

        info!(
            buffers = config.buffers.len(),
            default_capacity = config.default_buffer.capacity,
            "opened telemetry store"
        );

        Ok(Self {
            config,
            registry,
            router,
            gateway,
            poll: None,
        })
    }

    /// Opens a session whose poll requests go to `sink`.
    ///
    /// The subscriptions listed in the configuration are held for the
    /// lifetime of the session, and every ingested sample settles its key
    /// in the outstanding poll requests.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::ConfigError`] if `config` fails validation.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn open_with_poller<S: PollSink>(config: StoreConfig, sink: S) -> Result<Self> {
        let mut store = Self::open(config)?;

        let scheduler = Arc::new(PollScheduler::new(sink, store.config.poll.outstanding_timeout));
        for spec in &store.config.poll.subscriptions {
            scheduler.subscribe(spec.clone());
        }

        store.router = IngestRouter::new(Arc::clone(&store.registry))
            .with_poll_scheduler(Arc::clone(&scheduler));
        store.poll = Some(scheduler);
        Ok(store)
    }

    /// Appends one measurement.
    ///
    /// # Errors
    ///
    /// See [`IngestRouter::ingest`].
    pub fn ingest(&self, key: &str, value: impl Into<Value>, timestamp: u64) -> Result<()> {
        self.router.ingest(key, value, timestamp)
    }

    /// Appends one decoded message.
    ///
    /// # Errors
    ///
    /// See [`IngestRouter::ingest`].
    pub fn ingest_message(&self, message: DecodedMessage) -> Result<()> {
        self.router.ingest_message(message)
    }

    /// Appends a burst of decoded messages.
    pub fn ingest_batch<I>(&self, messages: I) -> IngestReport
    where
        I: IntoIterator<Item = DecodedMessage>,
    {
        self.router.ingest_batch(messages)
    }

    /// Adds a poll subscription, if this session has a scheduler.
    pub fn subscribe(&self, spec: PollSpec) -> Option<SubscriptionId> {
        self.poll.as_ref().map(|poll| poll.subscribe(spec))
    }

    /// Drops a poll subscription.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.poll.as_ref().is_some_and(|poll| poll.unsubscribe(id))
    }

    /// Returns the local query gateway.
    pub fn gateway(&self) -> &QueryGateway {
        &self.gateway
    }

    /// Returns a server answering remote queries from this session.
    pub fn query_server(&self) -> QueryServer {
        QueryServer::new(Arc::clone(&self.registry))
    }

    /// Connects a remote client to this session through an in-process
    /// channel, using the configured `gateway.query_timeout_ms` deadline.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn remote_client(&self) -> Arc<RemoteQueryClient> {
        connect_channel(Arc::clone(&self.registry), self.config.gateway.query_timeout)
    }

    /// Returns the registry.
    pub fn registry(&self) -> &Arc<DataSourceRegistry> {
        &self.registry
    }

    /// Returns the ingest router.
    pub fn router(&self) -> &IngestRouter {
        &self.router
    }

    /// Returns the poll scheduler, if any.
    pub fn poll_scheduler(&self) -> Option<&Arc<PollScheduler>> {
        self.poll.as_ref()
    }

    /// Returns the configuration the session was opened with.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Ends the device session's retained history.
    ///
    /// Every buffer is discarded; the next sample for a key starts a fresh
    /// one. Factories and poll subscriptions are kept so a reconnecting
    /// device picks up where the views left off.
    ///
    /// # Returns
    ///
    /// The number of buffers discarded.
    pub fn disconnect(&self) -> usize {
        let discarded = self.registry.clear();
        info!(
            discarded,
            accepted = self.router.accepted(),
            rejected = self.router.rejected(),
            "device disconnected; telemetry cleared"
        );
        discarded
    }
}
