//! # tidemark
//!
//! Windowed telemetry store for streaming device measurements.
//!
//! tidemark sits between a device link that delivers decoded measurements
//! and the views that plot them. Every measurement key gets a bounded,
//! arrival-ordered buffer; views ask for time windows or the latest N
//! samples, either in-process or from another process through a
//! correlation-ID query protocol. Variables the device only reports on
//! request are polled on a reference-counted schedule.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Bounded memory per key, fixed at buffer creation
//! - Exactly one buffer per key, even when ingest and queries race
//! - Per-key locking, so a slow read never stalls another key's ingest
//! - Remote queries with a deadline and no cross-talk between callers
//!
//! ## Quick Start
//!
//! ```rust
//! use tidemark::{BufferConfig, DataSourceRegistry, IngestRouter, QueryGateway};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(DataSourceRegistry::new(BufferConfig::default()));
//! registry.register_config("depth", BufferConfig::new(2, Default::default())?)?;
//!
//! let router = IngestRouter::new(Arc::clone(&registry));
//! router.ingest("depth", 1.0, 0)?;
//! router.ingest("depth", 2.0, 10)?;
//! router.ingest("depth", 3.0, 20)?;
//!
//! let gateway = QueryGateway::local(registry);
//! for sample in gateway.query_window("depth", 0, 20).await? {
//!     println!("{}: {:?}", sample.timestamp, sample.value);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`TimeSeriesBuffer`] — Bounded ring of samples for one key
//! - [`DataSourceRegistry`] — One buffer per key, created lazily
//! - [`IngestRouter`] — Appends decoded device messages
//! - [`QueryGateway`] — Window/latest/recent reads, local or remote
//! - [`PollScheduler`] — Periodic requests for poll-only variables
//! - [`TelemetryStore`] — Session handle over all of the above
//!
//! ## Modules
//!
//! - [`sample`] — Keys, values and samples
//! - [`buffer`] — Ring buffer and eviction policies
//! - [`registry`] — Buffer ownership and factories
//! - [`config`] — Declarative store configuration
//! - [`ingest`] — Device message intake
//! - [`query`] — Query model and wire messages
//! - [`gateway`] — Consumer read API and query serving
//! - [`transport`] — Channel and byte-stream query carriers
//! - [`poll`] — Poll scheduling
//! - [`store`] — Session lifecycle
//! - [`error`] — Error types

pub mod buffer;
pub mod config;
pub mod error;
pub mod gateway;
pub mod ingest;
pub mod poll;
pub mod query;
pub mod registry;
pub mod sample;
pub mod store;
pub mod transport;

pub use buffer::{BufferStats, DEFAULT_CAPACITY, EvictionPolicy, TimeSeriesBuffer};
pub use config::{BufferConfig, GatewayConfig, PollConfig, StoreConfig};
pub use error::{ConfigError, GatewayError, KeyError, QueryError, Result, TidemarkError};
pub use gateway::{QueryGateway, QueryServer, RemoteQueryClient, serve_request};
pub use ingest::{DecodedMessage, IngestReport, IngestRouter};
pub use poll::{PollScheduler, PollSink, PollSpec, PollState, SubscriptionId};
pub use query::{Query, QueryMode, QueryOutcome, QueryRequest, QueryResponse};
pub use registry::{BufferFactory, DataSourceRegistry, SharedBuffer};
pub use sample::{Key, Sample, Value};
pub use store::TelemetryStore;
pub use transport::{MAX_FRAME_LEN, QueryTransport, connect_channel, connect_stream};
