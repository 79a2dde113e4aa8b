//! Error types for the tidemark telemetry store.

use std::time::Duration;

use thiserror::Error;

/// The main error type for all tidemark operations.
///
/// Every variant is scoped to the call that produced it. No error leaves the
/// store itself in a degraded state: a rejected message or a timed-out query
/// does not affect ingestion or queries for any other key.
#[derive(Error, Debug)]
pub enum TidemarkError {
    /// A measurement key was malformed.
    #[error("key error: {0}")]
    Key(#[from] KeyError),

    /// Store, buffer, or factory configuration was invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A query could not be answered.
    #[error("query error: {0}")]
    Query(#[from] QueryError),

    /// A response could not be paired with an outstanding request.
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
}

/// Errors raised when validating a measurement key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// The key is empty, too long, or contains characters outside the
    /// printable ASCII range.
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey {
        /// The rejected key.
        key: String,
        /// Why the key was rejected.
        reason: String,
    },
}

/// Configuration errors.
///
/// These are caller mistakes and are terminal for the call that raised them.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A factory was registered for a key whose buffer already exists.
    ///
    /// Factories only configure storage that has not been created yet, so
    /// live data is never silently replaced.
    #[error("buffer for key '{key}' already exists; factories must be registered before first use")]
    FactoryAfterCreation {
        /// The key that already has a buffer.
        key: String,
    },

    /// A buffer capacity of zero was requested.
    #[error("invalid capacity {capacity} for {scope} (must be > 0)")]
    InvalidCapacity {
        /// Which buffer configuration was invalid (`default` or a key).
        scope: String,
        /// The rejected capacity.
        capacity: usize,
    },

    /// A max-age eviction window of zero was requested.
    #[error("invalid max age for {scope}: must be > 0 ms")]
    InvalidMaxAge {
        /// Which buffer configuration was invalid.
        scope: String,
    },

    /// A key in the configuration table is malformed.
    #[error("invalid key in configuration table: {0}")]
    InvalidKey(#[from] KeyError),

    /// A duration setting is out of range.
    #[error("invalid {setting}: {value:?} ({reason})")]
    InvalidDuration {
        /// The setting name.
        setting: &'static str,
        /// The rejected value.
        value: Duration,
        /// Why it was rejected.
        reason: String,
    },

    /// A poll subscription names no keys.
    #[error("poll subscription must name at least one key")]
    EmptyPollSpec,

    /// The configuration file could not be read.
    #[error("failed to read config file '{path}': {source}")]
    FileAccess {
        /// The path that could not be read.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for the expected shape.
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        /// The path that failed to parse.
        path: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors surfaced to a caller of the query API.
#[derive(Error, Debug)]
pub enum QueryError {
    /// A remote query did not receive a response before its deadline.
    ///
    /// The gateway does not retry; whether a retry is useful is up to the
    /// caller, since the requested window has usually moved on.
    #[error("query {correlation_id} for key '{key}' timed out after {timeout:?}")]
    Timeout {
        /// The correlation ID of the abandoned request.
        correlation_id: u64,
        /// The key that was queried.
        key: String,
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// The transport to the store process has shut down.
    #[error("query transport closed")]
    TransportClosed,

    /// The remote store answered with an error.
    #[error("remote store rejected query: {message}")]
    Remote {
        /// The error message returned by the remote side.
        message: String,
    },

    /// A request or response could not be encoded for the wire.
    #[error("failed to encode query message: {source}")]
    Encode {
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Internal gateway errors.
///
/// These are never returned from the consumer-facing query API. Transport
/// drivers receive them from [`crate::gateway::RemoteQueryClient::resolve`]
/// and log-and-discard them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// A response arrived for a correlation ID with no pending request:
    /// a duplicate, or a response to a query that already timed out.
    #[error("no pending request for correlation id {correlation_id}")]
    UnknownCorrelation {
        /// The unmatched correlation ID.
        correlation_id: u64,
    },
}

/// Type alias for `Result<T, TidemarkError>`.
pub type Result<T> = std::result::Result<T, TidemarkError>;
