//! The consumer-facing read API.
//!
//! A [`QueryGateway`] answers window, latest and recent queries either
//! directly from a registry in this process ([`QueryGateway::Local`]) or by
//! proxying them to a store elsewhere ([`QueryGateway::Remote`]). Consumers
//! call the same methods in both cases.
//!
//! # Remote Queries
//!
//! Each remote query gets a fresh correlation ID and an entry in the
//! client's pending table before the request is sent. The matching response
//! resolves that entry. A query that is not answered within the configured
//! deadline fails with [`QueryError::Timeout`] and its entry is removed, so
//! a late response is discarded rather than delivered to the wrong caller.
//! Queries are not retried.
//!
//! Outstanding queries are independent: responses may arrive in any order.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::DEFAULT_QUERY_TIMEOUT;
use crate::error::{GatewayError, QueryError, Result};
use crate::query::{Query, QueryOutcome, QueryRequest, QueryResponse};
use crate::registry::DataSourceRegistry;
use crate::sample::{Key, Sample};
use crate::transport::{
    Frame, FrameReader, MAX_FRAME_LEN, QueryTransport, decode_request, encode_line, write_line,
};

type PendingTable = Mutex<HashMap<u64, oneshot::Sender<QueryOutcome>>>;

/// Requester side of the cross-process query path.
pub struct RemoteQueryClient {
    transport: Box<dyn QueryTransport>,
    pending: PendingTable,
    next_id: AtomicU64,
    timeout: Duration,
    discarded: AtomicU64,
}

impl RemoteQueryClient {
    /// Creates a client sending requests through `transport`.
    ///
    /// Responses must be fed back through [`RemoteQueryClient::resolve`];
    /// the helpers in [`crate::transport`] wire that up.
    pub fn new<T: QueryTransport>(transport: T, timeout: Duration) -> Self {
        Self {
            transport: Box::new(transport),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            timeout,
            discarded: AtomicU64::new(0),
        }
    }

    /// Creates a client with the default two-second deadline.
    pub fn with_default_timeout<T: QueryTransport>(transport: T) -> Self {
        Self::new(transport, DEFAULT_QUERY_TIMEOUT)
    }

    /// Sends `query` and waits for its response.
    ///
    /// Dropping the returned future abandons the query; its pending entry
    /// is removed and a later response is discarded.
    ///
    /// # Errors
    ///
    /// - [`QueryError::Timeout`] if no response arrives before the deadline
    /// - [`QueryError::Remote`] if the store answered with an error
    /// - [`QueryError::TransportClosed`] if the transport shut down
    pub async fn query(&self, query: Query) -> Result<Vec<Sample>> {
        let correlation_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        self.pending.lock().insert(correlation_id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            correlation_id,
        };

        let key = query.key.to_string();
        self.transport.send(QueryRequest {
            correlation_id,
            query,
        })?;
        debug!(correlation_id, key = %key, "sent remote query");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(QueryOutcome::Samples(samples))) => Ok(samples),
            Ok(Ok(QueryOutcome::Error(message))) => Err(QueryError::Remote { message }.into()),
            Ok(Err(_)) => Err(QueryError::TransportClosed.into()),
            Err(_) => Err(QueryError::Timeout {
                correlation_id,
                key,
                timeout: self.timeout,
            }
            .into()),
        }
    }

    /// Delivers a response to the query waiting for it.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UnknownCorrelation`] if no query is waiting
    /// for this correlation ID (a duplicate, or the query already timed
    /// out). The response is discarded and no pending query is affected.
    pub fn resolve(&self, response: QueryResponse) -> std::result::Result<(), GatewayError> {
        let QueryResponse {
            correlation_id,
            outcome,
        } = response;

        let Some(tx) = self.pending.lock().remove(&correlation_id) else {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return Err(GatewayError::UnknownCorrelation { correlation_id });
        };

        // The waiter may have been dropped after the entry was taken.
        let _ = tx.send(outcome);
        Ok(())
    }

    /// Fails every pending query with [`QueryError::TransportClosed`].
    pub fn close(&self) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        if !drained.is_empty() {
            debug!(pending = drained.len(), "closing remote query client");
        }
    }

    /// Returns the number of queries awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Returns the number of responses discarded for an unknown
    /// correlation ID.
    pub fn discarded_responses(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Returns the per-query deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl std::fmt::Debug for RemoteQueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteQueryClient")
            .field("pending", &self.pending_count())
            .field("timeout", &self.timeout)
            .field("discarded", &self.discarded_responses())
            .finish_non_exhaustive()
    }
}

/// Removes a pending entry when its query finishes or is dropped.
struct PendingGuard<'a> {
    pending: &'a PendingTable,
    correlation_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.correlation_id);
    }
}

/// Read API over a local registry or a remote store.
#[derive(Debug, Clone)]
pub enum QueryGateway {
    /// Queries run directly against a registry in this process.
    Local(Arc<DataSourceRegistry>),
    /// Queries are proxied through a [`RemoteQueryClient`].
    Remote(Arc<RemoteQueryClient>),
}

impl QueryGateway {
    /// Creates a gateway over a local registry.
    pub fn local(registry: Arc<DataSourceRegistry>) -> Self {
        Self::Local(registry)
    }

    /// Creates a gateway over a remote client.
    pub fn remote(client: Arc<RemoteQueryClient>) -> Self {
        Self::Remote(client)
    }

    /// Runs a query. The local path never suspends.
    ///
    /// # Errors
    ///
    /// Local queries fail only for a malformed key. Remote queries may
    /// also fail with any [`QueryError`].
    pub async fn query(&self, query: Query) -> Result<Vec<Sample>> {
        match self {
            Self::Local(registry) => registry.read(query.key.as_str(), &query.mode),
            Self::Remote(client) => client.query(query).await,
        }
    }

    /// Returns samples with `start <= timestamp <= end`.
    ///
    /// # Errors
    ///
    /// See [`QueryGateway::query`].
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::sync::Arc;
    /// use tidemark::{BufferConfig, DataSourceRegistry, QueryGateway, Sample};
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() -> tidemark::Result<()> {
    /// let registry = Arc::new(DataSourceRegistry::new(BufferConfig::default()));
    /// registry.write("depth", Sample::new(10, 2.0))?;
    ///
    /// let gateway = QueryGateway::local(registry);
    /// let samples = gateway.query_window("depth", 0, 20).await?;
    /// assert_eq!(samples, vec![Sample::new(10, 2.0)]);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn query_window(&self, key: &str, start: u64, end: u64) -> Result<Vec<Sample>> {
        self.query(Query::window(Key::new(key)?, start, end)).await
    }

    /// Returns the last `n` samples in arrival order.
    ///
    /// # Errors
    ///
    /// See [`QueryGateway::query`].
    pub async fn query_latest(&self, key: &str, n: usize) -> Result<Vec<Sample>> {
        self.query(Query::latest(Key::new(key)?, n)).await
    }

    /// Returns samples within `span` milliseconds of the newest one.
    ///
    /// # Errors
    ///
    /// See [`QueryGateway::query`].
    pub async fn query_recent(&self, key: &str, span: u64) -> Result<Vec<Sample>> {
        self.query(Query::recent(Key::new(key)?, span)).await
    }

    /// Returns the number of remote queries in flight (always zero locally).
    pub fn pending_count(&self) -> usize {
        match self {
            Self::Local(_) => 0,
            Self::Remote(client) => client.pending_count(),
        }
    }
}

/// Answers one request against `registry`.
///
/// Never panics: a failing query becomes an error response.
pub fn serve_request(registry: &DataSourceRegistry, request: QueryRequest) -> QueryResponse {
    let QueryRequest {
        correlation_id,
        query,
    } = request;

    match registry.read(query.key.as_str(), &query.mode) {
        Ok(samples) => QueryResponse::samples(correlation_id, samples),
        Err(e) => QueryResponse::error(correlation_id, e.to_string()),
    }
}

/// Store side of the cross-process query path.
#[derive(Debug, Clone)]
pub struct QueryServer {
    registry: Arc<DataSourceRegistry>,
}

impl QueryServer {
    /// Creates a server answering from `registry`.
    pub fn new(registry: Arc<DataSourceRegistry>) -> Self {
        Self { registry }
    }

    /// Answers requests from a channel until either side closes.
    pub async fn run(
        &self,
        mut requests: mpsc::UnboundedReceiver<QueryRequest>,
        responses: mpsc::UnboundedSender<QueryResponse>,
    ) {
        while let Some(request) = requests.recv().await {
            let response = serve_request(&self.registry, request);
            if responses.send(response).is_err() {
                break;
            }
        }
    }

    /// Answers newline-delimited JSON requests from `reader`, writing one
    /// response line per request to `writer`, until end of stream.
    ///
    /// Malformed lines that carry a correlation ID get an error response;
    /// lines without one, non-UTF-8 lines and lines longer than
    /// [`crate::transport::MAX_FRAME_LEN`] are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the stream fails.
    pub async fn serve_stream<R, W>(&self, reader: R, mut writer: W) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut frames = FrameReader::new(reader);

        while let Some(frame) = frames.next_frame().await? {
            let Frame::Line(line) = frame else {
                warn!(max = MAX_FRAME_LEN, "skipping oversized request line");
                continue;
            };
            if line.trim_ascii().is_empty() {
                continue;
            }

            let response = match decode_request(&line) {
                Ok(request) => serve_request(&self.registry, request),
                Err(rejected) => match rejected.correlation_id {
                    Some(correlation_id) => QueryResponse::error(correlation_id, rejected.reason),
                    None => {
                        warn!(reason = %rejected.reason, "skipping request without correlation id");
                        continue;
                    }
                },
            };

            match encode_line(&response) {
                Ok(line) => write_line(&mut writer, &line).await?,
                Err(e) => warn!(error = %e, "failed to encode query response"),
            }
        }

        Ok(())
    }
}
