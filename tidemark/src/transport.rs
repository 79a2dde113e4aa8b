//! Carriers for cross-process query traffic.
//!
//! The gateway only needs to hand a [`QueryRequest`] to something and later
//! be told about a [`QueryResponse`]. [`QueryTransport`] is that something.
//! Two carriers ship with the crate:
//!
//! - a Tokio channel pair, for a store living in another task of the same
//!   process ([`connect_channel`])
//! - newline-delimited JSON over any byte stream, for a store in another
//!   process ([`connect_stream`], served by
//!   [`crate::gateway::QueryServer::serve_stream`])
//!
//! Stream frames are capped at [`MAX_FRAME_LEN`] bytes. A longer line, or
//! one that is not valid UTF-8 JSON, is logged and skipped; the frames
//! after it are still read.

use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::QueryError;
use crate::gateway::{QueryServer, RemoteQueryClient};
use crate::query::{QueryRequest, QueryResponse};
use crate::registry::DataSourceRegistry;

/// Longest accepted stream frame in bytes, newline excluded.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Sends query requests toward a store.
///
/// Sending never blocks; the response arrives out of band and is handed to
/// [`RemoteQueryClient::resolve`] by whatever reads the other direction.
pub trait QueryTransport: Send + Sync + 'static {
    /// Queues `request` for delivery.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::TransportClosed`] if the carrier has shut down.
    fn send(&self, request: QueryRequest) -> Result<(), QueryError>;
}

impl QueryTransport for mpsc::UnboundedSender<QueryRequest> {
    fn send(&self, request: QueryRequest) -> Result<(), QueryError> {
        mpsc::UnboundedSender::send(self, request).map_err(|_| QueryError::TransportClosed)
    }
}

/// A request line that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRequest {
    /// Correlation ID, if the line carried a usable one.
    pub correlation_id: Option<u64>,
    /// Why decoding failed.
    pub reason: String,
}

/// Decodes one request line.
///
/// A line that is valid JSON but not a valid request (an unknown mode, a
/// malformed key) still yields its correlation ID so the requester can be
/// told why instead of waiting for its timeout.
///
/// # Errors
///
/// Returns a [`RejectedRequest`] describing the failure.
pub fn decode_request(line: &[u8]) -> Result<QueryRequest, RejectedRequest> {
    match serde_json::from_slice::<QueryRequest>(line) {
        Ok(request) => Ok(request),
        Err(e) => {
            let correlation_id = serde_json::from_slice::<serde_json::Value>(line)
                .ok()
                .and_then(|value| value.get("correlation_id")?.as_u64());
            Err(RejectedRequest {
                correlation_id,
                reason: format!("malformed request: {e}"),
            })
        }
    }
}

/// Encodes a message as one JSON line, newline included.
///
/// # Errors
///
/// Returns [`QueryError::Encode`] if serialization fails.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, QueryError> {
    let mut line =
        serde_json::to_string(message).map_err(|source| QueryError::Encode { source })?;
    line.push('\n');
    Ok(line)
}

/// Spawns a task that writes every message from the returned sender to
/// `writer` as one JSON line. The task ends when all senders are dropped
/// or the stream fails.
pub fn spawn_line_writer<T, W>(writer: W) -> (mpsc::UnboundedSender<T>, JoinHandle<()>)
where
    T: Serialize + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<T>();
    let handle = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(message) = rx.recv().await {
            let line = match encode_line(&message) {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "dropping unencodable message");
                    continue;
                }
            };

            if let Err(e) = write_line(&mut writer, &line).await {
                debug!(error = %e, "line writer stopped");
                return;
            }
        }
    });
    (tx, handle)
}

/// One newline-delimited frame read from a stream.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Frame {
    /// Frame contents without the newline.
    Line(Vec<u8>),
    /// A frame longer than [`MAX_FRAME_LEN`]; its bytes were discarded.
    TooLong,
}

/// Reads newline-delimited frames of at most [`MAX_FRAME_LEN`] bytes.
pub(crate) struct FrameReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::new(),
        }
    }

    /// Returns the next frame, or `None` at end of stream.
    pub(crate) async fn next_frame(&mut self) -> std::io::Result<Option<Frame>> {
        if self.fill().await? == 0 {
            return Ok(None);
        }

        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            return Ok(Some(Frame::Line(std::mem::take(&mut self.buf))));
        }

        if self.buf.len() <= MAX_FRAME_LEN {
            // Last frame of the stream, unterminated.
            return Ok(Some(Frame::Line(std::mem::take(&mut self.buf))));
        }

        // Skip the rest of the oversized line.
        loop {
            let n = self.fill().await?;
            if n == 0 || self.buf.last() == Some(&b'\n') {
                break;
            }
        }
        self.buf.clear();
        Ok(Some(Frame::TooLong))
    }

    /// Reads up to one byte past the frame limit, stopping at a newline.
    async fn fill(&mut self) -> std::io::Result<usize> {
        self.buf.clear();
        (&mut self.reader)
            .take(MAX_FRAME_LEN as u64 + 1)
            .read_until(b'\n', &mut self.buf)
            .await
    }
}

pub(crate) async fn write_line<W>(writer: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

/// Connects a remote client to a store over a byte stream.
///
/// Requests are written to `writer`; responses are read from `reader` and
/// resolved against the client's pending table. When `reader` reaches end
/// of stream every pending query fails with [`QueryError::TransportClosed`].
///
/// # Panics
///
/// Panics if called outside a Tokio runtime.
pub fn connect_stream<R, W>(reader: R, writer: W, timeout: Duration) -> Arc<RemoteQueryClient>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (requests, _writer) = spawn_line_writer::<QueryRequest, _>(writer);
    let client = Arc::new(RemoteQueryClient::new(requests, timeout));
    tokio::spawn(read_responses(reader, Arc::downgrade(&client)));
    client
}

async fn read_responses<R>(reader: R, client: Weak<RemoteQueryClient>)
where
    R: AsyncRead + Unpin,
{
    let mut frames = FrameReader::new(reader);
    loop {
        let line = match frames.next_frame().await {
            Ok(Some(Frame::Line(line))) => line,
            Ok(Some(Frame::TooLong)) => {
                warn!(max = MAX_FRAME_LEN, "discarding oversized query response");
                continue;
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "query response stream failed");
                break;
            }
        };

        let Some(client) = client.upgrade() else {
            return;
        };

        match serde_json::from_slice::<QueryResponse>(&line) {
            Ok(response) => {
                if let Err(e) = client.resolve(response) {
                    warn!(error = %e, "discarding query response");
                }
            }
            Err(e) => warn!(error = %e, "discarding malformed query response"),
        }
    }

    if let Some(client) = client.upgrade() {
        client.close();
    }
}

/// Connects a remote client to a store running in another task of this
/// process.
///
/// Spawns the serving task for `registry` and the task that routes its
/// responses back into the client.
///
/// # Panics
///
/// Panics if called outside a Tokio runtime.
pub fn connect_channel(
    registry: Arc<DataSourceRegistry>,
    timeout: Duration,
) -> Arc<RemoteQueryClient> {
    let (request_tx, request_rx) = mpsc::unbounded_channel::<QueryRequest>();
    let (response_tx, mut response_rx) = mpsc::unbounded_channel::<QueryResponse>();

    let server = QueryServer::new(registry);
    tokio::spawn(async move { server.run(request_rx, response_tx).await });

    let client = Arc::new(RemoteQueryClient::new(request_tx, timeout));
    let weak = Arc::downgrade(&client);
    tokio::spawn(async move {
        while let Some(response) = response_rx.recv().await {
            let Some(client) = weak.upgrade() else {
                return;
            };
            if let Err(e) = client.resolve(response) {
                warn!(error = %e, "discarding query response");
            }
        }
    });

    client
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Query;
    use crate::sample::Key;

    #[test]
    fn test_decode_valid_request() {
        let request =
            decode_request(br#"{"correlation_id": 5, "key": "lt", "mode": {"latest": {"n": 3}}}"#)
                .unwrap();
        assert_eq!(request.correlation_id, 5);
        assert_eq!(request.query, Query::latest(Key::new("lt").unwrap(), 3));
    }

    #[test]
    fn test_decode_recovers_correlation_id() {
        let rejected =
            decode_request(br#"{"correlation_id": 9, "key": "", "mode": {"latest": {"n": 3}}}"#)
                .unwrap_err();
        assert_eq!(rejected.correlation_id, Some(9));
        assert!(rejected.reason.starts_with("malformed request"));
    }

    #[test]
    fn test_decode_garbage() {
        let rejected = decode_request(b"not json").unwrap_err();
        assert_eq!(rejected.correlation_id, None);

        let rejected = decode_request(b"\xff\xfe garbage").unwrap_err();
        assert_eq!(rejected.correlation_id, None);
    }

    #[tokio::test]
    async fn test_frame_reader_skips_oversized_line() {
        let mut input = vec![b'x'; MAX_FRAME_LEN + 10];
        input.extend_from_slice(b"\nnext\n\xff\nlast");
        let mut frames = FrameReader::new(&input[..]);

        assert_eq!(frames.next_frame().await.unwrap(), Some(Frame::TooLong));
        assert_eq!(
            frames.next_frame().await.unwrap(),
            Some(Frame::Line(b"next".to_vec()))
        );
        assert_eq!(
            frames.next_frame().await.unwrap(),
            Some(Frame::Line(vec![0xff]))
        );
        assert_eq!(
            frames.next_frame().await.unwrap(),
            Some(Frame::Line(b"last".to_vec()))
        );
        assert_eq!(frames.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_frame_reader_accepts_line_at_limit() {
        let mut input = vec![b'x'; MAX_FRAME_LEN];
        input.push(b'\n');
        let mut frames = FrameReader::new(&input[..]);

        match frames.next_frame().await.unwrap() {
            Some(Frame::Line(line)) => assert_eq!(line.len(), MAX_FRAME_LEN),
            other => panic!("expected a full-length line, got {other:?}"),
        }
        assert_eq!(frames.next_frame().await.unwrap(), None);
    }

    #[test]
    fn test_encode_line_terminates() {
        let line = encode_line(&QueryResponse::error(1, "boom")).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn test_closed_channel_reports_transport_closed() {
        let (tx, rx) = mpsc::unbounded_channel::<QueryRequest>();
        drop(rx);

        let result = QueryTransport::send(
            &tx,
            QueryRequest {
                correlation_id: 0,
                query: Query::latest(Key::new("lt").unwrap(), 1),
            },
        );
        assert!(matches!(result, Err(QueryError::TransportClosed)));
    }
}
