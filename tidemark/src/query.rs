//! Query model and wire messages.
//!
//! A [`Query`] names a key and a [`QueryMode`]. Queries are stateless and
//! never mutate a buffer. For the cross-process path a query is wrapped in a
//! [`QueryRequest`] carrying a correlation ID, and answered by a
//! [`QueryResponse`] carrying the same ID.
//!
//! # Wire Shape
//!
//! ```json
//! {"correlation_id": 7, "key": "depth", "mode": {"window": {"start": 0, "end": 20}}}
//! {"correlation_id": 7, "samples": [{"t": 10, "v": 2.0}, {"t": 20, "v": 3.0}]}
//! {"correlation_id": 8, "error": "key error: invalid key \"\": key cannot be empty"}
//! ```

use serde::{Deserialize, Serialize};

use crate::buffer::TimeSeriesBuffer;
use crate::sample::{Key, Sample};

/// Which samples a query selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    /// All samples with `start <= timestamp <= end`.
    Window {
        /// Inclusive lower bound.
        start: u64,
        /// Inclusive upper bound.
        end: u64,
    },

    /// The last `n` samples in arrival order.
    Latest {
        /// Maximum number of samples.
        n: usize,
    },

    /// All samples within `span` of the newest retained timestamp.
    Recent {
        /// Width of the window in milliseconds.
        span: u64,
    },
}

impl QueryMode {
    /// Evaluates this mode against a buffer.
    pub fn apply(&self, buffer: &TimeSeriesBuffer) -> Vec<Sample> {
        match *self {
            Self::Window { start, end } => buffer.query_window(start, end),
            Self::Latest { n } => buffer.query_latest(n),
            Self::Recent { span } => buffer.query_recent(span),
        }
    }
}

/// A read request for one key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Query {
    /// The key to read.
    pub key: Key,
    /// Which samples to select.
    pub mode: QueryMode,
}

impl Query {
    /// Creates a window query.
    pub fn window(key: Key, start: u64, end: u64) -> Self {
        Self {
            key,
            mode: QueryMode::Window { start, end },
        }
    }

    /// Creates a latest-N query.
    pub fn latest(key: Key, n: usize) -> Self {
        Self {
            key,
            mode: QueryMode::Latest { n },
        }
    }

    /// Creates a recent-span query.
    pub fn recent(key: Key, span: u64) -> Self {
        Self {
            key,
            mode: QueryMode::Recent { span },
        }
    }
}

/// A query paired with the correlation ID used to match its response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Token pairing this request with its response.
    pub correlation_id: u64,
    /// The query itself.
    #[serde(flatten)]
    pub query: Query,
}

/// The result carried by a [`QueryResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOutcome {
    /// The selected samples.
    Samples(Vec<Sample>),
    /// The store could not answer the query.
    Error(String),
}

/// The answer to a [`QueryRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    /// Correlation ID copied from the request.
    pub correlation_id: u64,
    /// Samples or an error message.
    #[serde(flatten)]
    pub outcome: QueryOutcome,
}

impl QueryResponse {
    /// Creates a successful response.
    pub fn samples(correlation_id: u64, samples: Vec<Sample>) -> Self {
        Self {
            correlation_id,
            outcome: QueryOutcome::Samples(samples),
        }
    }

    /// Creates an error response.
    pub fn error(correlation_id: u64, message: impl Into<String>) -> Self {
        Self {
            correlation_id,
            outcome: QueryOutcome::Error(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn depth() -> Key {
        Key::new("depth").unwrap()
    }

    #[test]
    fn test_mode_apply() {
        let mut buffer = TimeSeriesBuffer::new(10);
        for t in [0u64, 10, 20] {
            buffer.append(Sample::new(t, 1.0));
        }

        assert_eq!(QueryMode::Window { start: 5, end: 20 }.apply(&buffer).len(), 2);
        assert_eq!(QueryMode::Latest { n: 1 }.apply(&buffer).len(), 1);
        assert_eq!(QueryMode::Recent { span: 10 }.apply(&buffer).len(), 2);
    }

    #[test]
    fn test_request_wire_shape() {
        let request = QueryRequest {
            correlation_id: 7,
            query: Query::window(depth(), 0, 20),
        };

        let json: serde_json::Value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "correlation_id": 7,
                "key": "depth",
                "mode": {"window": {"start": 0, "end": 20}}
            })
        );

        let parsed: QueryRequest = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_response_wire_shape() {
        let ok = QueryResponse::samples(3, vec![Sample::new(20, 3.0)]);
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            serde_json::json!({"correlation_id": 3, "samples": [{"t": 20, "v": 3.0}]})
        );

        let err: QueryResponse =
            serde_json::from_str(r#"{"correlation_id": 4, "error": "boom"}"#).unwrap();
        assert_eq!(err, QueryResponse::error(4, "boom"));
    }

    #[test]
    fn test_request_with_invalid_key_fails_to_parse() {
        let result: Result<QueryRequest, _> = serde_json::from_str(
            r#"{"correlation_id": 1, "key": "", "mode": {"latest": {"n": 1}}}"#,
        );
        assert!(result.is_err());
    }
}
