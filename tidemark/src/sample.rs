//! Measurement keys, values, and timestamped samples.
//!
//! A [`Sample`] is one decoded device measurement: an integer timestamp and a
//! [`Value`]. Samples are immutable once recorded. A [`Key`] names the
//! measurement stream a sample belongs to (for example a device variable such
//! as `"depth"` or `"xd"`).

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::KeyError;

/// Maximum length of a key in bytes.
pub const MAX_KEY_LEN: usize = 64;

/// Name of one telemetry measurement stream.
///
/// Keys are validated on construction: non-empty, at most [`MAX_KEY_LEN`]
/// bytes, printable ASCII without whitespace. Cloning is cheap (the string is
/// reference-counted), and a `Key` can be looked up by `&str` in maps.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Key(Arc<str>);

impl Key {
    /// Creates a key after validating it.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::InvalidKey`] if the key is malformed.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use tidemark::Key;
    ///
    /// let key = Key::new("depth").unwrap();
    /// assert_eq!(key.as_str(), "depth");
    /// assert!(Key::new("").is_err());
    /// assert!(Key::new("has space").is_err());
    /// ```
    pub fn new(key: &str) -> Result<Self, KeyError> {
        validate_key(key)?;
        Ok(Self(Arc::from(key)))
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Checks key well-formedness without allocating.
///
/// # Errors
///
/// Returns [`KeyError::InvalidKey`] describing the first violated rule.
pub fn validate_key(key: &str) -> Result<(), KeyError> {
    let reason = if key.is_empty() {
        "key cannot be empty"
    } else if key.len() > MAX_KEY_LEN {
        "key exceeds 64 bytes"
    } else if !key.bytes().all(|b| b.is_ascii_graphic()) {
        "key must be printable ASCII without whitespace"
    } else {
        return Ok(());
    };

    Err(KeyError::InvalidKey {
        key: key.to_string(),
        reason: reason.to_string(),
    })
}

impl Borrow<str> for Key {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Key {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_key(&value)?;
        Ok(Self(Arc::from(value)))
    }
}

impl TryFrom<&str> for Key {
    type Error = KeyError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Key> for String {
    fn from(key: Key) -> Self {
        key.0.to_string()
    }
}

/// A measurement value: a scalar or a fixed-size numeric vector.
///
/// The store never inspects values. Shape checking belongs to whoever reads
/// them back; [`Value::component`] is the accessor charts use to plot one
/// axis of a vector measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// A single number.
    Scalar(f64),
    /// A fixed-size vector such as a 3-axis orientation.
    Vector(Vec<f64>),
}

impl Value {
    /// Returns the scalar value, or `None` for vectors.
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(v) => Some(*v),
            Self::Vector(_) => None,
        }
    }

    /// Returns the `index`-th component.
    ///
    /// A scalar is treated as a one-element vector.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use tidemark::Value;
    ///
    /// let orientation = Value::Vector(vec![0.1, 0.2, 0.3]);
    /// assert_eq!(orientation.component(2), Some(0.3));
    /// assert_eq!(orientation.component(3), None);
    /// assert_eq!(Value::Scalar(4.0).component(0), Some(4.0));
    /// ```
    pub fn component(&self, index: usize) -> Option<f64> {
        match self {
            Self::Scalar(v) => (index == 0).then_some(*v),
            Self::Vector(values) => values.get(index).copied(),
        }
    }

    /// Returns the number of components.
    pub fn arity(&self) -> usize {
        match self {
            Self::Scalar(_) => 1,
            Self::Vector(values) => values.len(),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Scalar(value)
    }
}

impl From<Vec<f64>> for Value {
    fn from(values: Vec<f64>) -> Self {
        Self::Vector(values)
    }
}

impl<const N: usize> From<[f64; N]> for Value {
    fn from(values: [f64; N]) -> Self {
        Self::Vector(values.to_vec())
    }
}

/// One timestamped measurement.
///
/// Serialized compactly as `{"t": <timestamp>, "v": <value>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Timestamp in milliseconds (monotonic or wall-clock; only ordering matters).
    #[serde(rename = "t")]
    pub timestamp: u64,
    /// The measured value.
    #[serde(rename = "v")]
    pub value: Value,
}

impl Sample {
    /// Creates a new sample.
    pub fn new(timestamp: u64, value: impl Into<Value>) -> Self {
        Self {
            timestamp,
            value: value.into(),
        }
    }
}
