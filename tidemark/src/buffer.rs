//! Fixed-capacity ring buffer of timestamped samples for one key.
//!
//! This module provides [`TimeSeriesBuffer`], the leaf storage type of the
//! store. Each measurement key owns exactly one buffer.
//!
//! # Key Features
//!
//! - O(1) amortized append that never fails: a full buffer evicts its oldest
//!   sample before inserting the newest
//! - Window queries by binary search over the timestamp sequence
//! - Correct (linear) window queries when the source delivered samples out of
//!   order, with the fast path restored once the disorder has been evicted
//! - Optional age-based eviction on top of the capacity ceiling
//!
//! # Design
//!
//! Samples are kept in arrival order in a `VecDeque`. Arrival order is never
//! rewritten: an out-of-order timestamp is a source error, so the buffer keeps
//! the sample where it arrived and only records that the sequence is no longer
//! monotonic. Monotonicity is tracked as the number of retained adjacent pairs
//! whose timestamps decrease, which is maintained in O(1) on both append and
//! eviction.
//!
//! Readers receive copies. Positions inside the buffer are unstable across
//! appends, since any append may evict the oldest sample.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::sample::Sample;

/// Default retention ceiling per key.
pub const DEFAULT_CAPACITY: usize = 20_000;

/// How a buffer discards old samples.
///
/// Both policies evict only from the oldest end and both enforce the
/// capacity ceiling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Evict the oldest sample only when the buffer is full.
    #[default]
    Fifo,

    /// Additionally evict every sample older than `max_age_ms` relative to
    /// the most recently appended timestamp.
    MaxAge {
        /// Maximum age in milliseconds.
        max_age_ms: u64,
    },
}

/// Counters describing a buffer's lifetime activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferStats {
    /// Samples currently retained.
    pub len: usize,
    /// Retention ceiling.
    pub capacity: usize,
    /// Total samples appended since construction.
    pub total_appended: u64,
    /// Total samples evicted since construction.
    pub total_evicted: u64,
    /// Total appends whose timestamp was older than the previous sample's.
    pub out_of_order: u64,
}

/// A bounded, arrival-ordered sequence of samples for one key.
///
/// # Thread Safety
///
/// The buffer itself is not synchronized. The registry wraps each buffer in
/// its own lock so that access is exclusive per key but independent across
/// keys.
#[derive(Debug, Clone)]
pub struct TimeSeriesBuffer {
    /// Retained samples, oldest first.
    samples: VecDeque<Sample>,
    /// Maximum number of retained samples.
    capacity: usize,
    /// Eviction policy applied after every append.
    policy: EvictionPolicy,
    /// Number of retained adjacent pairs with decreasing timestamps.
    inversions: usize,
    total_appended: u64,
    total_evicted: u64,
    out_of_order: u64,
}

impl TimeSeriesBuffer {
    /// Creates an empty buffer with FIFO eviction.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum number of retained samples
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero. Configuration validation rejects a zero
    /// capacity before any buffer is constructed.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use tidemark::{Sample, TimeSeriesBuffer};
    ///
    /// let mut buffer = TimeSeriesBuffer::new(2);
    /// buffer.append(Sample::new(0, 1.0));
    /// buffer.append(Sample::new(10, 2.0));
    /// buffer.append(Sample::new(20, 3.0));
    ///
    /// assert_eq!(buffer.len(), 2);
    /// assert_eq!(buffer.oldest_timestamp(), Some(10));
    /// ```
    pub fn new(capacity: usize) -> Self {
        Self::with_policy(capacity, EvictionPolicy::Fifo)
    }

    /// Creates an empty buffer with the given eviction policy.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_policy(capacity: usize, policy: EvictionPolicy) -> Self {
        assert!(capacity > 0, "buffer capacity must be non-zero");

        // Large ceilings are allocated on demand rather than up front.
        let initial = capacity.min(1024);
        Self {
            samples: VecDeque::with_capacity(initial),
            capacity,
            policy,
            inversions: 0,
            total_appended: 0,
            total_evicted: 0,
            out_of_order: 0,
        }
    }

    /// Appends a sample, evicting as needed.
    ///
    /// Never fails. When the buffer is full the oldest sample is evicted
    /// before the new one is inserted. Under [`EvictionPolicy::MaxAge`] any
    /// samples that fell out of the age window are evicted afterwards.
    ///
    /// # Returns
    ///
    /// The number of samples evicted by this call.
    pub fn append(&mut self, sample: Sample) -> usize {
        let mut evicted = 0;

        if self.samples.len() == self.capacity {
            self.evict_oldest();
            evicted += 1;
        }

        if let Some(last) = self.samples.back()
            && sample.timestamp < last.timestamp
        {
            self.inversions += 1;
            self.out_of_order += 1;
        }

        let newest = sample.timestamp;
        self.samples.push_back(sample);
        self.total_appended += 1;

        if let EvictionPolicy::MaxAge { max_age_ms } = self.policy {
            let cutoff = newest.saturating_sub(max_age_ms);
            while self
                .samples
                .front()
                .is_some_and(|oldest| oldest.timestamp < cutoff)
            {
                self.evict_oldest();
                evicted += 1;
            }
        }

        evicted
    }

    /// Removes the oldest sample and keeps the inversion count exact.
    fn evict_oldest(&mut self) {
        if let Some(removed) = self.samples.pop_front() {
            if let Some(next) = self.samples.front()
                && removed.timestamp > next.timestamp
            {
                self.inversions -= 1;
            }
            self.total_evicted += 1;
        }
    }

    /// Returns all retained samples with `start <= timestamp <= end`.
    ///
    /// Samples are returned in arrival order. An inverted range
    /// (`start > end`) yields an empty result.
    ///
    /// Runs in O(log n + k) while the retained timestamps are monotonic and
    /// falls back to a linear scan otherwise.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use tidemark::{Sample, TimeSeriesBuffer};
    ///
    /// let mut buffer = TimeSeriesBuffer::new(10);
    /// for t in [0, 10, 20, 30] {
    ///     buffer.append(Sample::new(t, t as f64));
    /// }
    ///
    /// let window = buffer.query_window(10, 20);
    /// assert_eq!(window, vec![Sample::new(10, 10.0), Sample::new(20, 20.0)]);
    /// ```
    pub fn query_window(&self, start: u64, end: u64) -> Vec<Sample> {
        if start > end || self.samples.is_empty() {
            return Vec::new();
        }

        if self.inversions == 0 {
            let lo = self.samples.partition_point(|s| s.timestamp < start);
            let hi = self.samples.partition_point(|s| s.timestamp <= end);
            if lo >= hi {
                return Vec::new();
            }
            self.samples.range(lo..hi).cloned().collect()
        } else {
            self.samples
                .iter()
                .filter(|s| s.timestamp >= start && s.timestamp <= end)
                .cloned()
                .collect()
        }
    }

    /// Returns the last `min(n, len)` samples in arrival order.
    pub fn query_latest(&self, n: usize) -> Vec<Sample> {
        let skip = self.samples.len().saturating_sub(n);
        self.samples.range(skip..).cloned().collect()
    }

    /// Returns every sample no older than `span` before the newest timestamp.
    ///
    /// This is the window a real-time chart displays: the most recent `span`
    /// milliseconds of data, anchored at the largest retained timestamp
    /// rather than at the wall clock. A late out-of-order arrival does not
    /// move the anchor back.
    pub fn query_recent(&self, span: u64) -> Vec<Sample> {
        match self.max_timestamp() {
            Some(newest) => self.query_window(newest.saturating_sub(span), u64::MAX),
            None => Vec::new(),
        }
    }

    /// Returns the most recently appended sample.
    pub fn latest(&self) -> Option<&Sample> {
        self.samples.back()
    }

    /// Returns the timestamp of the oldest retained sample.
    pub fn oldest_timestamp(&self) -> Option<u64> {
        self.samples.front().map(|s| s.timestamp)
    }

    /// Returns the timestamp of the most recently appended sample.
    pub fn newest_timestamp(&self) -> Option<u64> {
        self.samples.back().map(|s| s.timestamp)
    }

    /// Returns the largest retained timestamp. Equal to
    /// [`TimeSeriesBuffer::newest_timestamp`] while the buffer is monotonic.
    pub fn max_timestamp(&self) -> Option<u64> {
        if self.inversions == 0 {
            self.newest_timestamp()
        } else {
            self.samples.iter().map(|s| s.timestamp).max()
        }
    }

    /// Iterates over retained samples in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    /// Returns the number of retained samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns whether the buffer holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Returns the retention ceiling.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the eviction policy.
    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Returns whether the retained timestamps are non-decreasing.
    pub fn is_monotonic(&self) -> bool {
        self.inversions == 0
    }

    /// Returns lifetime counters for this buffer.
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            len: self.samples.len(),
            capacity: self.capacity,
            total_appended: self.total_appended,
            total_evicted: self.total_evicted,
            out_of_order: self.out_of_order,
        }
    }
}
