//! Registry of per-key buffers for one device session.
//!
//! The [`DataSourceRegistry`] owns exactly one [`TimeSeriesBuffer`] per
//! measurement key. Buffers are created lazily, on the first write or the
//! first query for a key, by the factory registered for that key or by the
//! default configuration.
//!
//! # Overview
//!
//! - [`DataSourceRegistry::get_or_create`] - Returns the shared buffer for a
//!   key, constructing it exactly once even when ingest and query paths race
//!   on first access
//! - [`DataSourceRegistry::register_factory`] - Overrides construction for a
//!   key that has no buffer yet
//! - [`DataSourceRegistry::write`] / [`DataSourceRegistry::read`] - Thin
//!   pass-throughs to the owned buffer
//!
//! # Locking
//!
//! The key map is behind a read/write lock that is held only long enough to
//! look up or insert an entry. Each buffer has its own lock, so a slow read
//! on one key never stalls ingestion of another.
//!
//! Factories run outside the map lock. Concurrent first accesses to one key
//! wait on that key's creation slot, so a slow factory delays only its own
//! key, and a factory may use the registry for other keys.
//!
//! # Example
//!
//! ```rust
//! use tidemark::{BufferConfig, DataSourceRegistry, QueryMode, Sample, TimeSeriesBuffer};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = DataSourceRegistry::new(BufferConfig::default());
//! registry.register_factory("depth", |_key| TimeSeriesBuffer::new(2))?;
//!
//! registry.write("depth", Sample::new(0, 1.0))?;
//! registry.write("depth", Sample::new(10, 2.0))?;
//! registry.write("depth", Sample::new(20, 3.0))?;
//!
//! let latest = registry.read("depth", &QueryMode::Latest { n: 1 })?;
//! assert_eq!(latest, vec![Sample::new(20, 3.0)]);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::debug;

use crate::buffer::{BufferStats, TimeSeriesBuffer};
use crate::config::{BufferConfig, StoreConfig};
use crate::error::{ConfigError, Result};
use crate::query::QueryMode;
use crate::sample::{Key, Sample};

/// A buffer shared between the registry and its readers and writers.
pub type SharedBuffer = Arc<RwLock<TimeSeriesBuffer>>;

/// Constructs the buffer for a key on first use.
pub type BufferFactory = Arc<dyn Fn(&Key) -> TimeSeriesBuffer + Send + Sync>;

/// Owner of every buffer in a device session.
///
/// # Thread Safety
///
/// All methods take `&self`; the registry is meant to be shared behind an
/// `Arc` between the ingest path and any number of query paths.
pub struct DataSourceRegistry {
    /// Key map and factory table, guarded together so that a factory can
    /// never be registered for a key whose buffer is being created.
    inner: RwLock<Inner>,
    /// Settings for keys without a registered factory.
    default_config: BufferConfig,
    /// Number of buffers constructed since the registry was created.
    created: AtomicU64,
}

#[derive(Default)]
struct Inner {
    buffers: HashMap<Key, SharedBuffer>,
    /// First accesses in flight; removed once the buffer is published.
    creating: HashMap<Key, Arc<OnceLock<SharedBuffer>>>,
    factories: HashMap<Key, BufferFactory>,
}

impl DataSourceRegistry {
    /// Creates an empty registry whose buffers default to `default_config`.
    pub fn new(default_config: BufferConfig) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            default_config,
            created: AtomicU64::new(0),
        }
    }

    /// Creates a registry from a validated store configuration.
    ///
    /// Every entry of the per-key table is registered as a factory before
    /// the registry is handed out, so configuration cannot race with first
    /// use.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration fails validation.
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        config.validate()?;

        let registry = Self::new(config.default_buffer);
        {
            let mut inner = registry.inner.write();
            for (key, buffer) in &config.buffers {
                let buffer = *buffer;
                let factory: BufferFactory = Arc::new(move |_key: &Key| buffer.build());
                inner.factories.insert(key.clone(), factory);
            }
        }

        Ok(registry)
    }

    /// Returns the buffer for `key`, constructing it on first access.
    ///
    /// At most one buffer is ever constructed per key: concurrent first
    /// accesses all observe the same instance. The factory runs without the
    /// map lock held; it must not access its own key.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::KeyError::InvalidKey`] if a buffer has to be
    /// created for a malformed key.
    pub fn get_or_create(&self, key: &str) -> Result<SharedBuffer> {
        if let Some(buffer) = self.inner.read().buffers.get(key) {
            return Ok(Arc::clone(buffer));
        }

        let key = Key::new(key)?;
        let (slot, factory) = {
            let mut inner = self.inner.write();

            // Another caller may have created it between the two locks.
            if let Some(buffer) = inner.buffers.get(&key) {
                return Ok(Arc::clone(buffer));
            }

            let slot = Arc::clone(inner.creating.entry(key.clone()).or_default());
            (slot, inner.factories.get(&key).cloned())
        };

        let shared = Arc::clone(slot.get_or_init(|| {
            let buffer = match &factory {
                Some(factory) => factory(&key),
                None => self.default_config.build(),
            };
            debug!(
                key = %key,
                capacity = buffer.capacity(),
                policy = ?buffer.policy(),
                "created buffer"
            );
            self.created.fetch_add(1, Ordering::Relaxed);
            Arc::new(RwLock::new(buffer))
        }));

        // Publish unless a clear or replace retired this slot meanwhile.
        let mut inner = self.inner.write();
        if inner
            .creating
            .get(&key)
            .is_some_and(|current| Arc::ptr_eq(current, &slot))
        {
            inner.creating.remove(&key);
            inner.buffers.insert(key, Arc::clone(&shared));
        }

        Ok(shared)
    }

    /// Returns the buffer for `key` without creating it.
    pub fn get(&self, key: &str) -> Option<SharedBuffer> {
        self.inner.read().buffers.get(key).cloned()
    }

    /// Registers the factory used to construct the buffer for `key`.
    ///
    /// Registering again before first use replaces the earlier factory.
    ///
    /// # Errors
    ///
    /// - [`crate::error::KeyError::InvalidKey`] if the key is malformed
    /// - [`ConfigError::FactoryAfterCreation`] if the buffer already exists
    ///   or is being created; the existing buffer is left untouched
    pub fn register_factory<F>(&self, key: &str, factory: F) -> Result<()>
    where
        F: Fn(&Key) -> TimeSeriesBuffer + Send + Sync + 'static,
    {
        let key = Key::new(key)?;
        let mut inner = self.inner.write();

        if inner.buffers.contains_key(&key) || inner.creating.contains_key(&key) {
            return Err(ConfigError::FactoryAfterCreation {
                key: key.to_string(),
            }
            .into());
        }

        debug!(key = %key, "registered buffer factory");
        inner.factories.insert(key, Arc::new(factory));
        Ok(())
    }

    /// Registers a factory that builds buffers from `config`.
    ///
    /// # Errors
    ///
    /// Same as [`DataSourceRegistry::register_factory`], plus any validation
    /// error from `config`.
    pub fn register_config(&self, key: &str, config: BufferConfig) -> Result<()> {
        config.validate(key)?;
        self.register_factory(key, move |_key| config.build())
    }

    /// Replaces the buffer for `key` with a fresh one built from `config`.
    ///
    /// Buffers cannot be resized in place; this is how a capacity change is
    /// applied to a live key. Retained samples are discarded. Callers still
    /// holding the old [`SharedBuffer`] keep reading the old instance.
    ///
    /// # Errors
    ///
    /// Returns a key or configuration error.
    pub fn replace(&self, key: &str, config: BufferConfig) -> Result<SharedBuffer> {
        config.validate(key)?;
        let key = Key::new(key)?;

        let shared = Arc::new(RwLock::new(config.build()));
        let mut inner = self.inner.write();
        inner.creating.remove(&key);
        let previous = inner.buffers.insert(key.clone(), Arc::clone(&shared));
        self.created.fetch_add(1, Ordering::Relaxed);

        debug!(
            key = %key,
            capacity = config.capacity,
            replaced = previous.is_some(),
            "replaced buffer"
        );
        Ok(shared)
    }

    /// Appends a sample to the buffer for `key`, creating it first.
    ///
    /// # Returns
    ///
    /// The number of samples evicted to make room.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::KeyError::InvalidKey`] for a malformed key.
    pub fn write(&self, key: &str, sample: Sample) -> Result<usize> {
        let buffer = self.get_or_create(key)?;
        let evicted = buffer.write().append(sample);
        Ok(evicted)
    }

    /// Evaluates a query mode against the buffer for `key`, creating it first.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::KeyError::InvalidKey`] for a malformed key.
    pub fn read(&self, key: &str, mode: &QueryMode) -> Result<Vec<Sample>> {
        let buffer = self.get_or_create(key)?;
        let samples = mode.apply(&buffer.read());
        Ok(samples)
    }

    /// Returns counters for the buffer of `key`, if it exists.
    pub fn stats(&self, key: &str) -> Option<BufferStats> {
        self.get(key).map(|buffer| buffer.read().stats())
    }

    /// Returns all keys that currently have a buffer, sorted.
    pub fn keys(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = self.inner.read().buffers.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Returns whether a buffer exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.read().buffers.contains_key(key)
    }

    /// Returns the number of live buffers.
    pub fn len(&self) -> usize {
        self.inner.read().buffers.len()
    }

    /// Returns whether no buffer has been created yet (or all were cleared).
    pub fn is_empty(&self) -> bool {
        self.inner.read().buffers.is_empty()
    }

    /// Returns the number of buffers constructed over the registry's lifetime.
    pub fn buffers_created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Returns the settings used for keys without a factory.
    pub fn default_config(&self) -> BufferConfig {
        self.default_config
    }

    /// Discards every buffer, ending the session's retained history.
    ///
    /// Registered factories are configuration and are kept.
    ///
    /// # Returns
    ///
    /// The number of buffers discarded.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.write();
        let discarded = inner.buffers.len();
        inner.buffers.clear();
        inner.creating.clear();
        discarded
    }
}

impl std::fmt::Debug for DataSourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("DataSourceRegistry")
            .field("buffers", &inner.buffers.len())
            .field("factories", &inner.factories.len())
            .field("default_config", &self.default_config)
            .field("created", &self.buffers_created())
            .finish()
    }
}
