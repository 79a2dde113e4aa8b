//! Periodic "please send" requests to the device.
//!
//! Some device variables are only reported when asked for. A [`PollSpec`]
//! names a set of keys and an interval; while at least one subscription is
//! live the [`PollScheduler`] asks its [`PollSink`] for the union of all
//! subscribed keys at the effective interval.
//!
//! # Reference Counting
//!
//! Subscriptions are counted per key. Two views subscribing the same keys
//! produce one stream of requests, not two, and polling of a key stops only
//! when the last subscription naming it is dropped.
//!
//! # Interval
//!
//! The effective interval is the smallest interval among live
//! subscriptions. The timer is restarted only when that minimum changes, so
//! merging keys into an active schedule never shifts its phase.
//!
//! # Coalescing
//!
//! Outstanding requests are tracked per key. A requested key stays awaited
//! until it is ingested; a tick asks only for keys that are not awaited, so
//! a key merged into an active schedule or answered since the last request
//! goes out on the next tick. When every key is awaited the tick coalesces.
//! A key still awaited after `outstanding_timeout` is presumed lost and is
//! requested again, so a key the device never reports does not hold back
//! the others.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::duration_ms;
use crate::error::{ConfigError, Result};
use crate::sample::Key;

/// A set of keys to poll and how often.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollSpec {
    /// Keys requested on every tick.
    pub keys: BTreeSet<Key>,

    /// Time between requests.
    #[serde(rename = "interval_ms", with = "duration_ms")]
    pub interval: Duration,
}

impl PollSpec {
    /// Creates a validated poll spec.
    ///
    /// # Errors
    ///
    /// Returns a key error for a malformed key, or [`ConfigError`] if no
    /// keys are given or the interval is zero.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::time::Duration;
    /// use tidemark::PollSpec;
    ///
    /// let spec = PollSpec::new(["led_state"], Duration::from_millis(50)).unwrap();
    /// assert_eq!(spec.keys.len(), 1);
    /// assert!(PollSpec::new(["led_state"], Duration::ZERO).is_err());
    /// ```
    pub fn new<I, S>(keys: I, interval: Duration) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys = keys
            .into_iter()
            .map(|key| Key::new(key.as_ref()))
            .collect::<std::result::Result<BTreeSet<_>, _>>()?;

        let spec = Self { keys, interval };
        spec.validate()?;
        Ok(spec)
    }

    /// Validates the spec.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EmptyPollSpec`] or
    /// [`ConfigError::InvalidDuration`].
    pub fn validate(&self) -> Result<()> {
        if self.keys.is_empty() {
            return Err(ConfigError::EmptyPollSpec.into());
        }

        if self.interval.is_zero() {
            return Err(ConfigError::InvalidDuration {
                setting: "poll interval_ms",
                value: self.interval,
                reason: "must be > 0".to_string(),
            }
            .into());
        }

        Ok(())
    }
}

/// Receives poll requests on behalf of the device link.
pub trait PollSink: Send + Sync + 'static {
    /// Asks the device to report `keys`.
    fn request(&self, keys: &BTreeSet<Key>);
}

impl<F> PollSink for F
where
    F: Fn(&BTreeSet<Key>) + Send + Sync + 'static,
{
    fn request(&self, keys: &BTreeSet<Key>) {
        self(keys);
    }
}

/// Whether the scheduler is currently polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// No live subscriptions; no timer runs.
    Idle,
    /// At least one live subscription.
    Active,
}

/// Handle returned by [`PollScheduler::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Subscription bookkeeping and the tick decision, independent of any timer.
#[derive(Debug)]
struct Schedule {
    subscriptions: HashMap<SubscriptionId, PollSpec>,
    key_refs: BTreeMap<Key, usize>,
    interval_refs: BTreeMap<Duration, usize>,
    /// Requested keys not yet ingested, with the time they were requested.
    awaiting: BTreeMap<Key, Instant>,
    outstanding_timeout: Duration,
    next_id: u64,
    requests_sent: u64,
    ticks_coalesced: u64,
}

impl Schedule {
    fn new(outstanding_timeout: Duration) -> Self {
        Self {
            subscriptions: HashMap::new(),
            key_refs: BTreeMap::new(),
            interval_refs: BTreeMap::new(),
            awaiting: BTreeMap::new(),
            outstanding_timeout,
            next_id: 0,
            requests_sent: 0,
            ticks_coalesced: 0,
        }
    }

    fn subscribe(&mut self, spec: PollSpec) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;

        for key in &spec.keys {
            *self.key_refs.entry(key.clone()).or_insert(0) += 1;
        }
        *self.interval_refs.entry(spec.interval).or_insert(0) += 1;
        self.subscriptions.insert(id, spec);

        id
    }

    fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let Some(spec) = self.subscriptions.remove(&id) else {
            return false;
        };

        for key in &spec.keys {
            if let Some(count) = self.key_refs.get_mut(key) {
                *count -= 1;
                if *count == 0 {
                    self.key_refs.remove(key);
                    // An unpolled key is no longer awaited.
                    self.awaiting.remove(key);
                }
            }
        }

        if let Some(count) = self.interval_refs.get_mut(&spec.interval) {
            *count -= 1;
            if *count == 0 {
                self.interval_refs.remove(&spec.interval);
            }
        }

        true
    }

    fn state(&self) -> PollState {
        if self.key_refs.is_empty() {
            PollState::Idle
        } else {
            PollState::Active
        }
    }

    fn interval(&self) -> Option<Duration> {
        self.interval_refs.keys().next().copied()
    }

    fn keys(&self) -> BTreeSet<Key> {
        self.key_refs.keys().cloned().collect()
    }

    /// Decides what a timer tick at `now` does: the subscribed keys that
    /// are not awaited (or whose request expired), or `None` when the tick
    /// coalesces or nothing is subscribed.
    fn tick(&mut self, now: Instant) -> Option<BTreeSet<Key>> {
        if self.key_refs.is_empty() {
            return None;
        }

        let due: BTreeSet<Key> = self
            .key_refs
            .keys()
            .filter(|key| {
                self.awaiting.get(*key).is_none_or(|issued_at| {
                    now.saturating_duration_since(*issued_at) >= self.outstanding_timeout
                })
            })
            .cloned()
            .collect();

        if due.is_empty() {
            self.ticks_coalesced += 1;
            return None;
        }

        for key in &due {
            self.awaiting.insert(key.clone(), now);
        }
        self.requests_sent += 1;
        Some(due)
    }

    fn acknowledge(&mut self, key: &str) {
        self.awaiting.remove(key);
    }

    fn has_outstanding(&self) -> bool {
        !self.awaiting.is_empty()
    }
}

struct Shared {
    schedule: Mutex<Schedule>,
    sink: Box<dyn PollSink>,
    /// Mirrors `!schedule.awaiting.is_empty()` so ingest can skip the lock.
    awaiting: AtomicBool,
}

impl Shared {
    fn on_tick(&self) {
        let keys = {
            let mut schedule = self.schedule.lock();
            let keys = schedule.tick(Instant::now());
            self.awaiting
                .store(schedule.has_outstanding(), Ordering::Release);
            keys
        };

        if let Some(keys) = keys {
            debug!(keys = keys.len(), "sending poll request");
            self.sink.request(&keys);
        }
    }
}

/// Reference-counted periodic poller.
///
/// Creating a scheduler spawns its timer task, so it must be created from
/// within a Tokio runtime. The task sleeps while the scheduler is idle and
/// stops when the scheduler is dropped.
pub struct PollScheduler {
    shared: Arc<Shared>,
    interval_tx: watch::Sender<Option<Duration>>,
    driver: JoinHandle<()>,
}

impl PollScheduler {
    /// Creates an idle scheduler that sends requests to `sink`.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new<S: PollSink>(sink: S, outstanding_timeout: Duration) -> Self {
        let shared = Arc::new(Shared {
            schedule: Mutex::new(Schedule::new(outstanding_timeout)),
            sink: Box::new(sink),
            awaiting: AtomicBool::new(false),
        });

        let (interval_tx, interval_rx) = watch::channel(None);
        let driver = tokio::spawn(drive(Arc::clone(&shared), interval_rx));

        Self {
            shared,
            interval_tx,
            driver,
        }
    }

    /// Adds a subscription and returns its handle.
    ///
    /// The first subscription starts the timer. Later subscriptions merge
    /// their keys into the schedule and restart the timer only if they lower
    /// the effective interval.
    pub fn subscribe(&self, spec: PollSpec) -> SubscriptionId {
        let mut schedule = self.shared.schedule.lock();
        let was = schedule.state();
        let id = schedule.subscribe(spec);
        let interval = schedule.interval();
        let keys = schedule.key_refs.len();
        drop(schedule);

        if was == PollState::Idle {
            info!(?interval, keys, "poll scheduler active");
        }
        self.publish_interval(interval);
        id
    }

    /// Drops a subscription. Unknown handles are ignored.
    ///
    /// # Returns
    ///
    /// Whether the handle referred to a live subscription.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut schedule = self.shared.schedule.lock();
        if !schedule.unsubscribe(id) {
            drop(schedule);
            warn!(?id, "unsubscribe for unknown poll subscription");
            return false;
        }
        let state = schedule.state();
        let interval = schedule.interval();
        self.shared
            .awaiting
            .store(schedule.has_outstanding(), Ordering::Release);
        drop(schedule);

        if state == PollState::Idle {
            info!("poll scheduler idle");
        }
        self.publish_interval(interval);
        true
    }

    /// Records that `key` was ingested. The key is no longer awaited, so
    /// the next tick requests it again.
    pub fn acknowledge(&self, key: &str) {
        if !self.shared.awaiting.load(Ordering::Acquire) {
            return;
        }

        let mut schedule = self.shared.schedule.lock();
        schedule.acknowledge(key);
        self.shared
            .awaiting
            .store(schedule.has_outstanding(), Ordering::Release);
    }

    /// Returns whether any subscription is live.
    pub fn state(&self) -> PollState {
        self.shared.schedule.lock().state()
    }

    /// Returns the union of all subscribed keys.
    pub fn keys(&self) -> BTreeSet<Key> {
        self.shared.schedule.lock().keys()
    }

    /// Returns the effective interval, or `None` when idle.
    pub fn interval(&self) -> Option<Duration> {
        self.shared.schedule.lock().interval()
    }

    /// Returns the number of requests sent to the sink.
    pub fn requests_sent(&self) -> u64 {
        self.shared.schedule.lock().requests_sent
    }

    /// Returns the number of ticks on which every key was still awaited.
    pub fn ticks_coalesced(&self) -> u64 {
        self.shared.schedule.lock().ticks_coalesced
    }

    fn publish_interval(&self, interval: Option<Duration>) {
        self.interval_tx.send_if_modified(|current| {
            if *current == interval {
                false
            } else {
                *current = interval;
                true
            }
        });
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

impl std::fmt::Debug for PollScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let schedule = self.shared.schedule.lock();
        f.debug_struct("PollScheduler")
            .field("state", &schedule.state())
            .field("interval", &schedule.interval())
            .field("keys", &schedule.key_refs.len())
            .field("requests_sent", &schedule.requests_sent)
            .finish_non_exhaustive()
    }
}

/// Timer loop. Runs one `tokio::time::Interval` per effective interval and
/// parks on the watch channel while idle.
async fn drive(shared: Arc<Shared>, mut interval_rx: watch::Receiver<Option<Duration>>) {
    loop {
        let period = *interval_rx.borrow_and_update();

        let Some(period) = period else {
            if interval_rx.changed().await.is_err() {
                return;
            }
            continue;
        };

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => shared.on_tick(),
                changed = interval_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(keys: &[&str], interval_ms: u64) -> PollSpec {
        PollSpec::new(keys.iter().copied(), Duration::from_millis(interval_ms)).unwrap()
    }

    fn names(keys: &BTreeSet<Key>) -> Vec<&str> {
        keys.iter().map(Key::as_str).collect()
    }

    #[test]
    fn test_spec_validation() {
        assert!(PollSpec::new(Vec::<&str>::new(), Duration::from_millis(50)).is_err());
        assert!(PollSpec::new(["a"], Duration::ZERO).is_err());
        assert!(PollSpec::new(["bad key"], Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_spec_json() {
        let spec: PollSpec =
            serde_json::from_str(r#"{"keys": ["led_state"], "interval_ms": 50}"#).unwrap();
        assert_eq!(spec, self::spec(&["led_state"], 50));
    }

    #[test]
    fn test_reference_counting() {
        let mut schedule = Schedule::new(Duration::from_secs(1));
        assert_eq!(schedule.state(), PollState::Idle);

        let first = schedule.subscribe(spec(&["a", "b"], 50));
        let second = schedule.subscribe(spec(&["a", "b"], 50));
        assert_eq!(schedule.state(), PollState::Active);

        assert!(schedule.unsubscribe(first));
        assert_eq!(schedule.state(), PollState::Active);
        assert_eq!(names(&schedule.keys()), vec!["a", "b"]);

        assert!(schedule.unsubscribe(second));
        assert_eq!(schedule.state(), PollState::Idle);
        assert!(!schedule.unsubscribe(second));
    }

    #[test]
    fn test_keys_merge() {
        let mut schedule = Schedule::new(Duration::from_secs(1));
        let first = schedule.subscribe(spec(&["a"], 50));
        schedule.subscribe(spec(&["b"], 50));

        assert_eq!(names(&schedule.keys()), vec!["a", "b"]);

        schedule.unsubscribe(first);
        assert_eq!(names(&schedule.keys()), vec!["b"]);
    }

    #[test]
    fn test_effective_interval_is_minimum() {
        let mut schedule = Schedule::new(Duration::from_secs(1));
        assert_eq!(schedule.interval(), None);

        let slow = schedule.subscribe(spec(&["a"], 200));
        assert_eq!(schedule.interval(), Some(Duration::from_millis(200)));

        let fast = schedule.subscribe(spec(&["b"], 50));
        assert_eq!(schedule.interval(), Some(Duration::from_millis(50)));

        schedule.unsubscribe(fast);
        assert_eq!(schedule.interval(), Some(Duration::from_millis(200)));

        schedule.unsubscribe(slow);
        assert_eq!(schedule.interval(), None);
    }

    #[test]
    fn test_tick_coalesces_while_outstanding() {
        let mut schedule = Schedule::new(Duration::from_millis(1_000));
        schedule.subscribe(spec(&["a", "b"], 50));
        let start = Instant::now();

        let keys = schedule.tick(start).unwrap();
        assert_eq!(names(&keys), vec!["a", "b"]);
        assert!(schedule.tick(start + Duration::from_millis(50)).is_none());

        // Only "a" answered: it is requested again, "b" is still awaited.
        schedule.acknowledge("a");
        let keys = schedule.tick(start + Duration::from_millis(100)).unwrap();
        assert_eq!(names(&keys), vec!["a"]);
        assert!(schedule.tick(start + Duration::from_millis(150)).is_none());

        schedule.acknowledge("a");
        schedule.acknowledge("b");
        let keys = schedule.tick(start + Duration::from_millis(200)).unwrap();
        assert_eq!(names(&keys), vec!["a", "b"]);

        assert_eq!(schedule.requests_sent, 3);
        assert_eq!(schedule.ticks_coalesced, 2);
    }

    #[test]
    fn test_merged_key_requested_on_next_tick() {
        let mut schedule = Schedule::new(Duration::from_millis(1_000));
        schedule.subscribe(spec(&["a"], 50));
        let start = Instant::now();

        assert!(schedule.tick(start).is_some());
        schedule.subscribe(spec(&["b"], 50));

        let keys = schedule.tick(start + Duration::from_millis(50)).unwrap();
        assert_eq!(names(&keys), vec!["b"]);
        assert_eq!(schedule.ticks_coalesced, 0);
    }

    #[test]
    fn test_silent_key_does_not_hold_back_others() {
        let mut schedule = Schedule::new(Duration::from_millis(1_000));
        schedule.subscribe(spec(&["a", "ghost"], 50));
        let start = Instant::now();

        for i in 0..10u64 {
            let keys = schedule.tick(start + Duration::from_millis(i * 50)).unwrap();
            assert!(keys.iter().any(|key| key.as_str() == "a"));
            schedule.acknowledge("a");
        }

        assert_eq!(schedule.requests_sent, 10);
        assert!(schedule.has_outstanding());
    }

    #[test]
    fn test_lost_request_reissued_after_timeout() {
        let mut schedule = Schedule::new(Duration::from_millis(100));
        schedule.subscribe(spec(&["a"], 50));
        let start = Instant::now();

        assert!(schedule.tick(start).is_some());
        assert!(schedule.tick(start + Duration::from_millis(50)).is_none());
        assert!(schedule.tick(start + Duration::from_millis(100)).is_some());
        assert_eq!(schedule.requests_sent, 2);
    }

    #[test]
    fn test_unsubscribed_key_no_longer_awaited() {
        let mut schedule = Schedule::new(Duration::from_secs(10));
        schedule.subscribe(spec(&["a"], 50));
        let b = schedule.subscribe(spec(&["b"], 50));
        let start = Instant::now();

        assert!(schedule.tick(start).is_some());
        schedule.acknowledge("a");
        assert!(schedule.has_outstanding());

        schedule.unsubscribe(b);
        assert!(!schedule.has_outstanding());
        assert!(schedule.tick(start + Duration::from_millis(50)).is_some());
    }

    #[test]
    fn test_idle_tick_sends_nothing() {
        let mut schedule = Schedule::new(Duration::from_secs(1));
        assert!(schedule.tick(Instant::now()).is_none());
        assert_eq!(schedule.requests_sent, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_polls_until_last_unsubscribe() {
        let requests = Arc::new(Mutex::new(Vec::<BTreeSet<Key>>::new()));
        let sink = {
            let requests = Arc::clone(&requests);
            move |keys: &BTreeSet<Key>| requests.lock().push(keys.clone())
        };
        // Every request is presumed lost before the next tick.
        let scheduler = PollScheduler::new(sink, Duration::from_millis(1));

        let first = scheduler.subscribe(spec(&["a", "b"], 50));
        let second = scheduler.subscribe(spec(&["a", "b"], 50));
        assert_eq!(scheduler.state(), PollState::Active);

        tokio::time::sleep(Duration::from_millis(120)).await;
        let after_both = requests.lock().len();
        assert!(after_both >= 2, "expected ticks, got {after_both}");
        assert!(requests.lock().iter().all(|keys| names(keys) == vec!["a", "b"]));

        assert!(scheduler.unsubscribe(first));
        tokio::time::sleep(Duration::from_millis(120)).await;
        let after_one = requests.lock().len();
        assert!(after_one > after_both);

        assert!(scheduler.unsubscribe(second));
        assert_eq!(scheduler.state(), PollState::Idle);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(requests.lock().len(), after_one);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledge_ends_coalescing() {
        let requests = Arc::new(Mutex::new(0usize));
        let sink = {
            let requests = Arc::clone(&requests);
            move |_: &BTreeSet<Key>| *requests.lock() += 1
        };
        let scheduler = PollScheduler::new(sink, Duration::from_secs(60));
        scheduler.subscribe(spec(&["led_state"], 50));

        tokio::time::sleep(Duration::from_millis(175)).await;
        assert_eq!(*requests.lock(), 1);
        assert!(scheduler.ticks_coalesced() >= 2);

        scheduler.acknowledge("led_state");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*requests.lock(), 2);
    }
}
