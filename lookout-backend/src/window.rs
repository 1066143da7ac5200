//! Windowed sample collection shared by the ping and performance collectors.
//!
//! Every tracked key moves `Pending -> Active -> removed`. Active keys are
//! sampled once per tick; valid samples are buffered and a full buffer is
//! handed back as one window and cleared under the same entry lock, so a
//! sample can never end up in two windows or in none.

use async_trait::async_trait;
use scc::HashMap;
use scc::hash_map::Entry;
use thiserror::Error;
use uuid::Uuid;

/// Failure of the platform call behind a sample source.
/// Treated as systemic: the task driving the collector stops.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("sample source unavailable: {0}")]
    Unavailable(String),
}

/// Where samples come from. `Ok(None)` means nothing to sample for this key right now.
#[async_trait]
pub trait SampleSource<T>: Send + Sync {
    async fn sample(&self, key: Uuid, now: i64) -> Result<Option<T>, ProbeError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample<T> {
    pub date: i64,
    pub value: T,
}

/// A buffer that reached the window size.
#[derive(Debug, Clone, PartialEq)]
pub struct FullWindow<T> {
    pub key: Uuid,
    pub owner: Uuid,
    pub samples: Vec<Sample<T>>,
}

impl<T> FullWindow<T> {
    /// Timestamp of the newest sample.
    pub fn last_date(&self) -> i64 {
        self.samples.last().map(|s| s.date).unwrap_or_default()
    }
}

/// Result of one tick.
#[derive(Debug)]
pub struct Round<T> {
    pub flushed: Vec<FullWindow<T>>,
    pub fault: Option<ProbeError>,
}

/// Observable tracking state of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingState {
    Pending { until: i64 },
    Active { buffered: usize },
}

enum Phase<T> {
    Pending { until: i64 },
    Active(Vec<Sample<T>>),
}

struct Tracked<T> {
    owner: Uuid,
    phase: Phase<T>,
}

pub struct WindowedCollector<T> {
    entries: HashMap<Uuid, Tracked<T>>,
    window: usize,
    is_valid: fn(&T) -> bool,
}

impl<T: Send + 'static> WindowedCollector<T> {
    pub fn new(window: usize, is_valid: fn(&T) -> bool) -> Self {
        Self {
            entries: HashMap::new(),
            window: window.max(1),
            is_valid,
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Start tracking `key`, sampling from `active_from` on.
    /// Re-tracking a key drops whatever it had buffered.
    pub async fn track(&self, key: Uuid, owner: Uuid, active_from: i64) {
        let tracked = Tracked {
            owner,
            phase: Phase::Pending { until: active_from },
        };
        match self.entries.entry_async(key).await {
            Entry::Occupied(mut entry) => {
                *entry.get_mut() = tracked;
            }
            Entry::Vacant(entry) => {
                entry.insert_entry(tracked);
            }
        }
    }

    /// Stop tracking `key`. A partial window is discarded.
    pub async fn untrack(&self, key: Uuid) -> bool {
        self.entries.remove_async(&key).await.is_some()
    }

    pub async fn state(&self, key: Uuid) -> Option<TrackingState> {
        self.entries
            .read_async(&key, |_, tracked| match &tracked.phase {
                Phase::Pending { until } => TrackingState::Pending { until: *until },
                Phase::Active(samples) => TrackingState::Active {
                    buffered: samples.len(),
                },
            })
            .await
    }

    pub fn tracked_count(&self) -> usize {
        self.entries.len()
    }

    /// Sample every active key once.
    ///
    /// Invalid or missing samples skip that key only. A source fault stops
    /// the round; windows completed before the fault are still returned.
    pub async fn tick(&self, source: &dyn SampleSource<T>, now: i64) -> Round<T> {
        let mut due = Vec::new();
        self.entries
            .retain_async(|key, tracked| {
                if let Phase::Pending { until } = tracked.phase {
                    if now >= until {
                        tracked.phase = Phase::Active(Vec::with_capacity(self.window));
                    }
                }
                if matches!(tracked.phase, Phase::Active(_)) {
                    due.push(*key);
                }
                true
            })
            .await;

        let mut round = Round {
            flushed: Vec::new(),
            fault: None,
        };
        for key in due {
            let value = match source.sample(key, now).await {
                Ok(Some(value)) if (self.is_valid)(&value) => value,
                Ok(_) => continue,
                Err(e) => {
                    round.fault = Some(e);
                    break;
                }
            };

            // Key may have been untracked while we were sampling; the sample is then dropped
            let full = self
                .entries
                .update_async(&key, |_, tracked| {
                    let Phase::Active(samples) = &mut tracked.phase else {
                        return None;
                    };
                    samples.push(Sample { date: now, value });
                    if samples.len() >= self.window {
                        Some(FullWindow {
                            key,
                            owner: tracked.owner,
                            samples: std::mem::take(samples),
                        })
                    } else {
                        None
                    }
                })
                .await
                .flatten();

            if let Some(full) = full {
                round.flushed.push(full);
            }
        }
        round
    }
}

/// Latest value reported per key, for platforms that push samples instead of being polled.
pub struct Reported<T> {
    values: HashMap<Uuid, (i64, T)>,
    max_age: i64,
}

impl<T: Clone + Send + Sync + 'static> Reported<T> {
    /// Reports older than `max_age` millis are treated as missing.
    pub fn new(max_age: i64) -> Self {
        Self {
            values: HashMap::new(),
            max_age,
        }
    }

    pub async fn report(&self, key: Uuid, value: T, now: i64) {
        match self.values.entry_async(key).await {
            Entry::Occupied(mut entry) => {
                *entry.get_mut() = (now, value);
            }
            Entry::Vacant(entry) => {
                entry.insert_entry((now, value));
            }
        }
    }

    pub async fn forget(&self, key: Uuid) {
        let _ = self.values.remove_async(&key).await;
    }

    /// Drop reports too old to be sampled. Returns how many were removed.
    pub async fn purge_stale(&self, now: i64) -> usize {
        let mut removed = 0;
        self.values
            .retain_async(|_, (reported_at, _)| {
                let fresh = now - *reported_at <= self.max_age;
                if !fresh {
                    removed += 1;
                }
                fresh
            })
            .await;
        removed
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> SampleSource<T> for Reported<T> {
    async fn sample(&self, key: Uuid, now: i64) -> Result<Option<T>, ProbeError> {
        let value = self
            .values
            .read_async(&key, |_, (reported_at, value)| {
                (now - *reported_at <= self.max_age).then(|| value.clone())
            })
            .await
            .flatten();
        Ok(value)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Source that returns a fixed value, or fails once `broken` is set.
    pub(crate) struct FixedSource<T> {
        pub value: Option<T>,
        pub broken: AtomicBool,
    }

    impl<T> FixedSource<T> {
        pub fn new(value: Option<T>) -> Self {
            Self {
                value,
                broken: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl<T: Clone + Send + Sync> SampleSource<T> for FixedSource<T> {
        async fn sample(&self, _key: Uuid, _now: i64) -> Result<Option<T>, ProbeError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(ProbeError::Unavailable("method removed".to_string()));
            }
            Ok(self.value.clone())
        }
    }

    fn positive(value: &i32) -> bool {
        *value >= 0
    }

    #[tokio::test]
    async fn test_pending_key_activates_at_deadline() {
        let collector = WindowedCollector::new(3, positive);
        let source = FixedSource::new(Some(5));
        let key = Uuid::new_v4();
        collector.track(key, Uuid::nil(), 1_000).await;

        collector.tick(&source, 999).await;
        assert_eq!(collector.state(key).await, Some(TrackingState::Pending { until: 1_000 }));

        collector.tick(&source, 1_000).await;
        assert_eq!(collector.state(key).await, Some(TrackingState::Active { buffered: 1 }));
    }

    #[tokio::test]
    async fn test_full_window_is_returned_and_cleared() {
        let collector = WindowedCollector::new(3, positive);
        let source = FixedSource::new(Some(5));
        let key = Uuid::new_v4();
        let owner = Uuid::new_v4();
        collector.track(key, owner, 0).await;

        assert!(collector.tick(&source, 1).await.flushed.is_empty());
        assert!(collector.tick(&source, 2).await.flushed.is_empty());
        let round = collector.tick(&source, 3).await;

        assert_eq!(round.flushed.len(), 1);
        assert_eq!(round.flushed[0].owner, owner);
        assert_eq!(round.flushed[0].samples.len(), 3);
        assert_eq!(round.flushed[0].last_date(), 3);
        assert_eq!(collector.state(key).await, Some(TrackingState::Active { buffered: 0 }));
    }

    #[tokio::test]
    async fn test_invalid_samples_do_not_grow_buffer() {
        let collector = WindowedCollector::new(3, positive);
        let source = FixedSource::new(Some(-5));
        let key = Uuid::new_v4();
        collector.track(key, Uuid::nil(), 0).await;

        for now in 0..10 {
            assert!(collector.tick(&source, now).await.flushed.is_empty());
        }
        assert_eq!(collector.state(key).await, Some(TrackingState::Active { buffered: 0 }));
    }

    #[tokio::test]
    async fn test_fault_is_reported() {
        let collector = WindowedCollector::new(3, positive);
        let source = FixedSource::new(Some(5));
        collector.track(Uuid::new_v4(), Uuid::nil(), 0).await;

        source.broken.store(true, Ordering::SeqCst);
        let round = collector.tick(&source, 0).await;
        assert!(matches!(round.fault, Some(ProbeError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_untrack_discards_partial_window() {
        let collector = WindowedCollector::new(3, positive);
        let source = FixedSource::new(Some(5));
        let key = Uuid::new_v4();
        collector.track(key, Uuid::nil(), 0).await;
        collector.tick(&source, 0).await;
        collector.tick(&source, 1).await;

        assert!(collector.untrack(key).await);
        assert!(!collector.untrack(key).await);
        assert!(collector.tick(&source, 2).await.flushed.is_empty());
        assert_eq!(collector.state(key).await, None);
    }

    #[tokio::test]
    async fn test_reported_values_go_stale() {
        let reported = Reported::new(10_000);
        let key = Uuid::new_v4();
        reported.report(key, 42, 1_000).await;

        assert_eq!(reported.sample(key, 5_000).await.unwrap(), Some(42));
        assert_eq!(reported.sample(key, 11_001).await.unwrap(), None);

        reported.forget(key).await;
        assert_eq!(reported.sample(key, 1_000).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_purge_drops_only_stale_reports() {
        let reported = Reported::new(10_000);
        let (old, fresh) = (Uuid::new_v4(), Uuid::new_v4());
        reported.report(old, 30, 0).await;
        reported.report(fresh, 40, 15_000).await;

        assert_eq!(reported.purge_stale(20_000).await, 1);
        assert_eq!(reported.len(), 1);
        assert_eq!(reported.sample(fresh, 20_000).await.unwrap(), Some(40));
    }
}
