//! Bucketed interval scheduler
//!
//! Trigger times are truncated to whole seconds so targets that come due
//! within the same second share one bucket and one timer fire.

use super::entry::{EntryState, ScheduleEntry};
use crate::error::SchedulerError;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Shortest delay handed back by `next_wake_delay`
pub const MIN_WAKE_DELAY: Duration = Duration::from_millis(1);

/// An entry returned by `drain_due`
#[derive(Debug)]
pub struct DueEntry<D> {
    pub key: String,
    pub descriptor: Arc<D>,
    /// Interval that produced this fire
    pub interval: Duration,
    pub attempt_count: u32,
}

impl<D> Clone for DueEntry<D> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            descriptor: Arc::clone(&self.descriptor),
            interval: self.interval,
            attempt_count: self.attempt_count,
        }
    }
}

/// Per-key backoff state plus the time-indexed buckets
///
/// Owned by a single scheduling loop; all mutation goes through `&mut self`.
#[derive(Debug)]
pub struct IntervalScheduler<D> {
    entries: HashMap<String, ScheduleEntry<D>>,
    buckets: BTreeMap<i64, Vec<String>>,
}

impl<D> Default for IntervalScheduler<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> IntervalScheduler<D> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            buckets: BTreeMap::new(),
        }
    }

    /// Register a target; fails if the key is taken
    pub fn register(
        &mut self,
        key: impl Into<String>,
        min_interval: Duration,
        max_interval: Duration,
        descriptor: D,
    ) -> Result<(), SchedulerError> {
        let key = key.into();
        if self.entries.contains_key(&key) {
            return Err(SchedulerError::DuplicateKey(key));
        }

        let entry = ScheduleEntry::new(key.clone(), min_interval, max_interval, descriptor);
        debug!(
            key = %key,
            min_ms = entry.min_interval().as_millis() as u64,
            max_ms = entry.max_interval().as_millis() as u64,
            "Registered schedule entry"
        );
        self.entries.insert(key, entry);
        Ok(())
    }

    /// Remove a target and take it out of its bucket
    pub fn unregister(&mut self, key: &str) -> Result<(), SchedulerError> {
        let entry = self
            .entries
            .remove(key)
            .ok_or_else(|| SchedulerError::UnknownKey(key.to_string()))?;

        if let EntryState::Scheduled(trigger) = entry.state {
            self.remove_from_bucket(trigger, key);
        }
        debug!(key = %key, "Unregistered schedule entry");
        Ok(())
    }

    /// Place the entry in the bucket for `truncate(from + current_interval)`
    pub fn schedule_next(&mut self, key: &str, from: DateTime<Utc>) -> Result<i64, SchedulerError> {
        let entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| SchedulerError::UnknownKey(key.to_string()))?;

        let previous = entry.state;
        let trigger = trigger_second(from, entry.current_interval());
        entry.state = EntryState::Scheduled(trigger);

        if let EntryState::Scheduled(old) = previous {
            self.remove_from_bucket(old, key);
        }
        self.buckets.entry(trigger).or_default().push(key.to_string());

        trace!(key = %key, trigger, "Scheduled entry");
        Ok(trigger)
    }

    /// Remove and return every entry whose bucket is at or before `now`
    pub fn drain_due(&mut self, now: DateTime<Utc>) -> Vec<DueEntry<D>> {
        let cutoff = now.timestamp().saturating_add(1);
        let remaining = self.buckets.split_off(&cutoff);
        let due_buckets = std::mem::replace(&mut self.buckets, remaining);

        let mut due = Vec::new();
        for key in due_buckets.into_values().flatten() {
            if let Some(entry) = self.entries.get_mut(&key) {
                entry.state = EntryState::Due;
                due.push(DueEntry {
                    key,
                    descriptor: Arc::clone(entry.descriptor()),
                    interval: entry.current_interval(),
                    attempt_count: entry.attempt_count(),
                });
            }
        }

        if !due.is_empty() {
            debug!(count = due.len(), "Drained due entries");
        }
        due
    }

    /// One backoff step for `key`
    pub fn grow_interval(&mut self, key: &str) -> Result<Duration, SchedulerError> {
        let entry = self.entry_mut(key)?;
        entry.grow();
        Ok(entry.current_interval())
    }

    /// Back to the minimum interval for `key`
    pub fn reset(&mut self, key: &str) -> Result<(), SchedulerError> {
        self.entry_mut(key)?.reset();
        Ok(())
    }

    /// Apply the outcome of one fire: reset when productive, grow otherwise
    ///
    /// Returns `false` (and changes nothing) unless the entry was drained and
    /// not yet settled, so each fire adjusts the interval at most once.
    pub fn settle(&mut self, key: &str, productive: bool) -> Result<bool, SchedulerError> {
        let entry = self.entry_mut(key)?;
        if entry.state != EntryState::Due {
            return Ok(false);
        }

        if productive {
            entry.reset();
        } else {
            entry.grow();
        }
        entry.state = EntryState::Idle;
        Ok(true)
    }

    /// Delay until the earliest bucket, never below `MIN_WAKE_DELAY`
    pub fn next_wake_delay(&self, now: DateTime<Utc>) -> Option<Duration> {
        let (&trigger, _) = self.buckets.first_key_value()?;
        let delta_ms = trigger
            .saturating_mul(1000)
            .saturating_sub(now.timestamp_millis());

        let delay = u64::try_from(delta_ms)
            .map(Duration::from_millis)
            .unwrap_or(Duration::ZERO);
        Some(delay.max(MIN_WAKE_DELAY))
    }

    pub fn entry(&self, key: &str) -> Option<&ScheduleEntry<D>> {
        self.entries.get(key)
    }

    pub fn current_interval(&self, key: &str) -> Option<Duration> {
        self.entries.get(key).map(ScheduleEntry::current_interval)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of non-empty buckets
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Drop every entry and bucket
    pub fn clear(&mut self) {
        self.entries.clear();
        self.buckets.clear();
    }

    fn entry_mut(&mut self, key: &str) -> Result<&mut ScheduleEntry<D>, SchedulerError> {
        self.entries
            .get_mut(key)
            .ok_or_else(|| SchedulerError::UnknownKey(key.to_string()))
    }

    fn remove_from_bucket(&mut self, trigger: i64, key: &str) {
        if let Some(bucket) = self.buckets.get_mut(&trigger) {
            bucket.retain(|k| k != key);
            if bucket.is_empty() {
                self.buckets.remove(&trigger);
            }
        }
    }
}

/// Unix second in which `from + interval` falls
fn trigger_second(from: DateTime<Utc>, interval: Duration) -> i64 {
    let interval_ms = i64::try_from(interval.as_millis()).unwrap_or(i64::MAX);
    from.timestamp_millis()
        .saturating_add(interval_ms)
        .div_euclid(1000)
}
