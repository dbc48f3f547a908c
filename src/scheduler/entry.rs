//! Per-target schedule state and the backoff arithmetic
//!
//! Backoff is kept as pure functions over `(min, max, attempt)` so it can be
//! checked without a scheduler around it.

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Multiplier applied per unproductive poll
pub const GROWTH_FACTOR: f64 = 1.75;

/// Floor for any configured interval
pub const MIN_INTERVAL_FLOOR: Duration = Duration::from_secs(1);

/// Where an entry sits in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Registered or settled, not in any bucket
    Idle,
    /// Waiting in the bucket for this Unix second
    Scheduled(i64),
    /// Returned by a drain, waiting to be settled
    Due,
}

/// One independently scheduled polling target
#[derive(Debug)]
pub struct ScheduleEntry<D> {
    key: String,
    min_interval: Duration,
    max_interval: Duration,
    current_interval: Duration,
    attempt_count: u32,
    descriptor: Arc<D>,
    pub(crate) state: EntryState,
}

impl<D> ScheduleEntry<D> {
    /// Create an entry with clamped bounds
    pub fn new(key: String, min_interval: Duration, max_interval: Duration, descriptor: D) -> Self {
        let (min_interval, max_interval) = clamp_bounds(&key, min_interval, max_interval);
        Self {
            key,
            min_interval,
            max_interval,
            current_interval: min_interval,
            attempt_count: 0,
            descriptor: Arc::new(descriptor),
            state: EntryState::Idle,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn max_interval(&self) -> Duration {
        self.max_interval
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn descriptor(&self) -> &Arc<D> {
        &self.descriptor
    }

    pub fn state(&self) -> EntryState {
        self.state
    }

    /// Lengthen the interval by one backoff step
    pub fn grow(&mut self) {
        let (interval, attempts) = next_backoff(
            self.min_interval,
            self.max_interval,
            self.attempt_count,
        );
        self.current_interval = interval;
        self.attempt_count = attempts;
    }

    /// Return to the minimum interval
    pub fn reset(&mut self) {
        self.attempt_count = 0;
        self.current_interval = self.min_interval;
    }
}

/// Apply the interval floor and order the bounds
pub(crate) fn clamp_bounds(key: &str, min: Duration, max: Duration) -> (Duration, Duration) {
    let clamped_min = min.max(MIN_INTERVAL_FLOOR);
    if clamped_min != min {
        warn!(
            key = %key,
            configured_ms = min.as_millis() as u64,
            "Minimum interval below 1s floor, clamping"
        );
    }

    let clamped_max = max.max(clamped_min);
    if clamped_max != max {
        warn!(
            key = %key,
            configured_ms = max.as_millis() as u64,
            min_ms = clamped_min.as_millis() as u64,
            "Maximum interval below minimum, raising to minimum"
        );
    }

    (clamped_min, clamped_max)
}

/// Compute the interval and attempt count after one growth step
///
/// `min × 1.75^(attempt + 1)`, clamped to `max`. Once clamped the attempt
/// count stops increasing.
pub fn next_backoff(min: Duration, max: Duration, attempt_count: u32) -> (Duration, u32) {
    let next_attempt = attempt_count.saturating_add(1);
    let exponent = i32::try_from(next_attempt).unwrap_or(i32::MAX);
    let next_secs = min.as_secs_f64() * GROWTH_FACTOR.powi(exponent);

    if !next_secs.is_finite() || next_secs >= max.as_secs_f64() {
        (max, attempt_count)
    } else {
        (Duration::from_secs_f64(next_secs), next_attempt)
    }
}
