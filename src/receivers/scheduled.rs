//! Polling receiver driven by the interval scheduler
//!
//! One scheduling loop per receiver. Every fire drains the due targets, polls
//! each of them on its own task, joins them all, and only then settles the
//! backoff and re-arms. A target is therefore never polled twice at once.

use super::{parse_setting, ItemHandler, ReceivedItem, Receiver, ReceiverTask};
use crate::error::{ReceiverError, SchedulerError};
use crate::observability::metrics::metrics;
use crate::scheduler::{DueEntry, IntervalScheduler};
use crate::{poll_span, receiver_span};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// A named source that can be polled for items
#[async_trait]
pub trait PollTarget: Send + Sync + 'static {
    /// Stable scheduling key
    fn key(&self) -> &str;

    /// Claim whatever is available right now
    async fn poll(&self) -> Result<Vec<ReceivedItem>, ReceiverError>;

    /// Settle one polled item after the handler ran; `processed` is false
    /// when the handler faulted
    async fn finish_item(&self, _item: &ReceivedItem, _processed: bool) {}

    /// Give back claimed but unprocessed items when the receiver stops
    fn release_pending(&self) {}
}

type Target = Box<dyn PollTarget>;
type SharedScheduler = Arc<Mutex<IntervalScheduler<Target>>>;

struct Registration {
    target: Target,
    min_interval: Option<Duration>,
    max_interval: Option<Duration>,
}

/// `Receiver` polling many targets, each on its own backoff schedule
pub struct ScheduledReceiver {
    name: String,
    pending: Vec<Registration>,
    min_interval: Duration,
    max_interval: Duration,
    idle_wait: Duration,
    scheduler: SharedScheduler,
    task: ReceiverTask,
}

impl ScheduledReceiver {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            pending: Vec::new(),
            min_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(300),
            idle_wait: Duration::from_millis(1000),
            scheduler: Arc::new(Mutex::new(IntervalScheduler::new())),
            task: ReceiverTask::default(),
        }
    }

    /// Add a target using the receiver-wide bounds
    pub fn add_target<T: PollTarget>(&mut self, target: T) {
        self.pending.push(Registration {
            target: Box::new(target),
            min_interval: None,
            max_interval: None,
        });
    }

    /// Add a target with its own bounds; `None` falls back to the receiver's
    pub fn add_target_with_bounds<T: PollTarget>(
        &mut self,
        target: T,
        min_interval: Option<Duration>,
        max_interval: Option<Duration>,
    ) {
        self.pending.push(Registration {
            target: Box::new(target),
            min_interval,
            max_interval,
        });
    }

    pub fn target_count(&self) -> usize {
        self.pending.len()
    }

    /// Current backoff interval of a running target
    pub async fn current_interval(&self, key: &str) -> Option<Duration> {
        self.scheduler.lock().await.current_interval(key)
    }

    pub fn bounds(&self) -> (Duration, Duration) {
        (self.min_interval, self.max_interval)
    }

    /// Move pending targets into the scheduler, all due immediately
    ///
    /// Keys are checked up front; on a duplicate nothing is registered and
    /// every target stays pending.
    async fn register_targets(&mut self) -> Result<(), ReceiverError> {
        let mut scheduler = self.scheduler.lock().await;
        let mut keys = HashSet::new();
        for registration in &self.pending {
            let key = registration.target.key();
            if scheduler.entry(key).is_some() || !keys.insert(key) {
                return Err(SchedulerError::DuplicateKey(key.to_string()).into());
            }
        }

        let now = Utc::now();

        for registration in self.pending.drain(..) {
            let key = registration.target.key().to_string();
            let min = registration.min_interval.unwrap_or(self.min_interval);
            let max = registration.max_interval.unwrap_or(self.max_interval);
            scheduler.register(key.clone(), min, max, registration.target)?;

            let interval = scheduler.current_interval(&key).unwrap_or(min);
            let from = now - chrono::Duration::milliseconds(interval.as_millis() as i64);
            scheduler.schedule_next(&key, from)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Receiver for ScheduledReceiver {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, settings: &HashMap<String, String>) -> Result<(), ReceiverError> {
        let min_secs = parse_setting(settings, "min_interval_secs", self.min_interval.as_secs_f64())?;
        let max_secs = parse_setting(settings, "max_interval_secs", self.max_interval.as_secs_f64())?;
        let idle_ms = parse_setting(settings, "idle_wait_ms", self.idle_wait.as_millis() as u64)?;

        for (key, value) in [("min_interval_secs", min_secs), ("max_interval_secs", max_secs)] {
            if !value.is_finite() || value < 0.0 {
                return Err(ReceiverError::invalid_setting(
                    key,
                    "must be a non-negative number of seconds",
                ));
            }
        }

        self.min_interval = Duration::from_secs_f64(min_secs);
        self.max_interval = Duration::from_secs_f64(max_secs);
        self.idle_wait = Duration::from_millis(idle_ms.max(1));
        Ok(())
    }

    async fn start_receiving(
        &mut self,
        handler: Arc<dyn ItemHandler<ReceivedItem>>,
        cancel: CancellationToken,
    ) -> Result<(), ReceiverError> {
        if self.task.is_running() {
            return Err(ReceiverError::AlreadyRunning);
        }
        self.register_targets().await?;

        let scheduler = self.scheduler.clone();
        let idle_wait = self.idle_wait;
        let span = receiver_span!(receiver = %self.name, kind = "scheduled");
        self.task.start(&self.name, &cancel, move |token| {
            run_schedule(scheduler, handler, idle_wait, token).instrument(span)
        })
    }

    async fn stop_receiving(&mut self) -> Result<(), ReceiverError> {
        self.task.stop(&self.name).await;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.task.is_running()
    }
}

async fn run_schedule(
    scheduler: SharedScheduler,
    handler: Arc<dyn ItemHandler<ReceivedItem>>,
    idle_wait: Duration,
    cancel: CancellationToken,
) {
    loop {
        let delay = scheduler
            .lock()
            .await
            .next_wake_delay(Utc::now())
            .unwrap_or(idle_wait);

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        let due = scheduler.lock().await.drain_due(Utc::now());
        if due.is_empty() {
            continue;
        }

        let results = poll_all(due, &handler).await;

        let mut guard = scheduler.lock().await;
        let now = Utc::now();
        for (key, productive) in results {
            if let Err(e) = guard.settle(&key, productive) {
                debug!(key = %key, error = %e, "Target gone before settling");
                continue;
            }
            if let Err(e) = guard.schedule_next(&key, now) {
                warn!(key = %key, error = %e, "Failed to re-arm target");
            }
        }
    }

    let mut guard = scheduler.lock().await;
    let keys: Vec<String> = guard.keys().map(str::to_string).collect();
    for key in &keys {
        if let Some(entry) = guard.entry(key) {
            entry.descriptor().release_pending();
        }
    }
    guard.clear();
    info!(targets = keys.len(), "Scheduling loop stopped");
}

/// Poll every due target concurrently and wait for all of them
async fn poll_all(
    due: Vec<DueEntry<Target>>,
    handler: &Arc<dyn ItemHandler<ReceivedItem>>,
) -> Vec<(String, bool)> {
    let mut polls = Vec::with_capacity(due.len());
    for entry in due {
        let span = poll_span!(
            key = %entry.key,
            interval_ms = entry.interval.as_millis() as u64,
            attempt = entry.attempt_count
        );
        let handler = handler.clone();
        let target = entry.descriptor;
        let handle = tokio::spawn(async move { poll_once(target.as_ref(), &handler).await }.instrument(span));
        polls.push((entry.key, handle));
    }

    let mut results = Vec::with_capacity(polls.len());
    for (key, handle) in polls {
        let productive = match handle.await {
            Ok(productive) => productive,
            Err(e) => {
                warn!(key = %key, error = %e, "Poll task aborted");
                false
            }
        };
        results.push((key, productive));
    }
    results
}

/// One poll; productive when it yielded at least one item
async fn poll_once(target: &Target, handler: &Arc<dyn ItemHandler<ReceivedItem>>) -> bool {
    let items = match target.poll().await {
        Ok(items) => items,
        Err(e) => {
            metrics().poll_failed();
            warn!(error = %e, "Poll failed");
            return false;
        }
    };

    if items.is_empty() {
        metrics().poll_empty();
        debug!("Poll returned nothing");
        return false;
    }

    metrics().poll_productive();
    debug!(count = items.len(), "Poll returned items");
    for item in items {
        let result = handler.handle_item(item.clone()).await;
        if let Err(fault) = &result {
            warn!(source = %item.source, fault = %fault, "Item handler reported fault");
        }
        target.finish_item(&item, result.is_ok()).await;
    }
    true
}
