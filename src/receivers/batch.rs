//! Spawn-and-join batch polling
//!
//! Each round enumerates due items, runs one task per item, and waits for
//! the whole batch before polling again. A fault in one task never reaches
//! its siblings or the loop; it goes to `BatchSource::on_item_fault`.

use super::scheduled::PollTarget;
use super::{parse_setting, ItemHandler, ReceivedItem, Receiver, ReceiverTask};
use crate::error::{ReceiverError, StepFault};
use crate::observability::metrics::metrics;
use crate::receiver_span;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// Default wait between empty polls
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_millis(1000);

/// What a batch dispatcher polls and how it handles one item
#[async_trait]
pub trait BatchSource: Send + Sync + 'static {
    type Item: Send + 'static;

    fn name(&self) -> &str;

    /// Enumerate currently due items; an empty vec is not an error
    async fn poll_due(&self) -> Result<Vec<Self::Item>, ReceiverError>;

    /// Stable label used in logs and fault routing
    fn item_key(&self, item: &Self::Item) -> String;

    async fn handle(&self, item: Self::Item) -> Result<(), StepFault>;

    /// Called exactly once for every item whose task faulted or panicked
    async fn on_item_fault(&self, item_key: &str, fault: StepFault);

    /// Return anything claimed but not processed; runs once when the loop ends
    fn release_pending(&self);
}

/// Poll tally of one dispatcher run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Polls that returned items
    pub rounds: u64,
    pub empty_polls: u64,
    pub failed_polls: u64,
}

/// Tally of one dispatched batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub completed: usize,
    pub faulted: usize,
}

struct ReleaseGuard<S: BatchSource> {
    source: Arc<S>,
}

impl<S: BatchSource> Drop for ReleaseGuard<S> {
    fn drop(&mut self) {
        debug!(source = %self.source.name(), "Releasing pending items");
        self.source.release_pending();
    }
}

/// Polling loop over a `BatchSource`
pub struct BatchDispatcher<S: BatchSource> {
    source: Arc<S>,
    polling_interval: Duration,
}

impl<S: BatchSource> BatchDispatcher<S> {
    pub fn new(source: Arc<S>, polling_interval: Duration) -> Self {
        Self {
            source,
            polling_interval,
        }
    }

    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    /// Poll and dispatch until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) -> RunSummary {
        let _release = ReleaseGuard {
            source: self.source.clone(),
        };
        let mut summary = RunSummary::default();

        loop {
            let polled = tokio::select! {
                _ = cancel.cancelled() => break,
                polled = self.source.poll_due() => polled,
            };

            let items = match polled {
                Ok(items) if items.is_empty() => {
                    metrics().poll_empty();
                    summary.empty_polls += 1;
                    None
                }
                Ok(items) => Some(items),
                Err(e) => {
                    metrics().poll_failed();
                    summary.failed_polls += 1;
                    warn!(source = %self.source.name(), error = %e, "Batch poll failed");
                    None
                }
            };

            match items {
                Some(items) => {
                    metrics().poll_productive();
                    summary.rounds += 1;
                    let report = self.dispatch(items).await;
                    debug!(
                        source = %self.source.name(),
                        round = summary.rounds,
                        completed = report.completed,
                        faulted = report.faulted,
                        "Batch finished"
                    );
                }
                None => tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.polling_interval) => {}
                },
            }
        }

        info!(
            source = %self.source.name(),
            rounds = summary.rounds,
            empty_polls = summary.empty_polls,
            failed_polls = summary.failed_polls,
            "Batch dispatcher stopped"
        );
        summary
    }

    /// Run one task per item and wait for all of them
    pub async fn dispatch(&self, items: Vec<S::Item>) -> BatchReport {
        let mut tasks = Vec::with_capacity(items.len());
        for item in items {
            let key = self.source.item_key(&item);
            let source = self.source.clone();
            let handle = tokio::spawn(async move { source.handle(item).await });
            tasks.push((key, handle));
        }

        let mut report = BatchReport::default();
        for (key, handle) in tasks {
            let fault = match handle.await {
                Ok(Ok(())) => None,
                Ok(Err(fault)) => Some(fault),
                Err(join_error) => Some(StepFault::task_aborted(format!(
                    "task for item '{key}' did not complete: {join_error}"
                ))),
            };

            match fault {
                None => report.completed += 1,
                Some(fault) => {
                    report.faulted += 1;
                    warn!(source = %self.source.name(), item = %key, fault = %fault, "Item task faulted");
                    self.source.on_item_fault(&key, fault).await;
                }
            }
        }
        report
    }
}

/// Adapts a poll target plus item handler into a batch source
struct HandlerSource<P: PollTarget> {
    target: Arc<P>,
    handler: Arc<dyn ItemHandler<ReceivedItem>>,
}

#[async_trait]
impl<P: PollTarget> BatchSource for HandlerSource<P> {
    type Item = ReceivedItem;

    fn name(&self) -> &str {
        self.target.key()
    }

    async fn poll_due(&self) -> Result<Vec<ReceivedItem>, ReceiverError> {
        self.target.poll().await
    }

    fn item_key(&self, item: &ReceivedItem) -> String {
        item.message_id
            .clone()
            .unwrap_or_else(|| format!("{}@{}", item.source, item.received_at.timestamp_millis()))
    }

    async fn handle(&self, item: ReceivedItem) -> Result<(), StepFault> {
        let result = self.handler.handle_item(item.clone()).await;
        self.target.finish_item(&item, result.is_ok()).await;
        result
    }

    async fn on_item_fault(&self, item_key: &str, fault: StepFault) {
        warn!(
            target_key = %self.target.key(),
            item = %item_key,
            fault = %fault.sanitized_message(),
            "Item left unprocessed"
        );
    }

    fn release_pending(&self) {
        self.target.release_pending();
    }
}

/// `Receiver` that polls one target at a fixed interval in batches
pub struct BatchReceiver<P: PollTarget> {
    name: String,
    target: Arc<P>,
    polling_interval: Duration,
    task: ReceiverTask,
}

impl<P: PollTarget> BatchReceiver<P> {
    pub fn new<S: Into<String>>(name: S, target: P) -> Self {
        Self {
            name: name.into(),
            target: Arc::new(target),
            polling_interval: DEFAULT_POLLING_INTERVAL,
            task: ReceiverTask::default(),
        }
    }

    pub fn polling_interval(&self) -> Duration {
        self.polling_interval
    }
}

#[async_trait]
impl<P: PollTarget> Receiver for BatchReceiver<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, settings: &HashMap<String, String>) -> Result<(), ReceiverError> {
        let millis = parse_setting(
            settings,
            "polling_interval_ms",
            self.polling_interval.as_millis() as u64,
        )?;
        if millis == 0 {
            return Err(ReceiverError::invalid_setting(
                "polling_interval_ms",
                "must be greater than zero",
            ));
        }
        self.polling_interval = Duration::from_millis(millis);
        Ok(())
    }

    async fn start_receiving(
        &mut self,
        handler: Arc<dyn ItemHandler<ReceivedItem>>,
        cancel: CancellationToken,
    ) -> Result<(), ReceiverError> {
        let dispatcher = BatchDispatcher::new(
            Arc::new(HandlerSource {
                target: self.target.clone(),
                handler,
            }),
            self.polling_interval,
        );
        let span = receiver_span!(receiver = %self.name, kind = "batch");
        self.task.start(&self.name, &cancel, move |token| {
            async move {
                dispatcher.run(token).await;
            }
            .instrument(span)
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
