//! Receivers discover work and hand each item to an `ItemHandler`
//!
//! Polling receivers are driven by the interval scheduler (`scheduled`,
//! `pickup`) or by a fixed polling interval (`batch`); the HTTP receiver is
//! driven by a bounded accept loop (`http`).

pub mod batch;
pub mod http;
pub mod pickup;
pub mod scheduled;

pub use batch::{BatchDispatcher, BatchReceiver, BatchSource};
pub use http::HttpReceiver;
pub use pickup::DirectoryPollTarget;
pub use scheduled::{PollTarget, ScheduledReceiver};

use crate::error::{ReceiverError, StepFault};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A raw unit of work as discovered by a receiver
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedItem {
    /// Receiver (or poll target) the item came from
    pub source: String,
    pub message_id: Option<String>,
    pub body: Bytes,
    pub properties: HashMap<String, String>,
    pub received_at: DateTime<Utc>,
}

impl ReceivedItem {
    pub fn new<S: Into<String>, B: Into<Bytes>>(source: S, body: B) -> Self {
        Self {
            source: source.into(),
            message_id: None,
            body: body.into(),
            properties: HashMap::new(),
            received_at: Utc::now(),
        }
    }

    pub fn with_message_id<S: Into<String>>(mut self, id: S) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_property<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Callback a receiver invokes once per discovered item
#[async_trait]
pub trait ItemHandler<I>: Send + Sync {
    async fn handle_item(&self, item: I) -> Result<(), StepFault>;
}

/// Source of work items
///
/// `start_receiving` launches the receiver in the background and returns;
/// the receiver runs until `cancel` fires or `stop_receiving` is called.
#[async_trait]
pub trait Receiver: Send {
    fn name(&self) -> &str;

    /// Apply opaque string settings; parsing is the receiver's concern
    fn configure(&mut self, settings: &HashMap<String, String>) -> Result<(), ReceiverError>;

    async fn start_receiving(
        &mut self,
        handler: Arc<dyn ItemHandler<ReceivedItem>>,
        cancel: CancellationToken,
    ) -> Result<(), ReceiverError>;

    /// Cancel the receiver and wait for its in-flight work to finish
    async fn stop_receiving(&mut self) -> Result<(), ReceiverError>;

    fn is_running(&self) -> bool;
}

/// Background task owned by a receiver between start and stop
#[derive(Debug, Default)]
pub(crate) struct ReceiverTask {
    running: Option<(CancellationToken, JoinHandle<()>)>,
}

impl ReceiverTask {
    pub(crate) fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .map(|(_, handle)| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Spawn `run` with a child of `parent`; fails if already running
    pub(crate) fn start<F, Fut>(
        &mut self,
        name: &str,
        parent: &CancellationToken,
        run: F,
    ) -> Result<(), ReceiverError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_running() {
            return Err(ReceiverError::AlreadyRunning);
        }
        let token = parent.child_token();
        let handle = tokio::spawn(run(token.clone()));
        info!(receiver = %name, "Receiver started");
        self.running = Some((token, handle));
        Ok(())
    }

    pub(crate) async fn stop(&mut self, name: &str) {
        if let Some((token, handle)) = self.running.take() {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(receiver = %name, error = %e, "Receiver task ended abnormally");
            }
            info!(receiver = %name, "Receiver stopped");
        }
    }
}

/// Parse one optional setting, keeping `current` when absent
pub(crate) fn parse_setting<T>(
    settings: &HashMap<String, String>,
    key: &str,
    current: T,
) -> Result<T, ReceiverError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match settings.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ReceiverError::invalid_setting(key, e.to_string())),
        None => Ok(current),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_setting() {
        let settings = HashMap::from([
            ("count".to_string(), " 4 ".to_string()),
            ("bad".to_string(), "four".to_string()),
        ]);

        assert_eq!(parse_setting(&settings, "count", 1u32).unwrap(), 4);
        assert_eq!(parse_setting(&settings, "missing", 7u32).unwrap(), 7);
        assert!(matches!(
            parse_setting(&settings, "bad", 1u32),
            Err(ReceiverError::InvalidSetting { .. })
        ));
    }

    #[tokio::test]
    async fn test_receiver_task_rejects_double_start() {
        let parent = CancellationToken::new();
        let mut task = ReceiverTask::default();

        task.start("test", &parent, |token| async move { token.cancelled().await })
            .unwrap();
        assert!(task.is_running());
        assert!(matches!(
            task.start("test", &parent, |_| async {}),
            Err(ReceiverError::AlreadyRunning)
        ));

        task.stop("test").await;
        assert!(!task.is_running());
    }
}
