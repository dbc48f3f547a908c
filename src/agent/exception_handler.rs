//! Handlers for faults that escape an agent run

use crate::error::StepFault;
use crate::persistence::{ExceptionDisposition, ExceptionRecord, ExceptionStore, ExceptionTarget};
use crate::pipeline::exception::UNKNOWN_CORRELATION_ID;
use crate::pipeline::ProcessingContext;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info};

/// Phase of an agent run in which a fault escaped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultPhase {
    Transform,
    Normal,
    Error,
}

impl FaultPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultPhase::Transform => "transform",
            FaultPhase::Normal => "normal_pipeline",
            FaultPhase::Error => "error_pipeline",
        }
    }
}

impl fmt::Display for FaultPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives faults an agent could not handle itself
///
/// `context` is the last context known before the fault; it is `None` for
/// transform faults.
#[async_trait]
pub trait AgentExceptionHandler: Send + Sync {
    async fn handle_fault(
        &self,
        agent: &str,
        phase: FaultPhase,
        fault: &StepFault,
        context: Option<&ProcessingContext>,
    );
}

/// Logs delegated faults and nothing else
#[derive(Debug, Default, Clone)]
pub struct LoggingExceptionHandler;

#[async_trait]
impl AgentExceptionHandler for LoggingExceptionHandler {
    async fn handle_fault(
        &self,
        agent: &str,
        phase: FaultPhase,
        fault: &StepFault,
        context: Option<&ProcessingContext>,
    ) {
        error!(
            agent = %agent,
            phase = %phase,
            correlation_id = context.and_then(|c| c.correlation_id()).unwrap_or("-"),
            fault = %fault,
            "Unhandled fault delegated"
        );
    }
}

/// Persists delegated faults and marks the item for retry
pub struct StoreExceptionHandler {
    store: Arc<dyn ExceptionStore>,
}

impl StoreExceptionHandler {
    pub fn new(store: Arc<dyn ExceptionStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AgentExceptionHandler for StoreExceptionHandler {
    async fn handle_fault(
        &self,
        agent: &str,
        phase: FaultPhase,
        fault: &StepFault,
        context: Option<&ProcessingContext>,
    ) {
        let target = match context {
            Some(ctx) if ctx.received_message_id.is_none() && ctx.sending_message_id.is_some() => {
                ExceptionTarget::Outbound
            }
            _ => ExceptionTarget::Inbound,
        };
        let correlation_id = context.and_then(|c| c.correlation_id());
        let disposition = ExceptionDisposition::from_notify_flag(
            context.map(|c| c.notify_on_exception()).unwrap_or(false),
        );

        let record = ExceptionRecord::from_fault(
            target,
            correlation_id.unwrap_or(UNKNOWN_CORRELATION_ID),
            format!("{agent}:{phase}"),
            fault,
            disposition,
        );
        if let Err(e) = self.store.record_exception(record).await {
            error!(agent = %agent, phase = %phase, error = %e, "Failed to record delegated fault");
        }

        if let Some(id) = correlation_id {
            match self.store.mark_for_retry(id).await {
                Ok(()) => info!(agent = %agent, correlation_id = %id, "Item marked for retry"),
                Err(e) => error!(
                    agent = %agent,
                    correlation_id = %id,
                    error = %e,
                    "Failed to mark item for retry"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryExceptionStore;
    use serde_json::Value;

    #[test]
    fn test_phase_labels() {
        assert_eq!(FaultPhase::Transform.to_string(), "transform");
        assert_eq!(FaultPhase::Normal.to_string(), "normal_pipeline");
        assert_eq!(FaultPhase::Error.as_str(), "error_pipeline");
    }

    #[tokio::test]
    async fn test_store_handler_records_and_marks_retry() {
        let store = Arc::new(InMemoryExceptionStore::new());
        let handler = StoreExceptionHandler::new(store.clone());
        let context = ProcessingContext::new("send", Value::Null).with_sending_message_id("out-9");

        handler
            .handle_fault(
                "send-agent",
                FaultPhase::Normal,
                &StepFault::step_failed("deliver", "timeout"),
                Some(&context),
            )
            .await;

        let records = store.records_for("out-9");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].target, ExceptionTarget::Outbound);
        assert_eq!(records[0].source, "send-agent:normal_pipeline");
        assert!(store.is_marked_for_retry("out-9"));
    }

    #[tokio::test]
    async fn test_store_handler_without_context_skips_retry() {
        let store = Arc::new(InMemoryExceptionStore::new());
        let handler = StoreExceptionHandler::new(store.clone());

        handler
            .handle_fault(
                "receive-agent",
                FaultPhase::Transform,
                &StepFault::transform_failed("empty body"),
                None,
            )
            .await;

        let records = store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].correlation_id, UNKNOWN_CORRELATION_ID);
        assert!(store.take_retries().is_empty());
    }
}
