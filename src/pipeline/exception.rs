//! Exception decorator
//!
//! Wraps a pipeline node so that a fault raised inside it is recorded once
//! against the item's correlation id and converted into a stopping outcome.
//! Nothing raised by the inner node escapes the decorator.

use super::composite::Pipeline;
use super::context::{ProcessingContext, ResultDescriptor};
use super::step::{StepOutcome, StepResult};
use crate::error::{StepFault, StoreError};
use crate::observability::metrics::metrics;
use crate::persistence::{ExceptionDisposition, ExceptionRecord, ExceptionStore, ExceptionTarget};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;
use tracing::{error, warn};

/// Correlation id recorded when the context carries none
pub const UNKNOWN_CORRELATION_ID: &str = "unknown";

/// Which correlation id and which store an exception goes to
#[async_trait]
pub trait ExceptionStrategy: Send + Sync {
    fn target(&self) -> ExceptionTarget;

    fn correlation_id(&self, context: &ProcessingContext) -> Option<String>;

    async fn record(&self, record: ExceptionRecord) -> Result<(), StoreError>;
}

/// Records against the inbound (received) message
pub struct InboundExceptionStrategy {
    store: Arc<dyn ExceptionStore>,
}

impl InboundExceptionStrategy {
    pub fn new(store: Arc<dyn ExceptionStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ExceptionStrategy for InboundExceptionStrategy {
    fn target(&self) -> ExceptionTarget {
        ExceptionTarget::Inbound
    }

    fn correlation_id(&self, context: &ProcessingContext) -> Option<String> {
        context.received_message_id.clone()
    }

    async fn record(&self, record: ExceptionRecord) -> Result<(), StoreError> {
        self.store.record_exception(record).await
    }
}

/// Records against the outbound (sending) message
pub struct OutboundExceptionStrategy {
    store: Arc<dyn ExceptionStore>,
}

impl OutboundExceptionStrategy {
    pub fn new(store: Arc<dyn ExceptionStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ExceptionStrategy for OutboundExceptionStrategy {
    fn target(&self) -> ExceptionTarget {
        ExceptionTarget::Outbound
    }

    fn correlation_id(&self, context: &ProcessingContext) -> Option<String> {
        context.sending_message_id.clone()
    }

    async fn record(&self, record: ExceptionRecord) -> Result<(), StoreError> {
        self.store.record_exception(record).await
    }
}

/// A pipeline node guarded by an exception strategy
#[derive(Clone)]
pub struct ExceptionDecorator {
    inner: Box<Pipeline>,
    strategy: Arc<dyn ExceptionStrategy>,
}

impl std::fmt::Debug for ExceptionDecorator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExceptionDecorator")
            .field("inner", &self.inner)
            .field("target", &self.strategy.target())
            .finish()
    }
}

impl ExceptionDecorator {
    pub fn new(inner: Pipeline, strategy: Arc<dyn ExceptionStrategy>) -> Self {
        Self {
            inner: Box::new(inner),
            strategy,
        }
    }

    pub fn inner(&self) -> &Pipeline {
        &self.inner
    }

    /// Run the inner node; a fault becomes a recorded, stopping outcome
    pub fn execute(&self, context: ProcessingContext) -> BoxFuture<'_, StepResult> {
        async move {
            let snapshot = context.clone();
            match self.inner.execute(context).await {
                Ok(outcome) => Ok(outcome),
                Err(fault) => Ok(self.absorb(snapshot, fault).await),
            }
        }
        .boxed()
    }

    async fn absorb(&self, mut context: ProcessingContext, fault: StepFault) -> StepOutcome {
        let target = self.strategy.target();
        let source = self.inner.label();
        let correlation_id = self.strategy.correlation_id(&context).unwrap_or_else(|| {
            warn!(
                exception_target = ?target,
                source = %source,
                "Context has no correlation id for exception record"
            );
            UNKNOWN_CORRELATION_ID.to_string()
        });
        let disposition = ExceptionDisposition::from_notify_flag(context.notify_on_exception());

        warn!(
            correlation_id = %correlation_id,
            source = %source,
            fault = %fault,
            disposition = ?disposition,
            "Step fault absorbed by exception decorator"
        );

        let record = ExceptionRecord::from_fault(
            target,
            correlation_id.clone(),
            source.clone(),
            &fault,
            disposition,
        );
        match self.strategy.record(record).await {
            Ok(()) => metrics().exception_recorded(),
            Err(e) => error!(
                correlation_id = %correlation_id,
                error = %e,
                "Failed to persist exception record"
            ),
        }

        let descriptor = ResultDescriptor::from_fault(&fault).with_step(source);
        context.set_result(descriptor.clone());
        StepOutcome {
            context,
            succeeded: false,
            can_proceed: false,
            fault: Some(descriptor),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::composite::PipelineBuilder;
    use crate::pipeline::context::NOTIFY_ON_EXCEPTION;
    use crate::persistence::InMemoryExceptionStore;
    use crate::testing::mocks::{FailingStep, RejectingExceptionStore, SpyStep};
    use serde_json::json;

    fn inbound_context() -> ProcessingContext {
        ProcessingContext::new("receive", json!({})).with_received_message_id("in-42")
    }

    #[tokio::test]
    async fn test_fault_is_absorbed_and_recorded_once() {
        let store = Arc::new(InMemoryExceptionStore::new());
        let strategy: Arc<dyn ExceptionStrategy> =
            Arc::new(InboundExceptionStrategy::new(store.clone()));
        let guarded = Pipeline::guarded(Pipeline::step(FailingStep::new("verify")), strategy);

        let outcome = guarded.execute(inbound_context()).await.unwrap();

        assert!(!outcome.can_proceed);
        assert!(!outcome.succeeded);
        let fault = outcome.fault.expect("fault descriptor");
        assert_eq!(fault.step.as_deref(), Some("verify"));
        assert_eq!(outcome.context.result, Some(fault));

        let records = store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].correlation_id, "in-42");
        assert_eq!(records[0].target, ExceptionTarget::Inbound);
        assert_eq!(records[0].disposition, ExceptionDisposition::NoFollowUp);
    }

    #[tokio::test]
    async fn test_successful_inner_passes_through() {
        let store = Arc::new(InMemoryExceptionStore::new());
        let strategy: Arc<dyn ExceptionStrategy> =
            Arc::new(InboundExceptionStrategy::new(store.clone()));
        let guarded = Pipeline::guarded(Pipeline::step(SpyStep::proceeding("ok")), strategy);

        let outcome = guarded.execute(inbound_context()).await.unwrap();

        assert!(outcome.succeeded && outcome.can_proceed);
        assert!(store.records().is_empty());
    }

    #[tokio::test]
    async fn test_outbound_strategy_uses_sending_id_and_notify_flag() {
        let store = Arc::new(InMemoryExceptionStore::new());
        let strategy: Arc<dyn ExceptionStrategy> =
            Arc::new(OutboundExceptionStrategy::new(store.clone()));
        let guarded = Pipeline::guarded(Pipeline::step(FailingStep::new("send")), strategy);
        let context = ProcessingContext::new("send", json!({}))
            .with_received_message_id("in-1")
            .with_sending_message_id("out-1")
            .with_property(NOTIFY_ON_EXCEPTION, "true");

        guarded.execute(context).await.unwrap();

        let records = store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].correlation_id, "out-1");
        assert_eq!(records[0].target, ExceptionTarget::Outbound);
        assert_eq!(records[0].disposition, ExceptionDisposition::NotifyPartner);
    }

    #[tokio::test]
    async fn test_missing_correlation_id_uses_placeholder() {
        let store = Arc::new(InMemoryExceptionStore::new());
        let strategy: Arc<dyn ExceptionStrategy> =
            Arc::new(OutboundExceptionStrategy::new(store.clone()));
        let guarded = Pipeline::guarded(Pipeline::step(FailingStep::new("send")), strategy);

        guarded
            .execute(ProcessingContext::new("send", json!({})))
            .await
            .unwrap();

        assert_eq!(store.records()[0].correlation_id, UNKNOWN_CORRELATION_ID);
    }

    #[tokio::test]
    async fn test_store_failure_does_not_escape() {
        let strategy: Arc<dyn ExceptionStrategy> =
            Arc::new(InboundExceptionStrategy::new(Arc::new(RejectingExceptionStore)));
        let guarded = Pipeline::guarded(Pipeline::step(FailingStep::new("verify")), strategy);

        let outcome = guarded.execute(inbound_context()).await;

        assert!(outcome.is_ok());
        assert!(!outcome.unwrap().can_proceed);
    }

    #[tokio::test]
    async fn test_guarded_step_stops_enclosing_sequence() {
        let store = Arc::new(InMemoryExceptionStore::new());
        let strategy: Arc<dyn ExceptionStrategy> =
            Arc::new(InboundExceptionStrategy::new(store.clone()));
        let after = SpyStep::proceeding("after");
        let pipeline = PipelineBuilder::new()
            .guarded_step(FailingStep::new("decrypt"), strategy)
            .step(after.clone())
            .build();

        let outcome = pipeline.execute(inbound_context()).await.unwrap();

        assert!(!outcome.can_proceed);
        assert_eq!(after.calls(), 0);
        assert_eq!(store.records().len(), 1);
    }
}
