//! Agent run state machine
//!
//! One run per received item: transform, normal pipeline, and at most one
//! error pipeline. Faults that escape any phase go to the exception handler
//! tagged with that phase.

use super::exception_handler::{AgentExceptionHandler, FaultPhase, LoggingExceptionHandler};
use super::transformer::Transformer;
use crate::agent_span;
use crate::error::StepFault;
use crate::observability::metrics::metrics;
use crate::pipeline::{Pipeline, ProcessingContext, ResultDescriptor, StepOutcome};
use crate::receivers::ItemHandler;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn, Instrument};

/// How one agent run ended
#[derive(Debug, Clone, PartialEq)]
pub enum AgentRunOutcome {
    /// Normal pipeline succeeded
    Completed(ProcessingContext),
    /// Normal pipeline failed and the error pipeline succeeded
    Recovered(ProcessingContext),
    /// Both the normal and the error pipeline reported failure
    Failed(ProcessingContext),
    /// A fault escaped and was handed to the exception handler
    Delegated(FaultPhase),
}

impl AgentRunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            AgentRunOutcome::Completed(_) => "completed",
            AgentRunOutcome::Recovered(_) => "recovered",
            AgentRunOutcome::Failed(_) => "failed",
            AgentRunOutcome::Delegated(_) => "delegated",
        }
    }

    /// Final context, when the run produced one
    pub fn context(&self) -> Option<&ProcessingContext> {
        match self {
            AgentRunOutcome::Completed(ctx)
            | AgentRunOutcome::Recovered(ctx)
            | AgentRunOutcome::Failed(ctx) => Some(ctx),
            AgentRunOutcome::Delegated(_) => None,
        }
    }
}

/// Drives items of type `R` through a normal and an error pipeline
pub struct Agent<R> {
    name: String,
    transformer: Arc<dyn Transformer<R>>,
    normal_pipeline: Pipeline,
    error_pipeline: Pipeline,
    exception_handler: Arc<dyn AgentExceptionHandler>,
}

impl<R: Send + 'static> Agent<R> {
    /// Agent with empty pipelines that logs delegated faults
    pub fn new<S: Into<String>>(name: S, transformer: Arc<dyn Transformer<R>>) -> Self {
        Self {
            name: name.into(),
            transformer,
            normal_pipeline: Pipeline::empty(),
            error_pipeline: Pipeline::empty(),
            exception_handler: Arc::new(LoggingExceptionHandler),
        }
    }

    pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.normal_pipeline = pipeline;
        self
    }

    pub fn with_error_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.error_pipeline = pipeline;
        self
    }

    pub fn with_exception_handler(mut self, handler: Arc<dyn AgentExceptionHandler>) -> Self {
        self.exception_handler = handler;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Process one item to completion
    pub async fn run(&self, item: R) -> AgentRunOutcome {
        let span = agent_span!(agent = %self.name);
        async move {
            let started = Instant::now();
            metrics().item_received();

            let outcome = self.run_phases(item).await;

            metrics().record_processing_time(started.elapsed());
            match &outcome {
                AgentRunOutcome::Completed(_) => metrics().item_completed(),
                AgentRunOutcome::Recovered(_) => metrics().item_recovered(),
                AgentRunOutcome::Failed(_) => metrics().item_failed(),
                AgentRunOutcome::Delegated(_) => metrics().item_delegated(),
            }
            info!(
                outcome = outcome.label(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Agent run finished"
            );
            outcome
        }
        .instrument(span)
        .await
    }

    async fn run_phases(&self, item: R) -> AgentRunOutcome {
        let context = match self.transformer.transform(item).await {
            Ok(context) => context,
            Err(fault) => return self.delegate(FaultPhase::Transform, fault, None).await,
        };
        debug!(
            pipeline = %context.pipeline,
            correlation_id = context.correlation_id().unwrap_or("-"),
            "Item transformed"
        );

        let snapshot = context.clone();
        let outcome = match self.normal_pipeline.execute(context).await {
            Ok(outcome) => outcome,
            Err(fault) => {
                return self
                    .delegate(FaultPhase::Normal, fault, Some(&snapshot))
                    .await
            }
        };

        if outcome.succeeded {
            return AgentRunOutcome::Completed(outcome.context);
        }

        let failed = failure_context(outcome);
        warn!(
            correlation_id = failed.correlation_id().unwrap_or("-"),
            code = failed.result.as_ref().map(|r| r.code.as_str()).unwrap_or("-"),
            "Normal pipeline failed, running error pipeline"
        );

        let snapshot = failed.clone();
        match self.error_pipeline.execute(failed).await {
            Ok(recovery) if recovery.succeeded => AgentRunOutcome::Recovered(recovery.context),
            Ok(recovery) => AgentRunOutcome::Failed(recovery.context),
            Err(fault) => {
                self.delegate(FaultPhase::Error, fault, Some(&snapshot))
                    .await
            }
        }
    }

    async fn delegate(
        &self,
        phase: FaultPhase,
        fault: StepFault,
        context: Option<&ProcessingContext>,
    ) -> AgentRunOutcome {
        warn!(phase = %phase, fault = %fault, "Delegating unhandled fault");
        self.exception_handler
            .handle_fault(&self.name, phase, &fault, context)
            .await;
        AgentRunOutcome::Delegated(phase)
    }
}

/// Context handed to the error pipeline, always carrying a result descriptor
fn failure_context(outcome: StepOutcome) -> ProcessingContext {
    let StepOutcome {
        mut context, fault, ..
    } = outcome;
    if context.result.is_none() {
        let descriptor = fault.unwrap_or_else(|| {
            ResultDescriptor::new("pipeline_failed", "normal pipeline reported failure")
        });
        context.set_result(descriptor);
    }
    context
}

#[async_trait]
impl<R: Send + 'static> ItemHandler<R> for Agent<R> {
    async fn handle_item(&self, item: R) -> Result<(), StepFault> {
        match self.run(item).await {
            AgentRunOutcome::Delegated(phase) => Err(StepFault::internal_error(format!(
                "agent '{}' delegated a fault from the {} phase",
                self.name, phase
            ))),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::transformer::ReceivedItemTransformer;
    use crate::pipeline::PipelineBuilder;
    use crate::receivers::ReceivedItem;
    use crate::testing::mocks::{FailingStep, RecordingExceptionHandler, SpyStep};

    fn agent() -> Agent<ReceivedItem> {
        Agent::new("receive-agent", Arc::new(ReceivedItemTransformer::new("receive")))
    }

    fn item() -> ReceivedItem {
        ReceivedItem::new("test", br#"{"k": 1}"#.to_vec()).with_message_id("m-1")
    }

    #[tokio::test]
    async fn test_empty_pipelines_complete_unchanged() {
        let outcome = agent().run(item()).await;

        match outcome {
            AgentRunOutcome::Completed(ctx) => {
                assert_eq!(ctx.received_message_id.as_deref(), Some("m-1"));
                assert!(ctx.result.is_none());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejection_fills_result_before_error_pipeline() {
        let recovery = SpyStep::proceeding("recover");
        let agent = agent()
            .with_pipeline(PipelineBuilder::new().step(SpyStep::unsuccessful("reject")).build())
            .with_error_pipeline(Pipeline::step(recovery.clone()));

        let outcome = agent.run(item()).await;

        assert_eq!(outcome.label(), "recovered");
        assert_eq!(recovery.calls(), 1);
        let result = outcome.context().and_then(|c| c.result.clone()).unwrap();
        assert_eq!(result.code, "pipeline_failed");
    }

    #[tokio::test]
    async fn test_transform_fault_is_delegated_without_context() {
        let handler = Arc::new(RecordingExceptionHandler::new());
        let agent = agent().with_exception_handler(handler.clone());

        let outcome = agent
            .run(ReceivedItem::new("test", Vec::new()))
            .await;

        assert_eq!(outcome, AgentRunOutcome::Delegated(FaultPhase::Transform));
        let calls = handler.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].phase, FaultPhase::Transform);
        assert!(calls[0].correlation_id.is_none());
    }

    #[tokio::test]
    async fn test_handle_item_maps_delegation_to_fault() {
        let agent = agent().with_pipeline(Pipeline::step(FailingStep::new("boom")));
        assert!(agent.handle_item(item()).await.is_err());

        let healthy = self::agent();
        assert!(healthy.handle_item(item()).await.is_ok());
    }
}
