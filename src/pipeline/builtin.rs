//! Built-in steps shared by every pipeline

use super::context::{ProcessingContext, ResultDescriptor};
use super::step::{Step, StepOutcome, StepResult};
use async_trait::async_trait;
use tracing::info;

/// Logs the context at info level and proceeds
#[derive(Debug, Clone, Default)]
pub struct LogContextStep;

#[async_trait]
impl Step for LogContextStep {
    fn name(&self) -> &str {
        "log_context"
    }

    async fn execute(&self, context: ProcessingContext) -> StepResult {
        info!(
            pipeline = %context.pipeline,
            correlation_id = context.correlation_id().unwrap_or("-"),
            properties = context.properties.len(),
            "Processing item"
        );
        Ok(StepOutcome::proceed(context))
    }
}

/// Sets one property on the context
#[derive(Debug, Clone)]
pub struct SetPropertyStep {
    key: String,
    value: String,
}

impl SetPropertyStep {
    pub fn new<K: Into<String>, V: Into<String>>(key: K, value: V) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[async_trait]
impl Step for SetPropertyStep {
    fn name(&self) -> &str {
        "set_property"
    }

    async fn execute(&self, mut context: ProcessingContext) -> StepResult {
        context.set_property(self.key.clone(), self.value.clone());
        Ok(StepOutcome::proceed(context))
    }
}

/// Rejects the item when a property is missing or blank
#[derive(Debug, Clone)]
pub struct RequirePropertyStep {
    key: String,
}

impl RequirePropertyStep {
    pub fn new<K: Into<String>>(key: K) -> Self {
        Self { key: key.into() }
    }
}

#[async_trait]
impl Step for RequirePropertyStep {
    fn name(&self) -> &str {
        "require_property"
    }

    async fn execute(&self, context: ProcessingContext) -> StepResult {
        let present = context
            .property(&self.key)
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false);

        if present {
            Ok(StepOutcome::proceed(context))
        } else {
            let result = ResultDescriptor::new(
                "missing_property",
                format!("required property '{}' is missing", self.key),
            )
            .with_step(self.name());
            Ok(StepOutcome::reject(context, result))
        }
    }
}
