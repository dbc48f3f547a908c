//! Atomic step capability and step outcomes

use super::context::{ProcessingContext, ResultDescriptor};
use crate::error::StepFault;
use async_trait::async_trait;

/// Result of executing a step or pipeline
pub type StepResult = Result<StepOutcome, StepFault>;

/// Outcome of one step or one pipeline run
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    /// Context to use from here on (may replace the input)
    pub context: ProcessingContext,
    pub succeeded: bool,
    /// `false` stops the enclosing sequence
    pub can_proceed: bool,
    /// Fault absorbed on the way, if any
    pub fault: Option<ResultDescriptor>,
}

impl StepOutcome {
    /// Success, continue with the next step
    pub fn proceed(context: ProcessingContext) -> Self {
        Self {
            context,
            succeeded: true,
            can_proceed: true,
            fault: None,
        }
    }

    /// Success, but stop the pipeline here
    pub fn stop(context: ProcessingContext) -> Self {
        Self {
            context,
            succeeded: true,
            can_proceed: false,
            fault: None,
        }
    }

    /// Application-level rejection; the detail is stored on the context
    pub fn reject(mut context: ProcessingContext, result: ResultDescriptor) -> Self {
        context.set_result(result);
        Self {
            context,
            succeeded: false,
            can_proceed: false,
            fault: None,
        }
    }
}

/// A unit of work executed against a processing context
///
/// Returning `Err` raises a fault: it propagates out of the pipeline unless
/// the step is wrapped by an exception decorator.
#[async_trait]
pub trait Step: Send + Sync {
    /// Name used in logs and exception records
    fn name(&self) -> &str;

    async fn execute(&self, context: ProcessingContext) -> StepResult;
}
