//! Composable step pipelines
//!
//! Steps run against a `ProcessingContext` that is passed by value and handed
//! back inside each `StepOutcome`, so a step can replace the context for
//! everything after it. Pipelines compose as sequences and conditionals, and
//! any subtree can be wrapped by an exception decorator.

pub mod builtin;
pub mod composite;
pub mod context;
pub mod exception;
pub mod step;

pub use builtin::{LogContextStep, RequirePropertyStep, SetPropertyStep};
pub use composite::{Pipeline, PipelineBuilder, Predicate};
pub use context::{ProcessingContext, ResultDescriptor, NOTIFY_ON_EXCEPTION};
pub use exception::{
    ExceptionDecorator, ExceptionStrategy, InboundExceptionStrategy, OutboundExceptionStrategy,
};
pub use step::{Step, StepOutcome, StepResult};
