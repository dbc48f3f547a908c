//! Recursive pipeline composition
//!
//! A `Pipeline` is a tree: atomic steps at the leaves, sequences and
//! conditionals as inner nodes, and exception-guarded subtrees.

use super::context::ProcessingContext;
use super::exception::{ExceptionDecorator, ExceptionStrategy};
use super::step::{Step, StepOutcome, StepResult};
use crate::step_span;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;
use tracing::{debug, Instrument};

/// Branch selector for conditional nodes; evaluated once per execution
pub type Predicate = Arc<dyn Fn(&ProcessingContext) -> bool + Send + Sync>;

/// A composable pipeline node
#[derive(Clone)]
pub enum Pipeline {
    Step(Arc<dyn Step>),
    Sequence(Vec<Pipeline>),
    Conditional {
        predicate: Predicate,
        then_branch: Box<Pipeline>,
        else_branch: Box<Pipeline>,
    },
    Guarded(ExceptionDecorator),
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Pipeline::Step(step) => f.debug_tuple("Step").field(&step.name()).finish(),
            Pipeline::Sequence(nodes) => f.debug_tuple("Sequence").field(nodes).finish(),
            Pipeline::Conditional {
                then_branch,
                else_branch,
                ..
            } => f
                .debug_struct("Conditional")
                .field("then_branch", then_branch)
                .field("else_branch", else_branch)
                .finish(),
            Pipeline::Guarded(decorator) => f.debug_tuple("Guarded").field(decorator).finish(),
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::empty()
    }
}

impl Pipeline {
    /// A pipeline with no steps; running it succeeds with the input unchanged
    pub fn empty() -> Self {
        Pipeline::Sequence(Vec::new())
    }

    pub fn step<S: Step + 'static>(step: S) -> Self {
        Pipeline::Step(Arc::new(step))
    }

    pub fn shared_step(step: Arc<dyn Step>) -> Self {
        Pipeline::Step(step)
    }

    pub fn sequence(nodes: Vec<Pipeline>) -> Self {
        Pipeline::Sequence(nodes)
    }

    pub fn conditional<F>(predicate: F, then_branch: Pipeline, else_branch: Pipeline) -> Self
    where
        F: Fn(&ProcessingContext) -> bool + Send + Sync + 'static,
    {
        Pipeline::Conditional {
            predicate: Arc::new(predicate),
            then_branch: Box::new(then_branch),
            else_branch: Box::new(else_branch),
        }
    }

    /// Wrap `inner` so its faults are recorded and absorbed
    pub fn guarded(inner: Pipeline, strategy: Arc<dyn ExceptionStrategy>) -> Self {
        Pipeline::Guarded(ExceptionDecorator::new(inner, strategy))
    }

    /// True when executing this node can never run a step
    pub fn is_empty(&self) -> bool {
        match self {
            Pipeline::Step(_) => false,
            Pipeline::Sequence(nodes) => nodes.iter().all(Pipeline::is_empty),
            Pipeline::Conditional {
                then_branch,
                else_branch,
                ..
            } => then_branch.is_empty() && else_branch.is_empty(),
            Pipeline::Guarded(decorator) => decorator.inner().is_empty(),
        }
    }

    /// Short label for logs and exception records
    pub fn label(&self) -> String {
        match self {
            Pipeline::Step(step) => step.name().to_string(),
            Pipeline::Sequence(nodes) => format!("sequence[{}]", nodes.len()),
            Pipeline::Conditional { .. } => "conditional".to_string(),
            Pipeline::Guarded(decorator) => format!("guarded({})", decorator.inner().label()),
        }
    }

    /// Run this node against `context`
    ///
    /// Faults from unguarded steps are returned as `Err` untouched.
    pub fn execute(&self, context: ProcessingContext) -> BoxFuture<'_, StepResult> {
        match self {
            Pipeline::Step(step) => {
                let span = step_span!(step = %step.name(), pipeline = %context.pipeline);
                async move { step.execute(context).await }
                    .instrument(span)
                    .boxed()
            }
            Pipeline::Sequence(nodes) => run_sequence(nodes, context).boxed(),
            Pipeline::Conditional {
                predicate,
                then_branch,
                else_branch,
            } => async move {
                let take_then = predicate(&context);
                let branch = if take_then { "then" } else { "else" };
                debug!(branch, "Conditional branch selected");
                if take_then {
                    then_branch.execute(context).await
                } else {
                    else_branch.execute(context).await
                }
            }
            .boxed(),
            Pipeline::Guarded(decorator) => decorator.execute(context),
        }
    }
}

async fn run_sequence(nodes: &[Pipeline], context: ProcessingContext) -> StepResult {
    let mut outcome = StepOutcome::proceed(context);

    for (index, node) in nodes.iter().enumerate() {
        outcome = node.execute(outcome.context).await?;
        if !outcome.can_proceed {
            debug!(
                index,
                node = %node.label(),
                succeeded = outcome.succeeded,
                "Sequence stopped early"
            );
            break;
        }
    }

    Ok(outcome)
}

/// Fluent builder for sequential pipelines
#[derive(Debug, Default)]
pub struct PipelineBuilder {
    nodes: Vec<Pipeline>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step<S: Step + 'static>(mut self, step: S) -> Self {
        self.nodes.push(Pipeline::step(step));
        self
    }

    pub fn node(mut self, node: Pipeline) -> Self {
        self.nodes.push(node);
        self
    }

    /// Append `step` wrapped in an exception decorator
    pub fn guarded_step<S: Step + 'static>(
        mut self,
        step: S,
        strategy: Arc<dyn ExceptionStrategy>,
    ) -> Self {
        self.nodes.push(Pipeline::guarded(Pipeline::step(step), strategy));
        self
    }

    pub fn branch<F>(mut self, predicate: F, then_branch: Pipeline, else_branch: Pipeline) -> Self
    where
        F: Fn(&ProcessingContext) -> bool + Send + Sync + 'static,
    {
        self.nodes
            .push(Pipeline::conditional(predicate, then_branch, else_branch));
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline::Sequence(self.nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{FailingStep, SpyStep};
    use serde_json::{json, Value};

    fn context() -> ProcessingContext {
        ProcessingContext::new("receive", json!({"n": 0}))
    }

    #[tokio::test]
    async fn test_empty_pipeline_is_noop_success() {
        let input = context();
        let outcome = Pipeline::empty().execute(input.clone()).await.unwrap();

        assert!(outcome.succeeded);
        assert!(outcome.can_proceed);
        assert_eq!(outcome.context, input);
    }

    #[tokio::test]
    async fn test_sequence_runs_in_order() {
        let first = SpyStep::proceeding("first");
        let second = SpyStep::proceeding("second");
        let pipeline = PipelineBuilder::new()
            .step(first.clone())
            .step(second.clone())
            .build();

        let outcome = pipeline.execute(context()).await.unwrap();

        assert!(outcome.succeeded);
        assert_eq!(first.calls(), 1);
        assert_eq!(second.calls(), 1);
        assert_eq!(outcome.context.property("visited"), Some("first,second"));
    }

    #[tokio::test]
    async fn test_sequence_short_circuits() {
        let first = SpyStep::stopping("first");
        let second = SpyStep::proceeding("second");
        let pipeline = Pipeline::sequence(vec![
            Pipeline::step(first.clone()),
            Pipeline::step(second.clone()),
        ]);

        let outcome = pipeline.execute(context()).await.unwrap();

        assert!(!outcome.can_proceed);
        assert_eq!(first.calls(), 1);
        assert_eq!(second.calls(), 0, "second step must not run after stop");
    }

    #[tokio::test]
    async fn test_sequence_uses_replacement_context() {
        let replacing = SpyStep::replacing("replace", json!({"replaced": true}));
        let observer = SpyStep::proceeding("observer");
        let pipeline = PipelineBuilder::new()
            .step(replacing)
            .step(observer.clone())
            .build();

        let outcome = pipeline.execute(context()).await.unwrap();

        assert_eq!(observer.seen_payloads(), vec![json!({"replaced": true})]);
        assert_eq!(outcome.context.payload, json!({"replaced": true}));
    }

    #[tokio::test]
    async fn test_fault_propagates_and_stops_sequence() {
        let after = SpyStep::proceeding("after");
        let pipeline = PipelineBuilder::new()
            .step(FailingStep::new("boom"))
            .step(after.clone())
            .build();

        let result = pipeline.execute(context()).await;

        assert!(result.is_err());
        assert_eq!(after.calls(), 0);
    }

    #[tokio::test]
    async fn test_conditional_true_runs_only_then() {
        let then_step = SpyStep::proceeding("then");
        let else_step = SpyStep::proceeding("else");
        let pipeline = Pipeline::conditional(
            |_| true,
            Pipeline::step(then_step.clone()),
            Pipeline::step(else_step.clone()),
        );

        pipeline.execute(context()).await.unwrap();

        assert_eq!(then_step.calls(), 1);
        assert_eq!(else_step.calls(), 0);
    }

    #[tokio::test]
    async fn test_conditional_false_runs_only_else() {
        let then_step = SpyStep::proceeding("then");
        let else_step = SpyStep::proceeding("else");
        let pipeline = Pipeline::conditional(
            |ctx| ctx.property("route") == Some("then"),
            Pipeline::step(then_step.clone()),
            Pipeline::step(else_step.clone()),
        );

        pipeline.execute(context()).await.unwrap();

        assert_eq!(then_step.calls(), 0);
        assert_eq!(else_step.calls(), 1);
    }

    #[tokio::test]
    async fn test_nested_conditionals_compose() {
        let inner_then = SpyStep::proceeding("inner-then");
        let inner_else = SpyStep::proceeding("inner-else");
        let outer_else = SpyStep::proceeding("outer-else");

        let pipeline = Pipeline::conditional(
            |ctx| ctx.payload != Value::Null,
            Pipeline::sequence(vec![Pipeline::conditional(
                |ctx| ctx.payload["n"] == json!(1),
                Pipeline::step(inner_then.clone()),
                Pipeline::step(inner_else.clone()),
            )]),
            Pipeline::step(outer_else.clone()),
        );

        pipeline.execute(context()).await.unwrap();

        assert_eq!(inner_then.calls(), 0);
        assert_eq!(inner_else.calls(), 1);
        assert_eq!(outer_else.calls(), 0);
    }

    #[test]
    fn test_is_empty_and_label() {
        assert!(Pipeline::empty().is_empty());
        assert!(Pipeline::sequence(vec![Pipeline::empty()]).is_empty());

        let step = Pipeline::step(SpyStep::proceeding("only"));
        assert!(!step.is_empty());
        assert_eq!(step.label(), "only");
        assert_eq!(Pipeline::sequence(vec![step]).label(), "sequence[1]");
    }
}
