//! Conversion of raw received items into processing contexts

use crate::error::StepFault;
use crate::pipeline::ProcessingContext;
use crate::receivers::ReceivedItem;
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

/// Property holding the receiver that produced the item
pub const SOURCE_PROPERTY: &str = "source";

/// Normalizes a raw item into a processing context
#[async_trait]
pub trait Transformer<R>: Send + Sync {
    async fn transform(&self, item: R) -> Result<ProcessingContext, StepFault>;
}

/// Turns `ReceivedItem`s into contexts for one named pipeline
///
/// JSON bodies become structured payloads; any other UTF-8 body is kept as a
/// string payload. Empty and non-UTF-8 bodies are transform faults.
#[derive(Debug, Clone)]
pub struct ReceivedItemTransformer {
    pipeline: String,
}

impl ReceivedItemTransformer {
    pub fn new<S: Into<String>>(pipeline: S) -> Self {
        Self {
            pipeline: pipeline.into(),
        }
    }
}

#[async_trait]
impl Transformer<ReceivedItem> for ReceivedItemTransformer {
    async fn transform(&self, item: ReceivedItem) -> Result<ProcessingContext, StepFault> {
        if item.body.is_empty() {
            return Err(StepFault::transform_failed(format!(
                "empty body received from '{}'",
                item.source
            )));
        }

        let payload = match serde_json::from_slice::<Value>(&item.body) {
            Ok(json) => json,
            Err(_) => {
                let text = std::str::from_utf8(&item.body).map_err(|e| {
                    StepFault::transform_failed(format!("body is neither JSON nor UTF-8: {e}"))
                })?;
                Value::String(text.to_string())
            }
        };

        let message_id = item
            .message_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut context =
            ProcessingContext::new(self.pipeline.clone(), payload).with_received_message_id(message_id);
        context.properties = item.properties;
        context.set_property(SOURCE_PROPERTY, item.source);
        Ok(context)
    }
}
