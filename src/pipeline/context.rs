//! The unit of work threaded through a pipeline

use crate::error::StepFault;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Property holding the exception notification policy ("true"/"false")
pub const NOTIFY_ON_EXCEPTION: &str = "notify_on_exception";

/// Result or fault detail carried by a context
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultDescriptor {
    /// Machine-readable code, e.g. `missing_property` or a fault kind
    pub code: String,
    pub message: String,
    /// Step that produced the result, when known
    pub step: Option<String>,
}

impl ResultDescriptor {
    pub fn new<C: Into<String>, M: Into<String>>(code: C, message: M) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            step: None,
        }
    }

    pub fn with_step<S: Into<String>>(mut self, step: S) -> Self {
        self.step = Some(step.into());
        self
    }

    /// Descriptor for a fault, with the message sanitized
    pub fn from_fault(fault: &StepFault) -> Self {
        Self::new(fault.kind(), fault.sanitized_message())
    }
}

/// Mutable processing context for one item
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingContext {
    /// Pipeline the context belongs to (submit, send, receive, ...)
    pub pipeline: String,
    /// Correlation id of the inbound message, if any
    pub received_message_id: Option<String>,
    /// Correlation id of the outbound message, if any
    pub sending_message_id: Option<String>,
    /// Domain payload, opaque to the pipeline
    pub payload: Value,
    /// String settings carried with the item
    #[serde(default)]
    pub properties: HashMap<String, String>,
    /// Result or failure detail
    pub result: Option<ResultDescriptor>,
}

impl ProcessingContext {
    pub fn new<S: Into<String>>(pipeline: S, payload: Value) -> Self {
        Self {
            pipeline: pipeline.into(),
            received_message_id: None,
            sending_message_id: None,
            payload,
            properties: HashMap::new(),
            result: None,
        }
    }

    pub fn with_received_message_id<S: Into<String>>(mut self, id: S) -> Self {
        self.received_message_id = Some(id.into());
        self
    }

    pub fn with_sending_message_id<S: Into<String>>(mut self, id: S) -> Self {
        self.sending_message_id = Some(id.into());
        self
    }

    pub fn with_property<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn set_property<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn set_result(&mut self, result: ResultDescriptor) {
        self.result = Some(result);
    }

    /// First available correlation id, inbound preferred
    pub fn correlation_id(&self) -> Option<&str> {
        self.received_message_id
            .as_deref()
            .or(self.sending_message_id.as_deref())
    }

    /// Whether an exception on this item should be followed by a notification
    pub fn notify_on_exception(&self) -> bool {
        self.property(NOTIFY_ON_EXCEPTION)
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
}
