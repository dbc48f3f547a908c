//! Error types for the message processing core
//!
//! Faults raised by steps, transformers and item handlers are `StepFault`s.
//! Component-level failures (scheduler bookkeeping, receivers, persistence)
//! have their own enums and roll up into `RuntimeError`.

use thiserror::Error;

/// Fault raised while processing a single item
#[derive(Debug, Error)]
pub enum StepFault {
    #[error("Step '{step}' failed: {message}")]
    StepFailed { step: String, message: String },

    #[error("Transform failed: {message}")]
    TransformFailed { message: String },

    #[error("Invalid context: {message}")]
    InvalidContext { message: String },

    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("Task aborted: {message}")]
    TaskAborted { message: String },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl StepFault {
    /// Create step failure
    pub fn step_failed<S: Into<String>, M: Into<String>>(step: S, message: M) -> Self {
        Self::StepFailed {
            step: step.into(),
            message: message.into(),
        }
    }

    /// Create transform failure
    pub fn transform_failed<S: Into<String>>(message: S) -> Self {
        Self::TransformFailed {
            message: message.into(),
        }
    }

    /// Create invalid context error
    pub fn invalid_context<S: Into<String>>(message: S) -> Self {
        Self::InvalidContext {
            message: message.into(),
        }
    }

    /// Create aborted task error (panicked or cancelled task)
    pub fn task_aborted<S: Into<String>>(message: S) -> Self {
        Self::TaskAborted {
            message: message.into(),
        }
    }

    /// Create internal error
    pub fn internal_error<S: Into<String>>(message: S) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// Short machine-readable kind, used in exception records and logs
    pub fn kind(&self) -> &'static str {
        match self {
            StepFault::StepFailed { .. } => "step_failed",
            StepFault::TransformFailed { .. } => "transform_failed",
            StepFault::InvalidContext { .. } => "invalid_context",
            StepFault::Persistence(_) => "persistence",
            StepFault::TaskAborted { .. } => "task_aborted",
            StepFault::InternalError { .. } => "internal_error",
        }
    }

    /// Message safe to persist or report outside the process
    pub fn sanitized_message(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

/// Interval scheduler bookkeeping errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Schedule key already registered: {0}")]
    DuplicateKey(String),
    #[error("Unknown schedule key: {0}")]
    UnknownKey(String),
}

/// Receiver configuration and runtime errors
#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("Invalid receiver setting '{key}': {message}")]
    InvalidSetting { key: String, message: String },

    #[error("Receiver is already running")]
    AlreadyRunning,

    #[error("Poll failed: {message}")]
    PollFailed { message: String },

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReceiverError {
    pub fn invalid_setting<K: Into<String>, M: Into<String>>(key: K, message: M) -> Self {
        Self::InvalidSetting {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn poll_failed<S: Into<String>>(message: S) -> Self {
        Self::PollFailed {
            message: message.into(),
        }
    }
}

/// Exception store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Write rejected: {0}")]
    Rejected(String),
}

/// Top-level error for runtime assembly and the binary
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Receiver error: {0}")]
    Receiver(#[from] ReceiverError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Sanitize error messages before they leave the process
pub(crate) fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    // Common secret patterns
    if let Ok(secrets) = regex::Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+") {
        sanitized = secrets.replace_all(&sanitized, "${1}=***").to_string();
    }

    // Paths into credential directories
    if let Ok(paths) =
        regex::Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
    {
        sanitized = paths.replace_all(&sanitized, "/***REDACTED***/").to_string();
    }

    if sanitized.len() > 500 {
        let truncate_suffix = "...[truncated]";
        let mut cut = 500 - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_failed_constructor() {
        let fault = StepFault::step_failed("sign", "certificate expired");
        assert!(matches!(fault, StepFault::StepFailed { .. }));
        assert_eq!(fault.to_string(), "Step 'sign' failed: certificate expired");
        assert_eq!(fault.kind(), "step_failed");
    }

    #[test]
    fn test_transform_failed_constructor() {
        let fault = StepFault::transform_failed("body is empty");
        assert_eq!(fault.to_string(), "Transform failed: body is empty");
        assert_eq!(fault.kind(), "transform_failed");
    }

    #[test]
    fn test_store_error_converts_to_fault() {
        let fault: StepFault = StoreError::Unavailable("db down".to_string()).into();
        assert!(matches!(fault, StepFault::Persistence(_)));
        assert!(fault.to_string().contains("db down"));
    }

    #[test]
    fn test_scheduler_error_converts_to_receiver_error() {
        let error: ReceiverError = SchedulerError::DuplicateKey("partner-a".to_string()).into();
        assert!(error.to_string().contains("partner-a"));
    }

    #[test]
    fn test_sanitized_message_redacts_secrets() {
        let fault = StepFault::internal_error("login failed: password=hunter2 token=abc");
        let message = fault.sanitized_message();

        assert!(!message.contains("hunter2"));
        assert!(!message.contains("abc"));
        assert!(message.contains("password=***"));
    }

    #[test]
    fn test_file_path_redaction() {
        let sanitized = sanitize_error_message("cannot open /home/relay/.ssh/id_rsa");
        assert!(sanitized.contains("/***REDACTED***/"));
        assert!(!sanitized.contains("id_rsa"));
    }

    #[test]
    fn test_long_message_truncation() {
        let sanitized = sanitize_error_message(&"x".repeat(600));
        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let sanitized = sanitize_error_message(&"é".repeat(400));
        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_sanitize_exactly_500_chars() {
        let sanitized = sanitize_error_message(&"x".repeat(500));
        assert_eq!(sanitized.len(), 500);
        assert!(!sanitized.contains("truncated"));
    }
}
