//! msgrelay - processing core of a store-and-forward message exchange runtime
//!
//! # Overview
//!
//! Items arrive through receivers, are transformed into a processing context
//! and run through composable step pipelines by an agent:
//! - Interval scheduling with exponential backoff for polling receivers
//! - Step pipelines with sequences, conditionals and exception decorators
//! - An agent state machine with a normal and an error pipeline
//! - Batch, scheduled directory pickup and HTTP receivers
//! - Structured logging, metrics and health endpoints
//!
//! # Quick Start
//!
//! ```rust
//! use msgrelay::scheduler::IntervalScheduler;
//! use chrono::Utc;
//! use std::time::Duration;
//!
//! let mut scheduler: IntervalScheduler<&str> = IntervalScheduler::new();
//! scheduler
//!     .register("partner-a", Duration::from_secs(2), Duration::from_secs(10), "inbox")
//!     .unwrap();
//!
//! let now = Utc::now();
//! scheduler.schedule_next("partner-a", now).unwrap();
//! assert!(scheduler.drain_due(now).is_empty());
//!
//! let due = scheduler.drain_due(now + chrono::Duration::seconds(3));
//! assert_eq!(due.len(), 1);
//!
//! // nothing was found, so the next interval backs off by 1.75x
//! scheduler.settle("partner-a", false).unwrap();
//! assert_eq!(
//!     scheduler.current_interval("partner-a"),
//!     Some(Duration::from_millis(3500))
//! );
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod observability;
pub mod persistence;
pub mod pipeline;
pub mod receivers;
pub mod scheduler;
pub mod testing;

pub use agent::{Agent, AgentRunOutcome, FaultPhase, ReceivedItemTransformer, Transformer};
pub use config::{ConfigError, RuntimeConfig};
pub use error::{ReceiverError, RuntimeError, SchedulerError, StepFault, StoreError};
pub use pipeline::{Pipeline, PipelineBuilder, ProcessingContext, Step, StepOutcome};
pub use receivers::{ItemHandler, ReceivedItem, Receiver};
pub use scheduler::IntervalScheduler;
