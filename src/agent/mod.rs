//! Agents: received items through transform, normal and error pipelines

pub mod exception_handler;
pub mod orchestrator;
pub mod transformer;

pub use exception_handler::*;
pub use orchestrator::*;
pub use transformer::*;
