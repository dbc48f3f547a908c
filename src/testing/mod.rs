//! Testing utilities and mock implementations
//!
//! Mocks for steps, exception stores and handlers, receivers and connection
//! plumbing, so pipelines and dispatch loops can be tested without real I/O.

pub mod mocks;

pub use mocks::*;
