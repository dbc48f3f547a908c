//! Exponential-backoff interval scheduling for polling receivers
//!
//! Each polling target gets a `ScheduleEntry` whose interval grows by 1.75x
//! after every unproductive fire (bounded by its maximum) and snaps back to
//! its minimum after a productive one. Due entries are grouped into
//! one-second buckets so a single timer serves many targets.

pub mod entry;
pub mod interval;

pub use entry::{next_backoff, EntryState, ScheduleEntry, GROWTH_FACTOR, MIN_INTERVAL_FLOOR};
pub use interval::{DueEntry, IntervalScheduler, MIN_WAKE_DELAY};
