//! Shared plumbing: tracing initialization and counters.

pub mod logging;
pub mod stats;

pub use stats::Stats;
