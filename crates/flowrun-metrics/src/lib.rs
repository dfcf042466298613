//! Execution metrics for flow runs
//!
//! Keeps the most recent samples per node and per flow in fixed-size ring
//! buffers for the JSON snapshot, and mirrors every observation into
//! Prometheus collectors for scraping.

mod collector;
mod ring;

pub use collector::{MetricsCollector, MetricsSnapshot, SampleSummary};
pub use ring::RingBuffer;
