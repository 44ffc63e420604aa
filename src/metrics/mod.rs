//! Latency, throughput and bandwidth measurement
//!
//! Sessions collect raw samples; `::metrics` facade gauges and histograms are
//! updated regardless of session state.

pub mod bandwidth;
pub mod session;

pub use bandwidth::ByteCounters;
pub use session::{MetricsAggregator, MetricsSession, MetricsSummary, SampleCounts, Stat};
