//! Rolling-window traffic statistics for gateway upstream targets.
//!
//! Request-path code feeds events into an [`Analysis`] registry; one background
//! task per registered (key, interval) window turns the live counters into
//! request/success/failure/reject deltas, latency extremes and QPS.

pub mod analysis;
pub mod error;
pub mod point;
pub mod recently;
pub mod task;

pub use analysis::Analysis;
pub use error::AnalysisError;
pub use point::{CounterPoint, PointSnapshot};
pub use recently::{RecentlyWindow, WindowSnapshot, WindowStats};
pub use task::TaskRunner;
