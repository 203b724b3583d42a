//! Upstream forwarding: admission control, request relay and correlation.

pub mod correlation;
pub mod forward;
pub mod upstream;
