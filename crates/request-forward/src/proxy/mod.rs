//! Forwarding: the per-request forwarder, the fallback layer and correlation.

pub mod correlation;
pub mod fallback;
pub mod forwarder;
