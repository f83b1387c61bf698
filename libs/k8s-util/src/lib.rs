//! Shared Kubernetes client plumbing: a client whose HTTP layer feeds
//! request metrics into the process registry.

pub mod client;
pub mod metrics;
pub mod url;
