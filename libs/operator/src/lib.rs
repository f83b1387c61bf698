//! ConfigButler mirrors selected live Kubernetes resources into Git as
//! sanitized canonical YAML, one file per object, with commits attributed to
//! the human who changed each resource.
//!
//! The cluster is the source of truth; Git is the audit trail. Admission
//! captures actor identity, the dynamic watch plane observes the resulting
//! writes, content-hash correlation joins the two, and per-branch workers
//! batch, encrypt and push the outcome.

pub mod admission;
pub mod controllers;
pub mod correlation;
pub mod crd;
pub mod encrypt;
pub mod error;
pub mod event;
pub mod git;
pub mod identity;
pub mod metrics;
pub mod reconcile;
pub mod router;
pub mod rules;
pub mod sanitize;
pub mod settings;
pub mod stream;
pub mod telemetry;
pub mod watch;
