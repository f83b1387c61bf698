//! Outer CRD controllers: validate configuration and feed the core planes.
//!
//! These controllers own no mirroring logic. Rule controllers compile
//! selection rules into the rule store and nudge the watch manager;
//! the destination controller resolves repo config and credentials,
//! enforces uniqueness and registers pipelines with the router.

pub mod destination;
pub mod rule;

use crate::error::Error;
use crate::metrics::Metrics;
use crate::router::EventRouter;
use crate::rules::RuleStore;
use crate::watch::WatchManager;

use std::sync::Arc;

use kube::client::Client;
use tracing::error;

/// Context injected with each reconcile invocation.
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Compiled selection rules
    pub rules: Arc<RuleStore>,
    /// Destination pipelines and branch workers
    pub router: Arc<EventRouter>,
    /// Dynamic informer plane
    pub watch: Arc<WatchManager>,
    /// Prometheus metrics
    pub metrics: Arc<Metrics>,
}

pub(crate) fn record_failure(ctx: &Context, controller: &str, error: &Error) {
    error!(%controller, %error, "failed reconciliation");
    ctx.metrics.reconcile.failure_inc(controller, error);
}
