use crate::controllers::{record_failure, Context};
use crate::crd::{ClusterWatchRule, RuleStatus, WatchRule};
use crate::error::{Error, Result};
use crate::rules::{compile_cluster_watch_rule, compile_watch_rule, CompiledRule};

use std::sync::Arc;

use futures::StreamExt;
use kube::api::{Api, ListParams, Patch, PatchParams, ResourceExt};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::watcher;
use serde_json::json;
use tokio::time::Duration;
use tracing::{error, info, instrument, warn};

pub const WATCH_RULE_CONTROLLER: &str = "watchrule";
pub const CLUSTER_WATCH_RULE_CONTROLLER: &str = "clusterwatchrule";

static RULE_FINALIZER: &str = "configbutler.io/rule";

/// Initialize the WatchRule controller (given the CRD is installed).
pub async fn run_watch_rules(ctx: Arc<Context>) {
    let api = Api::<WatchRule>::all(ctx.client.clone());
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("WatchRule CRD is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }
    info!(msg = "starting watch rule controller");
    Controller::new(api, watcher::Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile_watch_rule, error_policy_watch_rule, ctx)
        .filter_map(|x| async move { x.ok() })
        .for_each(|_| futures::future::ready(()))
        .await;
}

pub async fn run_cluster_watch_rules(ctx: Arc<Context>) {
    let api = Api::<ClusterWatchRule>::all(ctx.client.clone());
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("ClusterWatchRule CRD is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }
    info!(msg = "starting cluster watch rule controller");
    Controller::new(api, watcher::Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile_cluster_watch_rule, error_policy_cluster_watch_rule, ctx)
        .filter_map(|x| async move { x.ok() })
        .for_each(|_| futures::future::ready(()))
        .await;
}

#[instrument(skip(ctx, rule))]
async fn reconcile_watch_rule(rule: Arc<WatchRule>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = rule.namespace().ok_or_else(|| {
        Error::UserInputError("WatchRule is expected to be namespaced".to_string())
    })?;
    let api: Api<WatchRule> = Api::namespaced(ctx.client.clone(), &namespace);
    finalizer(&api, RULE_FINALIZER, rule, |event| async {
        match event {
            FinalizerEvent::Apply(rule) => {
                let status_api = api.clone();
                let name = rule.name_any();
                let compiled = compile_watch_rule(&rule);
                apply_rule(&ctx, compiled, |status| async move {
                    patch_rule_status(&status_api, &name, status).await
                })
                .await
            }
            FinalizerEvent::Cleanup(rule) => {
                cleanup_rule(&ctx, &format!("watchrule:{}/{}", namespace, rule.name_any())).await
            }
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(e.to_string()))
}

#[instrument(skip(ctx, rule))]
async fn reconcile_cluster_watch_rule(
    rule: Arc<ClusterWatchRule>,
    ctx: Arc<Context>,
) -> Result<Action> {
    let api = Api::<ClusterWatchRule>::all(ctx.client.clone());
    finalizer(&api, RULE_FINALIZER, rule, |event| async {
        match event {
            FinalizerEvent::Apply(rule) => {
                let status_api = api.clone();
                let name = rule.name_any();
                let compiled = compile_cluster_watch_rule(&rule);
                apply_rule(&ctx, compiled, |status| async move {
                    patch_cluster_rule_status(&status_api, &name, status).await
                })
                .await
            }
            FinalizerEvent::Cleanup(rule) => {
                cleanup_rule(&ctx, &format!("clusterwatchrule:{}", rule.name_any())).await
            }
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(e.to_string()))
}

/// Store the compiled rule (or drop a stale one on compile failure), kick
/// the watch plane, surface the outcome on status.
async fn apply_rule<F, Fut>(
    ctx: &Context,
    compiled: Result<CompiledRule>,
    patch_status: F,
) -> Result<Action>
where
    F: FnOnce(RuleStatus) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let status = match &compiled {
        Ok(rule) => {
            info!(rule = %rule.key, destination = %rule.destination, "rule compiled");
            ctx.rules.upsert(rule.clone());
            RuleStatus {
                accepted: true,
                message: None,
            }
        }
        Err(e) => {
            warn!(error = %e, "rule rejected");
            RuleStatus {
                accepted: false,
                message: Some(e.to_string()),
            }
        }
    };
    if status.accepted {
        if let Err(e) = ctx.watch.reconcile_for_rule_change(true).await {
            warn!(error = %e, "watch reconciliation after rule change failed");
        }
    }
    patch_status(status).await?;
    Ok(Action::requeue(Duration::from_secs(5 * 60)))
}

async fn cleanup_rule(ctx: &Context, key: &str) -> Result<Action> {
    info!(rule = %key, "removing rule");
    ctx.rules.remove(key);
    if let Err(e) = ctx.watch.reconcile_for_rule_change(true).await {
        warn!(error = %e, "watch reconciliation after rule removal failed");
    }
    Ok(Action::await_change())
}

async fn patch_rule_status(api: &Api<WatchRule>, name: &str, status: RuleStatus) -> Result<()> {
    api.patch_status(
        name,
        &PatchParams::default(),
        &Patch::Merge(json!({ "status": status })),
    )
    .await
    .map_err(Error::KubeError)?;
    Ok(())
}

async fn patch_cluster_rule_status(
    api: &Api<ClusterWatchRule>,
    name: &str,
    status: RuleStatus,
) -> Result<()> {
    api.patch_status(
        name,
        &PatchParams::default(),
        &Patch::Merge(json!({ "status": status })),
    )
    .await
    .map_err(Error::KubeError)?;
    Ok(())
}

fn error_policy_watch_rule(rule: Arc<WatchRule>, error: &Error, ctx: Arc<Context>) -> Action {
    // safe unwrap: WatchRule is a namespace scoped resource
    error!(msg = "failed reconciliation", namespace = %rule.namespace().unwrap(), name = %rule.name_any(), %error);
    record_failure(&ctx, WATCH_RULE_CONTROLLER, error);
    Action::requeue(Duration::from_secs(5 * 60))
}

fn error_policy_cluster_watch_rule(
    rule: Arc<ClusterWatchRule>,
    error: &Error,
    ctx: Arc<Context>,
) -> Action {
    error!(msg = "failed reconciliation", name = %rule.name_any(), %error);
    record_failure(&ctx, CLUSTER_WATCH_RULE_CONTROLLER, error);
    Action::requeue(Duration::from_secs(5 * 60))
}
