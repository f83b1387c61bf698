use crate::controllers::{record_failure, Context};
use crate::crd::{GitDestination, GitDestinationStatus, GitRepoConfig};
use crate::error::{Error, Result};
use crate::identity::ResourceReference;
use crate::router::DestinationBinding;

use std::sync::Arc;

use futures::StreamExt;
use kube::api::{Api, ListParams, Patch, PatchParams, ResourceExt};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::watcher;
use serde_json::json;
use tokio::time::Duration;
use tracing::{error, info, instrument, warn};

pub const DESTINATION_CONTROLLER: &str = "gitdestination";

static DESTINATION_FINALIZER: &str = "configbutler.io/destination";

/// Status refresh cadence; also how fast repo config changes (URL, branch
/// allowlist, credentials ref) propagate into running pipelines.
const REFRESH: Duration = Duration::from_secs(60);

pub async fn run_destinations(ctx: Arc<Context>) {
    let api = Api::<GitDestination>::all(ctx.client.clone());
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("GitDestination CRD is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }
    info!(msg = "starting destination controller");
    Controller::new(api, watcher::Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile_destination, error_policy, ctx)
        .filter_map(|x| async move { x.ok() })
        .for_each(|_| futures::future::ready(()))
        .await;
}

#[instrument(skip(ctx, destination))]
async fn reconcile_destination(
    destination: Arc<GitDestination>,
    ctx: Arc<Context>,
) -> Result<Action> {
    let namespace = destination.namespace().ok_or_else(|| {
        Error::UserInputError("GitDestination is expected to be namespaced".to_string())
    })?;
    let api: Api<GitDestination> = Api::namespaced(ctx.client.clone(), &namespace);
    finalizer(&api, DESTINATION_FINALIZER, destination, |event| async {
        match event {
            FinalizerEvent::Apply(destination) => {
                apply_destination(&ctx, &api, &namespace, destination).await
            }
            FinalizerEvent::Cleanup(destination) => {
                let reference = ResourceReference::new(&namespace, destination.name_any());
                info!(destination = %reference, "removing destination pipeline");
                ctx.router.remove_destination(&reference).await;
                Ok(Action::await_change())
            }
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(e.to_string()))
}

async fn apply_destination(
    ctx: &Context,
    api: &Api<GitDestination>,
    namespace: &str,
    destination: Arc<GitDestination>,
) -> Result<Action> {
    let name = destination.name_any();
    let reference = ResourceReference::new(namespace, &name);

    match resolve_binding(ctx, namespace, &destination).await {
        Ok(binding) => {
            ctx.router.register_destination(binding).await?;
            // a worker-surfaced failure (credentials, encryption config)
            // belongs on the status without flipping readiness off
            let message = ctx.router.destination_error(&reference).await;
            patch_status(
                api,
                &name,
                GitDestinationStatus {
                    ready: true,
                    message,
                },
            )
            .await?;
            Ok(Action::requeue(REFRESH))
        }
        Err(e) => {
            warn!(destination = %reference, error = %e, "destination disabled");
            ctx.router.remove_destination(&reference).await;
            patch_status(
                api,
                &name,
                GitDestinationStatus {
                    ready: false,
                    message: Some(e.to_string()),
                },
            )
            .await?;
            Ok(Action::requeue(REFRESH))
        }
    }
}

/// Resolve the repo config behind the destination and validate everything a
/// human must fix when wrong: branch allowlist, base folder shape, and the
/// cluster-wide `(resolved URL, branch, baseFolder)` uniqueness.
async fn resolve_binding(
    ctx: &Context,
    namespace: &str,
    destination: &GitDestination,
) -> Result<DestinationBinding> {
    let repo_ref = destination.spec.repo_ref.resolve(namespace);
    let repo = Api::<GitRepoConfig>::namespaced(ctx.client.clone(), &repo_ref.namespace)
        .get(&repo_ref.name)
        .await
        .map_err(|e| Error::UserInputError(format!("repo config {repo_ref} unavailable: {e}")))?;

    let branch = destination.spec.branch.clone();
    if !repo.spec.allowed_branches.contains(&branch) {
        return Err(Error::UserInputError(format!(
            "branch {branch:?} is not in the allowed branches of {repo_ref}"
        )));
    }
    let base_folder = destination.spec.base_folder.trim_matches('/').to_string();
    if base_folder.is_empty() || base_folder.split('/').any(|seg| seg.is_empty() || seg == "..") {
        return Err(Error::UserInputError(format!(
            "invalid baseFolder {:?}",
            destination.spec.base_folder
        )));
    }

    let binding = DestinationBinding {
        destination: ResourceReference::new(namespace, destination.name_any()),
        remote_url: repo.spec.repo_url.clone(),
        branch,
        base_folder,
        repo_namespace: repo_ref.namespace.clone(),
        secret_name: repo.spec.secret_ref.as_ref().map(|r| r.name.clone()),
    };

    ensure_unique(ctx, &binding).await?;
    Ok(binding)
}

/// A destination owns the subtree rooted at its base folder on its branch;
/// two owners of the same triple would fight over commits forever.
async fn ensure_unique(ctx: &Context, binding: &DestinationBinding) -> Result<()> {
    if let Some(other) = ctx.router.conflicting_binding(binding).await {
        return Err(Error::UserInputError(format!(
            "destination {other} already owns ({}, {}, {})",
            binding.remote_url, binding.branch, binding.base_folder
        )));
    }
    // also check destinations not registered yet (e.g. both created at once)
    let all = Api::<GitDestination>::all(ctx.client.clone())
        .list(&ListParams::default())
        .await
        .map_err(Error::KubeError)?;
    for other in &all.items {
        let Some(other_ns) = other.namespace() else {
            continue;
        };
        let other_ref = ResourceReference::new(&other_ns, other.name_any());
        if other_ref == binding.destination {
            continue;
        }
        if other.spec.branch != binding.branch
            || other.spec.base_folder.trim_matches('/') != binding.base_folder
        {
            continue;
        }
        let repo_ref = other.spec.repo_ref.resolve(&other_ns);
        let other_url = Api::<GitRepoConfig>::namespaced(ctx.client.clone(), &repo_ref.namespace)
            .get(&repo_ref.name)
            .await
            .map(|repo| repo.spec.repo_url)
            .unwrap_or_default();
        if other_url == binding.remote_url {
            // deterministic winner so exactly one of the pair reports ready
            if other_ref.key() < binding.destination.key() {
                return Err(Error::UserInputError(format!(
                    "destination {other_ref} already owns ({}, {}, {})",
                    binding.remote_url, binding.branch, binding.base_folder
                )));
            }
        }
    }
    Ok(())
}

async fn patch_status(
    api: &Api<GitDestination>,
    name: &str,
    status: GitDestinationStatus,
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

fn error_policy(destination: Arc<GitDestination>, error: &Error, ctx: Arc<Context>) -> Action {
    // safe unwrap: GitDestination is a namespace scoped resource
    error!(msg = "failed reconciliation", namespace = %destination.namespace().unwrap(),
        name = %destination.name_any(), %error);
    record_failure(&ctx, DESTINATION_CONTROLLER, error);
    Action::requeue(Duration::from_secs(60))
}
