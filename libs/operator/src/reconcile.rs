//! Per-destination reconciliation state machine.
//!
//! INIT → STARTUP_RECONCILE → LIVE_PROCESSING. During startup the
//! destination's stream buffers live events while cluster and repo snapshots
//! are requested through the router; once both arrive the diff lands on the
//! branch worker as synthetic events, the buffer flushes behind it, and the
//! stream goes live.

use crate::event::{Actor, ClusterObject, Operation, ResourceEvent};
use crate::git::worker::BranchWorker;
use crate::identity::{ResourceIdentifier, ResourceReference};
use crate::metrics::{Metrics, StartupMeasurer};
use crate::stream::DestinationStream;
use crate::telemetry;

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// State requests a reconciler emits towards the router.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlEvent {
    RequestClusterState(ResourceReference),
    RequestRepoState(ResourceReference),
}

enum Phase {
    Init,
    Startup {
        cluster: Option<Vec<ClusterObject>>,
        repo: Option<Vec<ResourceIdentifier>>,
        measure: Option<StartupMeasurer>,
    },
    Live,
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Startup { .. } => "startup_reconcile",
            Phase::Live => "live_processing",
        }
    }
}

pub struct FolderReconciler {
    destination: ResourceReference,
    base_folder: String,
    stream: Arc<DestinationStream>,
    worker: Arc<BranchWorker>,
    control: mpsc::Sender<ControlEvent>,
    metrics: Arc<Metrics>,
    phase: Mutex<Phase>,
}

impl FolderReconciler {
    pub fn new(
        destination: ResourceReference,
        base_folder: String,
        stream: Arc<DestinationStream>,
        worker: Arc<BranchWorker>,
        control: mpsc::Sender<ControlEvent>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(FolderReconciler {
            destination,
            base_folder,
            stream,
            worker,
            control,
            metrics,
            phase: Mutex::new(Phase::Init),
        })
    }

    pub async fn phase_name(&self) -> &'static str {
        self.phase.lock().await.name()
    }

    /// Enter STARTUP_RECONCILE (from INIT, from LIVE after a rule change, or
    /// after external remote commits) and request both snapshots.
    pub async fn start_reconciliation(&self) {
        {
            let mut phase = self.phase.lock().await;
            self.stream.begin_buffering().await;
            *phase = Phase::Startup {
                cluster: None,
                repo: None,
                measure: Some(
                    self.metrics
                        .reconcile
                        .startup_measure(&telemetry::get_trace_id()),
                ),
            };
        }
        info!(destination = %self.destination, "starting reconciliation");
        for request in [
            ControlEvent::RequestClusterState(self.destination.clone()),
            ControlEvent::RequestRepoState(self.destination.clone()),
        ] {
            if self.control.send(request).await.is_err() {
                warn!(destination = %self.destination, "router control channel closed");
            }
        }
    }

    pub async fn on_cluster_state(&self, objects: Vec<ClusterObject>) {
        let mut phase = self.phase.lock().await;
        if let Phase::Startup { cluster, .. } = &mut *phase {
            *cluster = Some(objects);
        } else {
            debug!(destination = %self.destination, phase = phase.name(),
                "dropping cluster snapshot outside startup");
            return;
        }
        self.maybe_complete(phase).await;
    }

    pub async fn on_repo_state(&self, identifiers: Vec<ResourceIdentifier>) {
        let mut phase = self.phase.lock().await;
        if let Phase::Startup { repo, .. } = &mut *phase {
            *repo = Some(identifiers);
        } else {
            debug!(destination = %self.destination, phase = phase.name(),
                "dropping repo snapshot outside startup");
            return;
        }
        self.maybe_complete(phase).await;
    }

    async fn maybe_complete(&self, mut phase: tokio::sync::MutexGuard<'_, Phase>) {
        let ready = matches!(
            &*phase,
            Phase::Startup {
                cluster: Some(_),
                repo: Some(_),
                ..
            }
        );
        if !ready {
            return;
        }
        let Phase::Startup {
            cluster, repo, measure,
        } = std::mem::replace(&mut *phase, Phase::Live)
        else {
            return;
        };
        // destructured after the matches! check above
        let cluster = cluster.unwrap_or_default();
        let repo = repo.unwrap_or_default();

        let events = diff_snapshots(cluster, repo);
        info!(destination = %self.destination, synthetic = events.len(),
            "startup diff complete, entering live processing");
        for event in events {
            self.worker.enqueue(&self.base_folder, event).await;
        }
        drop(measure);
        drop(phase);
        self.stream.on_reconciliation_complete().await;
    }
}

/// Diff cluster state against repo state.
///
/// - live only → synthetic CREATE
/// - repo only → synthetic DELETE (uncapped; history is the rollback)
/// - both → RECONCILE carrying the live payload, an idempotent upsert the
///   worker drops when the file is already byte-equal
pub fn diff_snapshots(
    mut cluster: Vec<ClusterObject>,
    mut repo: Vec<ResourceIdentifier>,
) -> Vec<ResourceEvent> {
    cluster.sort_by_key(|o| o.identifier.key());
    repo.sort_by_key(ResourceIdentifier::key);

    let tracked: HashSet<String> = repo.iter().map(ResourceIdentifier::key).collect();
    let mut live = HashSet::new();
    let mut events = Vec::new();

    for object in cluster {
        let key = object.identifier.key();
        let operation = if tracked.contains(&key) {
            Operation::Reconcile
        } else {
            Operation::Create
        };
        live.insert(key);
        events.push(ResourceEvent {
            identifier: object.identifier,
            operation,
            payload: Some(object.payload),
            actor: Actor::reconciler(),
        });
    }
    for identifier in repo {
        if live.contains(&identifier.key()) {
            continue;
        }
        events.push(ResourceEvent {
            identifier,
            operation: Operation::Delete,
            payload: None,
            actor: Actor::reconciler(),
        });
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RECONCILER_ACTOR;
    use crate::identity::ResourceScope;
    use crate::sanitize::SanitizedObject;

    fn id(name: &str) -> ResourceIdentifier {
        ResourceIdentifier {
            group: String::new(),
            version: "v1".into(),
            resource: "configmaps".into(),
            scope: ResourceScope::Namespaced,
            namespace: Some("ns-a".into()),
            name: name.into(),
        }
    }

    fn live(name: &str) -> ClusterObject {
        ClusterObject {
            identifier: id(name),
            payload: SanitizedObject {
                api_version: "v1".into(),
                kind: "ConfigMap".into(),
                yaml: format!("name: {name}\n"),
            },
        }
    }

    #[test]
    fn new_objects_become_creates() {
        let events = diff_snapshots(vec![live("cm1"), live("cm2")], vec![]);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.operation == Operation::Create
            && e.actor.username == RECONCILER_ACTOR
            && e.payload.is_some()));
    }

    #[test]
    fn orphans_become_deletes() {
        let events = diff_snapshots(vec![], vec![id("old")]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].operation, Operation::Delete);
        assert!(events[0].payload.is_none());
    }

    #[test]
    fn intersection_becomes_reconcile_upserts() {
        let events = diff_snapshots(vec![live("cm1"), live("cm2")], vec![id("cm2"), id("cm3")]);
        let by_name: Vec<(String, Operation)> = events
            .iter()
            .map(|e| (e.identifier.name.clone(), e.operation))
            .collect();
        assert!(by_name.contains(&("cm1".into(), Operation::Create)));
        assert!(by_name.contains(&("cm2".into(), Operation::Reconcile)));
        assert!(by_name.contains(&("cm3".into(), Operation::Delete)));
    }

    #[test]
    fn diff_is_deterministic() {
        let a = diff_snapshots(vec![live("b"), live("a")], vec![id("c")]);
        let b = diff_snapshots(vec![live("a"), live("b")], vec![id("c")]);
        let keys =
            |events: &[ResourceEvent]| -> Vec<String> { events.iter().map(|e| e.identifier.key()).collect() };
        assert_eq!(keys(&a), keys(&b));
    }
}
