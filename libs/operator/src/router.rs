//! Orchestrator between the watch plane, per-destination pipelines and
//! branch workers.
//!
//! Workers are keyed by `(remote URL, branch)` rather than by destination:
//! destinations sharing a branch share the worker and own disjoint base
//! folder subtrees (uniqueness is enforced at registration). Control events
//! from reconcilers are serviced here by calling back into the watch manager
//! and the branch workers.

use crate::encrypt::EncryptionWriter;
use crate::error::{Error, Result};
use crate::event::ResourceEvent;
use crate::git::repository::provider_segment;
use crate::git::worker::{BranchWorker, WorkerConfig, WorkerKey, WorkerSignal};
use crate::identity::ResourceReference;
use crate::metrics::Metrics;
use crate::reconcile::{ControlEvent, FolderReconciler};
use crate::settings::Settings;
use crate::stream::DestinationStream;
use crate::watch::WatchManager;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const CONTROL_BUFFER: usize = 64;
const SIGNAL_BUFFER: usize = 16;
/// Delay before re-requesting a snapshot that failed to materialize.
const SNAPSHOT_RETRY: Duration = Duration::from_secs(5);

/// Everything a destination needs to reach its repo, resolved from the CRDs
/// by the destination controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DestinationBinding {
    pub destination: ResourceReference,
    pub remote_url: String,
    pub branch: String,
    pub base_folder: String,
    /// Namespace of the repo config; credentials live there
    pub repo_namespace: String,
    pub secret_name: Option<String>,
}

impl DestinationBinding {
    pub fn worker_key(&self) -> WorkerKey {
        WorkerKey {
            remote_url: self.remote_url.clone(),
            branch: self.branch.clone(),
        }
    }
}

struct Pipeline {
    binding: DestinationBinding,
    stream: Arc<DestinationStream>,
    reconciler: Arc<FolderReconciler>,
    worker: Arc<BranchWorker>,
}

struct WorkerEntry {
    worker: Arc<BranchWorker>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct RouterState {
    pipelines: HashMap<String, Pipeline>,
    workers: HashMap<WorkerKey, WorkerEntry>,
}

pub struct EventRouter {
    client: kube::Client,
    settings: Arc<Settings>,
    metrics: Arc<Metrics>,
    encryptor: Arc<EncryptionWriter>,
    control_tx: mpsc::Sender<ControlEvent>,
    signal_tx: mpsc::Sender<WorkerSignal>,
    state: Mutex<RouterState>,
    watch_manager: OnceLock<Arc<WatchManager>>,
}

/// Receiving halves of the router's channels, consumed by [`EventRouter::run`].
pub struct RouterChannels {
    control_rx: mpsc::Receiver<ControlEvent>,
    signal_rx: mpsc::Receiver<WorkerSignal>,
}

impl EventRouter {
    pub fn new(
        client: kube::Client,
        settings: Arc<Settings>,
        metrics: Arc<Metrics>,
        encryptor: Arc<EncryptionWriter>,
    ) -> (Arc<Self>, RouterChannels) {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_BUFFER);
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_BUFFER);
        let router = Arc::new(EventRouter {
            client,
            settings,
            metrics,
            encryptor,
            control_tx,
            signal_tx,
            state: Mutex::new(RouterState::default()),
            watch_manager: OnceLock::new(),
        });
        (router, RouterChannels { control_rx, signal_rx })
    }

    /// Wire the watch manager after construction; the two reference each
    /// other, so one side has to come late.
    pub fn set_watch_manager(&self, watch_manager: Arc<WatchManager>) {
        let _ = self.watch_manager.set(watch_manager);
    }

    /// Route one enriched event to a destination's stream.
    pub async fn dispatch(&self, destination: &ResourceReference, event: ResourceEvent) {
        let stream = {
            let state = self.state.lock().await;
            state
                .pipelines
                .get(&destination.key())
                .map(|pipeline| pipeline.stream.clone())
        };
        match stream {
            Some(stream) => stream.on_watch_event(event).await,
            None => debug!(destination = %destination,
                "event for unregistered destination dropped"),
        }
    }

    /// Create (or re-create after a binding change) the pipeline for a
    /// destination and kick off its startup reconcile.
    pub async fn register_destination(&self, binding: DestinationBinding) -> Result<()> {
        let key = binding.destination.key();
        let mut state = self.state.lock().await;

        if let Some(existing) = state.pipelines.get(&key) {
            if existing.binding == binding {
                return Ok(());
            }
            // binding changed (URL, branch or folder): tear down and rebuild
            self.remove_pipeline_locked(&mut state, &key).await;
        }

        let worker_key = binding.worker_key();
        let worker = match state.workers.get(&worker_key) {
            Some(entry) => entry.worker.clone(),
            None => {
                let worker = BranchWorker::new(
                    WorkerConfig {
                        key: worker_key.clone(),
                        namespace: binding.repo_namespace.clone(),
                        provider: provider_segment(&binding.remote_url),
                        secret_name: binding.secret_name.clone(),
                    },
                    self.settings.clone(),
                    self.client.clone(),
                    self.encryptor.clone(),
                    self.metrics.clone(),
                    self.signal_tx.clone(),
                );
                let (shutdown_tx, shutdown_rx) = watch::channel(false);
                let handle = tokio::spawn(worker.clone().run(shutdown_rx));
                state.workers.insert(
                    worker_key.clone(),
                    WorkerEntry {
                        worker: worker.clone(),
                        shutdown: shutdown_tx,
                        handle,
                    },
                );
                worker
            }
        };

        let stream = DestinationStream::new(
            binding.destination.clone(),
            binding.base_folder.clone(),
            worker.clone(),
        );
        let reconciler = FolderReconciler::new(
            binding.destination.clone(),
            binding.base_folder.clone(),
            stream.clone(),
            worker.clone(),
            self.control_tx.clone(),
            self.metrics.clone(),
        );
        info!(destination = %binding.destination, worker = %worker_key,
            folder = %binding.base_folder, "registered destination");
        state.pipelines.insert(
            key,
            Pipeline {
                binding,
                stream,
                reconciler: reconciler.clone(),
                worker,
            },
        );
        drop(state);

        reconciler.start_reconciliation().await;
        Ok(())
    }

    pub async fn remove_destination(&self, destination: &ResourceReference) {
        let mut state = self.state.lock().await;
        self.remove_pipeline_locked(&mut state, &destination.key()).await;
    }

    async fn remove_pipeline_locked(&self, state: &mut RouterState, key: &str) {
        let Some(pipeline) = state.pipelines.remove(key) else {
            return;
        };
        let worker_key = pipeline.binding.worker_key();
        let still_used = state
            .pipelines
            .values()
            .any(|p| p.binding.worker_key() == worker_key);
        if !still_used {
            if let Some(entry) = state.workers.remove(&worker_key) {
                info!(worker = %worker_key, "stopping branch worker");
                // drain-and-exit; the worker flushes pending events first
                let _ = entry.shutdown.send(true);
                tokio::spawn(async move {
                    let _ = entry.handle.await;
                });
            }
        }
    }

    /// Restart startup reconciliation for every registered destination.
    /// Rule changes can widen or narrow any destination's selection, so all
    /// of them re-seed; the diff is cheap when nothing changed.
    pub async fn restart_all_reconciliation(&self) {
        let reconcilers: Vec<Arc<FolderReconciler>> = {
            let state = self.state.lock().await;
            state
                .pipelines
                .values()
                .map(|p| p.reconciler.clone())
                .collect()
        };
        for reconciler in reconcilers {
            reconciler.start_reconciliation().await;
        }
    }

    /// Restart reconciliation for the destinations fed by one worker, after
    /// its remote gained external commits.
    async fn restart_for_worker(&self, worker_key: &WorkerKey) {
        let reconcilers: Vec<Arc<FolderReconciler>> = {
            let state = self.state.lock().await;
            state
                .pipelines
                .values()
                .filter(|p| p.binding.worker_key() == *worker_key)
                .map(|p| p.reconciler.clone())
                .collect()
        };
        for reconciler in reconcilers {
            reconciler.start_reconciliation().await;
        }
    }

    /// Worker-surfaced error for a destination, if any; the destination
    /// controller copies this onto the CRD status.
    pub async fn destination_error(&self, destination: &ResourceReference) -> Option<String> {
        let worker = {
            let state = self.state.lock().await;
            state
                .pipelines
                .get(&destination.key())
                .map(|p| p.worker.clone())
        };
        match worker {
            Some(worker) => worker.last_error().await,
            None => None,
        }
    }

    pub async fn destination_phase(&self, destination: &ResourceReference) -> Option<&'static str> {
        let reconciler = {
            let state = self.state.lock().await;
            state
                .pipelines
                .get(&destination.key())
                .map(|p| p.reconciler.clone())
        };
        match reconciler {
            Some(reconciler) => Some(reconciler.phase_name().await),
            None => None,
        }
    }

    /// Service control events and worker signals until shutdown.
    pub async fn run(self: Arc<Self>, channels: RouterChannels, mut shutdown: watch::Receiver<bool>) {
        let RouterChannels {
            mut control_rx,
            mut signal_rx,
        } = channels;
        loop {
            tokio::select! {
                event = control_rx.recv() => match event {
                    Some(event) => self.service_control_event(event).await,
                    None => break,
                },
                signal = signal_rx.recv() => match signal {
                    Some(WorkerSignal::RemoteChanged(key)) => {
                        info!(worker = %key, "remote changed externally, restarting reconciliation");
                        self.restart_for_worker(&key).await;
                    }
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.shutdown_all().await;
    }

    async fn service_control_event(self: &Arc<Self>, event: ControlEvent) {
        match event {
            ControlEvent::RequestClusterState(destination) => {
                let Some(watch_manager) = self.watch_manager.get().cloned() else {
                    warn!("cluster state requested before the watch manager was wired");
                    return;
                };
                let Some(reconciler) = self.reconciler_for(&destination).await else {
                    return;
                };
                let router = self.clone();
                tokio::spawn(async move {
                    match watch_manager.cluster_state_for_destination(&destination).await {
                        Ok(snapshot) => reconciler.on_cluster_state(snapshot).await,
                        Err(e) => {
                            error!(destination = %destination, error = %e,
                                "cluster state enumeration failed, retrying");
                            router.retry_control(ControlEvent::RequestClusterState(destination));
                        }
                    }
                });
            }
            ControlEvent::RequestRepoState(destination) => {
                let (Some(reconciler), Some((worker, base_folder))) = (
                    self.reconciler_for(&destination).await,
                    self.worker_for(&destination).await,
                ) else {
                    return;
                };
                let router = self.clone();
                tokio::spawn(async move {
                    match worker.list_resources_in_base_folder(&base_folder).await {
                        Ok(snapshot) => reconciler.on_repo_state(snapshot).await,
                        Err(e) => {
                            error!(destination = %destination, error = %e,
                                "repo state enumeration failed, retrying");
                            router.retry_control(ControlEvent::RequestRepoState(destination));
                        }
                    }
                });
            }
        }
    }

    fn retry_control(self: &Arc<Self>, event: ControlEvent) {
        let control = self.control_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(SNAPSHOT_RETRY).await;
            let _ = control.send(event).await;
        });
    }

    async fn reconciler_for(&self, destination: &ResourceReference) -> Option<Arc<FolderReconciler>> {
        let state = self.state.lock().await;
        state
            .pipelines
            .get(&destination.key())
            .map(|p| p.reconciler.clone())
    }

    async fn worker_for(
        &self,
        destination: &ResourceReference,
    ) -> Option<(Arc<BranchWorker>, String)> {
        let state = self.state.lock().await;
        state
            .pipelines
            .get(&destination.key())
            .map(|p| (p.worker.clone(), p.binding.base_folder.clone()))
    }

    /// Drain every worker with a bounded deadline.
    pub async fn shutdown_all(&self) {
        let mut state = self.state.lock().await;
        state.pipelines.clear();
        let workers: Vec<WorkerEntry> = state.workers.drain().map(|(_, entry)| entry).collect();
        drop(state);
        for entry in workers {
            let _ = entry.shutdown.send(true);
            if tokio::time::timeout(Duration::from_secs(30), entry.handle)
                .await
                .is_err()
            {
                warn!("branch worker did not drain within the shutdown deadline");
            }
        }
    }

    /// Uniqueness probe used by the destination controller: is another
    /// registered destination already bound to this `(URL, branch, folder)`?
    pub async fn conflicting_binding(&self, binding: &DestinationBinding) -> Option<ResourceReference> {
        let state = self.state.lock().await;
        state
            .pipelines
            .values()
            .find(|p| {
                p.binding.destination != binding.destination
                    && p.binding.remote_url == binding.remote_url
                    && p.binding.branch == binding.branch
                    && p.binding.base_folder == binding.base_folder
            })
            .map(|p| p.binding.destination.clone())
    }
}

/// Convenience for callers that only need an error type.
impl EventRouter {
    pub async fn require_registered(&self, destination: &ResourceReference) -> Result<()> {
        let state = self.state.lock().await;
        if state.pipelines.contains_key(&destination.key()) {
            Ok(())
        } else {
            Err(Error::UserInputError(format!(
                "destination {destination} is not registered"
            )))
        }
    }
}
