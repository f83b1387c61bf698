//! Single-writer batching committer per `(remote URL, branch)`.
//!
//! All repository access for one remote+branch funnels through one worker
//! and its mutex: commits, pushes, remote syncs and repo-state enumeration
//! are strictly serial, which is the whole correctness argument against
//! concurrent rebase-and-push races. libgit2 work runs under
//! `spawn_blocking` while the mutex stays held.

use crate::encrypt::{
    parse_recipient_config, EncryptionScope, EncryptionWriter, ENCRYPTION_CONFIG_FILE,
};
use crate::error::{Error, Result};
use crate::event::{Operation, ResourceEvent, UNKNOWN_ACTOR};
use crate::git::credentials::GitCredentials;
use crate::git::repository::{
    checkout_dir, Checkout, FileMutation, MutationOp, PushOutcome,
};
use crate::identity::ResourceIdentifier;
use crate::metrics::{Metrics, WorkerLabels};
use crate::settings::Settings;

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const PUSH_ATTEMPTS: usize = 3;
/// Per push or rebase-fetch attempt; enforced inside the transfer via
/// progress-callback cancellation.
const PUSH_ATTEMPT_DEADLINE: Duration = Duration::from_secs(30);
/// Cumulative wall-clock budget for the whole rebase-retry loop.
const REBASE_RETRY_BUDGET: Duration = Duration::from_secs(90);

/// Worker identity; multiple destinations may share one worker when they
/// target the same branch with different base folders.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WorkerKey {
    pub remote_url: String,
    pub branch: String,
}

impl WorkerKey {
    pub fn metric_labels(&self) -> WorkerLabels {
        let digest = Sha256::digest(self.remote_url.as_bytes());
        WorkerLabels {
            repo: hex::encode(&digest[..6]),
            branch: self.branch.clone(),
        }
    }
}

impl fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.metric_labels().repo, self.branch)
    }
}

/// Signals the worker raises towards the router.
#[derive(Clone, Debug)]
pub enum WorkerSignal {
    /// The remote gained commits this worker did not push; owning
    /// destinations should restart reconciliation.
    RemoteChanged(WorkerKey),
}

/// Static wiring resolved from the destination's repo config.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub key: WorkerKey,
    /// Namespace of the repo config; first checkout path segment and the
    /// namespace credentials are resolved in
    pub namespace: String,
    /// Path segment derived from the remote host
    pub provider: String,
    pub secret_name: Option<String>,
}

struct GitTask {
    base_folder: String,
    event: ResourceEvent,
}

#[derive(Default)]
struct WorkerState {
    pending: VecDeque<GitTask>,
    pending_bytes: usize,
    branch_exists: bool,
    repo_initialized: bool,
    last_commit_sha: Option<String>,
    last_fetch: Option<Instant>,
    last_error: Option<String>,
}

pub struct BranchWorker {
    config: WorkerConfig,
    settings: Arc<Settings>,
    client: kube::Client,
    encryptor: Arc<EncryptionWriter>,
    metrics: Arc<Metrics>,
    signals: mpsc::Sender<WorkerSignal>,
    state: Mutex<WorkerState>,
    flush: Notify,
}

impl BranchWorker {
    pub fn new(
        config: WorkerConfig,
        settings: Arc<Settings>,
        client: kube::Client,
        encryptor: Arc<EncryptionWriter>,
        metrics: Arc<Metrics>,
        signals: mpsc::Sender<WorkerSignal>,
    ) -> Arc<Self> {
        Arc::new(BranchWorker {
            config,
            settings,
            client,
            encryptor,
            metrics,
            signals,
            state: Mutex::new(WorkerState::default()),
            flush: Notify::new(),
        })
    }

    pub fn key(&self) -> &WorkerKey {
        &self.config.key
    }

    fn checkout_path(&self) -> PathBuf {
        checkout_dir(
            &self.settings.work_dir,
            &self.config.namespace,
            &self.config.provider,
            &self.config.key.branch,
            &self.config.key.remote_url,
        )
    }

    /// Append one event to the pending batch; fires a flush when the file or
    /// byte threshold is crossed.
    pub async fn enqueue(&self, base_folder: &str, event: ResourceEvent) {
        let mut state = self.state.lock().await;
        state.pending_bytes += event
            .payload
            .as_ref()
            .map(|p| p.yaml.len())
            .unwrap_or_default();
        state.pending.push_back(GitTask {
            base_folder: base_folder.to_string(),
            event,
        });
        let depth = state.pending.len();
        self.metrics
            .git
            .queue_depth_set(&self.config.key.metric_labels(), depth);
        if depth >= self.settings.batch_max_files
            || state.pending_bytes >= self.settings.batch_max_bytes
        {
            self.flush.notify_one();
        }
    }

    /// Walk the checkout and parse the base folder subtree back into
    /// identifiers. Serialized with flushes through the worker mutex.
    pub async fn list_resources_in_base_folder(
        &self,
        base_folder: &str,
    ) -> Result<Vec<ResourceIdentifier>> {
        let _state = self.state.lock().await;
        let creds = self.credentials().await?;
        let path = self.checkout_path();
        let url = self.config.key.remote_url.clone();
        let branch = self.config.key.branch.clone();
        let base = base_folder.to_string();
        task::spawn_blocking(move || {
            let checkout = Checkout::prepare(&path, &url, &branch, &creds)?;
            checkout.list_resources(&base)
        })
        .await
        .map_err(|e| Error::UserInputError(format!("git task aborted: {e}")))?
    }

    pub async fn last_error(&self) -> Option<String> {
        self.state.lock().await.last_error.clone()
    }

    pub async fn queue_depth(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    async fn credentials(&self) -> Result<GitCredentials> {
        GitCredentials::resolve(
            &self.client,
            &self.config.namespace,
            self.config.secret_name.as_deref(),
        )
        .await
    }

    /// Worker loop: flush on demand or after `batch_max_wait`, sync with the
    /// remote periodically, drain on shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut sync_tick = interval(self.settings.remote_sync_interval);
        sync_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick fires immediately; skip it so a fresh worker seeds
        // through reconciliation first
        sync_tick.tick().await;

        info!(worker = %self.config.key, "starting branch worker");
        loop {
            tokio::select! {
                _ = self.flush.notified() => {
                    self.flush_pending().await;
                }
                _ = sleep(self.settings.batch_max_wait) => {
                    self.flush_pending().await;
                }
                _ = sync_tick.tick() => {
                    if let Err(e) = self.sync_with_remote().await {
                        warn!(worker = %self.config.key, error = %e, "remote sync failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(worker = %self.config.key, "draining before shutdown");
                        self.flush_pending().await;
                        break;
                    }
                }
            }
        }
    }

    async fn flush_pending(&self) {
        if let Err(e) = self.commit_and_push().await {
            error!(worker = %self.config.key, error = %e, "flush failed, retaining events");
        }
    }

    /// One flush: re-resolve credentials, prepare the checkout, resolve
    /// events into file mutations, commit and push with the rebase-on-
    /// conflict policy. Pending events survive every failure path.
    pub async fn commit_and_push(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.pending.is_empty() {
            return Ok(());
        }

        let creds = match self.credentials().await {
            Ok(creds) => creds,
            Err(e) => {
                state.last_error = Some(e.to_string());
                return Err(e);
            }
        };

        let tasks: Vec<GitTask> = state.pending.drain(..).collect();
        state.pending_bytes = 0;

        let job = FlushJob {
            path: self.checkout_path(),
            url: self.config.key.remote_url.clone(),
            branch: self.config.key.branch.clone(),
            work_dir: self.settings.work_dir.clone(),
            trailers: self.trailers(),
            creds,
            tasks,
            encryptor: self.encryptor.clone(),
        };
        let report = task::spawn_blocking(move || run_flush(job))
            .await
            .map_err(|e| Error::UserInputError(format!("git task aborted: {e}")))?;

        state.repo_initialized = true;
        state.branch_exists = report.branch_exists || report.commit_sha.is_some();
        if let Some(sha) = &report.commit_sha {
            state.last_commit_sha = Some(sha.clone());
        }

        for task in report.retained.into_iter().rev() {
            state.pending_bytes += task
                .event
                .payload
                .as_ref()
                .map(|p| p.yaml.len())
                .unwrap_or_default();
            state.pending.push_front(task);
        }
        self.metrics
            .git
            .queue_depth_set(&self.config.key.metric_labels(), state.pending.len());

        self.metrics.git.rebase_retries.inc_by(report.rebase_retries);
        if report.commit_sha.is_some() {
            self.metrics.git.commits.inc();
            self.metrics.git.objects_written.inc_by(report.written as u64);
            self.metrics.git.files_deleted.inc_by(report.deleted as u64);
            self.metrics.git.commit_bytes.inc_by(report.bytes as u64);
        }

        match report.error {
            Some(message) => {
                if report.push_exhausted {
                    self.metrics.git.push_failures.inc();
                }
                state.last_error = Some(message.clone());
                Err(Error::UserInputError(message))
            }
            None => {
                state.last_error = None;
                if let Some(sha) = report.commit_sha {
                    info!(worker = %self.config.key, commit = %sha, written = report.written,
                        deleted = report.deleted, "pushed");
                }
                Ok(())
            }
        }
    }

    /// Periodic fetch; external commits reset the checkout to the remote tip
    /// and ask owning destinations to reconcile from scratch.
    pub async fn sync_with_remote(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.repo_initialized {
            return Ok(());
        }
        let creds = self.credentials().await?;
        let path = self.checkout_path();
        let url = self.config.key.remote_url.clone();
        let branch = self.config.key.branch.clone();
        let remote_tip = task::spawn_blocking(move || -> Result<Option<String>> {
            let checkout = Checkout::prepare(&path, &url, &branch, &creds)?;
            let tip = checkout.fetch(&creds, PUSH_ATTEMPT_DEADLINE)?;
            if tip.is_some() && tip != checkout.head_sha() {
                checkout.reset_to_remote()?;
            }
            Ok(tip)
        })
        .await
        .map_err(|e| Error::UserInputError(format!("git task aborted: {e}")))??;

        state.last_fetch = Some(Instant::now());
        let changed = remote_tip.is_some() && remote_tip != state.last_commit_sha;
        if let Some(tip) = remote_tip {
            state.last_commit_sha = Some(tip);
        }
        if changed {
            debug!(worker = %self.config.key, "remote changed externally");
            let _ = self
                .signals
                .send(WorkerSignal::RemoteChanged(self.config.key.clone()))
                .await;
        }
        Ok(())
    }

    fn trailers(&self) -> String {
        format!(
            "X-ConfigButler-ClusterUID: {}\nX-ConfigButler-ControllerNS: {}\nX-ConfigButler-ControllerName: {}\nX-ConfigButler-InstanceID: {}",
            self.settings.cluster_uid,
            self.settings.controller_namespace,
            self.settings.controller_name,
            self.settings.instance_id,
        )
    }
}

struct FlushJob {
    path: PathBuf,
    url: String,
    branch: String,
    work_dir: PathBuf,
    trailers: String,
    creds: GitCredentials,
    tasks: Vec<GitTask>,
    encryptor: Arc<EncryptionWriter>,
}

#[derive(Default)]
struct FlushReport {
    commit_sha: Option<String>,
    branch_exists: bool,
    written: usize,
    deleted: usize,
    bytes: usize,
    rebase_retries: u64,
    push_exhausted: bool,
    /// Events to put back at the front of the queue
    retained: Vec<GitTask>,
    error: Option<String>,
}

/// The blocking half of a flush. Never panics on git failures; everything is
/// reported so the async side can retain events.
fn run_flush(mut job: FlushJob) -> FlushReport {
    let mut report = FlushReport::default();

    let checkout = match Checkout::prepare(&job.path, &job.url, &job.branch, &job.creds) {
        Ok(checkout) => checkout,
        Err(e) => {
            report.error = Some(format!("prepare checkout: {e}"));
            report.retained = job.tasks;
            return report;
        }
    };
    report.branch_exists = checkout.branch_exists();

    // Resolve events into mutations; encrypted kinds need the destination's
    // recipient declaration from the checkout.
    let (mutations, tasks, held, hold_error) =
        match resolve_mutations(&checkout, &job.encryptor, &job.work_dir, &job.url, job.tasks) {
            Ok(resolved) => resolved,
            Err((tasks, e)) => {
                report.error = Some(e.to_string());
                report.retained = tasks;
                return report;
            }
        };
    job.tasks = tasks;
    if let Some(e) = hold_error {
        report.error = Some(e);
    }
    report.retained = held;

    if mutations.is_empty() {
        return report;
    }

    let message = commit_message(&job.tasks, &job.trailers);
    let (author_name, author_email) = commit_author(&job.tasks);

    let flush_started = std::time::Instant::now();
    for attempt in 0..PUSH_ATTEMPTS {
        if attempt > 0 && flush_started.elapsed() >= REBASE_RETRY_BUDGET {
            break;
        }
        let changes = match checkout.apply(&mutations) {
            Ok(changes) => changes,
            Err(e) => {
                report.error = Some(format!("apply mutations: {e}"));
                report.retained.extend(job.tasks);
                return report;
            }
        };
        if changes.is_empty() && attempt == 0 && checkout.unpushed_head().is_none() {
            // everything byte-equal and nothing stranded: drop the batch
            return report;
        }

        let committed = match checkout.commit(&message, &author_name, &author_email) {
            Ok(committed) => committed,
            Err(e) => {
                report.error = Some(format!("commit: {e}"));
                report.retained.extend(job.tasks);
                return report;
            }
        };
        let sha = match committed {
            Some(sha) => sha,
            // tree unchanged: either the rebase already contained our
            // changes, or an earlier flush committed but never pushed
            None => match checkout.unpushed_head() {
                Some(sha) => sha,
                None => return report,
            },
        };

        match checkout.push(&job.creds, PUSH_ATTEMPT_DEADLINE) {
            Ok(PushOutcome::Pushed) => {
                report.commit_sha = Some(sha);
                report.written = changes.written;
                report.deleted = changes.deleted;
                report.bytes = changes.bytes;
                return report;
            }
            Ok(PushOutcome::Rejected(reason)) => {
                report.rebase_retries += 1;
                debug!(reason = %reason, attempt, "push rejected, rebasing onto remote tip");
                if let Err(e) = checkout
                    .fetch(&job.creds, PUSH_ATTEMPT_DEADLINE)
                    .and_then(|_| checkout.reset_to_remote())
                {
                    report.error = Some(format!("rebase fetch/reset: {e}"));
                    report.retained.extend(job.tasks);
                    return report;
                }
                // loop replays the same ordered mutations against the new base
            }
            Err(e) => {
                report.error = Some(format!("push: {e}"));
                report.retained.extend(job.tasks);
                return report;
            }
        }
    }

    report.push_exhausted = true;
    report.error = Some(format!(
        "push to {} not accepted within {PUSH_ATTEMPTS} attempts or {}s, giving up until next flush",
        job.branch,
        REBASE_RETRY_BUDGET.as_secs()
    ));
    report.retained.extend(job.tasks);
    report
}

type ResolvedMutations = (Vec<FileMutation>, Vec<GitTask>, Vec<GitTask>, Option<String>);

/// Turn events into file mutations. Events for encrypted kinds whose base
/// folder lacks a recipient config are split off (held) with the error that
/// belongs on the destination status.
fn resolve_mutations(
    checkout: &Checkout,
    encryptor: &EncryptionWriter,
    work_dir: &std::path::Path,
    url: &str,
    tasks: Vec<GitTask>,
) -> std::result::Result<ResolvedMutations, (Vec<GitTask>, Error)> {
    let mut recipients_by_folder: HashMap<String, Result<crate::encrypt::RecipientSet>> =
        HashMap::new();
    let mut mutations = Vec::new();
    let mut kept = Vec::new();
    let mut held = Vec::new();
    let mut hold_error = None;

    let mut queue = tasks.into_iter();
    while let Some(task) = queue.next() {
        let path = task.event.identifier.repo_path(&task.base_folder);
        match (task.event.operation, &task.event.payload) {
            (Operation::Delete, _) => {
                mutations.push(FileMutation {
                    path,
                    op: MutationOp::Delete,
                });
                kept.push(task);
            }
            (_, Some(payload)) => {
                let bytes = if encryptor.should_encrypt(&payload.kind) {
                    let recipients = recipients_by_folder
                        .entry(task.base_folder.clone())
                        .or_insert_with(|| load_recipients(checkout, &task.base_folder));
                    match recipients {
                        Ok(set) => {
                            let scope = EncryptionScope {
                                provider_identity: url.to_string(),
                                work_dir: work_dir.to_path_buf(),
                                recipients: set.recipients().to_vec(),
                                identities: Vec::new(),
                            };
                            match encryptor.encrypt(&scope, payload.yaml.as_bytes()) {
                                Ok(bytes) => bytes,
                                Err(e) => return Err((restore(kept, held, task, queue), e)),
                            }
                        }
                        Err(e) => {
                            hold_error = Some(e.to_string());
                            held.push(task);
                            continue;
                        }
                    }
                } else {
                    payload.yaml.clone().into_bytes()
                };
                mutations.push(FileMutation {
                    path,
                    op: MutationOp::Write(bytes),
                });
                kept.push(task);
            }
            (op, None) => {
                warn!(identifier = %task.event.identifier, operation = %op,
                    "dropping event without payload");
            }
        }
    }
    Ok((mutations, kept, held, hold_error))
}

fn restore(
    kept: Vec<GitTask>,
    held: Vec<GitTask>,
    current: GitTask,
    rest: std::vec::IntoIter<GitTask>,
) -> Vec<GitTask> {
    let mut all = kept;
    all.push(current);
    all.extend(rest);
    all.extend(held);
    all
}

fn load_recipients(
    checkout: &Checkout,
    base_folder: &str,
) -> Result<crate::encrypt::RecipientSet> {
    let config_path = PathBuf::from(base_folder).join(ENCRYPTION_CONFIG_FILE);
    match checkout.read_file(&config_path)? {
        Some(bytes) => parse_recipient_config(base_folder, &bytes),
        None => Err(Error::MissingEncryptionConfig(base_folder.to_string())),
    }
}

fn commit_message(tasks: &[GitTask], trailers: &str) -> String {
    let mut message = match tasks {
        [single] => format!("{} {}", single.event.operation, single.event.identifier),
        batch => {
            let mut lines = format!("sync {} resources\n", batch.len());
            for task in batch {
                lines.push_str(&format!(
                    "\n{} {}",
                    task.event.operation, task.event.identifier
                ));
            }
            lines
        }
    };
    message.push_str("\n\n");
    message.push_str(trailers);
    message
}

/// Author from correlation: the single distinct correlated username if there
/// is exactly one, the fallback otherwise.
fn commit_author(tasks: &[GitTask]) -> (String, String) {
    let users: BTreeSet<&str> = tasks
        .iter()
        .map(|t| t.event.actor.username.as_str())
        .filter(|u| !u.is_empty() && *u != UNKNOWN_ACTOR)
        .collect();
    let name = match users.len() {
        1 => users.into_iter().next().unwrap_or(UNKNOWN_ACTOR).to_string(),
        _ => UNKNOWN_ACTOR.to_string(),
    };
    let email = if name.contains('@') {
        name.clone()
    } else {
        format!("{name}@configbutler")
    };
    (name, email)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Actor;
    use crate::identity::{ResourceIdentifier, ResourceScope};
    use crate::sanitize::SanitizedObject;

    use std::path::Path;

    use git2::Repository;
    use tempfile::TempDir;

    fn identifier(resource: &str, name: &str) -> ResourceIdentifier {
        ResourceIdentifier {
            group: String::new(),
            version: "v1".into(),
            resource: resource.into(),
            scope: ResourceScope::Namespaced,
            namespace: Some("ns-a".into()),
            name: name.into(),
        }
    }

    fn task(kind: &str, resource: &str, name: &str, actor: &str, yaml: &str) -> GitTask {
        GitTask {
            base_folder: "audit".into(),
            event: ResourceEvent {
                identifier: identifier(resource, name),
                operation: Operation::Update,
                payload: Some(SanitizedObject {
                    api_version: "v1".into(),
                    kind: kind.into(),
                    yaml: yaml.to_string(),
                }),
                actor: Actor {
                    username: actor.to_string(),
                    uid: String::new(),
                },
            },
        }
    }

    fn job(tmp: &TempDir, url: &str, tasks: Vec<GitTask>) -> FlushJob {
        FlushJob {
            path: tmp.path().join("checkout"),
            url: url.to_string(),
            branch: "main".into(),
            work_dir: tmp.path().to_path_buf(),
            trailers: "X-ConfigButler-ClusterUID: uid-1\nX-ConfigButler-ControllerNS: cb\nX-ConfigButler-ControllerName: configbutler\nX-ConfigButler-InstanceID: i-1".into(),
            creds: GitCredentials::Anonymous,
            tasks,
            encryptor: Arc::new(EncryptionWriter::default()),
        }
    }

    fn bare_remote(tmp: &TempDir) -> String {
        let path = tmp.path().join("remote.git");
        Repository::init_bare(&path).unwrap();
        path.to_string_lossy().to_string()
    }

    fn head_commit(remote: &str) -> git2::Oid {
        Repository::open_bare(remote)
            .unwrap()
            .find_reference("refs/heads/main")
            .unwrap()
            .target()
            .unwrap()
    }

    #[test]
    fn flush_commits_with_correlated_author_and_trailers() {
        let tmp = TempDir::new().unwrap();
        let url = bare_remote(&tmp);
        let report = run_flush(job(
            &tmp,
            &url,
            vec![task("ConfigMap", "configmaps", "cm1", "jane@acme.com", "data: x\n")],
        ));
        assert!(report.error.is_none(), "{:?}", report.error);
        assert!(report.retained.is_empty());
        assert_eq!(report.written, 1);

        let repo = Repository::open_bare(&url).unwrap();
        let commit = repo.find_commit(head_commit(&url)).unwrap();
        assert_eq!(commit.author().name(), Some("jane@acme.com"));
        assert_eq!(commit.author().email(), Some("jane@acme.com"));
        let message = commit.message().unwrap();
        assert!(message.starts_with("UPDATE /v1/configmaps/ns-a/cm1"));
        assert!(message.contains("X-ConfigButler-ClusterUID: uid-1"));
        assert!(message.contains("X-ConfigButler-InstanceID: i-1"));
    }

    #[test]
    fn mixed_actors_fall_back_to_unknown() {
        let tmp = TempDir::new().unwrap();
        let url = bare_remote(&tmp);
        let report = run_flush(job(
            &tmp,
            &url,
            vec![
                task("ConfigMap", "configmaps", "a", "jane@acme.com", "data: a\n"),
                task("ConfigMap", "configmaps", "b", "sam@acme.com", "data: b\n"),
            ],
        ));
        assert!(report.error.is_none());

        let repo = Repository::open_bare(&url).unwrap();
        let commit = repo.find_commit(head_commit(&url)).unwrap();
        assert_eq!(commit.author().name(), Some(UNKNOWN_ACTOR));
        // batch summary subject plus one line per event
        let message = commit.message().unwrap();
        assert!(message.starts_with("sync 2 resources"));
        assert!(message.contains("UPDATE /v1/configmaps/ns-a/a"));
        assert!(message.contains("UPDATE /v1/configmaps/ns-a/b"));
    }

    #[test]
    fn identical_payload_flushed_twice_produces_one_commit() {
        let tmp = TempDir::new().unwrap();
        let url = bare_remote(&tmp);
        let first = run_flush(job(
            &tmp,
            &url,
            vec![task("ConfigMap", "configmaps", "cm1", "jane@acme.com", "data: x\n")],
        ));
        let sha = first.commit_sha.clone().unwrap();

        let second = run_flush(job(
            &tmp,
            &url,
            vec![task("ConfigMap", "configmaps", "cm1", "jane@acme.com", "data: x\n")],
        ));
        assert!(second.commit_sha.is_none());
        assert!(second.error.is_none());
        assert_eq!(head_commit(&url).to_string(), sha);
    }

    #[test]
    fn secrets_without_recipient_config_are_held_not_written() {
        let tmp = TempDir::new().unwrap();
        let url = bare_remote(&tmp);
        let report = run_flush(job(
            &tmp,
            &url,
            vec![task("Secret", "secrets", "s1", "jane@acme.com", "data:\n  k: dg==\n")],
        ));
        assert_eq!(report.retained.len(), 1);
        let error = report.error.unwrap();
        assert!(error.contains("audit/.sops.yaml"), "{error}");
        // nothing committed, nothing on disk in clear
        assert!(Repository::open_bare(&url)
            .unwrap()
            .find_reference("refs/heads/main")
            .is_err());
    }

    #[test]
    fn secrets_are_committed_as_envelopes() {
        let tmp = TempDir::new().unwrap();
        let url = bare_remote(&tmp);
        let identity = age::x25519::Identity::generate();
        let recipient = identity.to_public().to_string();

        // seed the recipient declaration, as an operator would
        let seeded = run_flush(job(
            &tmp,
            &url,
            vec![task("ConfigMap", "configmaps", "seed", "ops@acme.com", "data: x\n")],
        ));
        assert!(seeded.error.is_none());
        let checkout = tmp.path().join("checkout");
        std::fs::write(
            checkout.join("audit/.sops.yaml"),
            format!("creation_rules:\n  - age: \"{recipient}\"\n"),
        )
        .unwrap();
        let config_commit = run_flush(job(
            &tmp,
            &url,
            vec![task("ConfigMap", "configmaps", "seed2", "ops@acme.com", "data: y\n")],
        ));
        assert!(config_commit.error.is_none());

        let secret_yaml = "apiVersion: v1\nkind: Secret\nmetadata:\n  name: s1\ndata:\n  k: dg==\n";
        let report = run_flush(job(
            &tmp,
            &url,
            vec![task("Secret", "secrets", "s1", "jane@acme.com", secret_yaml)],
        ));
        assert!(report.error.is_none(), "{:?}", report.error);

        let committed =
            std::fs::read(checkout.join("audit/v1/secrets/ns-a/s1.yaml")).unwrap();
        let envelope = crate::encrypt::Envelope::parse(&committed).unwrap();
        assert_eq!(envelope.recipients, vec![recipient]);
        assert!(!String::from_utf8_lossy(&committed).contains("dg=="));
        assert!(envelope.data.contains("BEGIN AGE ENCRYPTED FILE"));
    }

    #[test]
    fn worker_checkout_paths_depend_on_remote_url() {
        let a = checkout_dir(
            Path::new("/work"),
            "ns",
            "github.com",
            "main",
            "https://github.com/org/a.git",
        );
        let b = checkout_dir(
            Path::new("/work"),
            "ns",
            "github.com",
            "main",
            "https://github.com/org/b.git",
        );
        assert_ne!(a, b);
    }
}
