//! Per-destination buffer and deduplicator in front of the branch worker,
//! coupled to the folder reconciler's state machine: while a startup
//! reconcile is in flight live events accumulate here, afterwards they flow
//! straight through (minus short-horizon duplicates).

use crate::event::{Operation, ResourceEvent};
use crate::git::worker::BranchWorker;
use crate::identity::ResourceReference;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

/// Recent content hashes kept per identifier in live mode.
const DEDUP_HORIZON: usize = 8;

enum StreamMode {
    /// STARTUP_RECONCILE: insertion-ordered buffer with `(identifier,
    /// operation)` dedup, later event wins.
    Buffering {
        buffer: Vec<ResourceEvent>,
        index: HashMap<(String, Operation), usize>,
    },
    /// LIVE_PROCESSING: forward immediately unless the same content was just
    /// seen.
    Live {
        recent: HashMap<String, VecDeque<[u8; 32]>>,
    },
}

impl StreamMode {
    fn buffering() -> Self {
        StreamMode::Buffering {
            buffer: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn live() -> Self {
        StreamMode::Live {
            recent: HashMap::new(),
        }
    }
}

pub struct DestinationStream {
    destination: ResourceReference,
    base_folder: String,
    worker: Arc<BranchWorker>,
    mode: Mutex<StreamMode>,
}

impl DestinationStream {
    /// Streams start buffering; the reconciler flips them live once the
    /// startup diff is on the worker queue.
    pub fn new(
        destination: ResourceReference,
        base_folder: String,
        worker: Arc<BranchWorker>,
    ) -> Arc<Self> {
        Arc::new(DestinationStream {
            destination,
            base_folder,
            worker,
            mode: Mutex::new(StreamMode::buffering()),
        })
    }

    pub fn destination(&self) -> &ResourceReference {
        &self.destination
    }

    pub async fn begin_buffering(&self) {
        *self.mode.lock().await = StreamMode::buffering();
    }

    pub async fn is_live(&self) -> bool {
        matches!(*self.mode.lock().await, StreamMode::Live { .. })
    }

    pub async fn on_watch_event(&self, event: ResourceEvent) {
        let mut mode = self.mode.lock().await;
        match &mut *mode {
            StreamMode::Buffering { buffer, index } => {
                let key = (event.identifier.key(), event.operation);
                match index.get(&key) {
                    Some(&position) => buffer[position] = event,
                    None => {
                        index.insert(key, buffer.len());
                        buffer.push(event);
                    }
                }
            }
            StreamMode::Live { recent } => {
                let hash = event.dedup_hash();
                let seen = recent.entry(event.identifier.key()).or_default();
                if seen.contains(&hash) {
                    debug!(destination = %self.destination, identifier = %event.identifier,
                        "dropping duplicate event");
                    return;
                }
                seen.push_back(hash);
                if seen.len() > DEDUP_HORIZON {
                    seen.pop_front();
                }
                if event.operation == Operation::Delete {
                    recent.remove(&event.identifier.key());
                }
                drop(mode);
                self.worker.enqueue(&self.base_folder, event).await;
            }
        }
    }

    /// Flush the startup buffer in insertion order, then go live.
    pub async fn on_reconciliation_complete(&self) {
        let mut mode = self.mode.lock().await;
        let buffered = match &mut *mode {
            StreamMode::Buffering { buffer, .. } => std::mem::take(buffer),
            StreamMode::Live { .. } => Vec::new(),
        };
        *mode = StreamMode::live();
        drop(mode);
        for event in buffered {
            self.worker.enqueue(&self.base_folder, event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encrypt::EncryptionWriter;
    use crate::event::Actor;
    use crate::git::worker::{BranchWorker, WorkerConfig, WorkerKey};
    use crate::identity::{ResourceIdentifier, ResourceScope};
    use crate::metrics::Metrics;
    use crate::sanitize::SanitizedObject;
    use crate::settings::Settings;

    use http::{Request, Response};
    use kube::client::Body;
    use tokio::sync::mpsc;

    fn test_worker() -> Arc<BranchWorker> {
        // enqueue only touches in-memory state, so the mocked client is
        // never exercised
        let (mock_service, _handle) =
            tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let client = kube::Client::new(mock_service, "default");
        let (signals, _rx) = mpsc::channel(4);
        BranchWorker::new(
            WorkerConfig {
                key: WorkerKey {
                    remote_url: "https://git.example.com/audit.git".into(),
                    branch: "main".into(),
                },
                namespace: "default".into(),
                provider: "git.example.com".into(),
                secret_name: None,
            },
            Arc::new(Settings::default()),
            client,
            Arc::new(EncryptionWriter::default()),
            Arc::new(Metrics::default()),
            signals,
        )
    }

    fn stream_with_worker() -> (Arc<DestinationStream>, Arc<BranchWorker>) {
        let worker = test_worker();
        let stream = DestinationStream::new(
            ResourceReference::new("ns", "dest"),
            "audit".into(),
            worker.clone(),
        );
        (stream, worker)
    }

    fn event(name: &str, operation: Operation, body: &str) -> ResourceEvent {
        ResourceEvent {
            identifier: ResourceIdentifier {
                group: String::new(),
                version: "v1".into(),
                resource: "configmaps".into(),
                scope: ResourceScope::Namespaced,
                namespace: Some("ns-a".into()),
                name: name.into(),
            },
            operation,
            payload: Some(SanitizedObject {
                api_version: "v1".into(),
                kind: "ConfigMap".into(),
                yaml: body.to_string(),
            }),
            actor: Actor::unknown(),
        }
    }

    #[tokio::test]
    async fn buffering_dedups_by_identifier_and_operation_later_wins() {
        let (stream, worker) = stream_with_worker();
        stream.on_watch_event(event("cm1", Operation::Update, "v1")).await;
        stream.on_watch_event(event("cm2", Operation::Update, "v1")).await;
        stream.on_watch_event(event("cm1", Operation::Update, "v2")).await;
        // nothing reaches the worker while buffering
        assert_eq!(worker.queue_depth().await, 0);

        stream.on_reconciliation_complete().await;
        assert!(stream.is_live().await);
        // cm1 deduped to a single (latest) entry, insertion order kept
        assert_eq!(worker.queue_depth().await, 2);
    }

    #[tokio::test]
    async fn distinct_operations_are_not_merged_while_buffering() {
        let (stream, worker) = stream_with_worker();
        stream.on_watch_event(event("cm1", Operation::Create, "v1")).await;
        stream.on_watch_event(event("cm1", Operation::Delete, "v1")).await;
        stream.on_reconciliation_complete().await;
        assert_eq!(worker.queue_depth().await, 2);
    }

    #[tokio::test]
    async fn live_mode_drops_recent_duplicates() {
        let (stream, worker) = stream_with_worker();
        stream.on_reconciliation_complete().await;

        stream.on_watch_event(event("cm1", Operation::Update, "v1")).await;
        stream.on_watch_event(event("cm1", Operation::Update, "v1")).await;
        assert_eq!(worker.queue_depth().await, 1);

        // changed content passes
        stream.on_watch_event(event("cm1", Operation::Update, "v2")).await;
        assert_eq!(worker.queue_depth().await, 2);

        // a delete clears the horizon, so a re-create of identical content passes
        stream.on_watch_event(event("cm1", Operation::Delete, "v2")).await;
        stream.on_watch_event(event("cm1", Operation::Update, "v1")).await;
        assert_eq!(worker.queue_depth().await, 4);
    }

    #[tokio::test]
    async fn restart_returns_to_buffering() {
        let (stream, worker) = stream_with_worker();
        stream.on_reconciliation_complete().await;
        assert!(stream.is_live().await);

        stream.begin_buffering().await;
        assert!(!stream.is_live().await);
        stream.on_watch_event(event("cm1", Operation::Update, "v1")).await;
        assert_eq!(worker.queue_depth().await, 0);
    }
}
