//! Discovery-aware list+watch over an open set of resource kinds.
//!
//! The manager reconciles the set of running dynamic informers against the
//! rule store whenever rules change and on a periodic discovery refresh.
//! Each watch event is sanitized, enriched with the admission-captured actor
//! (content-hash correlation) and fanned out to every matching destination
//! through the router. It also answers the synchronous "what does the
//! cluster hold for this destination" question reconcilers ask at startup.

use crate::correlation::{CorrelationIndex, CorrelationKey};
use crate::error::{Error, Result};
use crate::event::{Actor, ClusterObject, Operation, ResourceEvent};
use crate::identity::{ResourceIdentifier, ResourceReference, ResourceScope};
use crate::metrics::Metrics;
use crate::router::EventRouter;
use crate::rules::{NamespaceLabels, RuleStore};
use crate::sanitize::sanitize;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DynamicObject, ListParams};
use kube::discovery::{verbs, ApiCapabilities, ApiResource, Scope};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Discovery, ResourceExt};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const WATCH_BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const WATCH_BACKOFF_MAX: Duration = Duration::from_secs(30);
const LIST_PAGE_SIZE: u32 = 500;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GvrKey {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl fmt::Display for GvrKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.resource)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

#[derive(Clone)]
struct DiscoveredGvr {
    key: GvrKey,
    resource: ApiResource,
    scope: ResourceScope,
}

struct InformerHandle {
    task: JoinHandle<()>,
}

pub struct WatchManager {
    client: Client,
    rules: Arc<RuleStore>,
    correlation: Arc<CorrelationIndex>,
    router: Arc<EventRouter>,
    metrics: Arc<Metrics>,
    discovery_refresh: Duration,
    informers: Mutex<HashMap<GvrKey, InformerHandle>>,
}

impl WatchManager {
    pub fn new(
        client: Client,
        rules: Arc<RuleStore>,
        correlation: Arc<CorrelationIndex>,
        router: Arc<EventRouter>,
        metrics: Arc<Metrics>,
        discovery_refresh: Duration,
    ) -> Arc<Self> {
        Arc::new(WatchManager {
            client,
            rules,
            correlation,
            router,
            metrics,
            discovery_refresh,
            informers: Mutex::new(HashMap::new()),
        })
    }

    /// Initial informer bring-up plus the periodic discovery refresh loop.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.reconcile_for_rule_change(false).await {
            error!(error = %e, "initial watch reconciliation failed");
        }
        let mut tick = interval(self.discovery_refresh);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    debug!("periodic discovery refresh");
                    if let Err(e) = self.reconcile_for_rule_change(false).await {
                        warn!(error = %e, "discovery refresh failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        let mut informers = self.informers.lock().await;
        for (_, handle) in informers.drain() {
            handle.task.abort();
        }
        self.metrics.watch.active_informers.set(0);
    }

    /// Intersect the rule store's requested GVRs with what the API surface
    /// actually serves (list+watch capable, scope consistent).
    async fn filter_discoverable(&self) -> Result<Vec<DiscoveredGvr>> {
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(Error::KubeError)?;
        let requested = self.rules.requested_gvrs();
        let mut desired = Vec::new();
        for group in discovery.groups() {
            for version in group.versions() {
                for (resource, capabilities) in group.versioned_resources(&version) {
                    if resource.plural.contains('/') {
                        continue;
                    }
                    if !capabilities.supports_operation(verbs::LIST)
                        || !capabilities.supports_operation(verbs::WATCH)
                    {
                        continue;
                    }
                    let scope = scope_of(&capabilities);
                    let accepted = requested.iter().any(|request| {
                        request.accepts(&resource.group, &resource.version, &resource.plural, scope)
                    });
                    if accepted {
                        desired.push(DiscoveredGvr {
                            key: GvrKey {
                                group: resource.group.clone(),
                                version: resource.version.clone(),
                                resource: resource.plural.clone(),
                            },
                            resource,
                            scope,
                        });
                    }
                }
            }
        }
        Ok(desired)
    }

    /// Diff desired informers against running ones: start added, cancel
    /// removed, then trigger a background re-seed. `force_reseed` is set by
    /// the rule controllers (a rule edit can change matching without
    /// changing the informer set); the periodic refresh only re-seeds when
    /// membership actually moved.
    pub async fn reconcile_for_rule_change(&self, force_reseed: bool) -> Result<()> {
        let desired = self.filter_discoverable().await?;
        let desired_keys: HashSet<GvrKey> = desired.iter().map(|d| d.key.clone()).collect();

        let mut informers = self.informers.lock().await;
        let before = informers.len();
        informers.retain(|key, handle| {
            if desired_keys.contains(key) {
                true
            } else {
                info!(gvr = %key, "stopping informer");
                handle.task.abort();
                false
            }
        });
        let mut changed = informers.len() != before;
        for gvr in desired {
            if informers.contains_key(&gvr.key) {
                continue;
            }
            info!(gvr = %gvr.key, "starting informer");
            changed = true;
            let task = self.spawn_informer(gvr.clone());
            informers.insert(gvr.key, InformerHandle { task });
        }
        self.metrics
            .watch
            .active_informers
            .set(informers.len() as i64);
        drop(informers);

        if changed || force_reseed {
            let router = self.router.clone();
            tokio::spawn(async move {
                router.restart_all_reconciliation().await;
            });
        }
        Ok(())
    }

    fn spawn_informer(&self, gvr: DiscoveredGvr) -> JoinHandle<()> {
        let client = self.client.clone();
        let rules = self.rules.clone();
        let correlation = self.correlation.clone();
        let router = self.router.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let api: Api<DynamicObject> = Api::all_with(client, &gvr.resource);
            let backoff = ExponentialBackoffBuilder::new()
                .with_initial_interval(WATCH_BACKOFF_INITIAL)
                .with_max_interval(WATCH_BACKOFF_MAX)
                .with_max_elapsed_time(None)
                .build();
            let mut stream = watcher(api, watcher::Config::default().any_semantic())
                .backoff(backoff)
                .boxed();

            // first sight decides CREATE vs UPDATE
            let mut seen: HashSet<String> = HashSet::new();
            let mut desynced = false;

            while let Some(item) = stream.next().await {
                match item {
                    Ok(watcher::Event::Init) => {}
                    Ok(watcher::Event::InitApply(obj)) => {
                        metrics.watch.objects_scanned.inc();
                        seen.insert(obj_key(&obj));
                    }
                    Ok(watcher::Event::InitDone) => {
                        if desynced {
                            // relisted after Expired: live state may have
                            // moved arbitrarily, recompute per destination
                            desynced = false;
                            info!(gvr = %gvr.key, "relisted after desync, re-seeding");
                            router.restart_all_reconciliation().await;
                        }
                    }
                    Ok(watcher::Event::Apply(obj)) => {
                        let operation = if seen.insert(obj_key(&obj)) {
                            Operation::Create
                        } else {
                            Operation::Update
                        };
                        handle_event(&rules, &correlation, &router, &metrics, &gvr, operation, &obj)
                            .await;
                    }
                    Ok(watcher::Event::Delete(obj)) => {
                        seen.remove(&obj_key(&obj));
                        handle_event(
                            &rules,
                            &correlation,
                            &router,
                            &metrics,
                            &gvr,
                            Operation::Delete,
                            &obj,
                        )
                        .await;
                    }
                    Err(e) => {
                        metrics.watch.failures.inc();
                        desynced = true;
                        debug!(gvr = %gvr.key, error = %e, "watch interrupted, backing off");
                    }
                }
            }
        })
    }

    /// Enumerate live objects matching any rule bound to `destination`,
    /// with sanitized payloads. Pages through every relevant GVR.
    pub async fn cluster_state_for_destination(
        &self,
        destination: &ResourceReference,
    ) -> Result<Vec<ClusterObject>> {
        let discovered = self.filter_discoverable().await?;
        let mut out = Vec::new();
        for gvr in discovered {
            if !self.rules.destination_wants_gvr(
                destination,
                &gvr.key.group,
                &gvr.key.version,
                &gvr.key.resource,
                gvr.scope,
            ) {
                continue;
            }
            let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &gvr.resource);
            let mut continue_token: Option<String> = None;
            loop {
                let mut params = ListParams::default().limit(LIST_PAGE_SIZE);
                if let Some(token) = &continue_token {
                    params = params.continue_token(token);
                }
                let page = api.list(&params).await.map_err(Error::KubeError)?;
                for obj in &page.items {
                    self.metrics.watch.objects_scanned.inc();
                    let identifier = identifier_for(&gvr, obj);
                    if !self.rules.destination_selects(destination, &identifier) {
                        continue;
                    }
                    match sanitize(obj) {
                        Ok(payload) => out.push(ClusterObject {
                            identifier,
                            payload,
                        }),
                        Err(e) => warn!(identifier = %identifier, error = %e,
                            "skipping unsanitizable object"),
                    }
                }
                continue_token = page.metadata.continue_.clone().filter(|t| !t.is_empty());
                if continue_token.is_none() {
                    break;
                }
            }
        }
        Ok(out)
    }
}

async fn handle_event(
    rules: &RuleStore,
    correlation: &CorrelationIndex,
    router: &EventRouter,
    metrics: &Metrics,
    gvr: &DiscoveredGvr,
    operation: Operation,
    obj: &DynamicObject,
) {
    let identifier = identifier_for(gvr, obj);
    let destinations = rules.get_matching(&identifier, operation);
    if destinations.is_empty() {
        return;
    }
    let sanitized = match sanitize(obj) {
        Ok(sanitized) => sanitized,
        Err(e) => {
            warn!(identifier = %identifier, error = %e, "dropping unsanitizable event");
            return;
        }
    };
    let key = CorrelationKey::compute(&identifier, operation, sanitized.yaml.as_bytes());
    let actor = correlation
        .get_and_delete(&key)
        .map(|entry| Actor {
            username: entry.username,
            uid: entry.uid,
        })
        .unwrap_or_else(Actor::unknown);
    metrics.watch.event_inc(operation);

    let event = ResourceEvent {
        identifier,
        operation,
        payload: (operation != Operation::Delete).then_some(sanitized),
        actor,
    };
    for destination in destinations {
        router.dispatch(&destination, event.clone()).await;
    }
}

fn identifier_for(gvr: &DiscoveredGvr, obj: &DynamicObject) -> ResourceIdentifier {
    ResourceIdentifier {
        group: gvr.key.group.clone(),
        version: gvr.key.version.clone(),
        resource: gvr.key.resource.clone(),
        scope: gvr.scope,
        namespace: match gvr.scope {
            ResourceScope::Namespaced => obj.metadata.namespace.clone(),
            ResourceScope::Cluster => None,
        },
        name: obj.name_any(),
    }
}

fn obj_key(obj: &DynamicObject) -> String {
    format!(
        "{}/{}",
        obj.metadata.namespace.as_deref().unwrap_or(""),
        obj.name_any()
    )
}

fn scope_of(capabilities: &ApiCapabilities) -> ResourceScope {
    match capabilities.scope {
        Scope::Cluster => ResourceScope::Cluster,
        Scope::Namespaced => ResourceScope::Namespaced,
    }
}

/// Live namespace→labels map maintained by a dedicated watcher and read by
/// the rule store when it evaluates namespace selectors.
#[derive(Default)]
pub struct NamespaceLabelCache {
    inner: std::sync::RwLock<HashMap<String, BTreeMap<String, String>>>,
}

impl NamespaceLabels for NamespaceLabelCache {
    fn labels(&self, namespace: &str) -> Option<BTreeMap<String, String>> {
        self.inner
            .read()
            .expect("namespace cache lock poisoned")
            .get(namespace)
            .cloned()
    }
}

pub async fn run_namespace_watch(
    client: Client,
    cache: Arc<NamespaceLabelCache>,
    mut shutdown: watch::Receiver<bool>,
) {
    let api = Api::<Namespace>::all(client);
    let mut stream = watcher(api, watcher::Config::default().any_semantic())
        .default_backoff()
        .boxed();
    loop {
        tokio::select! {
            item = stream.next() => match item {
                Some(Ok(watcher::Event::Apply(ns) | watcher::Event::InitApply(ns))) => {
                    let labels = ns.metadata.labels.clone().unwrap_or_default();
                    cache
                        .inner
                        .write()
                        .expect("namespace cache lock poisoned")
                        .insert(ns.name_any(), labels);
                }
                Some(Ok(watcher::Event::Delete(ns))) => {
                    cache
                        .inner
                        .write()
                        .expect("namespace cache lock poisoned")
                        .remove(&ns.name_any());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => debug!(error = %e, "namespace watch interrupted"),
                None => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
