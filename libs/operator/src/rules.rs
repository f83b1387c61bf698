//! In-memory index of compiled selection rules, mutated by the outer rule
//! controllers and read by the watch plane on every event.

use crate::crd::{ClusterWatchRule, WatchRule};
use crate::error::{Error, Result};
use crate::event::Operation;
use crate::identity::{ResourceIdentifier, ResourceReference, ResourceScope};

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use kube::core::Selector;
use kube::core::SelectorExt;
use kube::ResourceExt;

pub const WILDCARD: &str = "*";

/// Read access to namespace labels, injected so the store itself never talks
/// to the API server.
pub trait NamespaceLabels: Send + Sync {
    fn labels(&self, namespace: &str) -> Option<BTreeMap<String, String>>;
}

/// Set-membership filter over one rule axis.
#[derive(Clone, Debug)]
pub struct SetFilter {
    any: bool,
    values: HashSet<String>,
}

impl SetFilter {
    pub fn compile(values: &[String]) -> Self {
        let any = values.is_empty() || values.iter().any(|v| v == WILDCARD);
        SetFilter {
            any,
            values: values.iter().cloned().collect(),
        }
    }

    pub fn accepts(&self, value: &str) -> bool {
        self.any || self.values.contains(value)
    }

    /// Concrete members, None when the axis is a wildcard.
    pub fn explicit(&self) -> Option<&HashSet<String>> {
        (!self.any).then_some(&self.values)
    }
}

#[derive(Clone, Debug)]
pub struct CompiledClause {
    pub operations: SetFilter,
    pub api_groups: SetFilter,
    pub api_versions: SetFilter,
    pub resources: SetFilter,
    pub scope: ResourceScope,
    pub namespace_selector: Option<Selector>,
}

impl CompiledClause {
    fn accepts_gvr(&self, group: &str, version: &str, resource: &str) -> bool {
        self.api_groups.accepts(group)
            && self.api_versions.accepts(version)
            && self.resources.accepts(resource)
    }
}

/// A validated rule ready for matching. `namespace` is set for namespaced
/// rules and confines their clauses to that namespace.
#[derive(Clone, Debug)]
pub struct CompiledRule {
    pub key: String,
    pub destination: ResourceReference,
    pub namespace: Option<String>,
    pub clauses: Vec<CompiledClause>,
}

impl CompiledRule {
    pub fn is_cluster(&self) -> bool {
        self.namespace.is_none()
    }
}

const KNOWN_OPERATIONS: &[&str] = &["CREATE", "UPDATE", "DELETE", WILDCARD];

fn compile_operations(operations: &[String]) -> Result<SetFilter> {
    for op in operations {
        if !KNOWN_OPERATIONS.contains(&op.as_str()) {
            return Err(Error::UserInputError(format!(
                "unknown operation {op:?}, expected CREATE, UPDATE, DELETE or \"*\""
            )));
        }
    }
    Ok(SetFilter::compile(operations))
}

/// Compile a namespaced rule; its clauses are implicitly namespace-scoped.
pub fn compile_watch_rule(rule: &WatchRule) -> Result<CompiledRule> {
    let namespace = rule.namespace().ok_or_else(|| {
        Error::UserInputError("WatchRule is expected to be namespaced".to_string())
    })?;
    if rule.spec.rules.is_empty() {
        return Err(Error::UserInputError("rules must not be empty".to_string()));
    }
    let clauses = rule
        .spec
        .rules
        .iter()
        .map(|clause| {
            Ok(CompiledClause {
                operations: compile_operations(&clause.operations)?,
                api_groups: SetFilter::compile(&clause.api_groups),
                api_versions: SetFilter::compile(&clause.api_versions),
                resources: SetFilter::compile(&clause.resources),
                scope: ResourceScope::Namespaced,
                namespace_selector: None,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(CompiledRule {
        key: format!("watchrule:{}/{}", namespace, rule.name_any()),
        destination: rule.spec.destination_ref.resolve(&namespace),
        namespace: Some(namespace),
        clauses,
    })
}

/// Compile a cluster rule; the destination reference must be fully qualified.
pub fn compile_cluster_watch_rule(rule: &ClusterWatchRule) -> Result<CompiledRule> {
    let Some(dest_namespace) = rule.spec.destination_ref.namespace.clone() else {
        return Err(Error::UserInputError(
            "ClusterWatchRule destinationRef requires a namespace".to_string(),
        ));
    };
    if rule.spec.rules.is_empty() {
        return Err(Error::UserInputError("rules must not be empty".to_string()));
    }
    let clauses = rule
        .spec
        .rules
        .iter()
        .map(|clause| {
            let namespace_selector = clause
                .namespace_selector
                .clone()
                .map(|selector| {
                    Selector::try_from(selector).map_err(|e| {
                        Error::UserInputError(format!("invalid namespaceSelector: {e}"))
                    })
                })
                .transpose()?;
            if namespace_selector.is_some() && clause.scope == ResourceScope::Cluster {
                return Err(Error::UserInputError(
                    "namespaceSelector is only valid for Namespaced clauses".to_string(),
                ));
            }
            Ok(CompiledClause {
                operations: compile_operations(&clause.clause.operations)?,
                api_groups: SetFilter::compile(&clause.clause.api_groups),
                api_versions: SetFilter::compile(&clause.clause.api_versions),
                resources: SetFilter::compile(&clause.clause.resources),
                scope: clause.scope,
                namespace_selector,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(CompiledRule {
        key: format!("clusterwatchrule:{}", rule.name_any()),
        destination: ResourceReference::new(dest_namespace, &rule.spec.destination_ref.name),
        namespace: None,
        clauses,
    })
}

/// Projection of one clause's GVR axes; fields are `"*"` for wildcards.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GvrRequest {
    pub group: String,
    pub version: String,
    pub resource: String,
    pub scope: ResourceScope,
}

impl GvrRequest {
    pub fn accepts(&self, group: &str, version: &str, resource: &str, scope: ResourceScope) -> bool {
        self.scope == scope
            && (self.group == WILDCARD || self.group == group)
            && (self.version == WILDCARD || self.version == version)
            && (self.resource == WILDCARD || self.resource == resource)
    }
}

/// Thread-safe store of compiled rules, keyed by their source object.
pub struct RuleStore {
    namespaces: Arc<dyn NamespaceLabels>,
    rules: RwLock<HashMap<String, CompiledRule>>,
}

impl RuleStore {
    pub fn new(namespaces: Arc<dyn NamespaceLabels>) -> Self {
        RuleStore {
            namespaces,
            rules: RwLock::new(HashMap::new()),
        }
    }

    pub fn upsert(&self, rule: CompiledRule) {
        self.rules
            .write()
            .expect("rule store lock poisoned")
            .insert(rule.key.clone(), rule);
    }

    pub fn remove(&self, key: &str) {
        self.rules
            .write()
            .expect("rule store lock poisoned")
            .remove(key);
    }

    pub fn snapshot_watch_rules(&self) -> Vec<CompiledRule> {
        self.snapshot(|rule| !rule.is_cluster())
    }

    pub fn snapshot_cluster_watch_rules(&self) -> Vec<CompiledRule> {
        self.snapshot(CompiledRule::is_cluster)
    }

    fn snapshot(&self, keep: impl Fn(&CompiledRule) -> bool) -> Vec<CompiledRule> {
        self.rules
            .read()
            .expect("rule store lock poisoned")
            .values()
            .filter(|&rule| keep(rule))
            .cloned()
            .collect()
    }

    /// Union of all clause axes projected to `(group, version, resource)`
    /// requests. Wildcard axes stay symbolic; the watch manager resolves them
    /// against API discovery.
    pub fn requested_gvrs(&self) -> Vec<GvrRequest> {
        let rules = self.rules.read().expect("rule store lock poisoned");
        let mut requests = BTreeSet::new();
        for rule in rules.values() {
            for clause in &rule.clauses {
                let groups = axis_values(&clause.api_groups);
                let versions = axis_values(&clause.api_versions);
                let resources = axis_values(&clause.resources);
                for group in &groups {
                    for version in &versions {
                        for resource in &resources {
                            requests.insert(GvrRequest {
                                group: group.clone(),
                                version: version.clone(),
                                resource: resource.clone(),
                                scope: clause.scope,
                            });
                        }
                    }
                }
            }
        }
        requests.into_iter().collect()
    }

    pub fn matches_gvr(
        &self,
        group: &str,
        version: &str,
        resource: &str,
        scope: ResourceScope,
    ) -> bool {
        let rules = self.rules.read().expect("rule store lock poisoned");
        rules.values().any(|rule| {
            rule.clauses
                .iter()
                .any(|c| c.scope == scope && c.accepts_gvr(group, version, resource))
        })
    }

    /// All destinations whose rules accept this event.
    pub fn get_matching(
        &self,
        identifier: &ResourceIdentifier,
        operation: Operation,
    ) -> Vec<ResourceReference> {
        self.matching(identifier, Some(operation), None)
    }

    /// Does any rule bound to `destination` select this object, regardless of
    /// operation? Used when enumerating live state for startup reconciles.
    pub fn destination_selects(
        &self,
        destination: &ResourceReference,
        identifier: &ResourceIdentifier,
    ) -> bool {
        !self.matching(identifier, None, Some(destination)).is_empty()
    }

    /// Does any rule bound to `destination` accept this GVR at all?
    pub fn destination_wants_gvr(
        &self,
        destination: &ResourceReference,
        group: &str,
        version: &str,
        resource: &str,
        scope: ResourceScope,
    ) -> bool {
        let rules = self.rules.read().expect("rule store lock poisoned");
        rules.values().any(|rule| {
            rule.destination == *destination
                && rule
                    .clauses
                    .iter()
                    .any(|c| c.scope == scope && c.accepts_gvr(group, version, resource))
        })
    }

    pub fn destinations(&self) -> BTreeSet<ResourceReference> {
        self.rules
            .read()
            .expect("rule store lock poisoned")
            .values()
            .map(|rule| rule.destination.clone())
            .collect()
    }

    fn matching(
        &self,
        identifier: &ResourceIdentifier,
        operation: Option<Operation>,
        only_destination: Option<&ResourceReference>,
    ) -> Vec<ResourceReference> {
        let op = operation.map(|op| op.to_string());
        let rules = self.rules.read().expect("rule store lock poisoned");
        let mut namespace_labels: Option<BTreeMap<String, String>> = None;
        let mut out = BTreeSet::new();

        for rule in rules.values() {
            if let Some(dest) = only_destination {
                if rule.destination != *dest {
                    continue;
                }
            }
            if let Some(ns) = &rule.namespace {
                if identifier.scope != ResourceScope::Namespaced
                    || identifier.namespace.as_deref() != Some(ns.as_str())
                {
                    continue;
                }
            }
            for clause in &rule.clauses {
                if clause.scope != identifier.scope {
                    continue;
                }
                if let Some(op) = &op {
                    if !clause.operations.accepts(op) {
                        continue;
                    }
                }
                if !clause.accepts_gvr(
                    &identifier.group,
                    &identifier.version,
                    &identifier.resource,
                ) {
                    continue;
                }
                if let Some(selector) = &clause.namespace_selector {
                    let Some(target_ns) = identifier.namespace.as_deref() else {
                        continue;
                    };
                    let labels = namespace_labels.get_or_insert_with(|| {
                        self.namespaces.labels(target_ns).unwrap_or_default()
                    });
                    if !selector.matches(labels) {
                        continue;
                    }
                }
                out.insert(rule.destination.clone());
                break;
            }
        }
        out.into_iter().collect()
    }
}

fn axis_values(filter: &SetFilter) -> Vec<String> {
    match filter.explicit() {
        Some(values) => {
            let mut v: Vec<String> = values.iter().cloned().collect();
            v.sort();
            v
        }
        None => vec![WILDCARD.to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::rule::{ClusterRuleClause, ClusterWatchRuleSpec, RuleClause, WatchRuleSpec};
    use crate::crd::NamespacedRef;

    struct StaticLabels(HashMap<String, BTreeMap<String, String>>);

    impl NamespaceLabels for StaticLabels {
        fn labels(&self, namespace: &str) -> Option<BTreeMap<String, String>> {
            self.0.get(namespace).cloned()
        }
    }

    fn store_with(labels: &[(&str, &[(&str, &str)])]) -> RuleStore {
        let map = labels
            .iter()
            .map(|(ns, kv)| {
                (
                    ns.to_string(),
                    kv.iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                )
            })
            .collect();
        RuleStore::new(Arc::new(StaticLabels(map)))
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn watch_rule(ns: &str, name: &str, dest: &str, clause: RuleClause) -> WatchRule {
        let mut rule = WatchRule::new(
            name,
            WatchRuleSpec {
                destination_ref: NamespacedRef {
                    name: dest.to_string(),
                    namespace: None,
                },
                rules: vec![clause],
            },
        );
        rule.metadata.namespace = Some(ns.to_string());
        rule
    }

    fn configmap_in(ns: &str, name: &str) -> ResourceIdentifier {
        ResourceIdentifier {
            group: String::new(),
            version: "v1".into(),
            resource: "configmaps".into(),
            scope: ResourceScope::Namespaced,
            namespace: Some(ns.into()),
            name: name.into(),
        }
    }

    #[test]
    fn namespaced_rule_is_confined_to_its_namespace() {
        let store = store_with(&[]);
        let rule = watch_rule(
            "ns-a",
            "r1",
            "dest",
            RuleClause {
                operations: strings(&["CREATE", "UPDATE"]),
                api_groups: strings(&[""]),
                api_versions: strings(&["v1"]),
                resources: strings(&["configmaps"]),
            },
        );
        store.upsert(compile_watch_rule(&rule).unwrap());

        let hit = store.get_matching(&configmap_in("ns-a", "cm1"), Operation::Create);
        assert_eq!(hit, vec![ResourceReference::new("ns-a", "dest")]);
        assert!(store
            .get_matching(&configmap_in("ns-b", "cm1"), Operation::Create)
            .is_empty());
        // operation axis
        assert!(store
            .get_matching(&configmap_in("ns-a", "cm1"), Operation::Delete)
            .is_empty());
    }

    #[test]
    fn wildcards_accept_everything_on_their_axis() {
        let store = store_with(&[]);
        let rule = watch_rule("ns-a", "r1", "dest", RuleClause::default());
        store.upsert(compile_watch_rule(&rule).unwrap());
        assert!(!store
            .get_matching(&configmap_in("ns-a", "cm1"), Operation::Delete)
            .is_empty());
        assert!(store.matches_gvr("", "v1", "configmaps", ResourceScope::Namespaced));
        assert!(!store.matches_gvr("", "v1", "nodes", ResourceScope::Cluster));
    }

    #[test]
    fn cluster_rule_namespace_selector() {
        let store = store_with(&[("prod-1", &[("env", "prod")]), ("dev-1", &[("env", "dev")])]);
        let rule = ClusterWatchRule::new(
            "cr",
            ClusterWatchRuleSpec {
                destination_ref: NamespacedRef {
                    name: "dest".into(),
                    namespace: Some("ops".into()),
                },
                rules: vec![ClusterRuleClause {
                    clause: RuleClause {
                        resources: strings(&["configmaps"]),
                        ..RuleClause::default()
                    },
                    scope: ResourceScope::Namespaced,
                    namespace_selector: Some(
                        serde_json::from_value(serde_json::json!({
                            "matchLabels": {"env": "prod"}
                        }))
                        .unwrap(),
                    ),
                }],
            },
        );
        store.upsert(compile_cluster_watch_rule(&rule).unwrap());

        assert_eq!(
            store.get_matching(&configmap_in("prod-1", "cm"), Operation::Update),
            vec![ResourceReference::new("ops", "dest")]
        );
        assert!(store
            .get_matching(&configmap_in("dev-1", "cm"), Operation::Update)
            .is_empty());
    }

    #[test]
    fn cluster_rule_requires_destination_namespace() {
        let rule = ClusterWatchRule::new(
            "cr",
            ClusterWatchRuleSpec {
                destination_ref: NamespacedRef {
                    name: "dest".into(),
                    namespace: None,
                },
                rules: vec![ClusterRuleClause::default()],
            },
        );
        assert!(compile_cluster_watch_rule(&rule).is_err());
    }

    #[test]
    fn unknown_operations_are_rejected() {
        let rule = watch_rule(
            "ns-a",
            "r1",
            "dest",
            RuleClause {
                operations: strings(&["PATCH"]),
                ..RuleClause::default()
            },
        );
        assert!(compile_watch_rule(&rule).is_err());
    }

    #[test]
    fn requested_gvrs_project_clause_axes() {
        let store = store_with(&[]);
        let rule = watch_rule(
            "ns-a",
            "r1",
            "dest",
            RuleClause {
                operations: strings(&["*"]),
                api_groups: strings(&["", "apps"]),
                api_versions: strings(&["v1"]),
                resources: strings(&["configmaps", "deployments"]),
            },
        );
        store.upsert(compile_watch_rule(&rule).unwrap());
        let requested = store.requested_gvrs();
        assert_eq!(requested.len(), 4);
        assert!(requested.iter().any(|r| r.group == "apps"
            && r.resource == "deployments"
            && r.accepts("apps", "v1", "deployments", ResourceScope::Namespaced)));
    }

    #[test]
    fn same_destination_reported_once() {
        let store = store_with(&[]);
        for name in ["r1", "r2"] {
            let rule = watch_rule("ns-a", name, "dest", RuleClause::default());
            store.upsert(compile_watch_rule(&rule).unwrap());
        }
        assert_eq!(
            store
                .get_matching(&configmap_in("ns-a", "cm"), Operation::Create)
                .len(),
            1
        );
        assert!(store.destination_selects(
            &ResourceReference::new("ns-a", "dest"),
            &configmap_in("ns-a", "cm")
        ));
    }
}
