use crate::crd::NamespacedRef;
use crate::identity::ResourceScope;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Selects resources in the rule's own namespace for mirroring to a
/// destination.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "configbutler.io",
    version = "v1alpha1",
    kind = "WatchRule",
    namespaced,
    status = "RuleStatus",
    shortname = "wr",
    printcolumn = r#"{"name":"Destination","type":"string","jsonPath":".spec.destinationRef.name"}"#,
    printcolumn = r#"{"name":"Accepted","type":"boolean","jsonPath":".status.accepted"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WatchRuleSpec {
    pub destination_ref: NamespacedRef,
    pub rules: Vec<RuleClause>,
}

/// One selection clause; every axis is set membership with `"*"` meaning any.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuleClause {
    /// Subset of CREATE, UPDATE, DELETE; empty or `"*"` means all
    #[serde(default)]
    pub operations: Vec<String>,
    #[serde(default)]
    pub api_groups: Vec<String>,
    #[serde(default)]
    pub api_versions: Vec<String>,
    /// Plural resource names
    #[serde(default)]
    pub resources: Vec<String>,
}

/// Cluster-wide selection rule; clauses may target cluster-scoped resources
/// and may narrow namespaced ones with a label selector over namespaces.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "configbutler.io",
    version = "v1alpha1",
    kind = "ClusterWatchRule",
    status = "RuleStatus",
    shortname = "cwr",
    printcolumn = r#"{"name":"Destination","type":"string","jsonPath":".spec.destinationRef.name"}"#,
    printcolumn = r#"{"name":"Accepted","type":"boolean","jsonPath":".status.accepted"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterWatchRuleSpec {
    /// Must carry an explicit namespace
    pub destination_ref: NamespacedRef,
    pub rules: Vec<ClusterRuleClause>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRuleClause {
    #[serde(flatten)]
    pub clause: RuleClause,
    #[serde(default)]
    pub scope: ResourceScope,
    /// Evaluated against the labels of the target object's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuleStatus {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
