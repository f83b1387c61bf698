pub mod destination;
pub mod repo;
pub mod rule;

pub use destination::{GitDestination, GitDestinationSpec, GitDestinationStatus};
pub use repo::{GitRepoConfig, GitRepoConfigSpec, GitRepoConfigStatus, SecretRef};
pub use rule::{
    ClusterRuleClause, ClusterWatchRule, ClusterWatchRuleSpec, RuleClause, RuleStatus, WatchRule,
    WatchRuleSpec,
};

use crate::identity::ResourceReference;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const API_GROUP: &str = "configbutler.io";

/// Reference to another object, defaulting to the referrer's namespace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NamespacedRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl NamespacedRef {
    pub fn resolve(&self, default_namespace: &str) -> ResourceReference {
        ResourceReference::new(
            self.namespace.as_deref().unwrap_or(default_namespace),
            &self.name,
        )
    }
}
