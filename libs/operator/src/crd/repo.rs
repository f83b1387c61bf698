use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A Git remote the mirror may write to, with the branches it may touch.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "configbutler.io",
    version = "v1alpha1",
    kind = "GitRepoConfig",
    namespaced,
    status = "GitRepoConfigStatus",
    shortname = "grc",
    printcolumn = r#"{"name":"URL","type":"string","jsonPath":".spec.repoURL"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GitRepoConfigSpec {
    /// HTTPS or SSH remote URL
    pub repo_url: String,
    /// Branches destinations may bind to
    pub allowed_branches: Vec<String>,
    /// Secret in the same namespace holding either `username`/`token` or
    /// `ssh-privatekey` (+ optional `known_hosts`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SecretRef {
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitRepoConfigStatus {
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
