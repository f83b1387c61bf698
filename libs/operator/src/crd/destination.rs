use crate::crd::NamespacedRef;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A unique `(repo URL, branch, baseFolder)` triple the mirror writes to.
/// The destination owns the subtree rooted at `baseFolder` on its branch.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "configbutler.io",
    version = "v1alpha1",
    kind = "GitDestination",
    namespaced,
    status = "GitDestinationStatus",
    shortname = "gdest",
    printcolumn = r#"{"name":"Branch","type":"string","jsonPath":".spec.branch"}"#,
    printcolumn = r#"{"name":"Folder","type":"string","jsonPath":".spec.baseFolder"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GitDestinationSpec {
    pub repo_ref: NamespacedRef,
    /// Must appear in the referenced repo config's `allowedBranches`
    pub branch: String,
    pub base_folder: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitDestinationStatus {
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
