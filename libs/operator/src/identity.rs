use std::fmt;
use std::path::{Path, PathBuf};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Whether a resource lives in a namespace or at cluster level.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
    Default,
)]
pub enum ResourceScope {
    Cluster,
    #[default]
    Namespaced,
}

/// The logical identity of one Kubernetes object, across GVR, scope,
/// namespace and name. Deterministically maps to a repository path and back.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceIdentifier {
    /// API group; empty for the core group
    pub group: String,
    pub version: String,
    /// Plural resource name, e.g. `configmaps`
    pub resource: String,
    pub scope: ResourceScope,
    /// None for cluster-scoped objects
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceIdentifier {
    /// Stable map key: `group/version/resource/namespace/name`. The namespace
    /// segment is empty for cluster-scoped objects.
    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.group,
            self.version,
            self.resource,
            self.namespace.as_deref().unwrap_or(""),
            self.name
        )
    }

    /// Repository path under `base_folder`:
    /// `<base>/<group>/<version>/<resource>/[<namespace>/]<name>.yaml`,
    /// with the group segment collapsed for the core group.
    pub fn repo_path(&self, base_folder: &str) -> PathBuf {
        let mut path = PathBuf::from(base_folder);
        if !self.group.is_empty() {
            path.push(&self.group);
        }
        path.push(&self.version);
        path.push(&self.resource);
        if let Some(ns) = &self.namespace {
            path.push(ns);
        }
        path.push(format!("{}.yaml", self.name));
        path
    }

    /// Inverse of [`repo_path`](Self::repo_path). Returns None for paths that
    /// do not parse as a resource file (wrong extension, missing segments).
    pub fn from_repo_path(base_folder: &str, path: &Path) -> Option<Self> {
        let rel = path.strip_prefix(base_folder).ok()?;
        let mut segments: Vec<&str> = rel.iter().filter_map(|s| s.to_str()).collect();
        if segments.len() < 3 {
            return None;
        }
        let file = segments.pop()?;
        let name = file.strip_suffix(".yaml")?;

        // An API group never looks like a version, so the first
        // version-shaped segment terminates the (possibly empty) group prefix.
        let group = if looks_like_api_version(segments[0]) {
            String::new()
        } else {
            let g = segments.remove(0).to_string();
            if segments.len() < 2 || !looks_like_api_version(segments[0]) {
                return None;
            }
            g
        };
        let version = segments.remove(0).to_string();
        let resource = segments.remove(0).to_string();

        match segments.len() {
            0 => Some(ResourceIdentifier {
                group,
                version,
                resource,
                scope: ResourceScope::Cluster,
                namespace: None,
                name: name.to_string(),
            }),
            1 => Some(ResourceIdentifier {
                group,
                version,
                resource,
                scope: ResourceScope::Namespaced,
                namespace: Some(segments[0].to_string()),
                name: name.to_string(),
            }),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// `v1`, `v2`, `v1alpha1`, `v1beta2`, ...
fn looks_like_api_version(s: &str) -> bool {
    let Some(rest) = s.strip_prefix('v') else {
        return false;
    };
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return false;
    }
    let tail = &rest[digits.len()..];
    if tail.is_empty() {
        return true;
    }
    for stage in ["alpha", "beta"] {
        if let Some(n) = tail.strip_prefix(stage) {
            return !n.is_empty() && n.chars().all(|c| c.is_ascii_digit());
        }
    }
    false
}

/// A `(namespace, name)` tuple used wherever a destination, rule or config
/// object is referenced.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
pub struct ResourceReference {
    pub namespace: String,
    pub name: String,
}

impl ResourceReference {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        ResourceReference {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl fmt::Display for ResourceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn namespaced(group: &str, ns: &str) -> ResourceIdentifier {
        ResourceIdentifier {
            group: group.to_string(),
            version: "v1".to_string(),
            resource: "configmaps".to_string(),
            scope: ResourceScope::Namespaced,
            namespace: Some(ns.to_string()),
            name: "cm1".to_string(),
        }
    }

    #[test]
    fn core_group_collapses_in_path() {
        let id = namespaced("", "ns-a");
        assert_eq!(
            id.repo_path("audit"),
            PathBuf::from("audit/v1/configmaps/ns-a/cm1.yaml")
        );
    }

    #[test]
    fn cluster_scope_omits_namespace_segment() {
        let id = ResourceIdentifier {
            group: "rbac.authorization.k8s.io".to_string(),
            version: "v1".to_string(),
            resource: "clusterroles".to_string(),
            scope: ResourceScope::Cluster,
            namespace: None,
            name: "admin".to_string(),
        };
        assert_eq!(
            id.repo_path("audit"),
            PathBuf::from("audit/rbac.authorization.k8s.io/v1/clusterroles/admin.yaml")
        );
    }

    #[test]
    fn path_round_trips() {
        for id in [
            namespaced("", "ns-a"),
            namespaced("apps", "ns-b"),
            ResourceIdentifier {
                group: "".to_string(),
                version: "v1".to_string(),
                resource: "nodes".to_string(),
                scope: ResourceScope::Cluster,
                namespace: None,
                name: "node-1".to_string(),
            },
            ResourceIdentifier {
                group: "apiextensions.k8s.io".to_string(),
                version: "v1".to_string(),
                resource: "customresourcedefinitions".to_string(),
                scope: ResourceScope::Cluster,
                namespace: None,
                name: "foos.example.com".to_string(),
            },
        ] {
            let path = id.repo_path("base");
            let parsed = ResourceIdentifier::from_repo_path("base", &path).unwrap();
            assert_eq!(parsed, id, "path {}", path.display());
        }
    }

    #[test]
    fn grouped_cluster_path_is_not_confused_with_namespaced_core_path() {
        // four segments both times; the version shape disambiguates
        let grouped =
            ResourceIdentifier::from_repo_path("b", Path::new("b/apps/v1/things/x.yaml")).unwrap();
        assert_eq!(grouped.group, "apps");
        assert_eq!(grouped.scope, ResourceScope::Cluster);

        let core = ResourceIdentifier::from_repo_path("b", Path::new("b/v1/things/ns/x.yaml"))
            .unwrap();
        assert_eq!(core.group, "");
        assert_eq!(core.scope, ResourceScope::Namespaced);
        assert_eq!(core.namespace.as_deref(), Some("ns"));
    }

    #[test]
    fn rejects_non_resource_paths() {
        for p in ["b/.sops.yaml", "b/v1/things/x.json", "b/notaversion/things/x.yaml"] {
            assert!(
                ResourceIdentifier::from_repo_path("b", Path::new(p)).is_none(),
                "{p}"
            );
        }
    }

    #[test]
    fn version_shapes() {
        assert!(looks_like_api_version("v1"));
        assert!(looks_like_api_version("v1alpha1"));
        assert!(looks_like_api_version("v2beta3"));
        assert!(!looks_like_api_version("apps"));
        assert!(!looks_like_api_version("v"));
        assert!(!looks_like_api_version("v1gamma1"));
        assert!(!looks_like_api_version("version1"));
    }
}
