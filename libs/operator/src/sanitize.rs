//! Canonical declarative encoding of arbitrary Kubernetes objects.
//!
//! The output is byte-stable for semantically equal inputs: server-managed
//! fields are stripped, keys are emitted in a deterministic order, and
//! nothing here depends on wall-clock time. Both the admission handler and
//! the watch plane feed their objects through [`sanitize`], which is what
//! makes content-hash correlation between the two streams possible.

use crate::error::{Error, Result};

use kube::core::DynamicObject;
use serde_json::Value;

/// Metadata fields owned by the API server, never meaningful in Git.
const SERVER_MANAGED_FIELDS: &[&str] = &[
    "uid",
    "resourceVersion",
    "generation",
    "creationTimestamp",
    "managedFields",
    "selfLink",
];

/// Annotations written by the platform rather than the user.
const SERVER_MANAGED_ANNOTATIONS: &[&str] = &[
    "kubectl.kubernetes.io/last-applied-configuration",
    "deployment.kubernetes.io/revision",
];

/// A canonical YAML rendering of one object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SanitizedObject {
    pub api_version: String,
    pub kind: String,
    pub yaml: String,
}

/// Sanitize a dynamically-typed object.
pub fn sanitize(obj: &DynamicObject) -> Result<SanitizedObject> {
    let value = serde_json::to_value(obj).map_err(Error::SerializationError)?;
    sanitize_value(value)
}

/// Sanitize a schema-loose JSON representation of an object.
pub fn sanitize_value(mut value: Value) -> Result<SanitizedObject> {
    let root = value
        .as_object_mut()
        .ok_or_else(|| Error::InvalidObject("payload is not a JSON object".to_string()))?;

    root.remove("status");

    let api_version = root
        .get("apiVersion")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let kind = root
        .get("kind")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    if let Some(meta) = root.get_mut("metadata").and_then(Value::as_object_mut) {
        for field in SERVER_MANAGED_FIELDS {
            meta.remove(*field);
        }
        let empty_annotations = match meta.get_mut("annotations").and_then(Value::as_object_mut) {
            Some(annotations) => {
                for key in SERVER_MANAGED_ANNOTATIONS {
                    annotations.remove(*key);
                }
                annotations.is_empty()
            }
            None => false,
        };
        if empty_annotations {
            meta.remove("annotations");
        }
        drop_nulls(meta);
    }

    // apiVersion, kind, metadata first; everything else in sorted key order.
    // serde_json maps iterate sorted, and serde_yaml mappings preserve
    // insertion order, so the rendering is deterministic end to end.
    let mut doc = serde_yaml::Mapping::new();
    for head in ["apiVersion", "kind", "metadata"] {
        if let Some(v) = root.remove(head) {
            doc.insert(
                serde_yaml::Value::String(head.to_string()),
                serde_yaml::to_value(v).map_err(Error::YamlError)?,
            );
        }
    }
    for (key, v) in root.iter() {
        doc.insert(
            serde_yaml::Value::String(key.clone()),
            serde_yaml::to_value(v).map_err(Error::YamlError)?,
        );
    }

    let yaml = serde_yaml::to_string(&doc).map_err(Error::YamlError)?;
    Ok(SanitizedObject {
        api_version,
        kind,
        yaml,
    })
}

/// Re-parse a sanitized document, e.g. to run it through [`sanitize_value`]
/// again or to inspect it in tests.
pub fn parse_sanitized(yaml: &str) -> Result<Value> {
    serde_yaml::from_str(yaml).map_err(Error::YamlError)
}

fn drop_nulls(map: &mut serde_json::Map<String, Value>) {
    map.retain(|_, v| !v.is_null());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn configmap() -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "cm1",
                "namespace": "ns-a",
                "uid": "9e3f5e1c",
                "resourceVersion": "12345",
                "generation": 3,
                "creationTimestamp": "2024-01-01T00:00:00Z",
                "managedFields": [{"manager": "kubectl"}],
                "labels": {"env": "prod"},
                "annotations": {
                    "kubectl.kubernetes.io/last-applied-configuration": "{}",
                    "team": "payments"
                }
            },
            "data": {"k": "v"},
            "status": {"phase": "Active"}
        })
    }

    #[test]
    fn strips_server_managed_state() {
        let s = sanitize_value(configmap()).unwrap();
        assert!(!s.yaml.contains("status"));
        assert!(!s.yaml.contains("resourceVersion"));
        assert!(!s.yaml.contains("uid"));
        assert!(!s.yaml.contains("managedFields"));
        assert!(!s.yaml.contains("last-applied-configuration"));
        // user data survives
        assert!(s.yaml.contains("team: payments"));
        assert!(s.yaml.contains("env: prod"));
        assert!(s.yaml.contains("k: v"));
        assert_eq!(s.kind, "ConfigMap");
        assert_eq!(s.api_version, "v1");
    }

    #[test]
    fn head_keys_come_first() {
        let s = sanitize_value(configmap()).unwrap();
        let api = s.yaml.find("apiVersion:").unwrap();
        let kind = s.yaml.find("kind:").unwrap();
        let meta = s.yaml.find("metadata:").unwrap();
        let data = s.yaml.find("data:").unwrap();
        assert!(api < kind && kind < meta && meta < data);
    }

    #[test]
    fn annotations_block_disappears_when_only_server_managed() {
        let mut v = configmap();
        v["metadata"]["annotations"] = json!({
            "kubectl.kubernetes.io/last-applied-configuration": "{}"
        });
        let s = sanitize_value(v).unwrap();
        assert!(!s.yaml.contains("annotations"));
    }

    #[test]
    fn byte_stable_across_key_order() {
        let reordered = json!({
            "status": {"phase": "Active"},
            "data": {"k": "v"},
            "kind": "ConfigMap",
            "metadata": {
                "labels": {"env": "prod"},
                "namespace": "ns-a",
                "annotations": {
                    "team": "payments",
                    "kubectl.kubernetes.io/last-applied-configuration": "{}"
                },
                "name": "cm1",
                "uid": "other",
                "resourceVersion": "99999",
                "generation": 4,
                "creationTimestamp": "2030-12-31T23:59:59Z",
                "managedFields": [],
            },
            "apiVersion": "v1",
        });
        let a = sanitize_value(configmap()).unwrap();
        let b = sanitize_value(reordered).unwrap();
        assert_eq!(a.yaml, b.yaml);
    }

    #[test]
    fn sanitization_is_idempotent() {
        let once = sanitize_value(configmap()).unwrap();
        let twice = sanitize_value(parse_sanitized(&once.yaml).unwrap()).unwrap();
        assert_eq!(once.yaml, twice.yaml);
    }

    #[test]
    fn rejects_scalars() {
        assert!(sanitize_value(json!("not an object")).is_err());
    }
}
