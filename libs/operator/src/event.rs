use crate::identity::ResourceIdentifier;
use crate::sanitize::SanitizedObject;

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Fallback author when no admission record correlates with an event.
pub const UNKNOWN_ACTOR: &str = "unknown@configbutler";
/// Author recorded on synthetic events emitted by startup reconciliation.
pub const RECONCILER_ACTOR: &str = "system:reconciler";

/// Observed or synthesized state transition of one object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Create,
    Update,
    Delete,
    /// Synthetic idempotent upsert emitted by startup reconciliation
    Reconcile,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
            Operation::Reconcile => "RECONCILE",
        };
        f.write_str(s)
    }
}

/// The acting user behind an event, captured at admission time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Actor {
    pub username: String,
    pub uid: String,
}

impl Actor {
    pub fn unknown() -> Self {
        Actor {
            username: UNKNOWN_ACTOR.to_string(),
            uid: String::new(),
        }
    }

    pub fn reconciler() -> Self {
        Actor {
            username: RECONCILER_ACTOR.to_string(),
            uid: String::new(),
        }
    }
}

/// One sanitized, attributed event flowing from the watch plane towards a
/// branch worker. DELETE events carry no payload.
#[derive(Clone, Debug)]
pub struct ResourceEvent {
    pub identifier: ResourceIdentifier,
    pub operation: Operation,
    pub payload: Option<SanitizedObject>,
    pub actor: Actor,
}

impl ResourceEvent {
    /// Content hash over `(identifier, operation, sanitized bytes)`; the
    /// basis of both admission correlation and live deduplication.
    pub fn dedup_hash(&self) -> [u8; 32] {
        content_hash(
            &self.identifier,
            self.operation,
            self.payload.as_ref().map(|p| p.yaml.as_bytes()).unwrap_or(b""),
        )
    }
}

/// H(identifier, operation, sanitized YAML bytes).
pub fn content_hash(
    identifier: &ResourceIdentifier,
    operation: Operation,
    sanitized: &[u8],
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(identifier.key().as_bytes());
    hasher.update([0]);
    hasher.update(operation.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(sanitized);
    hasher.finalize().into()
}

/// One live object enumerated for a destination during startup reconcile.
#[derive(Clone, Debug)]
pub struct ClusterObject {
    pub identifier: ResourceIdentifier,
    pub payload: SanitizedObject,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ResourceScope;

    fn id(name: &str) -> ResourceIdentifier {
        ResourceIdentifier {
            group: String::new(),
            version: "v1".into(),
            resource: "configmaps".into(),
            scope: ResourceScope::Namespaced,
            namespace: Some("default".into()),
            name: name.into(),
        }
    }

    #[test]
    fn hash_distinguishes_identifier_operation_and_content() {
        let a = content_hash(&id("a"), Operation::Create, b"x");
        assert_ne!(a, content_hash(&id("b"), Operation::Create, b"x"));
        assert_ne!(a, content_hash(&id("a"), Operation::Update, b"x"));
        assert_ne!(a, content_hash(&id("a"), Operation::Create, b"y"));
        assert_eq!(a, content_hash(&id("a"), Operation::Create, b"x"));
    }
}
