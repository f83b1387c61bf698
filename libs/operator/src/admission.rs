//! Validating admission handler: capture who is writing what, never block.
//!
//! The handler sanitizes the admitted object, computes the same content-hash
//! key the watch plane will compute when the write surfaces, and stores the
//! acting user in the correlation index. It never enqueues events and always
//! answers "allowed" — with failure policy Ignore on the webhook
//! registration, a dropped call only degrades attribution.

use crate::correlation::{CorrelationEntry, CorrelationIndex, CorrelationKey};
use crate::error::{Error, Result};
use crate::event::Operation;
use crate::identity::{ResourceIdentifier, ResourceScope};
use crate::sanitize::sanitize;

use std::sync::Arc;

use chrono::Utc;
use kube::core::admission::{
    AdmissionRequest, AdmissionResponse, AdmissionReview, Operation as AdmissionOperation,
};
use kube::core::DynamicObject;
use kube::ResourceExt;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct AdmissionState {
    pub correlation: Arc<CorrelationIndex>,
}

/// Handle one review. Attribution is best effort; the response is allowed on
/// every path that has a well-formed request.
pub fn review(state: &AdmissionState, review: AdmissionReview<DynamicObject>) -> AdmissionReview<DynamicObject> {
    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "malformed admission review");
            return AdmissionResponse::invalid(e.to_string()).into_review();
        }
    };
    let response = AdmissionResponse::from(&request);
    if let Err(e) = record(state, &request) {
        debug!(error = %e, "admission event not correlated");
    }
    response.into_review()
}

fn record(state: &AdmissionState, request: &AdmissionRequest<DynamicObject>) -> Result<()> {
    let operation = match request.operation {
        AdmissionOperation::Create => Operation::Create,
        AdmissionOperation::Update => Operation::Update,
        AdmissionOperation::Delete => Operation::Delete,
        _ => return Ok(()),
    };
    // DELETE carries the object being removed in oldObject
    let object = match operation {
        Operation::Delete => request.old_object.as_ref(),
        _ => request.object.as_ref(),
    }
    .ok_or_else(|| Error::InvalidObject("admission request without object".to_string()))?;

    let sanitized = sanitize(object)?;
    let identifier = ResourceIdentifier {
        group: request.resource.group.clone(),
        version: request.resource.version.clone(),
        resource: request.resource.resource.clone(),
        scope: if request.namespace.is_some() {
            ResourceScope::Namespaced
        } else {
            ResourceScope::Cluster
        },
        namespace: request.namespace.clone(),
        name: if request.name.is_empty() {
            object.name_any()
        } else {
            request.name.clone()
        },
    };

    let key = CorrelationKey::compute(&identifier, operation, sanitized.yaml.as_bytes());
    state.correlation.put(
        key,
        CorrelationEntry {
            username: request.user_info.username.clone().unwrap_or_default(),
            uid: request.user_info.uid.clone().unwrap_or_default(),
            timestamp: Utc::now(),
        },
    );
    Ok(())
}
