//! Pod Mutation Webhook
//!
//! Injects the active build policy into pods labeled `config.builds.dev/build`.
//! The mutation is computed by diffing the pod before and after
//! [`PodTemplateInjector::inject`], so only fields the injector actually
//! changed appear in the patch.

use std::sync::Arc;

use axum::{extract::State, Json};
use k8s_openapi::api::core::v1::Pod;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use opentelemetry::KeyValue;
use tracing::{debug, error, info, warn};

use buildconfig_common::metrics::POD_INJECTIONS;
use buildconfig_common::BUILD_LABEL;
use buildconfig_policy::PodTemplateInjector;

use super::WebhookState;

/// Handle mutating admission review for Pods
pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<Pod>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<Pod> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    Json(mutate_pod(&state, &req).into_review())
}

/// Process a single pod admission
pub(crate) fn mutate_pod(state: &WebhookState, request: &AdmissionRequest<Pod>) -> AdmissionResponse {
    let uid = request.uid.clone();

    let pod = match &request.object {
        Some(pod) => pod,
        None => {
            debug!(uid = %uid, "No pod object in request, allowing unchanged");
            return AdmissionResponse::from(request);
        }
    };

    let build = match pod.metadata.labels.as_ref().and_then(|l| l.get(BUILD_LABEL)) {
        Some(build) => build.clone(),
        None => {
            debug!(uid = %uid, pod = ?pod.metadata.name, "Not a build pod, allowing unchanged");
            return AdmissionResponse::from(request);
        }
    };

    if !state.policy.is_ready() {
        warn!(uid = %uid, build = %build, "Build policy not loaded yet, denying to allow retry");
        POD_INJECTIONS.add(1, &[KeyValue::new("result", "error")]);
        return AdmissionResponse::from(request)
            .deny("build policy not yet loaded, will retry");
    }

    let policy = state.policy.current();
    let mutated = PodTemplateInjector::inject(pod, &policy);

    let patch = match (serde_json::to_value(pod), serde_json::to_value(&mutated)) {
        (Ok(before), Ok(after)) => json_patch::diff(&before, &after),
        (Err(e), _) | (_, Err(e)) => {
            error!(uid = %uid, error = %e, "Failed to serialize pod");
            POD_INJECTIONS.add(1, &[KeyValue::new("result", "error")]);
            return AdmissionResponse::from(request).deny(format!("pod serialization error: {e}"));
        }
    };

    if patch.0.is_empty() {
        debug!(uid = %uid, build = %build, "Pod already carries the active policy");
        POD_INJECTIONS.add(1, &[KeyValue::new("result", "unchanged")]);
        return AdmissionResponse::from(request);
    }

    info!(
        uid = %uid,
        build = %build,
        policy_version = policy.version(),
        patch_ops = patch.0.len(),
        "Injecting build policy into pod"
    );

    match AdmissionResponse::from(request).with_patch(patch) {
        Ok(response) => {
            POD_INJECTIONS.add(1, &[KeyValue::new("result", "mutated")]);
            response
        }
        Err(e) => {
            error!(uid = %uid, error = %e, "Failed to serialize patch");
            POD_INJECTIONS.add(1, &[KeyValue::new("result", "error")]);
            AdmissionResponse::from(request).deny(format!("patch serialization error: {e}"))
        }
    }
}
