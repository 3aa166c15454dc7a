//! Registry gate and propagation endpoints
//!
//! The build execution path calls `POST /gate/evaluate` before each distinct
//! image pull, passing the configuration uid and generation its pod was
//! admitted under. Local policy versions differ between replicas, so the
//! admitted policy is looked up by that revision. Clients that just wrote the
//! cluster configuration call `GET /propagation/await` to block until every
//! replica enforces it.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use buildconfig_common::ConfigRevision;
use buildconfig_policy::{Decision, EffectivePolicy};

use super::{ApiError, WebhookState};

/// Body of `POST /gate/evaluate`
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateRequest {
    /// Image reference the build is about to pull
    pub image_ref: String,
    /// Build performing the pull
    pub build_id: String,
    /// Configuration generation the build pod was admitted under
    #[serde(default)]
    pub policy_generation: Option<i64>,
    /// Configuration uid the build pod was admitted under; defaults to the
    /// uid of this replica's current policy
    #[serde(default)]
    pub policy_uid: Option<String>,
}

/// Response of `POST /gate/evaluate`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResponse {
    /// `allow` or `deny`
    pub decision: String,
    /// Reason string; abort the pull with it on deny
    pub reason: String,
    /// Registry the pull targets
    pub registry: Option<String>,
    /// Whether the default registry was substituted
    pub defaulted: bool,
    /// Local policy version the decision was made under
    pub policy_version: u64,
    /// Configuration generation that policy was compiled from
    pub policy_generation: Option<i64>,
}

/// Policy the build was admitted under, falling back to the current one
fn admitted_policy(
    state: &WebhookState,
    request: &EvaluateRequest,
) -> Result<Arc<EffectivePolicy>, ApiError> {
    let current = state.policy.current();
    let Some(generation) = request.policy_generation else {
        return Ok(current);
    };
    let uid = match (&request.policy_uid, current.source_revision()) {
        (Some(uid), _) => uid.clone(),
        (None, Some(active)) => active.uid.clone(),
        (None, None) => return Ok(current),
    };
    let requested = ConfigRevision::new(uid, generation);

    if current.source_revision() == Some(&requested) {
        return Ok(current);
    }
    if let Some(admitted) = state.policy.at_revision(&requested) {
        return Ok(admitted);
    }
    // Admitted by a replica that is ahead of this one
    if current
        .source_revision()
        .is_some_and(|active| active.uid == requested.uid && active.generation < generation)
    {
        return Err(ApiError::Pending { generation });
    }

    debug!(
        requested = %requested,
        current = state.policy.version(),
        "Admitted policy no longer retained, using current"
    );
    Ok(current)
}

/// Evaluate an image pull against the admitted (or current) policy
#[instrument(skip_all, fields(build_id = %request.build_id, image = %request.image_ref))]
pub async fn evaluate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(request): Json<EvaluateRequest>,
) -> Result<Json<EvaluateResponse>, ApiError> {
    if !state.policy.is_ready() {
        return Err(ApiError::NotReady);
    }
    if request.build_id.is_empty() {
        return Err(ApiError::BadRequest("buildId must not be empty".to_string()));
    }

    let policy = admitted_policy(&state, &request)?;
    let policy_version = policy.version();
    let policy_generation = policy.source_generation();

    let guard = state.guards.guard(&request.build_id, policy);
    let verdict = guard.lock().await.check(&request.image_ref).await;

    let response = match verdict {
        Ok(verdict) => EvaluateResponse {
            decision: verdict.decision.as_str().to_string(),
            reason: verdict.reason,
            registry: verdict.registry.map(|r| r.to_string()),
            defaulted: verdict.defaulted,
            policy_version,
            policy_generation,
        },
        Err(denied) => EvaluateResponse {
            decision: Decision::Deny.as_str().to_string(),
            reason: denied.verdict.reason,
            registry: denied.verdict.registry.map(|r| r.to_string()),
            defaulted: denied.verdict.defaulted,
            policy_version,
            policy_generation,
        },
    };

    Ok(Json(response))
}

/// Query of `GET /propagation/await`
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwaitQuery {
    /// Store generation to wait for
    pub generation: i64,
    /// Object uid the generation belongs to; defaults to the uid of this
    /// replica's current policy
    #[serde(default)]
    pub uid: Option<String>,
    /// Wait bound; defaults to the server's configured timeout
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// Response of `GET /propagation/await`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwaitResponse {
    /// Generation that became active
    pub generation: i64,
    /// Object uid of that generation
    pub uid: String,
    /// Replicas enforcing it
    pub acknowledged_by: Vec<String>,
}

/// Block until a revision is active on every replica
pub async fn await_handler(
    State(state): State<Arc<WebhookState>>,
    Query(query): Query<AwaitQuery>,
) -> Result<Json<AwaitResponse>, ApiError> {
    let timeout = query
        .timeout_seconds
        .map(Duration::from_secs)
        .unwrap_or(state.default_await_timeout)
        .min(state.max_await_timeout);

    let uid = match query.uid {
        Some(uid) => uid,
        None => state
            .policy
            .current()
            .source_revision()
            .map(|active| active.uid.clone())
            .ok_or_else(|| {
                ApiError::BadRequest(
                    "uid is required until a stored configuration is active".to_string(),
                )
            })?,
    };
    let revision = ConfigRevision::new(uid, query.generation);

    let record = state.tracker.await_revision(&revision, timeout).await?;
    Ok(Json(AwaitResponse {
        generation: record.revision.generation,
        uid: record.revision.uid,
        acknowledged_by: record.acknowledged_by.into_iter().collect(),
    }))
}
