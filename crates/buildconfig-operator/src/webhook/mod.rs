//! HTTPS endpoints served by every replica
//!
//! - `POST /mutate/pods`: mutating admission webhook for build pods
//! - `POST /gate/evaluate`: registry gate for the build execution path
//! - `GET /propagation/await`: bounded wait for a configuration revision
//! - `GET /healthz`, `GET /readyz`

pub mod gate;
pub mod pods;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use serde_json::json;
use tracing::info;

use buildconfig_common::Error;
use buildconfig_policy::{PolicyReader, PullGuardCache};

use crate::tracker::PropagationTracker;

/// Shared state for handlers
pub struct WebhookState {
    /// Current-policy reader
    pub policy: PolicyReader,
    /// Propagation tracker for await requests
    pub tracker: Arc<PropagationTracker>,
    /// Per-build pull guards; denials are reported through their sink
    pub guards: PullGuardCache,
    /// Await timeout when the caller gives none
    pub default_await_timeout: Duration,
    /// Upper bound on caller-supplied await timeouts
    pub max_await_timeout: Duration,
}

/// Error type for API handlers
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request was malformed
    #[error("bad request: {0}")]
    BadRequest(String),

    /// No policy has been published on this replica yet
    #[error("build policy not yet loaded")]
    NotReady,

    /// The requested configuration generation is newer than this replica's policy
    #[error("policy generation {generation} not yet active on this replica")]
    Pending {
        /// Requested generation
        generation: i64,
    },

    /// The awaited generation did not become active in time
    #[error("generation {generation} not active after {waited:?}")]
    Timeout {
        /// Awaited generation
        generation: i64,
        /// How long the request waited
        waited: Duration,
        /// Replicas that had not acknowledged
        missing: Vec<String>,
    },

    /// Anything else
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::Timeout {
                generation,
                waited,
                missing,
            } => ApiError::Timeout {
                generation,
                waited,
                missing,
            },
            Error::InvalidConfig { .. } => ApiError::BadRequest(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotReady | ApiError::Pending { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = match &self {
            ApiError::Timeout { missing, .. } => {
                json!({ "error": self.to_string(), "missing": missing })
            }
            _ => json!({ "error": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

/// Build the router
pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/mutate/pods", post(pods::mutate_handler))
        .route("/gate/evaluate", post(gate::evaluate_handler))
        .route("/propagation/await", get(gate::await_handler))
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .with_state(state)
}

async fn readyz(State(state): State<Arc<WebhookState>>) -> Response {
    if state.policy.is_ready() {
        (StatusCode::OK, format!("policy version {}", state.policy.version())).into_response()
    } else {
        ApiError::NotReady.into_response()
    }
}

/// TLS server settings
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to bind
    pub addr: SocketAddr,
    /// PEM certificate path
    pub cert_path: PathBuf,
    /// PEM private key path
    pub key_path: PathBuf,
}

/// Serve the router over TLS until the handle is shut down
pub async fn serve(config: ServerConfig, app: Router, handle: Handle) -> anyhow::Result<()> {
    let tls_config = RustlsConfig::from_pem_file(&config.cert_path, &config.key_path)
        .await
        .map_err(|e| anyhow::anyhow!("TLS config error: {}", e))?;

    info!(addr = %config.addr, "Starting webhook server");

    axum_server::bind_rustls(config.addr, tls_config)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .map_err(|e| anyhow::anyhow!("webhook server error: {}", e))?;

    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use buildconfig_common::crd::{BuildClusterConfigSpec, RegistryRule};
    use buildconfig_common::events::{PolicyEventSink, RecordingEventSink};
    use buildconfig_common::ConfigRevision;
    use buildconfig_policy::{
        policy_slot, PolicyCompiler, PolicyPublisher, DEFAULT_GUARD_CAPACITY, DEFAULT_HISTORY_LIMIT,
    };

    /// Object uid the harness publishes under
    pub(crate) const HARNESS_UID: &str = "0d3c-harness";

    pub(crate) struct Harness {
        pub publisher: PolicyPublisher,
        pub state: Arc<WebhookState>,
        pub sink: Arc<RecordingEventSink>,
    }

    pub(crate) fn blacklist_docker_io() -> BuildClusterConfigSpec {
        let mut spec = BuildClusterConfigSpec::default();
        spec.registries.blocked_registries = vec![RegistryRule::new("docker.io")];
        spec
    }

    pub(crate) fn harness() -> Harness {
        let sink = Arc::new(RecordingEventSink::new());
        harness_with_sink(sink.clone(), sink)
    }

    pub(crate) fn harness_with_sink(
        events: Arc<dyn PolicyEventSink>,
        sink: Arc<RecordingEventSink>,
    ) -> Harness {
        let (publisher, reader) = policy_slot(DEFAULT_HISTORY_LIMIT);
        let state = Arc::new(WebhookState {
            policy: reader,
            tracker: Arc::new(PropagationTracker::new()),
            guards: PullGuardCache::new(events, DEFAULT_GUARD_CAPACITY),
            default_await_timeout: Duration::from_secs(30),
            max_await_timeout: Duration::from_secs(60),
        });
        Harness {
            publisher,
            state,
            sink,
        }
    }

    impl Harness {
        pub(crate) fn publish(&self, spec: &BuildClusterConfigSpec, generation: i64) {
            self.publish_revision(spec, ConfigRevision::new(HARNESS_UID, generation));
        }

        pub(crate) fn publish_revision(&self, spec: &BuildClusterConfigSpec, revision: ConfigRevision) {
            let policy = PolicyCompiler::new()
                .compile_revision(spec, self.publisher.current_version(), Some(revision))
                .expect("compile");
            self.publisher.publish(policy);
        }
    }
}
