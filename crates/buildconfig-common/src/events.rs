//! Observability sink for policy lifecycle and enforcement events.
//!
//! Compile failures and registry denials are reported as structured events.
//! The Kubernetes-backed sink turns them into standard Events visible via
//! `kubectl describe buildclusterconfig cluster`; the tracing sink logs them.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation or a pull.
//! Callers on a request path wrap the Kubernetes sink in a [`QueuedEventSink`]
//! so an event costs a channel send, not an API round trip.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::API_GROUP;

/// Events buffered ahead of a slow sink before new ones are dropped
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 256;

/// A structured policy event
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PolicyEvent {
    /// Raw configuration was rejected; the previous policy stays active
    InvalidConfig {
        /// Store generation that failed to compile
        generation: Option<i64>,
        /// Offending field path
        field: String,
        /// Compiler message
        message: String,
    },
    /// A new policy was published to the current-policy slot
    PolicyPublished {
        /// Local policy version
        version: u64,
        /// Store generation it was compiled from
        generation: Option<i64>,
    },
    /// A build was refused an image pull
    RegistryDenied {
        /// Registry host the pull targeted
        host: String,
        /// Build that attempted the pull
        build_id: String,
        /// Image reference as requested
        image: String,
        /// User-facing reason string
        reason: String,
    },
}

impl PolicyEvent {
    /// Machine-readable reason (REASON column of `kubectl get events`)
    pub fn reason(&self) -> &'static str {
        match self {
            PolicyEvent::InvalidConfig { .. } => reasons::INVALID_CONFIG,
            PolicyEvent::PolicyPublished { .. } => reasons::POLICY_PUBLISHED,
            PolicyEvent::RegistryDenied { .. } => reasons::REGISTRY_DENIED,
        }
    }

    /// Action that produced the event
    pub fn action(&self) -> &'static str {
        match self {
            PolicyEvent::InvalidConfig { .. } | PolicyEvent::PolicyPublished { .. } => {
                actions::COMPILE
            }
            PolicyEvent::RegistryDenied { .. } => actions::PULL,
        }
    }

    /// Event severity
    pub fn event_type(&self) -> EventType {
        match self {
            PolicyEvent::PolicyPublished { .. } => EventType::Normal,
            PolicyEvent::InvalidConfig { .. } | PolicyEvent::RegistryDenied { .. } => {
                EventType::Warning
            }
        }
    }

    /// Human-readable note
    pub fn note(&self) -> String {
        match self {
            PolicyEvent::InvalidConfig {
                generation,
                field,
                message,
            } => format!(
                "generation {} rejected at {}: {}; previous policy remains active",
                generation.map_or_else(|| "?".to_string(), |g| g.to_string()),
                field,
                message
            ),
            PolicyEvent::PolicyPublished {
                version,
                generation,
            } => format!(
                "policy version {} published from generation {}",
                version,
                generation.map_or_else(|| "?".to_string(), |g| g.to_string())
            ),
            PolicyEvent::RegistryDenied {
                build_id, reason, ..
            } => format!("build {}: {}", build_id, reason),
        }
    }
}

/// Sink for policy events.
///
/// Implementations are expected to be fire-and-forget.
#[async_trait]
pub trait PolicyEventSink: Send + Sync {
    /// Report an event
    async fn emit(&self, event: PolicyEvent);
}

/// Object reference to the reconciled BuildClusterConfig
pub fn cluster_config_ref(config_name: &str) -> ObjectReference {
    ObjectReference {
        api_version: Some(format!("{}/v1alpha1", API_GROUP)),
        kind: Some("BuildClusterConfig".to_string()),
        name: Some(config_name.to_string()),
        ..Default::default()
    }
}

/// Production sink wrapping `kube::runtime::events::Recorder`.
///
/// Every event is attached to the named BuildClusterConfig object and also
/// logged. `emit` waits for the API write.
pub struct KubeEventSink {
    recorder: Recorder,
    reference: ObjectReference,
}

impl KubeEventSink {
    /// Create a sink reporting as the given controller and instance, attaching
    /// events to the BuildClusterConfig named `config_name`
    pub fn new(
        client: Client,
        controller_name: &str,
        instance: Option<String>,
        config_name: &str,
    ) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance,
        };
        Self {
            recorder: Recorder::new(client, reporter),
            reference: cluster_config_ref(config_name),
        }
    }
}

#[async_trait]
impl PolicyEventSink for KubeEventSink {
    async fn emit(&self, event: PolicyEvent) {
        log_event(&event);
        let kube_event = Event {
            type_: event.event_type(),
            reason: event.reason().to_string(),
            note: Some(event.note()),
            action: event.action().to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&kube_event, &self.reference).await {
            warn!(
                reason = event.reason(),
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// Sink that only writes structured log lines, for replicas without
/// permission to create Events
pub struct TracingEventSink;

#[async_trait]
impl PolicyEventSink for TracingEventSink {
    async fn emit(&self, event: PolicyEvent) {
        log_event(&event);
    }
}

fn log_event(event: &PolicyEvent) {
    match event {
        PolicyEvent::InvalidConfig {
            generation,
            field,
            message,
        } => warn!(
            event = reasons::INVALID_CONFIG,
            generation = ?generation,
            field = %field,
            message = %message,
            "Rejected build cluster configuration, keeping last known good policy"
        ),
        PolicyEvent::PolicyPublished {
            version,
            generation,
        } => info!(
            event = reasons::POLICY_PUBLISHED,
            version,
            generation = ?generation,
            "Published build policy"
        ),
        PolicyEvent::RegistryDenied {
            host,
            build_id,
            image,
            reason,
        } => warn!(
            event = reasons::REGISTRY_DENIED,
            host = %host,
            build_id = %build_id,
            image = %image,
            reason = %reason,
            "Registry denied image pull"
        ),
    }
}

/// Hands events to a background task that forwards them to another sink.
///
/// `emit` never waits on the inner sink. When `capacity` events are already
/// queued, further events are logged and dropped.
pub struct QueuedEventSink {
    queue: mpsc::Sender<PolicyEvent>,
}

impl QueuedEventSink {
    /// Spawn the forwarding task on the current runtime
    pub fn new(inner: Arc<dyn PolicyEventSink>, capacity: usize) -> Self {
        let (queue, mut pending) = mpsc::channel::<PolicyEvent>(capacity.max(1));
        tokio::spawn(async move {
            while let Some(event) = pending.recv().await {
                inner.emit(event).await;
            }
            debug!("Event queue closed");
        });
        Self { queue }
    }
}

#[async_trait]
impl PolicyEventSink for QueuedEventSink {
    async fn emit(&self, event: PolicyEvent) {
        match self.queue.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(reason = event.reason(), "Event queue full, dropping event");
                log_event(&event);
            }
            Err(TrySendError::Closed(event)) => {
                warn!(reason = event.reason(), "Event queue closed, dropping event");
                log_event(&event);
            }
        }
    }
}

/// Sink that keeps every event in memory, for tests and diagnostics
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<PolicyEvent>>,
}

impl RecordingEventSink {
    /// Create an empty recording sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded events in emission order
    pub fn events(&self) -> Vec<PolicyEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PolicyEventSink for RecordingEventSink {
    async fn emit(&self, event: PolicyEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// Raw configuration failed to compile
    pub const INVALID_CONFIG: &str = "InvalidConfig";
    /// New policy published
    pub const POLICY_PUBLISHED: &str = "PolicyPublished";
    /// Image pull refused by registry policy
    pub const REGISTRY_DENIED: &str = "RegistryDenied";
}

/// Well-known event action strings.
pub mod actions {
    /// Compiling configuration into policy
    pub const COMPILE: &str = "Compile";
    /// Evaluating an image pull
    pub const PULL: &str = "Pull";
}

#[cfg(test)]
mod tests {
    use super::*;

    fn denied() -> PolicyEvent {
        PolicyEvent::RegistryDenied {
            host: "docker.io".to_string(),
            build_id: "sample-build-1".to_string(),
            image: "centos/ruby-25-centos7".to_string(),
            reason: "Source image rejected: registry docker.io is blocked".to_string(),
        }
    }

    #[test]
    fn sinks_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TracingEventSink>();
        assert_send_sync::<RecordingEventSink>();
        assert_send_sync::<KubeEventSink>();
        assert_send_sync::<QueuedEventSink>();
    }

    #[test]
    fn denial_is_a_warning_with_build_id_in_note() {
        let event = denied();
        assert_eq!(event.reason(), "RegistryDenied");
        assert_eq!(event.action(), "Pull");
        assert_eq!(event.event_type(), EventType::Warning);
        assert!(event.note().contains("sample-build-1"));
        assert!(event.note().contains("Source image rejected"));
    }

    #[test]
    fn invalid_config_note_mentions_last_known_good() {
        let event = PolicyEvent::InvalidConfig {
            generation: Some(4),
            field: "proxy.httpProxy".to_string(),
            message: "relative URL without a base".to_string(),
        };
        assert_eq!(event.reason(), reasons::INVALID_CONFIG);
        assert!(event.note().contains("generation 4"));
        assert!(event.note().contains("previous policy remains active"));
    }

    #[test]
    fn cluster_config_ref_points_at_configured_object() {
        let reference = cluster_config_ref("staging");
        assert_eq!(reference.kind.as_deref(), Some("BuildClusterConfig"));
        assert_eq!(reference.name.as_deref(), Some("staging"));
        assert_eq!(
            reference.api_version.as_deref(),
            Some("config.builds.dev/v1alpha1")
        );
    }

    #[tokio::test]
    async fn recording_sink_keeps_order() {
        let sink = RecordingEventSink::new();
        sink.emit(PolicyEvent::PolicyPublished {
            version: 1,
            generation: Some(1),
        })
        .await;
        sink.emit(denied()).await;

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], denied());
    }

    #[tokio::test]
    async fn tracing_sink_does_not_panic() {
        TracingEventSink.emit(denied()).await;
    }

    /// Sink whose API write takes ten seconds
    struct SlowSink {
        delivered: RecordingEventSink,
    }

    #[async_trait]
    impl PolicyEventSink for SlowSink {
        async fn emit(&self, event: PolicyEvent) {
            tokio::time::sleep(std::time::Duration::from_secs(10)).await;
            self.delivered.emit(event).await;
        }
    }

    // =========================================================================
    // Story: a denial is reported while the API server is slow
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn story_queued_emit_does_not_wait_for_slow_sink() {
        let slow = Arc::new(SlowSink {
            delivered: RecordingEventSink::new(),
        });
        let queued = QueuedEventSink::new(slow.clone(), DEFAULT_EVENT_QUEUE_CAPACITY);

        let started = tokio::time::Instant::now();
        tokio::time::timeout(std::time::Duration::from_millis(1), queued.emit(denied()))
            .await
            .expect("emit returns without waiting for the sink");
        assert_eq!(started.elapsed(), std::time::Duration::ZERO);
        assert!(slow.delivered.events().is_empty());

        // The background task still delivers it
        tokio::time::sleep(std::time::Duration::from_secs(11)).await;
        assert_eq!(slow.delivered.events(), vec![denied()]);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_drops_instead_of_blocking() {
        let slow = Arc::new(SlowSink {
            delivered: RecordingEventSink::new(),
        });
        let queued = QueuedEventSink::new(slow.clone(), 1);

        for _ in 0..5 {
            tokio::time::timeout(std::time::Duration::from_millis(1), queued.emit(denied()))
                .await
                .expect("emit never blocks");
        }

        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        let delivered = slow.delivered.events().len();
        assert!((1..5).contains(&delivered), "delivered {delivered}");
    }
}
