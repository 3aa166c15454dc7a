//! End-to-end flow against the in-memory store: two replicas reconcile one
//! configuration, a client waits for propagation, then a build pod is
//! admitted and its image pulls are gated.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use buildconfig_common::crd::{BuildClusterConfigSpec, ConfigPhase, ProxyConfig, RegistryRule};
use buildconfig_common::events::{PolicyEvent, PolicyEventSink, RecordingEventSink};
use buildconfig_common::{ConfigRevision, CLUSTER_CONFIG_NAME};
use buildconfig_operator::store::ConfigStore;
use buildconfig_operator::tracker::track_local_acks;
use buildconfig_operator::{
    router, ConfigWatcher, MemoryConfigStore, PropagationTracker, WatcherOptions, WebhookState,
};
use buildconfig_policy::{
    policy_slot, PolicyReader, PullGuardCache, DEFAULT_GUARD_CAPACITY, DEFAULT_HISTORY_LIMIT,
};

struct Cluster {
    store: MemoryConfigStore,
    sink: Arc<RecordingEventSink>,
    replica_a: Router,
    readers: Vec<PolicyReader>,
}

/// Start two replicas sharing one store and one view of the replica set
fn start_cluster() -> Cluster {
    let store = MemoryConfigStore::new();
    let sink = Arc::new(RecordingEventSink::new());
    let tracker = Arc::new(PropagationTracker::new());
    let mut routers = Vec::new();
    let mut readers = Vec::new();

    for replica in ["replica-a", "replica-b"] {
        let (publisher, reader) = policy_slot(DEFAULT_HISTORY_LIMIT);
        let watcher = ConfigWatcher::new(
            Arc::new(store.clone()),
            CLUSTER_CONFIG_NAME,
            publisher,
            sink.clone(),
            WatcherOptions::default(),
        );
        tokio::spawn(track_local_acks(
            tracker.clone(),
            replica.to_string(),
            watcher.acknowledgements(),
        ));
        tokio::spawn(watcher.run());

        let events: Arc<dyn PolicyEventSink> = sink.clone();
        routers.push(router(Arc::new(WebhookState {
            policy: reader.clone(),
            tracker: tracker.clone(),
            guards: PullGuardCache::new(events, DEFAULT_GUARD_CAPACITY),
            default_await_timeout: Duration::from_secs(30),
            max_await_timeout: Duration::from_secs(60),
        })));
        readers.push(reader);
    }

    Cluster {
        store,
        sink,
        replica_a: routers.remove(0),
        readers,
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

fn await_request(revision: &ConfigRevision, timeout_secs: u64) -> Request<Body> {
    Request::builder()
        .uri(format!(
            "/propagation/await?generation={}&uid={}&timeoutSeconds={}",
            revision.generation, revision.uid, timeout_secs
        ))
        .body(Body::empty())
        .expect("request")
}

fn json_post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn blocked_docker_io_with_proxy() -> BuildClusterConfigSpec {
    let mut spec = BuildClusterConfigSpec::default();
    spec.registries.blocked_registries = vec![RegistryRule::new("docker.io")];
    spec.proxy = Some(ProxyConfig {
        http_proxy: Some("http://cluster:3128".to_string()),
        https_proxy: None,
        no_proxy: vec![],
    });
    spec
}

// =============================================================================
// Story: administrator blocks docker.io; builds see it once propagation completes
// =============================================================================

#[tokio::test(start_paused = true)]
async fn story_blocked_registry_propagates_to_builds() {
    let cluster = start_cluster();

    let revision = cluster
        .store
        .apply(CLUSTER_CONFIG_NAME, &blocked_docker_io_with_proxy())
        .await
        .expect("apply");
    assert_eq!(revision.generation, 1);

    // No fixed sleep: the await endpoint is the completion signal
    let (status, body) = send(&cluster.replica_a, await_request(&revision, 30)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["acknowledgedBy"], json!(["replica-a", "replica-b"]));
    for reader in &cluster.readers {
        assert!(reader.current().deny_set().len() == 1);
    }

    // A build pod is admitted and receives the cluster proxy
    let review = json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "3f1c",
            "kind": {"group": "", "version": "v1", "kind": "Pod"},
            "resource": {"group": "", "version": "v1", "resource": "pods"},
            "namespace": "builds",
            "operation": "CREATE",
            "userInfo": {},
            "dryRun": false,
            "object": {
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {
                    "name": "ruby-sample-build-1",
                    "labels": {"config.builds.dev/build": "ruby-sample-build-1"}
                },
                "spec": {"containers": [{"name": "sti-build", "image": "builder:latest"}]}
            }
        }
    });
    let (status, body) = send(&cluster.replica_a, json_post("/mutate/pods", review)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["response"]["uid"], "3f1c");
    assert_eq!(body["response"]["allowed"], true);
    assert_eq!(body["response"]["patchType"], "JSONPatch");

    // The build's pull of an unqualified image resolves to docker.io and is denied
    let (status, body) = send(
        &cluster.replica_a,
        json_post(
            "/gate/evaluate",
            json!({
                "imageRef": "centos/ruby-25-centos7",
                "buildId": "ruby-sample-build-1",
                "policyGeneration": revision.generation,
                "policyUid": revision.uid,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["decision"], "deny");
    assert_eq!(body["defaulted"], true);
    assert_eq!(body["policyGeneration"], 1);
    assert_eq!(
        body["reason"],
        "Source image rejected: registry docker.io is blocked"
    );

    assert!(cluster.sink.events().iter().any(|event| matches!(
        event,
        PolicyEvent::RegistryDenied { host, build_id, .. }
            if host == "docker.io" && build_id == "ruby-sample-build-1"
    )));

    let status = cluster
        .store
        .status(CLUSTER_CONFIG_NAME)
        .expect("status written");
    assert_eq!(status.phase, ConfigPhase::Valid);
    assert_eq!(status.observed_generation, Some(1));
}

// =============================================================================
// Story: a rejected configuration never reports as active
// =============================================================================

#[tokio::test(start_paused = true)]
async fn story_invalid_config_times_out_and_keeps_prior_policy() {
    let cluster = start_cluster();

    let first = cluster
        .store
        .apply(CLUSTER_CONFIG_NAME, &blocked_docker_io_with_proxy())
        .await
        .expect("apply");
    let (status, _) = send(&cluster.replica_a, await_request(&first, 30)).await;
    assert_eq!(status, StatusCode::OK);

    let mut broken = blocked_docker_io_with_proxy();
    broken.proxy = Some(ProxyConfig {
        http_proxy: Some("::not-a-url".to_string()),
        https_proxy: None,
        no_proxy: vec![],
    });
    let second = cluster
        .store
        .apply(CLUSTER_CONFIG_NAME, &broken)
        .await
        .expect("apply");

    let (status, body) = send(&cluster.replica_a, await_request(&second, 5)).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["missing"], json!(["replica-a", "replica-b"]));

    // Both replicas still enforce the last valid policy
    for reader in &cluster.readers {
        let policy = reader.current();
        assert_eq!(policy.source_revision(), Some(&first));
        assert_eq!(policy.proxy().http_proxy.as_deref(), Some("http://cluster:3128"));
    }

    let status = cluster
        .store
        .status(CLUSTER_CONFIG_NAME)
        .expect("status written");
    assert_eq!(status.phase, ConfigPhase::Invalid);
    assert!(status
        .message
        .as_deref()
        .is_some_and(|m| m.contains("proxy.httpProxy")));

    assert!(cluster
        .sink
        .events()
        .iter()
        .any(|event| matches!(event, PolicyEvent::InvalidConfig { .. })));
}

// =============================================================================
// Story: the configuration is deleted and re-created
// =============================================================================

#[tokio::test(start_paused = true)]
async fn story_recreated_config_is_awaited_by_its_own_revision() {
    let cluster = start_cluster();

    let mut spec = blocked_docker_io_with_proxy();
    let mut before = cluster
        .store
        .apply(CLUSTER_CONFIG_NAME, &spec)
        .await
        .expect("apply");
    for host in ["quay.io", "ghcr.io"] {
        spec.registries.blocked_registries.push(RegistryRule::new(host));
        before = cluster
            .store
            .apply(CLUSTER_CONFIG_NAME, &spec)
            .await
            .expect("apply");
    }
    assert_eq!(before.generation, 3);
    let (status, _) = send(&cluster.replica_a, await_request(&before, 30)).await;
    assert_eq!(status, StatusCode::OK);

    cluster.store.delete(CLUSTER_CONFIG_NAME).expect("delete");
    let after = cluster
        .store
        .apply(CLUSTER_CONFIG_NAME, &blocked_docker_io_with_proxy())
        .await
        .expect("apply");
    assert_eq!(after.generation, 1);
    assert_ne!(after.uid, before.uid);

    // Generation 3 of the old object does not stand in for generation 1 of the new one
    let (status, body) = send(&cluster.replica_a, await_request(&after, 30)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["uid"], after.uid.as_str());
    for reader in &cluster.readers {
        let policy = reader.current();
        assert_eq!(policy.source_revision(), Some(&after));
        assert_eq!(policy.deny_set().len(), 1);
    }
}
