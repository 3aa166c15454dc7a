//! Build configuration operator - cluster build policy for build pods

use std::sync::Arc;
use std::time::Duration;

use axum_server::Handle;
use clap::Parser;
use kube::{Client, CustomResourceExt};
use tokio::signal::unix::{signal, SignalKind};

use buildconfig_common::crd::BuildClusterConfig;
use buildconfig_common::events::{KubeEventSink, PolicyEventSink, QueuedEventSink, TracingEventSink};
use buildconfig_common::telemetry::{init_telemetry, TelemetryConfig};
use buildconfig_operator::startup::{ensure_crds_installed, ensure_webhook_config, WebhookInstall};
use buildconfig_operator::store::KubeConfigStore;
use buildconfig_operator::tracker::lease::{LeasePoller, ReplicaLease};
use buildconfig_operator::tracker::{track_local_acks, PropagationTracker};
use buildconfig_operator::webhook::{self, ServerConfig, WebhookState};
use buildconfig_operator::{ConfigWatcher, OperatorConfig, WatcherOptions};
use buildconfig_policy::{policy_slot, PolicyCompiler, PullGuardCache};

const CONTROLLER_NAME: &str = "buildconfig-operator";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}. \
             The webhook cannot serve TLS without it.",
            e
        );
        std::process::exit(1);
    }

    let cli = OperatorConfig::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&BuildClusterConfig::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    cli.validate().map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;
    let telemetry = init_telemetry(&TelemetryConfig::for_replica(
        cli.replica_id.clone(),
        cli.namespace.clone(),
        cli.otlp_endpoint.clone(),
    ))?;
    tracing::info!(exporting = telemetry.is_exporting(), "Telemetry initialized");

    let result = run(cli).await;
    drop(telemetry);
    result
}

async fn run(cli: OperatorConfig) -> anyhow::Result<()> {
    tracing::info!(
        replica = %cli.replica_id,
        namespace = %cli.namespace,
        config = %cli.config_name,
        standalone = cli.standalone,
        "Starting build configuration operator"
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kube client: {}", e))?;

    if !cli.skip_install {
        ensure_crds_installed(&client).await?;
    }
    if let Some(ca_path) = &cli.webhook_ca {
        let ca_bundle = tokio::fs::read(ca_path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to read webhook CA {}: {}", ca_path.display(), e))?;
        let install = WebhookInstall {
            namespace: cli.namespace.clone(),
            target_port: cli.listen_addr.port(),
            ca_bundle,
        };
        ensure_webhook_config(&client, &install).await?;
    }

    let store = Arc::new(KubeConfigStore::new(client.clone()));
    let sink: Arc<dyn PolicyEventSink> = if cli.disable_kube_events {
        Arc::new(TracingEventSink)
    } else {
        let events = KubeEventSink::new(
            client.clone(),
            CONTROLLER_NAME,
            Some(cli.replica_id.clone()),
            &cli.config_name,
        );
        Arc::new(QueuedEventSink::new(Arc::new(events), cli.event_queue_capacity))
    };
    let (publisher, reader) = policy_slot(cli.history_limit);
    let tracker = Arc::new(PropagationTracker::new());

    let mut watcher = ConfigWatcher::new(
        store,
        cli.config_name.clone(),
        publisher,
        sink.clone(),
        WatcherOptions {
            debounce: cli.debounce(),
            ..Default::default()
        },
    );
    if let Some(fallback) = cli.fallback_registry().map_err(|e| anyhow::anyhow!(e))? {
        tracing::info!(registry = %fallback, "Using fallback default registry");
        watcher = watcher.with_compiler(PolicyCompiler::with_fallback_registry(fallback));
    }
    let acks = watcher.acknowledgements();

    tokio::spawn(track_local_acks(
        tracker.clone(),
        cli.replica_id.clone(),
        acks.clone(),
    ));

    let lease = if cli.standalone {
        None
    } else {
        let lease = ReplicaLease::new(client.clone(), &cli.namespace, &cli.replica_id)
            .with_timing(cli.lease_duration(), cli.lease_renew());
        tokio::spawn(lease.clone().run(acks));
        tokio::spawn(
            LeasePoller::new(client.clone(), &cli.namespace, tracker.clone())
                .with_interval(cli.lease_poll())
                .run(),
        );
        Some(lease)
    };

    tokio::spawn(watcher.run());

    let state = Arc::new(WebhookState {
        policy: reader,
        tracker,
        guards: PullGuardCache::new(sink, cli.guard_capacity),
        default_await_timeout: cli.await_timeout(),
        max_await_timeout: cli.max_await_timeout(),
    });

    let handle = Handle::new();
    tokio::spawn(shutdown_on_signal(handle.clone()));

    let served = webhook::serve(
        ServerConfig {
            addr: cli.listen_addr,
            cert_path: cli.tls_cert.clone(),
            key_path: cli.tls_key.clone(),
        },
        webhook::router(state),
        handle,
    )
    .await;

    if let Some(lease) = lease {
        lease.release().await;
    }
    tracing::info!("Build configuration operator stopped");
    served
}

async fn shutdown_on_signal(handle: Handle) {
    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!(error = %e, "Failed to register signal handlers, graceful shutdown disabled");
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        _ = sigint.recv() => tracing::info!("Received SIGINT"),
    }
    handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
}
