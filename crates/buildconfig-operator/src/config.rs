//! Command line and environment configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use buildconfig_common::events::DEFAULT_EVENT_QUEUE_CAPACITY;
use buildconfig_common::{CLUSTER_CONFIG_NAME, SYSTEM_NAMESPACE};
use buildconfig_policy::{RegistryHost, DEFAULT_GUARD_CAPACITY, DEFAULT_HISTORY_LIMIT};

/// Cluster build configuration controller
#[derive(Parser, Debug, Clone)]
#[command(name = "buildconfig-operator", version, about, long_about = None)]
pub struct OperatorConfig {
    /// Generate CRD manifests and exit
    #[arg(long)]
    pub crd: bool,

    /// Identity of this replica (normally the pod name)
    #[arg(long, env = "POD_NAME", default_value = "buildconfig-operator-0")]
    pub replica_id: String,

    /// Namespace for replica Leases and the webhook Service
    #[arg(long, env = "POD_NAMESPACE", default_value = SYSTEM_NAMESPACE)]
    pub namespace: String,

    /// Name of the cluster-scoped BuildClusterConfig to reconcile
    #[arg(long, env = "BUILDCONFIG_NAME", default_value = CLUSTER_CONFIG_NAME)]
    pub config_name: String,

    /// Quiet period after a configuration change before recompiling
    #[arg(long, env = "BUILDCONFIG_DEBOUNCE_MS", default_value_t = 500)]
    pub debounce_ms: u64,

    /// Address the HTTPS webhook and gate API listen on
    #[arg(long, env = "BUILDCONFIG_LISTEN_ADDR", default_value = "0.0.0.0:8443")]
    pub listen_addr: SocketAddr,

    /// PEM serving certificate
    #[arg(long, env = "BUILDCONFIG_TLS_CERT", default_value = "/etc/buildconfig/tls/tls.crt")]
    pub tls_cert: PathBuf,

    /// PEM serving key
    #[arg(long, env = "BUILDCONFIG_TLS_KEY", default_value = "/etc/buildconfig/tls/tls.key")]
    pub tls_key: PathBuf,

    /// PEM CA bundle registered with the MutatingWebhookConfiguration.
    /// The webhook configuration is not installed when unset.
    #[arg(long, env = "BUILDCONFIG_WEBHOOK_CA")]
    pub webhook_ca: Option<PathBuf>,

    /// Replica Lease duration in seconds
    #[arg(long, default_value_t = 30)]
    pub lease_duration_secs: u64,

    /// Replica Lease renew interval in seconds
    #[arg(long, default_value_t = 10)]
    pub lease_renew_secs: u64,

    /// Interval between replica Lease listings in seconds
    #[arg(long, default_value_t = 2)]
    pub lease_poll_secs: u64,

    /// Propagation await timeout when the caller gives none
    #[arg(long, env = "BUILDCONFIG_AWAIT_TIMEOUT_SECS", default_value_t = 60)]
    pub await_timeout_secs: u64,

    /// Upper bound on caller-supplied propagation await timeouts
    #[arg(long, default_value_t = 600)]
    pub max_await_timeout_secs: u64,

    /// Number of published policy versions retained for admitted builds
    #[arg(long, default_value_t = DEFAULT_HISTORY_LIMIT)]
    pub history_limit: usize,

    /// Default registry for unqualified images when the configuration names none
    #[arg(long, env = "BUILDCONFIG_FALLBACK_REGISTRY")]
    pub fallback_registry: Option<String>,

    /// Builds whose pull verdicts are cached between gate requests
    #[arg(long, default_value_t = DEFAULT_GUARD_CAPACITY)]
    pub guard_capacity: usize,

    /// Pending Kubernetes Events before new ones are dropped
    #[arg(long, default_value_t = DEFAULT_EVENT_QUEUE_CAPACITY)]
    pub event_queue_capacity: usize,

    /// Log policy events instead of recording Kubernetes Events
    #[arg(long)]
    pub disable_kube_events: bool,

    /// OTLP gRPC endpoint for traces and metrics
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    /// Track only this replica instead of discovering peers through Leases
    #[arg(long)]
    pub standalone: bool,

    /// Skip CRD installation on startup
    #[arg(long)]
    pub skip_install: bool,
}

impl OperatorConfig {
    /// Watcher debounce window
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Lease duration
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    /// Lease renew interval
    pub fn lease_renew(&self) -> Duration {
        Duration::from_secs(self.lease_renew_secs)
    }

    /// Lease poll interval
    pub fn lease_poll(&self) -> Duration {
        Duration::from_secs(self.lease_poll_secs)
    }

    /// Default await timeout, never above the maximum
    pub fn await_timeout(&self) -> Duration {
        Duration::from_secs(self.await_timeout_secs.min(self.max_await_timeout_secs))
    }

    /// Maximum await timeout
    pub fn max_await_timeout(&self) -> Duration {
        Duration::from_secs(self.max_await_timeout_secs)
    }

    /// Parsed fallback registry, if one was given
    pub fn fallback_registry(&self) -> Result<Option<RegistryHost>, String> {
        self.fallback_registry
            .as_deref()
            .map(|host| {
                RegistryHost::parse(host).map_err(|e| format!("invalid fallback registry: {}", e))
            })
            .transpose()
    }

    /// Reject combinations that cannot work
    pub fn validate(&self) -> Result<(), String> {
        if self.lease_renew_secs == 0 || self.lease_renew_secs >= self.lease_duration_secs {
            return Err(format!(
                "lease renew interval ({}s) must be non-zero and below the lease duration ({}s)",
                self.lease_renew_secs, self.lease_duration_secs
            ));
        }
        if self.lease_poll_secs == 0 {
            return Err("lease poll interval must be non-zero".to_string());
        }
        if self.replica_id.is_empty() {
            return Err("replica id must not be empty".to_string());
        }
        if self.guard_capacity == 0 || self.event_queue_capacity == 0 {
            return Err("guard and event queue capacities must be non-zero".to_string());
        }
        self.fallback_registry()?;
        Ok(())
    }
}
