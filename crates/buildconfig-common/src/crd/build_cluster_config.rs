//! BuildClusterConfig CRD: cluster-wide build registry and proxy policy
//!
//! A single cluster-scoped object named `cluster` governs which registries
//! builds may pull from, which registry unqualified image references resolve
//! against, and which proxy settings build pods inherit.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// BuildClusterConfig defines registry and proxy policy for every build.
///
/// Example:
/// ```yaml
/// apiVersion: config.builds.dev/v1alpha1
/// kind: BuildClusterConfig
/// metadata:
///   name: cluster
/// spec:
///   registries:
///     searchRegistries: ["docker.io"]
///     blockedRegistries:
///       - hostPattern: docker.io
///   proxy:
///     httpProxy: http://proxy.corp.example.com:3128
///     httpsProxy: http://proxy.corp.example.com:3128
///     noProxy: [".cluster.local", "10.0.0.0/8"]
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "config.builds.dev",
    version = "v1alpha1",
    kind = "BuildClusterConfig",
    status = "BuildClusterConfigStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Policy","type":"integer","jsonPath":".status.policyVersion"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BuildClusterConfigSpec {
    /// Registry search order and allow/deny lists
    #[serde(default)]
    pub registries: RegistriesConfig,

    /// Proxy settings injected into build pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,

    /// Default environment for build pods (never overrides a build's own env)
    #[serde(default)]
    pub build_defaults: BuildDefaults,
}

/// Registry configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistriesConfig {
    /// Registry host used when an image reference names no registry.
    ///
    /// Falls back to the first search registry, then to `docker.io`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_registry: Option<String>,

    /// Ordered registry search list for unqualified image references
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search_registries: Vec<String>,

    /// Registries builds may pull from. Empty means no allow list is in effect.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_registries: Vec<RegistryRule>,

    /// Registries builds may not pull from
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_registries: Vec<RegistryRule>,

    /// How an allow rule and a deny rule matching the same host interact
    #[serde(default)]
    pub precedence: RegistryPrecedence,
}

/// A single registry rule
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryRule {
    /// `host`, `host:port`, or `*.domain` (wildcard matches one leading label)
    pub host_pattern: String,
}

impl RegistryRule {
    /// Create a rule for the given host pattern
    pub fn new(host_pattern: impl Into<String>) -> Self {
        Self {
            host_pattern: host_pattern.into(),
        }
    }
}

/// Precedence between overlapping allow and deny rules
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RegistryPrecedence {
    /// A host matched by both lists is allowed (explicit allow rescues a deny)
    #[default]
    AllowOverridesDeny,
    /// A host matched by the deny list is always denied
    DenyAlwaysWins,
}

/// Proxy settings for build pods
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    /// Proxy URL for plain HTTP traffic
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<String>,

    /// Proxy URL for HTTPS traffic
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https_proxy: Option<String>,

    /// Hosts, domains, or CIDRs that bypass the proxy
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub no_proxy: Vec<String>,
}

/// Cluster-wide build defaults
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildDefaults {
    /// Environment variables added to build containers that do not set them
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvDefault>,
}

/// A default environment variable
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct EnvDefault {
    /// Variable name
    pub name: String,
    /// Variable value
    #[serde(default)]
    pub value: String,
}

/// BuildClusterConfig status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildClusterConfigStatus {
    /// Current phase
    #[serde(default)]
    pub phase: ConfigPhase,

    /// Human-readable message (compile error when Invalid)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Generation of the spec the status describes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Local policy version published from the observed generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_version: Option<u64>,

    /// Last time the phase changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

/// BuildClusterConfig phase
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConfigPhase {
    /// Not compiled yet
    #[default]
    Pending,
    /// Compiled and published
    Valid,
    /// Rejected; the previous policy remains active
    Invalid,
}

impl std::fmt::Display for ConfigPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPhase::Pending => write!(f, "Pending"),
            ConfigPhase::Valid => write!(f, "Valid"),
            ConfigPhase::Invalid => write!(f, "Invalid"),
        }
    }
}
