//! Common types for the build configuration controller: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod metrics;
pub mod retry;
pub mod revision;
pub mod telemetry;

pub use error::Error;
pub use revision::ConfigRevision;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for build configuration resources
pub const API_GROUP: &str = "config.builds.dev";

/// Name of the singleton cluster-wide BuildClusterConfig
pub const CLUSTER_CONFIG_NAME: &str = "cluster";

/// Namespace the operator runs in (Leases, Events, webhook Service)
pub const SYSTEM_NAMESPACE: &str = "buildconfig-system";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "buildconfig-operator";

/// Registry used when neither a default nor a search list is configured
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Label carried by build pods; the value is the build id
pub const BUILD_LABEL: &str = "config.builds.dev/build";

/// Annotation stamped on build pods with the local policy version used at admission
pub const POLICY_VERSION_ANNOTATION: &str = "config.builds.dev/policy-version";

/// Annotation stamped on build pods with the store generation the policy was compiled from
pub const POLICY_GENERATION_ANNOTATION: &str = "config.builds.dev/policy-generation";

/// Annotation stamped on build pods with the uid of the object the policy was compiled from
pub const POLICY_UID_ANNOTATION: &str = "config.builds.dev/policy-uid";

/// Annotation stamped on build pods with the effective default registry
pub const DEFAULT_REGISTRY_ANNOTATION: &str = "config.builds.dev/default-registry";

/// Label marking replica acknowledgement Leases
pub const REPLICA_LABEL_KEY: &str = "config.builds.dev/replica";

/// Annotation on replica Leases carrying the acknowledged store generation
pub const ACKED_GENERATION_ANNOTATION: &str = "config.builds.dev/acked-generation";

/// Annotation on replica Leases carrying the uid of the acknowledged object
pub const ACKED_UID_ANNOTATION: &str = "config.builds.dev/acked-uid";
