//! Cluster build configuration controller
//!
//! Watches the cluster-scoped `BuildClusterConfig`, compiles it into an
//! immutable build policy, injects that policy into build pods at admission,
//! gates image pulls, and reports when a configuration change is active on
//! every replica.

#![deny(missing_docs)]

/// Command line and environment configuration
pub mod config;
/// Startup utilities (CRD and webhook installation)
pub mod startup;
/// Configuration store abstraction and implementations
pub mod store;
/// Propagation tracking across replicas
pub mod tracker;
/// Configuration watcher and policy publisher
pub mod watcher;
/// Admission webhook, registry gate and propagation API
pub mod webhook;

pub use config::OperatorConfig;
pub use store::{ConfigStore, KubeConfigStore, MemoryConfigStore, StoredConfig, WatchEvent};
pub use tracker::{PropagationRecord, PropagationTracker};
pub use watcher::{ConfigWatcher, WatcherOptions, WatcherState};
pub use webhook::{router, WebhookState};
