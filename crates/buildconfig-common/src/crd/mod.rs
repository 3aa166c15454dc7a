//! Custom Resource Definitions for the build configuration controller

mod build_cluster_config;

pub use build_cluster_config::{
    BuildClusterConfig, BuildClusterConfigSpec, BuildClusterConfigStatus, BuildDefaults,
    ConfigPhase, EnvDefault, ProxyConfig, RegistriesConfig, RegistryPrecedence, RegistryRule,
};
