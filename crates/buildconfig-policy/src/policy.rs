//! Compiled, immutable build policy

use std::collections::BTreeSet;

use buildconfig_common::crd::RegistryPrecedence;
use buildconfig_common::{ConfigRevision, DEFAULT_REGISTRY};

use crate::host::{RegistryHost, RegistryMatcher};

/// Proxy settings injected into build pods
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProxySettings {
    /// Proxy URL for HTTP traffic, as configured
    pub http_proxy: Option<String>,
    /// Proxy URL for HTTPS traffic, as configured
    pub https_proxy: Option<String>,
    /// Proxy bypass entries
    pub no_proxy: BTreeSet<String>,
}

impl ProxySettings {
    /// Whether no proxy setting is configured
    pub fn is_empty(&self) -> bool {
        self.http_proxy.is_none() && self.https_proxy.is_none() && self.no_proxy.is_empty()
    }

    /// `NO_PROXY` value (comma-separated, sorted), if any entry is set
    pub fn no_proxy_value(&self) -> Option<String> {
        if self.no_proxy.is_empty() {
            None
        } else {
            Some(self.no_proxy.iter().cloned().collect::<Vec<_>>().join(","))
        }
    }
}

/// An immutable policy snapshot compiled from one observed configuration.
///
/// Built only by [`crate::PolicyCompiler`]; published through
/// [`crate::PolicyPublisher`] and shared with readers as `Arc<EffectivePolicy>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EffectivePolicy {
    pub(crate) version: u64,
    pub(crate) source: Option<ConfigRevision>,
    pub(crate) default_registry: RegistryHost,
    pub(crate) search_registries: Vec<RegistryHost>,
    pub(crate) allow_set: RegistryMatcher,
    pub(crate) deny_set: RegistryMatcher,
    pub(crate) precedence: RegistryPrecedence,
    pub(crate) proxy: ProxySettings,
    pub(crate) default_env: Vec<(String, String)>,
}

impl EffectivePolicy {
    /// Version 0 placeholder held by a slot before the first publish.
    ///
    /// Readers treat version 0 as "not ready".
    pub fn bootstrap() -> Self {
        Self {
            version: 0,
            source: None,
            default_registry: RegistryHost::from_static(DEFAULT_REGISTRY),
            search_registries: Vec::new(),
            allow_set: RegistryMatcher::default(),
            deny_set: RegistryMatcher::default(),
            precedence: RegistryPrecedence::default(),
            proxy: ProxySettings::default(),
            default_env: Vec::new(),
        }
    }

    /// Local monotonic policy version.
    ///
    /// Counts publishes on this replica only; other replicas number the same
    /// configuration differently. Use [`Self::source_revision`] to compare.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Object uid and generation this policy was compiled from; None for
    /// defaults compiled while the object was absent
    pub fn source_revision(&self) -> Option<&ConfigRevision> {
        self.source.as_ref()
    }

    /// Store generation this policy was compiled from
    pub fn source_generation(&self) -> Option<i64> {
        self.source.as_ref().map(|r| r.generation)
    }

    /// Registry for unqualified image references
    pub fn default_registry(&self) -> &RegistryHost {
        &self.default_registry
    }

    /// Configured registry search order
    pub fn search_registries(&self) -> &[RegistryHost] {
        &self.search_registries
    }

    /// Compiled allow list
    pub fn allow_set(&self) -> &RegistryMatcher {
        &self.allow_set
    }

    /// Compiled deny list
    pub fn deny_set(&self) -> &RegistryMatcher {
        &self.deny_set
    }

    /// Allow/deny precedence
    pub fn precedence(&self) -> RegistryPrecedence {
        self.precedence
    }

    /// Proxy settings
    pub fn proxy(&self) -> &ProxySettings {
        &self.proxy
    }

    /// Default environment for build containers, in configured order
    pub fn default_env(&self) -> &[(String, String)] {
        &self.default_env
    }

    /// Whether two policies enforce the same rules, ignoring version and generation
    pub fn same_rules(&self, other: &EffectivePolicy) -> bool {
        self.default_registry == other.default_registry
            && self.search_registries == other.search_registries
            && self.allow_set == other.allow_set
            && self.deny_set == other.deny_set
            && self.precedence == other.precedence
            && self.proxy == other.proxy
            && self.default_env == other.default_env
    }
}
