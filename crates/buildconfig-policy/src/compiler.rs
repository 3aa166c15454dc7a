//! Compilation of raw BuildClusterConfig specs into EffectivePolicy
//!
//! Compilation is pure and deterministic: the same spec and prior version
//! always yield the same policy. Every rejection names the offending field.

use std::collections::{BTreeSet, HashSet};

use buildconfig_common::crd::{BuildClusterConfigSpec, ProxyConfig, RegistryRule};
use buildconfig_common::{ConfigRevision, Error, Result, DEFAULT_REGISTRY};

use crate::host::{HostPattern, RegistryHost, RegistryMatcher};
use crate::policy::{EffectivePolicy, ProxySettings};

/// Compiler from raw configuration to [`EffectivePolicy`]
#[derive(Debug, Clone)]
pub struct PolicyCompiler {
    /// Default registry when neither `defaultRegistry` nor `searchRegistries` is set
    fallback_registry: RegistryHost,
}

impl Default for PolicyCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyCompiler {
    /// Create a compiler falling back to `docker.io`
    pub fn new() -> Self {
        Self {
            fallback_registry: RegistryHost::from_static(DEFAULT_REGISTRY),
        }
    }

    /// Create a compiler with a different fallback default registry, for
    /// clusters that mirror `docker.io`
    pub fn with_fallback_registry(fallback_registry: RegistryHost) -> Self {
        Self { fallback_registry }
    }

    /// Compile `raw` into the policy following `prior_version`
    pub fn compile(&self, raw: &BuildClusterConfigSpec, prior_version: u64) -> Result<EffectivePolicy> {
        self.compile_revision(raw, prior_version, None)
    }

    /// Compile `raw`, recording the object revision it was read at
    ///
    /// Returns `Error::InvalidConfig` if:
    /// - a rule host pattern is empty or malformed
    /// - `defaultRegistry` or a search registry is not a valid `host[:port]`
    /// - a proxy URL does not parse as an http(s) URL with a host
    /// - a `noProxy` entry is empty
    /// - a default env entry has an invalid or duplicate name
    pub fn compile_revision(
        &self,
        raw: &BuildClusterConfigSpec,
        prior_version: u64,
        source: Option<ConfigRevision>,
    ) -> Result<EffectivePolicy> {
        let registries = &raw.registries;

        let search_registries = registries
            .search_registries
            .iter()
            .enumerate()
            .map(|(i, host)| {
                RegistryHost::parse(host).map_err(|e| {
                    Error::invalid_config_field(format!("registries.searchRegistries[{}]", i), e)
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let default_registry = match registries.default_registry.as_deref() {
            Some(host) => RegistryHost::parse(host)
                .map_err(|e| Error::invalid_config_field("registries.defaultRegistry", e))?,
            None => search_registries
                .first()
                .cloned()
                .unwrap_or_else(|| self.fallback_registry.clone()),
        };

        let allow_set = compile_rules("registries.allowedRegistries", &registries.allowed_registries)?;
        let deny_set = compile_rules("registries.blockedRegistries", &registries.blocked_registries)?;

        let proxy = match &raw.proxy {
            Some(proxy) => compile_proxy(proxy)?,
            None => ProxySettings::default(),
        };

        let default_env = compile_env(raw)?;

        let version = prior_version.checked_add(1).ok_or_else(|| {
            Error::internal_with_context("compiler", "policy version overflow")
        })?;

        Ok(EffectivePolicy {
            version,
            source,
            default_registry,
            search_registries,
            allow_set,
            deny_set,
            precedence: registries.precedence,
            proxy,
            default_env,
        })
    }
}

fn compile_rules(field: &str, rules: &[RegistryRule]) -> Result<RegistryMatcher> {
    let patterns = rules
        .iter()
        .enumerate()
        .map(|(i, rule)| {
            HostPattern::parse(&rule.host_pattern).map_err(|e| {
                Error::invalid_config_field(format!("{}[{}].hostPattern", field, i), e)
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(RegistryMatcher::new(patterns))
}

fn compile_proxy(proxy: &ProxyConfig) -> Result<ProxySettings> {
    let http_proxy = compile_proxy_url("proxy.httpProxy", proxy.http_proxy.as_deref())?;
    let https_proxy = compile_proxy_url("proxy.httpsProxy", proxy.https_proxy.as_deref())?;

    let mut no_proxy = BTreeSet::new();
    for (i, entry) in proxy.no_proxy.iter().enumerate() {
        let entry = entry.trim();
        if entry.is_empty() || entry.contains(',') || entry.chars().any(char::is_whitespace) {
            return Err(Error::invalid_config_field(
                format!("proxy.noProxy[{}]", i),
                format!("invalid noProxy entry {:?}", entry),
            ));
        }
        no_proxy.insert(entry.to_string());
    }

    Ok(ProxySettings {
        http_proxy,
        https_proxy,
        no_proxy,
    })
}

/// Empty strings mean "unset"; anything else must be an http(s) URL with a host
fn compile_proxy_url(field: &str, value: Option<&str>) -> Result<Option<String>> {
    let value = match value.map(str::trim) {
        Some(v) if !v.is_empty() => v,
        _ => return Ok(None),
    };

    let url = url::Url::parse(value).map_err(|e| {
        Error::invalid_config_field(field, format!("unparseable proxy URL {:?}: {}", value, e))
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::invalid_config_field(
            field,
            format!("proxy URL {:?} must use http or https", value),
        ));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(Error::invalid_config_field(
            field,
            format!("proxy URL {:?} has no host", value),
        ));
    }

    Ok(Some(value.to_string()))
}

fn compile_env(raw: &BuildClusterConfigSpec) -> Result<Vec<(String, String)>> {
    let mut seen = HashSet::new();
    let mut env = Vec::with_capacity(raw.build_defaults.env.len());
    for (i, var) in raw.build_defaults.env.iter().enumerate() {
        let field = format!("buildDefaults.env[{}].name", i);
        if !is_env_name(&var.name) {
            return Err(Error::invalid_config_field(
                field,
                format!("invalid environment variable name {:?}", var.name),
            ));
        }
        if !seen.insert(var.name.as_str()) {
            return Err(Error::invalid_config_field(
                field,
                format!("duplicate environment variable {:?}", var.name),
            ));
        }
        env.push((var.name.clone(), var.value.clone()));
    }
    Ok(env)
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
