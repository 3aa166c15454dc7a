//! Build pod template injection
//!
//! Adds proxy and default environment to every container of a build pod and
//! stamps the pod with the policy it was admitted under. Values a build sets
//! itself always win; injection only fills gaps.

use k8s_openapi::api::core::v1::{Container, EnvVar, Pod};

use buildconfig_common::{
    DEFAULT_REGISTRY_ANNOTATION, POLICY_GENERATION_ANNOTATION, POLICY_UID_ANNOTATION,
    POLICY_VERSION_ANNOTATION,
};

use crate::policy::EffectivePolicy;

/// Environment variable carrying the policy version into build containers
pub const POLICY_VERSION_ENV: &str = "BUILD_POLICY_VERSION";

/// Environment variable carrying the admitting store generation into build containers
pub const POLICY_GENERATION_ENV: &str = "BUILD_POLICY_GENERATION";

/// Environment variable carrying the admitting object uid into build containers
pub const POLICY_UID_ENV: &str = "BUILD_POLICY_UID";

/// Environment variable carrying the default registry into build containers
pub const DEFAULT_REGISTRY_ENV: &str = "BUILD_DEFAULT_REGISTRY";

/// Stateless injector of an [`EffectivePolicy`] into build pods
pub struct PodTemplateInjector;

impl PodTemplateInjector {
    /// Return a copy of `template` with `policy` applied. Never fails.
    ///
    /// - `HTTP_PROXY`, `HTTPS_PROXY` and `NO_PROXY` (and their lowercase
    ///   forms) are added only when the container sets neither spelling
    /// - cluster default env is added only for names the container lacks
    /// - policy version, source revision and default registry are stamped
    ///   as annotations and env. The source revision is what the registry
    ///   gate resolves the admitting policy by on any replica.
    pub fn inject(template: &Pod, policy: &EffectivePolicy) -> Pod {
        let mut pod = template.clone();
        let defaults = default_env(policy);

        if let Some(spec) = pod.spec.as_mut() {
            for container in spec.containers.iter_mut() {
                apply_env(container, &defaults, policy);
            }
            if let Some(init) = spec.init_containers.as_mut() {
                for container in init.iter_mut() {
                    apply_env(container, &defaults, policy);
                }
            }
        }

        let annotations = pod.metadata.annotations.get_or_insert_with(Default::default);
        annotations.insert(
            POLICY_VERSION_ANNOTATION.to_string(),
            policy.version().to_string(),
        );
        match policy.source_revision() {
            Some(source) => {
                annotations.insert(
                    POLICY_GENERATION_ANNOTATION.to_string(),
                    source.generation.to_string(),
                );
                annotations.insert(POLICY_UID_ANNOTATION.to_string(), source.uid.clone());
            }
            None => {
                annotations.remove(POLICY_GENERATION_ANNOTATION);
                annotations.remove(POLICY_UID_ANNOTATION);
            }
        }
        annotations.insert(
            DEFAULT_REGISTRY_ANNOTATION.to_string(),
            policy.default_registry().to_string(),
        );

        pod
    }
}

/// Proxy variables as (upper, lower, value) triples
fn proxy_env(policy: &EffectivePolicy) -> Vec<(&'static str, &'static str, String)> {
    let proxy = policy.proxy();
    let mut vars = Vec::with_capacity(3);
    if let Some(http) = &proxy.http_proxy {
        vars.push(("HTTP_PROXY", "http_proxy", http.clone()));
    }
    if let Some(https) = &proxy.https_proxy {
        vars.push(("HTTPS_PROXY", "https_proxy", https.clone()));
    }
    if let Some(no_proxy) = proxy.no_proxy_value() {
        vars.push(("NO_PROXY", "no_proxy", no_proxy));
    }
    vars
}

fn default_env(policy: &EffectivePolicy) -> Vec<EnvVar> {
    policy
        .default_env()
        .iter()
        .map(|(name, value)| env_var(name, value))
        .collect()
}

fn apply_env(container: &mut Container, defaults: &[EnvVar], policy: &EffectivePolicy) {
    let env = container.env.get_or_insert_with(Vec::new);

    for (upper, lower, value) in proxy_env(policy) {
        if !has_var(env, upper) && !has_var(env, lower) {
            env.push(env_var(upper, &value));
            env.push(env_var(lower, &value));
        }
    }

    for var in defaults {
        if !has_var(env, &var.name) {
            env.push(var.clone());
        }
    }

    // Cluster-owned metadata; always reflects the admitting policy
    set_var(env, POLICY_VERSION_ENV, &policy.version().to_string());
    set_var(env, DEFAULT_REGISTRY_ENV, &policy.default_registry().to_string());
    match policy.source_revision() {
        Some(source) => {
            set_var(env, POLICY_GENERATION_ENV, &source.generation.to_string());
            set_var(env, POLICY_UID_ENV, &source.uid);
        }
        None => env.retain(|var| var.name != POLICY_GENERATION_ENV && var.name != POLICY_UID_ENV),
    }
}

fn has_var(env: &[EnvVar], name: &str) -> bool {
    env.iter().any(|var| var.name == name)
}

fn set_var(env: &mut Vec<EnvVar>, name: &str, value: &str) {
    match env.iter_mut().find(|var| var.name == name) {
        Some(var) => {
            var.value = Some(value.to_string());
            var.value_from = None;
        }
        None => env.push(env_var(name, value)),
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}
