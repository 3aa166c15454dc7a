//! Per-build pull guard
//!
//! The build execution path creates one guard per build, capturing the policy
//! the build was admitted under. Each distinct image reference is evaluated
//! once; repeated pulls of the same reference reuse the first verdict.
//!
//! Gate requests arrive one pull at a time, so [`PullGuardCache`] keeps the
//! guards of recently seen builds between requests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use buildconfig_common::events::{PolicyEvent, PolicyEventSink};
use buildconfig_common::metrics::REGISTRY_DECISIONS;
use opentelemetry::KeyValue;
use tracing::{debug, info};

use crate::gate::{GateVerdict, RegistryDenied, RegistryGate};
use crate::policy::EffectivePolicy;

/// Memoizing gate for a single build
pub struct PullGuard {
    policy: Arc<EffectivePolicy>,
    build_id: String,
    sink: Arc<dyn PolicyEventSink>,
    verdicts: HashMap<String, GateVerdict>,
}

impl PullGuard {
    /// Create a guard for `build_id` bound to one policy snapshot
    pub fn new(
        policy: Arc<EffectivePolicy>,
        build_id: impl Into<String>,
        sink: Arc<dyn PolicyEventSink>,
    ) -> Self {
        Self {
            policy,
            build_id: build_id.into(),
            sink,
            verdicts: HashMap::new(),
        }
    }

    /// Policy the guard evaluates against
    pub fn policy(&self) -> &Arc<EffectivePolicy> {
        &self.policy
    }

    /// Check an image reference before pulling it.
    ///
    /// Denials are reported to the sink on first evaluation only.
    pub async fn check(&mut self, image_ref: &str) -> Result<GateVerdict, RegistryDenied> {
        let verdict = match self.verdicts.get(image_ref) {
            Some(verdict) => {
                debug!(build_id = %self.build_id, image = %image_ref, "Reusing registry verdict");
                verdict.clone()
            }
            None => {
                let verdict = self.evaluate_first(image_ref).await;
                self.verdicts.insert(image_ref.to_string(), verdict.clone());
                verdict
            }
        };

        if verdict.is_allowed() {
            Ok(verdict)
        } else {
            Err(self.denied(image_ref, &verdict))
        }
    }

    async fn evaluate_first(&self, image_ref: &str) -> GateVerdict {
        let verdict = RegistryGate::evaluate(&self.policy, image_ref);
        REGISTRY_DECISIONS.add(1, &[KeyValue::new("decision", verdict.decision.as_str())]);

        if verdict.defaulted {
            if let Some(host) = &verdict.registry {
                info!(build_id = %self.build_id, "defaulting registry to {}", host);
            }
        }

        if !verdict.is_allowed() {
            let denied = self.denied(image_ref, &verdict);
            self.sink
                .emit(PolicyEvent::RegistryDenied {
                    host: denied.host,
                    build_id: denied.build_id,
                    image: denied.image,
                    reason: denied.verdict.reason,
                })
                .await;
        }

        verdict
    }

    fn denied(&self, image_ref: &str, verdict: &GateVerdict) -> RegistryDenied {
        RegistryDenied {
            host: verdict
                .registry
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
            build_id: self.build_id.clone(),
            image: image_ref.to_string(),
            verdict: verdict.clone(),
        }
    }
}

/// Guards retained per build before the oldest is evicted
pub const DEFAULT_GUARD_CAPACITY: usize = 1024;

/// A cached guard and the policy it was created for
type CachedGuard = (Arc<EffectivePolicy>, Arc<tokio::sync::Mutex<PullGuard>>);

#[derive(Default)]
struct CachedGuards {
    by_build: HashMap<String, CachedGuard>,
    /// Build ids in insertion order, oldest first
    order: VecDeque<String>,
}

/// Bounded set of per-build guards, evicting the oldest build first
pub struct PullGuardCache {
    sink: Arc<dyn PolicyEventSink>,
    capacity: usize,
    guards: Mutex<CachedGuards>,
}

impl PullGuardCache {
    /// Create a cache whose guards report denials to `sink`
    pub fn new(sink: Arc<dyn PolicyEventSink>, capacity: usize) -> Self {
        Self {
            sink,
            capacity: capacity.max(1),
            guards: Mutex::new(CachedGuards::default()),
        }
    }

    /// Guard for `build_id` evaluating `policy`.
    ///
    /// Returns the cached guard when it was created for the same policy
    /// snapshot; otherwise a fresh guard replaces it.
    pub fn guard(
        &self,
        build_id: &str,
        policy: Arc<EffectivePolicy>,
    ) -> Arc<tokio::sync::Mutex<PullGuard>> {
        let mut cached = self.guards.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some((bound, guard)) = cached.by_build.get(build_id) {
            if Arc::ptr_eq(bound, &policy) {
                return guard.clone();
            }
        }

        let guard = Arc::new(tokio::sync::Mutex::new(PullGuard::new(
            policy.clone(),
            build_id,
            self.sink.clone(),
        )));
        let replaced = cached
            .by_build
            .insert(build_id.to_string(), (policy, guard.clone()));
        if replaced.is_none() {
            cached.order.push_back(build_id.to_string());
        }
        while cached.by_build.len() > self.capacity {
            match cached.order.pop_front() {
                Some(oldest) => {
                    cached.by_build.remove(&oldest);
                    debug!(build_id = %oldest, "Evicted pull guard");
                }
                None => break,
            }
        }
        guard
    }

    /// Number of builds with a cached guard
    pub fn len(&self) -> usize {
        self.guards
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_build
            .len()
    }

    /// Whether no guard is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
