//! Metrics for build policy reconciliation and enforcement
//!
//! Instruments are created lazily against the global meter provider, which is
//! a no-op until telemetry is initialized with an OTLP endpoint.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};

/// Global meter for build configuration metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("buildconfig"));

/// Counter of configuration compilations
///
/// Labels:
/// - `result`: success, invalid
pub static POLICY_COMPILATIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("buildconfig_policy_compilations_total")
        .with_description("Total number of build configuration compilations")
        .with_unit("{compilations}")
        .build()
});

/// Gauge of the policy version currently published on this replica
pub static ACTIVE_POLICY_VERSION: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("buildconfig_active_policy_version")
        .with_description("Local policy version currently published")
        .build()
});

/// Counter of registry gate decisions
///
/// Labels:
/// - `decision`: allow, deny
pub static REGISTRY_DECISIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("buildconfig_registry_decisions_total")
        .with_description("Total number of registry gate decisions")
        .with_unit("{decisions}")
        .build()
});

/// Counter of build pod injections
///
/// Labels:
/// - `result`: mutated, unchanged, error
pub static POD_INJECTIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("buildconfig_pod_injections_total")
        .with_description("Total number of build pods processed by the admission webhook")
        .with_unit("{pods}")
        .build()
});

/// Histogram of propagation wait duration
///
/// Labels:
/// - `result`: converged, timeout, cancelled (caller went away), error
pub static PROPAGATION_WAIT_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("buildconfig_propagation_wait_seconds")
        .with_description("Time callers spent waiting for a configuration to become active")
        .with_unit("s")
        .build()
});
