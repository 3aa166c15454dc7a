//! Build policy engine: compiles cluster build configuration into an immutable
//! policy, publishes it to a single-writer slot, and evaluates it on the hot
//! paths (pod admission and image pulls).

#![deny(missing_docs)]

pub mod compiler;
pub mod gate;
pub mod host;
pub mod image;
pub mod injector;
pub mod policy;
pub mod pull_guard;
pub mod slot;

pub use compiler::PolicyCompiler;
pub use gate::{Decision, GateVerdict, RegistryDenied, RegistryGate};
pub use host::{HostPattern, RegistryHost, RegistryMatcher};
pub use image::ImageReference;
pub use injector::PodTemplateInjector;
pub use policy::{EffectivePolicy, ProxySettings};
pub use pull_guard::{PullGuard, PullGuardCache, DEFAULT_GUARD_CAPACITY};
pub use slot::{policy_slot, PolicyPublisher, PolicyReader, DEFAULT_HISTORY_LIMIT};
