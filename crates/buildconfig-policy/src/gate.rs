//! Registry gate: allow/deny decision for an image pull
//!
//! Evaluation order:
//! 1. Resolve the registry host, substituting the default registry for
//!    unqualified references
//! 2. Deny if the deny list matches, unless the allow list also matches and
//!    precedence is `AllowOverridesDeny`
//! 3. Deny if an allow list is in effect (non-empty) and does not match
//! 4. Otherwise allow

use std::fmt;

use buildconfig_common::crd::RegistryPrecedence;
use thiserror::Error;

use crate::host::RegistryHost;
use crate::image::ImageReference;
use crate::policy::EffectivePolicy;

/// Outcome of a gate evaluation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Decision {
    /// Pull may proceed
    Allow,
    /// Pull must be aborted
    Deny,
}

impl Decision {
    /// Lowercase label used in metrics and API responses
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Deny => "deny",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full result of evaluating one image reference
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GateVerdict {
    /// Allow or deny
    pub decision: Decision,
    /// Reason string; user-facing on Deny
    pub reason: String,
    /// Registry the pull targets; None when the reference did not parse
    pub registry: Option<RegistryHost>,
    /// Whether the default registry was substituted
    pub defaulted: bool,
    /// Rule that decided the outcome, if any
    pub matched_rule: Option<String>,
    /// Version of the policy evaluated against
    pub policy_version: u64,
}

impl GateVerdict {
    /// Whether the pull may proceed
    pub fn is_allowed(&self) -> bool {
        self.decision == Decision::Allow
    }
}

/// A pull refused by registry policy. A user-facing outcome, not an internal error.
///
/// Carries the full verdict so callers can still report how the reference
/// was resolved.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{}", .verdict.reason)]
pub struct RegistryDenied {
    /// Registry host the pull targeted (empty when the reference did not parse)
    pub host: String,
    /// Build that attempted the pull
    pub build_id: String,
    /// Image reference as requested
    pub image: String,
    /// The deny verdict
    pub verdict: GateVerdict,
}

impl RegistryDenied {
    /// User-facing reason string
    pub fn reason(&self) -> &str {
        &self.verdict.reason
    }
}

/// Stateless evaluator of pull targets against a policy snapshot
pub struct RegistryGate;

impl RegistryGate {
    /// Evaluate `image_ref` against `policy`. Pure and deterministic.
    pub fn evaluate(policy: &EffectivePolicy, image_ref: &str) -> GateVerdict {
        let image = match ImageReference::parse(image_ref) {
            Ok(image) => image,
            Err(e) => {
                return GateVerdict {
                    decision: Decision::Deny,
                    reason: format!("Source image rejected: invalid image reference: {}", e),
                    registry: None,
                    defaulted: false,
                    matched_rule: None,
                    policy_version: policy.version(),
                }
            }
        };

        let (host, defaulted) = match image.registry() {
            Some(host) => (host.clone(), false),
            None => (policy.default_registry().clone(), true),
        };

        let allowed_by = policy.allow_set().first_match(&host);
        let denied_by = policy.deny_set().first_match(&host);

        let rescued = allowed_by.is_some()
            && policy.precedence() == RegistryPrecedence::AllowOverridesDeny;

        let (decision, reason, matched_rule) = match (denied_by, allowed_by) {
            (Some(rule), _) if !rescued => (
                Decision::Deny,
                format!("Source image rejected: registry {} is blocked", host),
                Some(rule.to_string()),
            ),
            (_, None) if !policy.allow_set().is_empty() => (
                Decision::Deny,
                format!(
                    "Source image rejected: registry {} is not in the allowed list",
                    host
                ),
                None,
            ),
            (_, allowed) => (
                Decision::Allow,
                format!("registry {} is allowed", host),
                allowed.map(|rule| rule.to_string()),
            ),
        };

        GateVerdict {
            decision,
            reason,
            registry: Some(host),
            defaulted,
            matched_rule,
            policy_version: policy.version(),
        }
    }
}
