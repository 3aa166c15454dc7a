//! Image reference parsing
//!
//! Splits a pull target into the registry host and the remainder. The first
//! path component is treated as a registry host when it contains a `.` or a
//! `:`, or is exactly `localhost`; otherwise the reference is unqualified and
//! resolves against the policy's default registry.

use std::fmt;

use crate::host::RegistryHost;

/// A parsed image reference
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageReference {
    registry: Option<RegistryHost>,
    remainder: String,
}

impl ImageReference {
    /// Parse an image reference such as `quay.io/org/app:1.0` or `library/ruby`
    pub fn parse(input: &str) -> Result<Self, String> {
        let input = input.trim();
        if input.is_empty() {
            return Err("image reference must not be empty".to_string());
        }
        if input.contains("://") {
            return Err(format!(
                "image reference {:?} must not include a scheme",
                input
            ));
        }
        if input.chars().any(char::is_whitespace) {
            return Err(format!(
                "image reference {:?} must not contain whitespace",
                input
            ));
        }

        let (registry, remainder) = match input.split_once('/') {
            Some((first, rest)) if looks_like_registry(first) => {
                let host = RegistryHost::parse(first)
                    .map_err(|e| format!("image reference {:?}: {}", input, e))?;
                (Some(host), rest)
            }
            _ => (None, input),
        };

        if remainder.is_empty() || remainder.starts_with('/') || remainder.ends_with('/') {
            return Err(format!(
                "image reference {:?} has no repository path",
                input
            ));
        }

        Ok(Self {
            registry,
            remainder: remainder.to_string(),
        })
    }

    /// Explicit registry host, if the reference names one
    pub fn registry(&self) -> Option<&RegistryHost> {
        self.registry.as_ref()
    }

    /// Repository path with tag or digest
    pub fn remainder(&self) -> &str {
        &self.remainder
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.registry {
            Some(host) => write!(f, "{}/{}", host, self.remainder),
            None => write!(f, "{}", self.remainder),
        }
    }
}

fn looks_like_registry(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}
