//! Registry host parsing and host-pattern matching
//!
//! A registry host is `name` or `name:port`. Rules are exact hosts or a single
//! leading wildcard label (`*.example.com`), which matches exactly one label:
//! `a.example.com` but neither `example.com` nor `a.b.example.com`.
//!
//! A rule without a port matches the host on any port; a rule with a port
//! matches only that port.

use std::fmt;

const MAX_HOST_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// A registry host, lowercased
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RegistryHost {
    name: String,
    port: Option<u16>,
}

impl RegistryHost {
    /// Parse `name` or `name:port`
    pub fn parse(input: &str) -> Result<Self, String> {
        let input = input.trim();
        if input.is_empty() {
            return Err("registry host must not be empty".to_string());
        }
        if input.contains("://") {
            return Err(format!("registry host {:?} must not include a scheme", input));
        }
        if input.contains('/') {
            return Err(format!("registry host {:?} must not include a path", input));
        }

        let (name, port) = split_port(input)?;
        validate_dns_name(name)?;

        Ok(Self {
            name: name.to_ascii_lowercase(),
            port,
        })
    }

    /// Build from an already-validated lowercase name
    pub(crate) fn from_static(name: &'static str) -> Self {
        Self {
            name: name.to_string(),
            port: None,
        }
    }

    /// Host name without port
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Port, if one was given
    pub fn port(&self) -> Option<u16> {
        self.port
    }
}

impl fmt::Display for RegistryHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.name, port),
            None => write!(f, "{}", self.name),
        }
    }
}

/// A compiled registry rule
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostPattern {
    /// Exact host name
    Exact {
        /// Lowercased host name
        name: String,
        /// Required port, if any
        port: Option<u16>,
    },
    /// `*.suffix`: one arbitrary leading label followed by `suffix`
    Wildcard {
        /// Lowercased domain after the `*.`
        suffix: String,
        /// Required port, if any
        port: Option<u16>,
    },
}

impl HostPattern {
    /// Parse a rule host pattern
    pub fn parse(input: &str) -> Result<Self, String> {
        let input = input.trim();
        if input.is_empty() {
            return Err("host pattern must not be empty".to_string());
        }

        match input.strip_prefix("*.") {
            Some(rest) => {
                if rest.contains('*') {
                    return Err(format!(
                        "host pattern {:?} may only contain a single leading wildcard",
                        input
                    ));
                }
                let host = RegistryHost::parse(rest)?;
                Ok(HostPattern::Wildcard {
                    suffix: host.name,
                    port: host.port,
                })
            }
            None => {
                if input.contains('*') {
                    return Err(format!(
                        "host pattern {:?} may only use a wildcard as the whole first label",
                        input
                    ));
                }
                let host = RegistryHost::parse(input)?;
                Ok(HostPattern::Exact {
                    name: host.name,
                    port: host.port,
                })
            }
        }
    }

    /// Whether this pattern matches the host
    pub fn matches(&self, host: &RegistryHost) -> bool {
        match self {
            HostPattern::Exact { name, port } => {
                *name == host.name && port_matches(*port, host.port)
            }
            HostPattern::Wildcard { suffix, port } => {
                let label = host
                    .name
                    .strip_suffix(suffix.as_str())
                    .and_then(|prefix| prefix.strip_suffix('.'));
                matches!(label, Some(l) if !l.is_empty() && !l.contains('.'))
                    && port_matches(*port, host.port)
            }
        }
    }
}

impl fmt::Display for HostPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (prefix, name, port) = match self {
            HostPattern::Exact { name, port } => ("", name, port),
            HostPattern::Wildcard { suffix, port } => ("*.", suffix, port),
        };
        match port {
            Some(port) => write!(f, "{}{}:{}", prefix, name, port),
            None => write!(f, "{}{}", prefix, name),
        }
    }
}

fn port_matches(required: Option<u16>, actual: Option<u16>) -> bool {
    match required {
        Some(port) => actual == Some(port),
        None => true,
    }
}

/// Ordered set of host patterns; the first matching rule wins
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistryMatcher {
    rules: Vec<HostPattern>,
}

impl RegistryMatcher {
    /// Build a matcher preserving rule order
    pub fn new(rules: Vec<HostPattern>) -> Self {
        Self { rules }
    }

    /// First rule matching the host
    pub fn first_match(&self, host: &RegistryHost) -> Option<&HostPattern> {
        self.rules.iter().find(|rule| rule.matches(host))
    }

    /// Whether any rule matches the host
    pub fn matches(&self, host: &RegistryHost) -> bool {
        self.first_match(host).is_some()
    }

    /// Rules in evaluation order
    pub fn rules(&self) -> &[HostPattern] {
        &self.rules
    }

    /// Whether the matcher has no rules
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Number of rules
    pub fn len(&self) -> usize {
        self.rules.len()
    }
}

fn split_port(input: &str) -> Result<(&str, Option<u16>), String> {
    match input.rsplit_once(':') {
        Some((name, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| format!("invalid port in registry host {:?}", input))?;
            if port == 0 {
                return Err(format!("invalid port in registry host {:?}", input));
            }
            Ok((name, Some(port)))
        }
        None => Ok((input, None)),
    }
}

fn validate_dns_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("registry host name must not be empty".to_string());
    }
    if name.len() > MAX_HOST_LEN {
        return Err(format!("registry host {:?} is too long", name));
    }
    for label in name.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(format!("registry host {:?} has an invalid label", name));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(format!(
                "registry host {:?} has a label starting or ending with '-'",
                name
            ));
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(format!(
                "registry host {:?} contains invalid characters",
                name
            ));
        }
    }
    Ok(())
}
