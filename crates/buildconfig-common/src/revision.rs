//! Identity of one observed BuildClusterConfig
//!
//! Kubernetes restarts `metadata.generation` at 1 when an object is deleted
//! and re-created, so a generation on its own does not identify a
//! configuration. Every comparison across replicas goes through a
//! [`ConfigRevision`]: the object uid plus the generation within that
//! object's lifetime.

use std::fmt;

/// One generation of one object lifetime
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConfigRevision {
    /// `metadata.uid` of the object
    pub uid: String,
    /// `metadata.generation` within that uid
    pub generation: i64,
}

impl ConfigRevision {
    /// Create a revision
    pub fn new(uid: impl Into<String>, generation: i64) -> Self {
        Self {
            uid: uid.into(),
            generation,
        }
    }

    /// Whether a replica at this revision has activated `target` or a later
    /// generation of the same object.
    ///
    /// Revisions of different objects never cover each other.
    pub fn covers(&self, target: &ConfigRevision) -> bool {
        self.uid == target.uid && self.generation >= target.generation
    }
}

impl fmt::Display for ConfigRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.generation, self.uid)
    }
}
