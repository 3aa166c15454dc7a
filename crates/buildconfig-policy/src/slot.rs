//! Current-policy slot: single writer, lock-free readers
//!
//! The slot holds an immutable `SlotState` behind an `ArcSwap`. Publishing
//! builds a new state and swaps the pointer, so readers always see either the
//! previous or the next complete snapshot and never wait on the writer.
//!
//! The state also carries a bounded history of recently published policies
//! so a build admitted under an older configuration can be evaluated against
//! it. History is keyed by the source [`ConfigRevision`], which every replica
//! agrees on; local versions differ between replicas and restart with them.

use std::collections::VecDeque;
use std::sync::Arc;

use arc_swap::ArcSwap;
use buildconfig_common::ConfigRevision;
use tokio::sync::watch;

use crate::policy::EffectivePolicy;

/// Number of published policies retained for lookup by source revision
pub const DEFAULT_HISTORY_LIMIT: usize = 16;

#[derive(Debug)]
struct SlotState {
    current: Arc<EffectivePolicy>,
    history: PolicyHistory,
}

struct Shared {
    state: ArcSwap<SlotState>,
    published: watch::Sender<u64>,
}

/// Bounded record of recently published policies, oldest first
#[derive(Clone, Debug)]
struct PolicyHistory {
    entries: VecDeque<Arc<EffectivePolicy>>,
    limit: usize,
}

impl PolicyHistory {
    fn with_limit(limit: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(limit),
            limit,
        }
    }

    fn pushed(&self, policy: Arc<EffectivePolicy>) -> Self {
        let mut next = self.clone();
        next.entries.push_back(policy);
        while next.entries.len() > next.limit {
            next.entries.pop_front();
        }
        next
    }

    /// Newest retained policy compiled from `source`
    fn get(&self, source: &ConfigRevision) -> Option<Arc<EffectivePolicy>> {
        self.entries
            .iter()
            .rev()
            .find(|p| p.source_revision() == Some(source))
            .cloned()
    }

    #[cfg(test)]
    fn generations(&self) -> Vec<Option<i64>> {
        self.entries.iter().map(|p| p.source_generation()).collect()
    }
}

/// Create a slot holding the version 0 bootstrap policy.
///
/// Returns the single writer and a reader handle; more readers come from
/// cloning the reader or calling [`PolicyPublisher::reader`].
pub fn policy_slot(history_limit: usize) -> (PolicyPublisher, PolicyReader) {
    let (published, _) = watch::channel(0);
    let shared = Arc::new(Shared {
        state: ArcSwap::from_pointee(SlotState {
            current: Arc::new(EffectivePolicy::bootstrap()),
            history: PolicyHistory::with_limit(history_limit.max(1)),
        }),
        published,
    });
    (
        PolicyPublisher {
            shared: shared.clone(),
        },
        PolicyReader { shared },
    )
}

/// Sole writer of the current-policy slot. Deliberately not `Clone`.
pub struct PolicyPublisher {
    shared: Arc<Shared>,
}

impl PolicyPublisher {
    /// Atomically publish `policy` as the current policy.
    ///
    /// # Panics
    ///
    /// Panics if `policy.version()` does not exceed the current version.
    /// A non-monotonic publish is a logic error in the single writer.
    pub fn publish(&self, policy: EffectivePolicy) -> Arc<EffectivePolicy> {
        let previous = self.shared.state.load();
        assert!(
            policy.version() > previous.current.version(),
            "non-monotonic policy publish: version {} after {}",
            policy.version(),
            previous.current.version()
        );

        let policy = Arc::new(policy);
        let next = SlotState {
            current: policy.clone(),
            history: previous.history.pushed(policy.clone()),
        };
        self.shared.state.store(Arc::new(next));
        self.shared.published.send_replace(policy.version());
        policy
    }

    /// Version currently published
    pub fn current_version(&self) -> u64 {
        self.shared.state.load().current.version()
    }

    /// A reader handle onto this slot
    pub fn reader(&self) -> PolicyReader {
        PolicyReader {
            shared: self.shared.clone(),
        }
    }
}

/// Read handle onto the current-policy slot
#[derive(Clone)]
pub struct PolicyReader {
    shared: Arc<Shared>,
}

impl PolicyReader {
    /// Snapshot of the current policy
    pub fn current(&self) -> Arc<EffectivePolicy> {
        self.shared.state.load().current.clone()
    }

    /// Version of the current policy (0 before the first publish)
    pub fn version(&self) -> u64 {
        self.shared.state.load().current.version()
    }

    /// Whether a compiled policy has been published
    pub fn is_ready(&self) -> bool {
        self.version() > 0
    }

    /// Policy compiled from `source`, if this replica published it and still
    /// retains it
    pub fn at_revision(&self, source: &ConfigRevision) -> Option<Arc<EffectivePolicy>> {
        self.shared.state.load().history.get(source)
    }

    /// Receiver notified with each newly published version
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.published.subscribe()
    }
}

impl std::fmt::Debug for PolicyReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyReader")
            .field("version", &self.version())
            .finish()
    }
}
