//! Propagation tracking: "is this configuration active on every replica?"
//!
//! Each replica acknowledges the [`ConfigRevision`] its active policy was
//! compiled from. Within one object uid only the highest acknowledged
//! generation is kept, so duplicate and reordered acknowledgements are
//! harmless. An acknowledgement for a different uid replaces the previous
//! one: the object was deleted and re-created and its generations restarted.
//! A revision is active once every known replica acknowledged it or a later
//! generation of the same object.
//!
//! Waiters block on a `tokio::sync::watch` channel with a timeout; dropping
//! the wait future releases the caller without leaving a task behind.

pub mod lease;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use buildconfig_common::metrics::PROPAGATION_WAIT_DURATION;
use buildconfig_common::{ConfigRevision, Error, Result};

/// Acknowledgement state for a single revision
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropagationRecord {
    /// Awaited revision
    pub revision: ConfigRevision,
    /// Known replicas that acknowledged `revision` or a later generation of it
    pub acknowledged_by: BTreeSet<String>,
}

#[derive(Clone, Debug, Default)]
struct AckState {
    known: BTreeSet<String>,
    acked: BTreeMap<String, ConfigRevision>,
}

impl AckState {
    fn has_acked(&self, replica: &str, target: &ConfigRevision) -> bool {
        self.acked.get(replica).is_some_and(|acked| acked.covers(target))
    }

    fn is_active(&self, target: &ConfigRevision) -> bool {
        !self.known.is_empty() && self.known.iter().all(|r| self.has_acked(r, target))
    }

    fn record(&self, target: &ConfigRevision) -> PropagationRecord {
        PropagationRecord {
            revision: target.clone(),
            acknowledged_by: self
                .known
                .iter()
                .filter(|r| self.has_acked(r, target))
                .cloned()
                .collect(),
        }
    }

    fn missing(&self, target: &ConfigRevision) -> Vec<String> {
        self.known
            .iter()
            .filter(|r| !self.has_acked(r, target))
            .cloned()
            .collect()
    }

    fn ack(&mut self, replica: &str, revision: &ConfigRevision) -> bool {
        match self.acked.get(replica) {
            Some(previous)
                if previous.uid == revision.uid && previous.generation >= revision.generation =>
            {
                false
            }
            _ => {
                self.acked.insert(replica.to_string(), revision.clone());
                true
            }
        }
    }
}

/// Records the wait duration on drop, labeled by how the wait ended
struct WaitTimer {
    started: Instant,
    result: Option<&'static str>,
}

impl WaitTimer {
    fn start() -> Self {
        Self {
            started: Instant::now(),
            result: None,
        }
    }

    fn finish(&mut self, result: &'static str) -> Duration {
        self.result = Some(result);
        self.started.elapsed()
    }

    /// Label for a wait that never finished: the caller dropped the future
    fn label(&self) -> &'static str {
        self.result.unwrap_or("cancelled")
    }
}

impl Drop for WaitTimer {
    fn drop(&mut self) {
        PROPAGATION_WAIT_DURATION.record(
            self.started.elapsed().as_secs_f64(),
            &[KeyValue::new("result", self.label())],
        );
    }
}

/// Tracks which replicas have activated which configuration revision
pub struct PropagationTracker {
    state: watch::Sender<AckState>,
}

impl Default for PropagationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PropagationTracker {
    /// Create a tracker with no known replicas
    pub fn new() -> Self {
        Self {
            state: watch::channel(AckState::default()).0,
        }
    }

    /// Add a replica to the known set
    pub fn register_replica(&self, replica: &str) {
        self.state.send_if_modified(|state| state.known.insert(replica.to_string()));
    }

    /// Remove a replica and its acknowledgements
    pub fn remove_replica(&self, replica: &str) {
        self.state.send_if_modified(|state| {
            let removed = state.known.remove(replica);
            state.acked.remove(replica);
            removed
        });
    }

    /// Record that `replica` activated `revision`.
    ///
    /// Idempotent; lower generations of the same object are ignored, and a
    /// revision of a different object replaces the previous acknowledgement.
    pub fn acknowledge(&self, replica: &str, revision: &ConfigRevision) {
        let advanced = self.state.send_if_modified(|state| state.ack(replica, revision));
        if advanced {
            debug!(replica, revision = %revision, "Replica acknowledged configuration");
        }
    }

    /// Replace the known replica set with `replicas` and merge their acknowledgements.
    ///
    /// Replicas absent from `replicas` are forgotten.
    pub fn sync_replicas<I>(&self, replicas: I)
    where
        I: IntoIterator<Item = (String, Option<ConfigRevision>)>,
    {
        let replicas: Vec<_> = replicas.into_iter().collect();
        self.state.send_if_modified(|state| {
            let known: BTreeSet<String> = replicas.iter().map(|(id, _)| id.clone()).collect();
            let mut changed = known != state.known;
            state.known = known;
            state.acked.retain(|id, _| state.known.contains(id));
            for (id, acked) in &replicas {
                if let Some(revision) = acked {
                    changed |= state.ack(id, revision);
                }
            }
            changed
        });
    }

    /// Known replica ids
    pub fn replicas(&self) -> BTreeSet<String> {
        self.state.borrow().known.clone()
    }

    /// Current acknowledgement record for `revision`
    pub fn record(&self, revision: &ConfigRevision) -> PropagationRecord {
        self.state.borrow().record(revision)
    }

    /// Whether `revision` is active on every known replica
    pub fn is_active(&self, revision: &ConfigRevision) -> bool {
        self.state.borrow().is_active(revision)
    }

    /// Wait until `revision` is active on every known replica.
    ///
    /// Returns `Error::Timeout` naming the replicas still missing when
    /// `timeout` elapses first.
    pub async fn await_revision(
        &self,
        revision: &ConfigRevision,
        timeout: Duration,
    ) -> Result<PropagationRecord> {
        let mut timer = WaitTimer::start();
        let mut rx = self.state.subscribe();

        let converged = tokio::time::timeout(timeout, async {
            rx.wait_for(|state| state.is_active(revision))
                .await
                .map(|state| state.record(revision))
        })
        .await;

        match converged {
            Ok(Ok(record)) => {
                let waited = timer.finish("converged");
                info!(
                    revision = %revision,
                    replicas = record.acknowledged_by.len(),
                    waited_ms = waited.as_millis() as u64,
                    "Configuration active on all replicas"
                );
                Ok(record)
            }
            Ok(Err(_)) => {
                timer.finish("error");
                Err(Error::internal_with_context(
                    "tracker",
                    "acknowledgement channel closed",
                ))
            }
            Err(_) => {
                timer.finish("timeout");
                let missing = self.state.borrow().missing(revision);
                warn!(
                    revision = %revision,
                    missing = ?missing,
                    "Timed out waiting for configuration to propagate"
                );
                Err(Error::timeout(revision.generation, timeout, missing))
            }
        }
    }
}

/// Feed this replica's own acknowledgements into the tracker.
///
/// Runs until the acknowledgement sender is dropped.
pub async fn track_local_acks(
    tracker: Arc<PropagationTracker>,
    replica: String,
    mut acks: watch::Receiver<Option<ConfigRevision>>,
) {
    tracker.register_replica(&replica);
    loop {
        let acked = acks.borrow_and_update().clone();
        if let Some(revision) = acked {
            tracker.acknowledge(&replica, &revision);
        }
        if acks.changed().await.is_err() {
            debug!(replica = %replica, "Acknowledgement source closed");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UID: &str = "3a7f-uid";

    fn rev(generation: i64) -> ConfigRevision {
        ConfigRevision::new(UID, generation)
    }

    fn tracker_with(replicas: &[&str]) -> Arc<PropagationTracker> {
        let tracker = Arc::new(PropagationTracker::new());
        for replica in replicas {
            tracker.register_replica(replica);
        }
        tracker
    }

    // =========================================================================
    // Story: a waiter is released once every replica has acknowledged
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn story_await_succeeds_once_all_replicas_ack() {
        let tracker = tracker_with(&["replica-a", "replica-b"]);

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.await_revision(&rev(3), Duration::from_secs(30)).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        tracker.acknowledge("replica-a", &rev(3));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());

        // A later generation also satisfies the wait
        tracker.acknowledge("replica-b", &rev(4));

        let record = waiter.await.expect("join").expect("converged");
        assert_eq!(record.revision, rev(3));
        assert_eq!(
            record.acknowledged_by,
            ["replica-a", "replica-b"].into_iter().map(String::from).collect::<BTreeSet<_>>()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn await_times_out_naming_missing_replicas() {
        let tracker = tracker_with(&["replica-a", "replica-b"]);
        tracker.acknowledge("replica-a", &rev(2));

        let err = tracker
            .await_revision(&rev(2), Duration::from_secs(10))
            .await
            .expect_err("timeout");
        match err {
            Error::Timeout {
                generation,
                waited,
                missing,
            } => {
                assert_eq!(generation, 2);
                assert_eq!(waited, Duration::from_secs(10));
                assert_eq!(missing, vec!["replica-b".to_string()]);
            }
            other => panic!("expected Timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn already_active_revision_returns_immediately() {
        let tracker = tracker_with(&["replica-a"]);
        tracker.acknowledge("replica-a", &rev(5));
        let record = tracker
            .await_revision(&rev(5), Duration::from_millis(1))
            .await
            .expect("already active");
        assert!(record.acknowledged_by.contains("replica-a"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_wait_releases_promptly() {
        let tracker = tracker_with(&["replica-a"]);
        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.await_revision(&rev(1), Duration::from_secs(3600)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter.abort();
        assert!(waiter.await.expect_err("aborted").is_cancelled());
        // The sender never kept the waiter alive
        assert_eq!(tracker.state.receiver_count(), 0);
    }

    #[test]
    fn unfinished_wait_is_labeled_cancelled() {
        let mut timer = WaitTimer::start();
        assert_eq!(timer.label(), "cancelled");
        timer.finish("converged");
        assert_eq!(timer.label(), "converged");
    }

    #[test]
    fn acknowledgements_are_idempotent_and_order_independent() {
        let tracker = tracker_with(&["replica-a"]);
        tracker.acknowledge("replica-a", &rev(5));
        tracker.acknowledge("replica-a", &rev(3));
        tracker.acknowledge("replica-a", &rev(5));
        assert!(tracker.is_active(&rev(5)));
        assert!(tracker.is_active(&rev(4)));
        assert!(!tracker.is_active(&rev(6)));
    }

    // =========================================================================
    // Story: the configuration is deleted and re-created
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn story_recreated_object_restarts_acknowledgements() {
        let tracker = tracker_with(&["replica-a"]);
        tracker.acknowledge("replica-a", &rev(5));

        // Generation 1 of the new object is not covered by generation 5 of the old one
        let recreated = ConfigRevision::new("9c2d-uid", 1);
        assert!(!tracker.is_active(&recreated));
        assert!(tracker
            .await_revision(&recreated, Duration::from_millis(10))
            .await
            .is_err());

        // Acknowledging the new object replaces the old acknowledgement
        tracker.acknowledge("replica-a", &recreated);
        assert!(tracker.is_active(&recreated));
        assert!(!tracker.is_active(&ConfigRevision::new("9c2d-uid", 2)));
        assert!(!tracker.is_active(&rev(5)));
    }

    #[test]
    fn no_known_replicas_is_never_active() {
        let tracker = PropagationTracker::new();
        tracker.acknowledge("stray", &rev(1));
        assert!(!tracker.is_active(&rev(1)));
        assert!(tracker.record(&rev(1)).acknowledged_by.is_empty());
    }

    #[test]
    fn removed_replica_no_longer_blocks() {
        let tracker = tracker_with(&["replica-a", "replica-b"]);
        tracker.acknowledge("replica-a", &rev(1));
        assert!(!tracker.is_active(&rev(1)));
        tracker.remove_replica("replica-b");
        assert!(tracker.is_active(&rev(1)));
    }

    #[test]
    fn sync_replaces_known_set_and_merges_acks() {
        let tracker = tracker_with(&["gone"]);
        tracker.acknowledge("gone", &rev(9));

        tracker.sync_replicas(vec![
            ("replica-a".to_string(), Some(rev(2))),
            ("replica-b".to_string(), None),
        ]);
        assert_eq!(tracker.replicas().len(), 2);
        assert!(!tracker.is_active(&rev(2)));

        tracker.sync_replicas(vec![
            ("replica-a".to_string(), Some(rev(1))),
            ("replica-b".to_string(), Some(rev(2))),
        ]);
        // replica-a keeps its higher acknowledgement
        assert!(tracker.is_active(&rev(2)));
    }

    #[tokio::test]
    async fn local_acks_flow_into_tracker() {
        let tracker = Arc::new(PropagationTracker::new());
        let (tx, rx) = watch::channel(None);
        let task = tokio::spawn(track_local_acks(tracker.clone(), "self".to_string(), rx));

        tx.send_replace(Some(rev(7)));
        let record = tracker
            .await_revision(&rev(7), Duration::from_secs(5))
            .await
            .expect("local ack");
        assert!(record.acknowledged_by.contains("self"));

        drop(tx);
        task.await.expect("task ends when sender drops");
    }
}
