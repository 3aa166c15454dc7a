//! Replica acknowledgements via Kubernetes Leases
//!
//! Every replica owns one `coordination.k8s.io/v1` Lease named
//! `buildconfig-replica-<id>`, labeled `config.builds.dev/replica=true`. The
//! Lease is renewed periodically and annotated with the uid and generation of
//! the stored configuration the replica's active policy was compiled from.
//!
//! A poller lists replica Leases and feeds the unexpired ones into the
//! [`PropagationTracker`]: the unexpired Leases are the known replica set, and
//! their annotations are the acknowledgements.
//!
//! Each replica only ever writes its own Lease, so renewals use server-side
//! apply instead of the compare-and-swap a shared leader Lease needs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::Client;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use buildconfig_common::{
    ConfigRevision, ACKED_GENERATION_ANNOTATION, ACKED_UID_ANNOTATION, FIELD_MANAGER,
    REPLICA_LABEL_KEY,
};

use super::PropagationTracker;

/// Prefix of replica Lease names
pub const REPLICA_LEASE_PREFIX: &str = "buildconfig-replica-";

/// Default Lease timing
pub const LEASE_DURATION: Duration = Duration::from_secs(30);
/// Default interval between renewals
pub const RENEW_INTERVAL: Duration = Duration::from_secs(10);
/// Default interval between Lease listings
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Lease name for a replica
pub fn lease_name(replica_id: &str) -> String {
    format!("{}{}", REPLICA_LEASE_PREFIX, replica_id)
}

/// Build the desired Lease for a replica
pub fn build_lease(
    replica_id: &str,
    namespace: &str,
    lease_duration: Duration,
    acked: Option<&ConfigRevision>,
    now: DateTime<Utc>,
) -> Lease {
    let annotations = acked.map(|revision| {
        BTreeMap::from([
            (
                ACKED_GENERATION_ANNOTATION.to_string(),
                revision.generation.to_string(),
            ),
            (ACKED_UID_ANNOTATION.to_string(), revision.uid.clone()),
        ])
    });

    Lease {
        metadata: ObjectMeta {
            name: Some(lease_name(replica_id)),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                REPLICA_LABEL_KEY.to_string(),
                "true".to_string(),
            )])),
            annotations,
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(replica_id.to_string()),
            lease_duration_seconds: Some(lease_duration.as_secs() as i32),
            renew_time: Some(MicroTime(now)),
            ..Default::default()
        }),
    }
}

/// Replica id and acknowledged revision of every unexpired replica Lease
pub fn replica_acks(
    leases: &[Lease],
    now: DateTime<Utc>,
) -> Vec<(String, Option<ConfigRevision>)> {
    leases
        .iter()
        .filter(|lease| !is_expired(lease, now))
        .filter_map(|lease| {
            let replica = lease
                .spec
                .as_ref()
                .and_then(|s| s.holder_identity.clone())
                .or_else(|| {
                    lease
                        .metadata
                        .name
                        .as_deref()
                        .and_then(|n| n.strip_prefix(REPLICA_LEASE_PREFIX))
                        .map(String::from)
                })?;
            Some((replica, acked_revision(lease)))
        })
        .collect()
}

/// Both annotations must be present and the generation numeric
fn acked_revision(lease: &Lease) -> Option<ConfigRevision> {
    let annotations = lease.metadata.annotations.as_ref()?;
    let generation = annotations
        .get(ACKED_GENERATION_ANNOTATION)?
        .parse::<i64>()
        .ok()?;
    let uid = annotations.get(ACKED_UID_ANNOTATION).filter(|uid| !uid.is_empty())?;
    Some(ConfigRevision::new(uid.as_str(), generation))
}

fn is_expired(lease: &Lease, now: DateTime<Utc>) -> bool {
    let spec = lease.spec.as_ref();
    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
    match (renew_time, duration_secs) {
        (Some(rt), Some(duration)) => now > rt.0 + chrono::Duration::seconds(duration as i64),
        _ => true,
    }
}

/// Publishes this replica's Lease and acknowledged revision
#[derive(Clone)]
pub struct ReplicaLease {
    client: Client,
    namespace: String,
    replica_id: String,
    lease_duration: Duration,
    renew_interval: Duration,
}

impl ReplicaLease {
    /// Create a publisher with default timing (30s lease, 10s renew)
    pub fn new(client: Client, namespace: &str, replica_id: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            replica_id: replica_id.to_string(),
            lease_duration: LEASE_DURATION,
            renew_interval: RENEW_INTERVAL,
        }
    }

    /// Override Lease timing
    pub fn with_timing(mut self, lease_duration: Duration, renew_interval: Duration) -> Self {
        self.lease_duration = lease_duration;
        self.renew_interval = renew_interval;
        self
    }

    /// Renew the Lease forever, immediately re-publishing on every new acknowledgement
    pub async fn run(self, mut acks: watch::Receiver<Option<ConfigRevision>>) {
        info!(
            replica = %self.replica_id,
            lease = %lease_name(&self.replica_id),
            "Publishing replica lease"
        );
        loop {
            let acked = acks.borrow_and_update().clone();
            if let Err(e) = self.renew(acked.as_ref()).await {
                warn!(
                    replica = %self.replica_id,
                    error = %e,
                    retry_secs = self.renew_interval.as_secs(),
                    "Failed to renew replica lease, retrying..."
                );
            }

            tokio::select! {
                _ = tokio::time::sleep(self.renew_interval) => {}
                changed = acks.changed() => {
                    if changed.is_err() {
                        debug!(replica = %self.replica_id, "Acknowledgement source closed");
                        return;
                    }
                }
            }
        }
    }

    async fn renew(&self, acked: Option<&ConfigRevision>) -> Result<(), kube::Error> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let lease = build_lease(
            &self.replica_id,
            &self.namespace,
            self.lease_duration,
            acked,
            Utc::now(),
        );
        api.patch(
            &lease_name(&self.replica_id),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&lease),
        )
        .await?;
        debug!(
            replica = %self.replica_id,
            acked = %acked.map(ToString::to_string).unwrap_or_default(),
            "Renewed replica lease"
        );
        Ok(())
    }

    /// Delete the Lease so other replicas stop waiting on this one
    pub async fn release(&self) {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        match api
            .delete(&lease_name(&self.replica_id), &DeleteParams::default())
            .await
        {
            Ok(_) => info!(replica = %self.replica_id, "Released replica lease"),
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => warn!(replica = %self.replica_id, error = %e, "Failed to release replica lease"),
        }
    }
}

/// Lists replica Leases and syncs them into the tracker
pub struct LeasePoller {
    client: Client,
    namespace: String,
    poll_interval: Duration,
    tracker: Arc<PropagationTracker>,
}

impl LeasePoller {
    /// Create a poller for Leases in `namespace`
    pub fn new(client: Client, namespace: &str, tracker: Arc<PropagationTracker>) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            poll_interval: POLL_INTERVAL,
            tracker,
        }
    }

    /// Override the poll interval
    pub fn with_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Poll forever
    pub async fn run(self) {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let params = ListParams::default().labels(&format!("{}=true", REPLICA_LABEL_KEY));
        loop {
            match api.list(&params).await {
                Ok(list) => {
                    let acks = replica_acks(&list.items, Utc::now());
                    debug!(replicas = acks.len(), "Synced replica leases");
                    self.tracker.sync_replicas(acks);
                }
                Err(e) => warn!(
                    error = %e,
                    retry_secs = self.poll_interval.as_secs(),
                    "Failed to list replica leases, keeping last known replica set"
                ),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).expect("valid timestamp")
    }

    fn rev(generation: i64) -> ConfigRevision {
        ConfigRevision::new("5e0b-uid", generation)
    }

    fn annotation<'a>(lease: &'a Lease, key: &str) -> Option<&'a str> {
        lease
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    #[test]
    fn lease_carries_label_holder_and_ack() {
        let lease = build_lease("pod-a", "buildconfig-system", LEASE_DURATION, Some(&rev(4)), at(0));
        assert_eq!(lease.metadata.name.as_deref(), Some("buildconfig-replica-pod-a"));
        assert_eq!(
            lease.metadata.labels.as_ref().and_then(|l| l.get(REPLICA_LABEL_KEY)).map(String::as_str),
            Some("true")
        );
        assert_eq!(annotation(&lease, ACKED_GENERATION_ANNOTATION), Some("4"));
        assert_eq!(annotation(&lease, ACKED_UID_ANNOTATION), Some("5e0b-uid"));
        let spec = lease.spec.as_ref().expect("spec");
        assert_eq!(spec.holder_identity.as_deref(), Some("pod-a"));
        assert_eq!(spec.lease_duration_seconds, Some(30));
    }

    #[test]
    fn configured_duration_is_published() {
        let lease = build_lease("pod-a", "ns", Duration::from_secs(45), None, at(0));
        assert_eq!(lease.spec.and_then(|s| s.lease_duration_seconds), Some(45));
    }

    #[test]
    fn unacknowledged_lease_has_no_annotation() {
        let lease = build_lease("pod-a", "ns", LEASE_DURATION, None, at(0));
        assert!(lease.metadata.annotations.is_none());
        assert_eq!(replica_acks(&[lease], at(1)), vec![("pod-a".to_string(), None)]);
    }

    #[test]
    fn expired_leases_are_not_known_replicas() {
        let fresh = build_lease("pod-a", "ns", LEASE_DURATION, Some(&rev(2)), at(0));
        let stale = build_lease("pod-b", "ns", LEASE_DURATION, Some(&rev(1)), at(-60));
        let acks = replica_acks(&[fresh, stale], at(5));
        assert_eq!(acks, vec![("pod-a".to_string(), Some(rev(2)))]);
    }

    #[test]
    fn replica_id_falls_back_to_lease_name() {
        let mut lease = build_lease("pod-c", "ns", LEASE_DURATION, Some(&rev(3)), at(0));
        if let Some(spec) = lease.spec.as_mut() {
            spec.holder_identity = None;
        }
        assert_eq!(replica_acks(&[lease], at(1)), vec![("pod-c".to_string(), Some(rev(3)))]);
    }

    #[test]
    fn garbage_annotation_counts_as_no_ack() {
        let mut lease = build_lease("pod-d", "ns", LEASE_DURATION, Some(&rev(3)), at(0));
        if let Some(a) = lease.metadata.annotations.as_mut() {
            a.insert(ACKED_GENERATION_ANNOTATION.to_string(), "three".to_string());
        }
        assert_eq!(replica_acks(&[lease], at(1)), vec![("pod-d".to_string(), None)]);
    }

    #[test]
    fn generation_without_uid_counts_as_no_ack() {
        let mut lease = build_lease("pod-e", "ns", LEASE_DURATION, Some(&rev(3)), at(0));
        if let Some(a) = lease.metadata.annotations.as_mut() {
            a.remove(ACKED_UID_ANNOTATION);
        }
        assert_eq!(replica_acks(&[lease], at(1)), vec![("pod-e".to_string(), None)]);
    }

    #[test]
    fn synced_leases_drive_propagation() {
        let tracker = PropagationTracker::new();
        let leases = vec![
            build_lease("pod-a", "ns", LEASE_DURATION, Some(&rev(5)), at(0)),
            build_lease("pod-b", "ns", LEASE_DURATION, Some(&rev(4)), at(0)),
        ];
        tracker.sync_replicas(replica_acks(&leases, at(1)));
        assert!(tracker.is_active(&rev(4)));
        assert!(!tracker.is_active(&rev(5)));
    }

    #[test]
    fn lease_from_recreated_object_replaces_old_ack() {
        let tracker = PropagationTracker::new();
        let before = build_lease("pod-a", "ns", LEASE_DURATION, Some(&rev(8)), at(0));
        tracker.sync_replicas(replica_acks(&[before], at(1)));

        let recreated = ConfigRevision::new("b71f-uid", 1);
        assert!(!tracker.is_active(&recreated));

        let after = build_lease("pod-a", "ns", LEASE_DURATION, Some(&recreated), at(2));
        tracker.sync_replicas(replica_acks(&[after], at(3)));
        assert!(tracker.is_active(&recreated));
        assert!(!tracker.is_active(&rev(8)));
    }
}
