//! ConfigWatcher: the single writer of the current-policy slot
//!
//! One long-lived task per replica. It watches the ConfigStore, collapses
//! bursts of notifications, re-reads the latest configuration, compiles it
//! and publishes the result:
//!
//! ```text
//! Idle -> Compiling -> Published -> Idle
//!              \-> Idle (unchanged or rejected)
//! ```
//!
//! A configuration that fails to compile leaves the last known good policy in
//! place, is reported to the event sink and marked `Invalid` in status. It is
//! never acknowledged, so propagation waiters for that revision time out.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use opentelemetry::KeyValue;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use buildconfig_common::crd::{BuildClusterConfigStatus, ConfigPhase};
use buildconfig_common::events::{PolicyEvent, PolicyEventSink};
use buildconfig_common::metrics::{ACTIVE_POLICY_VERSION, POLICY_COMPILATIONS};
use buildconfig_common::retry::{retry_store, RetryPolicy};
use buildconfig_common::{ConfigRevision, Error, Result};
use buildconfig_policy::{PolicyCompiler, PolicyPublisher};

use crate::store::{ConfigStore, StoredConfig, WatchEvent};

/// Default quiet period before compiling after a notification
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Watcher lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatcherState {
    /// Waiting for a change
    Idle,
    /// Reading and compiling the latest configuration
    Compiling,
    /// A new policy was just published
    Published,
}

/// Watcher tuning
#[derive(Clone, Debug)]
pub struct WatcherOptions {
    /// Quiet period that ends a burst of notifications
    pub debounce: Duration,
    /// Upper bound on how long a continuous burst can postpone compilation
    pub max_debounce: Duration,
    /// Retry policy for store reads
    pub retry: RetryPolicy,
    /// Delay before re-opening a watch stream that ended
    pub rewatch_delay: Duration,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            max_debounce: DEFAULT_DEBOUNCE * 10,
            retry: RetryPolicy::forever(),
            rewatch_delay: Duration::from_secs(1),
        }
    }
}

/// Watches the configuration and publishes compiled policies
pub struct ConfigWatcher {
    store: Arc<dyn ConfigStore>,
    name: String,
    compiler: PolicyCompiler,
    publisher: PolicyPublisher,
    sink: Arc<dyn PolicyEventSink>,
    options: WatcherOptions,
    last_seen: Option<StoredConfig>,
    state: watch::Sender<WatcherState>,
    acked: watch::Sender<Option<ConfigRevision>>,
}

impl ConfigWatcher {
    /// Create a watcher for the named object, owning the slot's writer
    pub fn new(
        store: Arc<dyn ConfigStore>,
        name: impl Into<String>,
        publisher: PolicyPublisher,
        sink: Arc<dyn PolicyEventSink>,
        options: WatcherOptions,
    ) -> Self {
        Self {
            store,
            name: name.into(),
            compiler: PolicyCompiler::new(),
            publisher,
            sink,
            options,
            last_seen: None,
            state: watch::channel(WatcherState::Idle).0,
            acked: watch::channel(None).0,
        }
    }

    /// Use a specific compiler, e.g. one with a mirrored fallback registry
    pub fn with_compiler(mut self, compiler: PolicyCompiler) -> Self {
        self.compiler = compiler;
        self
    }

    /// Receiver of lifecycle state transitions
    pub fn state(&self) -> watch::Receiver<WatcherState> {
        self.state.subscribe()
    }

    /// Receiver of the store revision this replica has activated
    pub fn acknowledgements(&self) -> watch::Receiver<Option<ConfigRevision>> {
        self.acked.subscribe()
    }

    /// Run forever, re-opening the watch whenever the stream ends
    pub async fn run(mut self) {
        info!(name = %self.name, "Starting build configuration watcher");
        loop {
            let mut events = self.store.watch(&self.name);
            self.reconcile().await;

            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => {
                        debug!(name = %self.name, event = ?event, "Configuration notification");
                        let ended = self.debounce(&mut events).await;
                        self.reconcile().await;
                        if ended {
                            break;
                        }
                    }
                    Err(e) => warn!(name = %self.name, error = %e, "Configuration watch error"),
                }
            }

            warn!(
                name = %self.name,
                delay_ms = self.options.rewatch_delay.as_millis() as u64,
                "Configuration watch ended, re-watching"
            );
            tokio::time::sleep(self.options.rewatch_delay).await;
        }
    }

    /// Swallow notifications until the stream is quiet for `debounce`.
    ///
    /// Returns true if the stream ended.
    async fn debounce(&self, events: &mut BoxStream<'static, Result<WatchEvent>>) -> bool {
        let deadline = Instant::now() + self.options.max_debounce;
        let mut collapsed = 0u32;
        loop {
            let quiet = self.options.debounce.min(deadline.saturating_duration_since(Instant::now()));
            if quiet.is_zero() {
                break;
            }
            match tokio::time::timeout(quiet, events.next()).await {
                Ok(Some(_)) => collapsed += 1,
                Ok(None) => return true,
                Err(_) => break,
            }
        }
        if collapsed > 0 {
            debug!(name = %self.name, collapsed, "Collapsed configuration notifications");
        }
        false
    }

    /// Read, compile and publish the latest configuration
    #[instrument(skip(self), fields(name = %self.name))]
    pub async fn reconcile(&mut self) {
        self.state.send_replace(WatcherState::Compiling);

        let store = self.store.clone();
        let name = self.name.clone();
        let read = retry_store(&self.options.retry, "get_build_cluster_config", || {
            let store = store.clone();
            let name = name.clone();
            async move { store.get(&name).await }
        })
        .await;

        let raw = match read {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!(name = %self.name, "Configuration absent, using defaults");
                StoredConfig::absent()
            }
            Err(e) => {
                warn!(name = %self.name, error = %e, "Giving up reading configuration");
                self.state.send_replace(WatcherState::Idle);
                return;
            }
        };

        if self.last_seen.as_ref() == Some(&raw) {
            debug!(
                name = %self.name,
                revision = ?raw.revision,
                "Configuration unchanged, keeping current policy"
            );
            self.state.send_replace(WatcherState::Idle);
            return;
        }

        let prior = self.publisher.current_version();
        match self
            .compiler
            .compile_revision(&raw.spec, prior, raw.revision.clone())
        {
            Ok(policy) => {
                let published = self.publisher.publish(policy);
                self.state.send_replace(WatcherState::Published);
                POLICY_COMPILATIONS.add(1, &[KeyValue::new("result", "success")]);
                ACTIVE_POLICY_VERSION.record(published.version() as i64, &[]);

                self.sink
                    .emit(PolicyEvent::PolicyPublished {
                        version: published.version(),
                        generation: raw.generation(),
                    })
                    .await;
                if let Some(revision) = &raw.revision {
                    self.acked.send_replace(Some(revision.clone()));
                }
                self.write_status(&raw, ConfigPhase::Valid, None, published.version())
                    .await;
            }
            Err(e) => {
                POLICY_COMPILATIONS.add(1, &[KeyValue::new("result", "invalid")]);
                let (field, message) = match &e {
                    Error::InvalidConfig { field, message } => (field.clone(), message.clone()),
                    other => (String::new(), other.to_string()),
                };
                self.sink
                    .emit(PolicyEvent::InvalidConfig {
                        generation: raw.generation(),
                        field,
                        message,
                    })
                    .await;
                self.write_status(&raw, ConfigPhase::Invalid, Some(e.to_string()), prior)
                    .await;
            }
        }

        self.last_seen = Some(raw);
        self.state.send_replace(WatcherState::Idle);
    }

    async fn write_status(
        &self,
        raw: &StoredConfig,
        phase: ConfigPhase,
        message: Option<String>,
        policy_version: u64,
    ) {
        // Absent objects have nowhere to write status
        if raw.revision.is_none() {
            return;
        }
        let status = BuildClusterConfigStatus {
            phase,
            message,
            observed_generation: raw.generation(),
            policy_version: Some(policy_version),
            last_transition_time: Some(chrono::Utc::now().to_rfc3339()),
        };
        if let Err(e) = self.store.patch_status(&self.name, &status).await {
            warn!(name = %self.name, error = %e, phase = %phase, "Failed to write status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryConfigStore, MockConfigStore};
    use buildconfig_common::crd::{BuildClusterConfigSpec, ProxyConfig, RegistryRule};
    use buildconfig_common::events::RecordingEventSink;
    use buildconfig_policy::{policy_slot, PolicyReader, RegistryHost, DEFAULT_HISTORY_LIMIT};
    use futures::stream;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn blacklist() -> BuildClusterConfigSpec {
        let mut spec = BuildClusterConfigSpec::default();
        spec.registries.blocked_registries = vec![RegistryRule::new("docker.io")];
        spec
    }

    fn bad_proxy() -> BuildClusterConfigSpec {
        let mut spec = blacklist();
        spec.proxy = Some(ProxyConfig {
            http_proxy: Some("::not-a-url".into()),
            ..Default::default()
        });
        spec
    }

    fn watcher_over(
        store: Arc<dyn ConfigStore>,
    ) -> (ConfigWatcher, PolicyReader, Arc<RecordingEventSink>) {
        watcher_with(store, WatcherOptions::default())
    }

    fn watcher_with(
        store: Arc<dyn ConfigStore>,
        options: WatcherOptions,
    ) -> (ConfigWatcher, PolicyReader, Arc<RecordingEventSink>) {
        let (publisher, reader) = policy_slot(DEFAULT_HISTORY_LIMIT);
        let sink = Arc::new(RecordingEventSink::new());
        let watcher = ConfigWatcher::new(store, "cluster", publisher, sink.clone(), options);
        (watcher, reader, sink)
    }

    /// Mock store whose every read returns a new generation of the blacklist
    fn store_with_watches<F>(watches: Arc<AtomicU32>, open: F) -> (MockConfigStore, Arc<AtomicU32>)
    where
        F: Fn(u32) -> BoxStream<'static, Result<WatchEvent>> + Send + Sync + 'static,
    {
        let reads = Arc::new(AtomicU32::new(0));
        let mut store = MockConfigStore::new();
        let counter = reads.clone();
        store.expect_get().returning(move |_| {
            let generation = counter.fetch_add(1, Ordering::SeqCst) as i64 + 1;
            Ok(Some(StoredConfig {
                spec: blacklist(),
                revision: Some(ConfigRevision::new("uid-1", generation)),
            }))
        });
        store.expect_watch().returning(move |_| open(watches.fetch_add(1, Ordering::SeqCst)));
        store.expect_patch_status().returning(|_, _| Ok(()));
        (store, reads)
    }

    // =========================================================================
    // Story: configuration lifecycle on one replica
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn story_publish_reject_and_keep_last_known_good() {
        let store = Arc::new(MemoryConfigStore::new());
        let (mut watcher, reader, sink) = watcher_over(store.clone());
        let acks = watcher.acknowledgements();

        // Step 1: absent configuration compiles to the permissive default
        watcher.reconcile().await;
        assert_eq!(reader.version(), 1);
        assert_eq!(*acks.borrow(), None);

        // Step 2: blocking docker.io publishes version 2 and acks revision 1
        let revision = store.apply("cluster", &blacklist()).await.expect("apply");
        watcher.reconcile().await;
        assert_eq!(reader.version(), 2);
        assert_eq!(reader.current().source_revision(), Some(&revision));
        assert_eq!(*acks.borrow(), Some(revision.clone()));
        assert_eq!(
            store.status("cluster").map(|s| s.phase),
            Some(ConfigPhase::Valid)
        );

        // Step 3: an unchanged configuration does not advance the version
        watcher.reconcile().await;
        assert_eq!(reader.version(), 2);

        // Step 4: an invalid proxy is rejected; version 2 stays active and unacked
        let rejected = store.apply("cluster", &bad_proxy()).await.expect("apply");
        watcher.reconcile().await;
        assert_eq!(reader.version(), 2);
        assert_eq!(*acks.borrow(), Some(revision));
        let status = store.status("cluster").expect("status");
        assert_eq!(status.phase, ConfigPhase::Invalid);
        assert_eq!(status.observed_generation, Some(rejected.generation));
        assert!(status.message.unwrap_or_default().contains("proxy.httpProxy"));

        let events = sink.events();
        assert!(matches!(
            events.last(),
            Some(PolicyEvent::InvalidConfig { field, .. }) if field == "proxy.httpProxy"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn store_read_failures_are_retried() {
        let store = Arc::new(MemoryConfigStore::new());
        store.apply("cluster", &blacklist()).await.expect("apply");
        store.fail_next_gets(5);

        let (mut watcher, reader, _sink) = watcher_over(store.clone());
        watcher.reconcile().await;
        assert_eq!(reader.version(), 1);
        assert_eq!(reader.current().deny_set().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deleted_configuration_reverts_to_defaults() {
        let store = Arc::new(MemoryConfigStore::new());
        store.apply("cluster", &blacklist()).await.expect("apply");
        let (mut watcher, reader, _sink) = watcher_over(store.clone());

        watcher.reconcile().await;
        assert_eq!(reader.current().deny_set().len(), 1);

        store.delete("cluster").expect("delete");
        watcher.reconcile().await;
        assert_eq!(reader.version(), 2);
        assert!(reader.current().deny_set().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn bursts_of_changes_compile_only_the_latest() {
        let store = Arc::new(MemoryConfigStore::new());
        let (watcher, reader, _sink) = watcher_over(store.clone());
        let mut published = reader.subscribe();
        tokio::spawn(watcher.run());

        // Initial reconcile of the absent configuration
        published.changed().await.expect("publish");
        assert_eq!(*published.borrow_and_update(), 1);

        let mut spec = BuildClusterConfigSpec::default();
        for i in 0..5 {
            spec.registries.search_registries = vec![format!("mirror{}.example.com", i)];
            store.apply("cluster", &spec).await.expect("apply");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        published.changed().await.expect("publish");
        assert_eq!(*published.borrow_and_update(), 2);
        assert_eq!(
            reader.current().default_registry().to_string(),
            "mirror4.example.com"
        );

        // Nothing else is pending
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(reader.version(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn status_write_failure_is_not_fatal() {
        let mut store = MockConfigStore::new();
        store.expect_get().returning(|_| {
            Ok(Some(StoredConfig {
                spec: blacklist(),
                revision: Some(ConfigRevision::new("uid-1", 3)),
            }))
        });
        store
            .expect_patch_status()
            .times(1)
            .returning(|_, _| Err(Error::store_unavailable("patch_status", "conflict")));

        let (mut watcher, reader, _sink) = watcher_over(Arc::new(store));
        let acks = watcher.acknowledgements();
        watcher.reconcile().await;

        assert_eq!(reader.version(), 1);
        assert_eq!(*acks.borrow(), Some(ConfigRevision::new("uid-1", 3)));
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_walks_through_states() {
        let store = Arc::new(MemoryConfigStore::new());
        let (mut watcher, _reader, _sink) = watcher_over(store);
        let state = watcher.state();
        assert_eq!(*state.borrow(), WatcherState::Idle);
        watcher.reconcile().await;
        assert_eq!(*state.borrow(), WatcherState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_registry_compiler_is_used() {
        let store = Arc::new(MemoryConfigStore::new());
        let (watcher, reader, _sink) = watcher_over(store);
        let mirror = RegistryHost::parse("mirror.corp.example:5000").expect("host");
        let mut watcher = watcher.with_compiler(PolicyCompiler::with_fallback_registry(mirror));

        watcher.reconcile().await;
        assert_eq!(
            reader.current().default_registry().to_string(),
            "mirror.corp.example:5000"
        );
    }

    // =========================================================================
    // Story: the watch connection drops and comes back
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn story_ended_watch_is_reopened_and_reread() {
        let watches = Arc::new(AtomicU32::new(0));
        let (store, reads) = store_with_watches(watches.clone(), |opened| match opened {
            // First connection delivers one change and then closes
            0 => stream::iter(vec![Ok(WatchEvent::Changed { generation: Some(2) })]).boxed(),
            _ => stream::pending().boxed(),
        });
        let (watcher, reader, _sink) = watcher_over(Arc::new(store));
        tokio::spawn(watcher.run());

        // Initial read, read after the change, then re-read on the new watch
        tokio::time::sleep(DEFAULT_DEBOUNCE + Duration::from_millis(100)).await;
        assert_eq!(reads.load(Ordering::SeqCst), 2);
        assert_eq!(watches.load(Ordering::SeqCst), 1);

        tokio::time::sleep(WatcherOptions::default().rewatch_delay).await;
        assert_eq!(watches.load(Ordering::SeqCst), 2);
        assert_eq!(reads.load(Ordering::SeqCst), 3);
        assert_eq!(reader.current().source_generation(), Some(3));

        // The second connection stays open
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(watches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn watch_errors_are_survived_and_rewatched() {
        let watches = Arc::new(AtomicU32::new(0));
        let (store, reads) = store_with_watches(watches.clone(), |opened| match opened {
            0 => stream::iter(vec![Err(Error::store_unavailable(
                "watch",
                "connection reset by peer",
            ))])
            .boxed(),
            _ => stream::pending().boxed(),
        });
        let (watcher, reader, _sink) = watcher_over(Arc::new(store));
        let mut published = reader.subscribe();
        tokio::spawn(watcher.run());

        published.changed().await.expect("initial publish");
        assert_eq!(reads.load(Ordering::SeqCst), 1);

        // An error event alone does not trigger a read
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(reads.load(Ordering::SeqCst), 1);

        tokio::time::sleep(WatcherOptions::default().rewatch_delay).await;
        assert_eq!(watches.load(Ordering::SeqCst), 2);
        assert_eq!(reads.load(Ordering::SeqCst), 2);
        assert_eq!(reader.current().source_generation(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn continuous_changes_publish_by_max_debounce() {
        let store = Arc::new(MemoryConfigStore::new());
        let options = WatcherOptions {
            debounce: Duration::from_millis(500),
            max_debounce: Duration::from_secs(2),
            ..WatcherOptions::default()
        };
        let (watcher, reader, _sink) = watcher_with(store.clone(), options);
        let mut published = reader.subscribe();
        tokio::spawn(watcher.run());
        published.changed().await.expect("initial publish");

        // A change every 300ms never leaves the stream quiet for 500ms
        let burst = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut spec = BuildClusterConfigSpec::default();
                for i in 0..30 {
                    spec.registries.search_registries = vec![format!("mirror{}.example.com", i)];
                    store.apply("cluster", &spec).await.expect("apply");
                    tokio::time::sleep(Duration::from_millis(300)).await;
                }
            })
        };

        let started = Instant::now();
        tokio::time::timeout(Duration::from_secs(3), published.changed())
            .await
            .expect("published before the burst ends")
            .expect("publish");
        assert!(started.elapsed() <= Duration::from_millis(2500));
        assert!(!burst.is_finished());
        assert_eq!(reader.version(), 2);
    }
}
