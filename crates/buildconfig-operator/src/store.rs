//! ConfigStore: durable, watchable storage for the BuildClusterConfig object
//!
//! The trait is the seam between the watcher and the cluster. Production uses
//! [`KubeConfigStore`] on top of the Kubernetes API; tests and local runs use
//! [`MemoryConfigStore`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use serde_json::json;
use tokio::sync::watch;
use tracing::debug;

use buildconfig_common::crd::{BuildClusterConfig, BuildClusterConfigSpec, BuildClusterConfigStatus};
use buildconfig_common::{ConfigRevision, Error, Result, FIELD_MANAGER};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// so the API server closes idle watches before the client times out.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Raw configuration as read from the store
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StoredConfig {
    /// Spec as submitted by the administrator
    pub spec: BuildClusterConfigSpec,
    /// Object uid and generation; None when the object does not exist
    pub revision: Option<ConfigRevision>,
}

impl StoredConfig {
    /// Configuration in effect when the object does not exist: permissive defaults
    pub fn absent() -> Self {
        Self::default()
    }

    /// Store generation, if the object exists
    pub fn generation(&self) -> Option<i64> {
        self.revision.as_ref().map(|r| r.generation)
    }
}

fn revision_of(object: &BuildClusterConfig, operation: &str) -> Result<ConfigRevision> {
    let name = object.metadata.name.as_deref().unwrap_or_default();
    let uid = object.metadata.uid.clone().ok_or_else(|| {
        Error::store_unavailable(operation, format!("{} has no uid", name))
    })?;
    let generation = object.metadata.generation.ok_or_else(|| {
        Error::store_unavailable(operation, format!("{} has no generation", name))
    })?;
    Ok(ConfigRevision::new(uid, generation))
}

/// Change notification from [`ConfigStore::watch`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    /// The object was created or its spec changed
    Changed {
        /// Generation observed with the change
        generation: Option<i64>,
    },
    /// The object was deleted
    Deleted,
    /// The watch (re)started; the current state should be re-read
    Resynced,
}

/// Durable, watchable store of the cluster build configuration
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Read the named object; `Ok(None)` when it does not exist
    async fn get(&self, name: &str) -> Result<Option<StoredConfig>>;

    /// Apply a spec, returning the resulting revision.
    ///
    /// The revision is the token to wait on: propagation of a generation is
    /// only meaningful together with the uid of the object it belongs to.
    async fn apply(&self, name: &str, spec: &BuildClusterConfigSpec) -> Result<ConfigRevision>;

    /// Infinite stream of change notifications for the named object.
    ///
    /// Transient disconnects are resumed internally; a stream that ends should
    /// be re-opened by the caller.
    fn watch(&self, name: &str) -> BoxStream<'static, Result<WatchEvent>>;

    /// Record the outcome of compiling the object
    async fn patch_status(&self, name: &str, status: &BuildClusterConfigStatus) -> Result<()>;
}

/// ConfigStore backed by the Kubernetes API
pub struct KubeConfigStore {
    client: Client,
}

impl KubeConfigStore {
    /// Create a store using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self) -> Api<BuildClusterConfig> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl ConfigStore for KubeConfigStore {
    async fn get(&self, name: &str) -> Result<Option<StoredConfig>> {
        let object = self
            .api()
            .get_opt(name)
            .await
            .map_err(|e| Error::store_unavailable("get", e.to_string()))?;
        object
            .map(|obj| {
                Ok(StoredConfig {
                    revision: Some(revision_of(&obj, "get")?),
                    spec: obj.spec,
                })
            })
            .transpose()
    }

    async fn apply(&self, name: &str, spec: &BuildClusterConfigSpec) -> Result<ConfigRevision> {
        let object = BuildClusterConfig::new(name, spec.clone());
        let params = PatchParams::apply(FIELD_MANAGER).force();
        let applied = self
            .api()
            .patch(name, &params, &Patch::Apply(&object))
            .await
            .map_err(|e| Error::store_unavailable("apply", e.to_string()))?;
        revision_of(&applied, "apply")
    }

    fn watch(&self, name: &str) -> BoxStream<'static, Result<WatchEvent>> {
        let config = watcher::Config::default()
            .fields(&format!("metadata.name={}", name))
            .timeout(WATCH_TIMEOUT_SECS);

        watcher(self.api(), config)
            .default_backoff()
            .map(|event| match event {
                Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
                    Ok(WatchEvent::Changed {
                        generation: obj.metadata.generation,
                    })
                }
                Ok(watcher::Event::Delete(_)) => Ok(WatchEvent::Deleted),
                Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => Ok(WatchEvent::Resynced),
                Err(e) => Err(Error::store_unavailable("watch", e.to_string())),
            })
            .boxed()
    }

    async fn patch_status(&self, name: &str, status: &BuildClusterConfigStatus) -> Result<()> {
        self.api()
            .patch_status(
                name,
                &PatchParams::default(),
                &Patch::Merge(&json!({ "status": status })),
            )
            .await
            .map_err(|e| Error::store_unavailable("patch_status", e.to_string()))?;
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct MemoryObject {
    spec: BuildClusterConfigSpec,
    revision: ConfigRevision,
    status: Option<BuildClusterConfigStatus>,
}

#[derive(Default)]
struct MemoryState {
    objects: HashMap<String, MemoryObject>,
    channels: HashMap<String, watch::Sender<WatchEvent>>,
    /// Objects created so far; each creation gets a fresh uid
    created: u64,
}

impl MemoryState {
    fn channel(&mut self, name: &str) -> &watch::Sender<WatchEvent> {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| watch::channel(WatchEvent::Resynced).0)
    }

    fn notify(&mut self, name: &str, event: WatchEvent) {
        self.channel(name).send_replace(event);
    }
}

/// In-process ConfigStore with fault injection.
///
/// Like the API server, a deleted and re-created object gets a new uid and
/// starts again at generation 1.
#[derive(Clone, Default)]
pub struct MemoryConfigStore {
    state: Arc<Mutex<MemoryState>>,
    failing_gets: Arc<AtomicU32>,
}

impl MemoryConfigStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls to `get` fail with `StoreUnavailable`
    pub fn fail_next_gets(&self, count: u32) {
        self.failing_gets.store(count, Ordering::SeqCst);
    }

    /// Delete the named object
    pub fn delete(&self, name: &str) -> Result<()> {
        let mut state = self.lock()?;
        if state.objects.remove(name).is_some() {
            state.notify(name, WatchEvent::Deleted);
        }
        Ok(())
    }

    /// Last status written for the named object
    pub fn status(&self, name: &str) -> Option<BuildClusterConfigStatus> {
        self.lock()
            .ok()?
            .objects
            .get(name)
            .and_then(|obj| obj.status.clone())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| Error::internal_with_context("memory-store", "state lock poisoned"))
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_gets
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get(&self, name: &str) -> Result<Option<StoredConfig>> {
        if self.take_injected_failure() {
            return Err(Error::store_unavailable("get", "injected failure"));
        }
        let state = self.lock()?;
        Ok(state.objects.get(name).map(|obj| StoredConfig {
            spec: obj.spec.clone(),
            revision: Some(obj.revision.clone()),
        }))
    }

    async fn apply(&self, name: &str, spec: &BuildClusterConfigSpec) -> Result<ConfigRevision> {
        let mut state = self.lock()?;

        let (revision, status) = match state.objects.get(name) {
            Some(existing) if existing.spec == *spec => {
                debug!(name, revision = %existing.revision, "Apply is a no-op");
                return Ok(existing.revision.clone());
            }
            Some(existing) => (
                ConfigRevision::new(existing.revision.uid.clone(), existing.revision.generation + 1),
                existing.status.clone(),
            ),
            None => {
                state.created += 1;
                (ConfigRevision::new(format!("memory-uid-{}", state.created), 1), None)
            }
        };

        state.objects.insert(
            name.to_string(),
            MemoryObject {
                spec: spec.clone(),
                revision: revision.clone(),
                status,
            },
        );
        state.notify(
            name,
            WatchEvent::Changed {
                generation: Some(revision.generation),
            },
        );
        Ok(revision)
    }

    fn watch(&self, name: &str) -> BoxStream<'static, Result<WatchEvent>> {
        let rx = match self.lock() {
            Ok(mut state) => state.channel(name).subscribe(),
            Err(e) => return stream::once(async move { Err::<WatchEvent, Error>(e) }).boxed(),
        };

        let initial = stream::once(async { Ok::<_, Error>(WatchEvent::Resynced) });
        let changes = stream::unfold(rx, |mut rx| async move {
            rx.changed().await.ok()?;
            let event = rx.borrow_and_update().clone();
            Some((Ok(event), rx))
        });
        initial.chain(changes).boxed()
    }

    async fn patch_status(&self, name: &str, status: &BuildClusterConfigStatus) -> Result<()> {
        let mut state = self.lock()?;
        match state.objects.get_mut(name) {
            Some(obj) => {
                obj.status = Some(status.clone());
                Ok(())
            }
            None => Err(Error::store_unavailable(
                "patch_status",
                format!("{} not found", name),
            )),
        }
    }
}
