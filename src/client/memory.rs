//! In-process [`ResourceClient`] with API-server semantics.
//!
//! Mirrors the parts of the API server the controller depends on:
//! resource versions and optimistic concurrency, generation bumps on spec
//! changes, status kept apart from the main resource, finalizers delaying
//! deletion, and a watch stream that replays current objects as `Added`.
//! Every write is recorded so callers can assert on exactly which writes a
//! reconciliation pass issued. Faults can be injected per operation.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::broadcast;

use super::{ChangeEvent, ClientError, Clients, ResourceClient};
use crate::crd::Motis;

const WATCH_BUFFER: usize = 1024;

/// Operations a client exposes, used for write records and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteKind {
    Create,
    Get,
    List,
    Update,
    UpdateStatus,
    Delete,
}

impl WriteKind {
    fn is_write(self) -> bool {
        !matches!(self, WriteKind::Get | WriteKind::List)
    }
}

/// A single recorded write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub kind: &'static str,
    pub operation: WriteKind,
    pub name: String,
}

/// Shared log of writes across all stores of one cluster.
#[derive(Debug, Default)]
struct WriteLog {
    entries: Mutex<Vec<WriteRecord>>,
}

impl WriteLog {
    fn record(&self, kind: &'static str, operation: WriteKind, name: &str) {
        lock(&self.entries).push(WriteRecord {
            kind,
            operation,
            name: name.to_string(),
        });
    }
}

struct Store<K> {
    objects: BTreeMap<String, K>,
    faults: VecDeque<(WriteKind, ClientError)>,
}

/// In-memory client for one kind.
pub struct InMemoryResourceClient<K> {
    kind: &'static str,
    store: Arc<Mutex<Store<K>>>,
    versions: Arc<Mutex<u64>>,
    log: Arc<WriteLog>,
    events: broadcast::Sender<ChangeEvent<K>>,
}

impl<K> Clone for InMemoryResourceClient<K> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            store: self.store.clone(),
            versions: self.versions.clone(),
            log: self.log.clone(),
            events: self.events.clone(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<K> InMemoryResourceClient<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Debug + Send + Sync + 'static,
{
    fn with_shared(kind: &'static str, versions: Arc<Mutex<u64>>, log: Arc<WriteLog>) -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            kind,
            store: Arc::new(Mutex::new(Store {
                objects: BTreeMap::new(),
                faults: VecDeque::new(),
            })),
            versions,
            log,
            events,
        }
    }

    /// A standalone store.
    pub fn new(kind: &'static str) -> Self {
        Self::with_shared(kind, Arc::default(), Arc::default())
    }

    /// Make the next `operation` fail with `error`. Faults queue up in order.
    pub fn fail_next(&self, operation: WriteKind, error: ClientError) {
        lock(&self.store).faults.push_back((operation, error));
    }

    /// Snapshot of all stored objects.
    pub fn objects(&self) -> Vec<K> {
        lock(&self.store).objects.values().cloned().collect()
    }

    /// Stored object by name.
    pub fn object(&self, name: &str) -> Option<K> {
        lock(&self.store).objects.get(name).cloned()
    }

    /// Mutate a stored object in place, the way another cluster controller
    /// would (e.g. the Deployment controller writing rollout status).
    /// Bumps the resource version and emits a `Modified` event.
    pub fn mutate(&self, name: &str, f: impl FnOnce(&mut K)) -> bool {
        let updated = {
            let mut store = lock(&self.store);
            let Some(obj) = store.objects.get_mut(name) else {
                return false;
            };
            f(obj);
            obj.meta_mut().resource_version = Some(self.next_version());
            obj.clone()
        };
        let _ = self.events.send(ChangeEvent::Modified(updated));
        true
    }

    /// Insert an object as if another actor created it (no write recorded).
    pub fn seed(&self, mut obj: K) {
        let name = obj.name_any();
        self.stamp_new(&mut obj);
        lock(&self.store).objects.insert(name, obj.clone());
        let _ = self.events.send(ChangeEvent::Added(obj));
    }

    /// Remove every object whose controller owner is not in `live_uids`,
    /// the way the garbage collector does after an owner disappears.
    pub fn collect_orphans(&self, live_uids: &HashSet<String>) -> usize {
        let removed: Vec<K> = {
            let mut store = lock(&self.store);
            let orphaned: Vec<String> = store
                .objects
                .iter()
                .filter(|(_, obj)| {
                    let owners = obj.owner_references();
                    !owners.is_empty() && owners.iter().all(|o| !live_uids.contains(&o.uid))
                })
                .map(|(name, _)| name.clone())
                .collect();
            orphaned
                .iter()
                .filter_map(|name| store.objects.remove(name))
                .collect()
        };
        let count = removed.len();
        for obj in removed {
            let _ = self.events.send(ChangeEvent::Deleted(obj));
        }
        count
    }

    fn next_version(&self) -> String {
        let mut version = lock(&self.versions);
        *version += 1;
        version.to_string()
    }

    fn stamp_new(&self, obj: &mut K) {
        let version = self.next_version();
        let meta = obj.meta_mut();
        meta.uid = Some(uuid::Uuid::new_v4().to_string());
        meta.resource_version = Some(version);
        meta.generation = Some(1);
        meta.creation_timestamp = Some(Time(jiff::Timestamp::now()));
        meta.deletion_timestamp = None;
    }

    fn take_fault(&self, store: &mut Store<K>, operation: WriteKind) -> Result<(), ClientError> {
        match store.faults.iter().position(|(op, _)| *op == operation) {
            Some(idx) => match store.faults.remove(idx) {
                Some((_, err)) => Err(err),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }

    fn record(&self, operation: WriteKind, name: &str) {
        if operation.is_write() {
            self.log.record(self.kind, operation, name);
        }
    }

    fn describe(&self, name: &str) -> String {
        format!("{} \"{}\"", self.kind, name)
    }

    fn check_version(&self, stored: &K, incoming: &K, name: &str) -> Result<(), ClientError> {
        match incoming.resource_version() {
            Some(rv) if Some(&rv) != stored.meta().resource_version.as_ref() => Err(
                ClientError::Conflict(format!("{} has been modified", self.describe(name))),
            ),
            _ => Ok(()),
        }
    }
}

fn to_value<K: Serialize>(obj: &K) -> Result<Value, ClientError> {
    serde_json::to_value(obj).map_err(|e| ClientError::Invalid(e.to_string()))
}

fn from_value<K: DeserializeOwned>(value: Value) -> Result<K, ClientError> {
    serde_json::from_value(value).map_err(|e| ClientError::Invalid(e.to_string()))
}

/// Everything outside metadata and status.
fn desired_part(value: &Value) -> Value {
    let mut value = value.clone();
    if let Some(map) = value.as_object_mut() {
        map.remove("metadata");
        map.remove("status");
    }
    value
}

/// `target` with its status replaced by `source`'s status.
fn with_status_of<K>(target: &K, source: &K) -> Result<K, ClientError>
where
    K: Serialize + DeserializeOwned,
{
    let mut value = to_value(target)?;
    let status = to_value(source)?.get("status").cloned();
    if let Some(map) = value.as_object_mut() {
        match status {
            Some(status) => map.insert("status".to_string(), status),
            None => map.remove("status"),
        };
    }
    from_value(value)
}

#[async_trait]
impl<K> ResourceClient<K> for InMemoryResourceClient<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn create(&self, obj: &K) -> Result<K, ClientError> {
        let name = obj
            .meta()
            .name
            .clone()
            .ok_or_else(|| ClientError::Invalid(format!("{} without a name", self.kind)))?;
        let created = {
            let mut store = lock(&self.store);
            self.take_fault(&mut store, WriteKind::Create)?;
            if store.objects.contains_key(&name) {
                return Err(ClientError::AlreadyExists(self.describe(&name)));
            }
            let mut created = obj.clone();
            self.stamp_new(&mut created);
            store.objects.insert(name.clone(), created.clone());
            created
        };
        self.record(WriteKind::Create, &name);
        let _ = self.events.send(ChangeEvent::Added(created.clone()));
        Ok(created)
    }

    async fn get(&self, name: &str) -> Result<K, ClientError> {
        let mut store = lock(&self.store);
        self.take_fault(&mut store, WriteKind::Get)?;
        store
            .objects
            .get(name)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(self.describe(name)))
    }

    async fn list(&self, label_selector: Option<&str>) -> Result<Vec<K>, ClientError> {
        let mut store = lock(&self.store);
        self.take_fault(&mut store, WriteKind::List)?;
        let wanted: Vec<(&str, &str)> = label_selector
            .unwrap_or_default()
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .collect();
        Ok(store
            .objects
            .values()
            .filter(|obj| {
                let labels = obj.labels();
                wanted
                    .iter()
                    .all(|(k, v)| labels.get(*k).is_some_and(|actual| actual == v))
            })
            .cloned()
            .collect())
    }

    async fn update(&self, obj: &K) -> Result<K, ClientError> {
        let name = obj.name_any();
        let (event, updated) = {
            let mut store = lock(&self.store);
            self.take_fault(&mut store, WriteKind::Update)?;
            let stored = store
                .objects
                .get(&name)
                .cloned()
                .ok_or_else(|| ClientError::NotFound(self.describe(&name)))?;
            self.check_version(&stored, obj, &name)?;

            let mut updated = with_status_of(obj, &stored)?;
            let spec_changed = desired_part(&to_value(&updated)?) != desired_part(&to_value(&stored)?);
            let version = self.next_version();
            {
                let stored_meta = stored.meta();
                let meta = updated.meta_mut();
                meta.uid = stored_meta.uid.clone();
                meta.creation_timestamp = stored_meta.creation_timestamp.clone();
                meta.deletion_timestamp = stored_meta.deletion_timestamp.clone();
                meta.generation = match (stored_meta.generation, spec_changed) {
                    (Some(generation), true) => Some(generation + 1),
                    (generation, _) => generation,
                };
                meta.resource_version = Some(version);
            }

            if updated.meta().deletion_timestamp.is_some() && updated.finalizers().is_empty() {
                store.objects.remove(&name);
                (ChangeEvent::Deleted(updated.clone()), updated)
            } else {
                store.objects.insert(name.clone(), updated.clone());
                (ChangeEvent::Modified(updated.clone()), updated)
            }
        };
        self.record(WriteKind::Update, &name);
        let _ = self.events.send(event);
        Ok(updated)
    }

    async fn update_status(&self, obj: &K) -> Result<K, ClientError> {
        let name = obj.name_any();
        let updated = {
            let mut store = lock(&self.store);
            self.take_fault(&mut store, WriteKind::UpdateStatus)?;
            let stored = store
                .objects
                .get(&name)
                .cloned()
                .ok_or_else(|| ClientError::NotFound(self.describe(&name)))?;
            self.check_version(&stored, obj, &name)?;

            let mut updated = with_status_of(&stored, obj)?;
            updated.meta_mut().resource_version = Some(self.next_version());
            store.objects.insert(name.clone(), updated.clone());
            updated
        };
        self.record(WriteKind::UpdateStatus, &name);
        let _ = self.events.send(ChangeEvent::Modified(updated.clone()));
        Ok(updated)
    }

    async fn delete(&self, name: &str) -> Result<(), ClientError> {
        let event = {
            let mut store = lock(&self.store);
            self.take_fault(&mut store, WriteKind::Delete)?;
            let stored = store
                .objects
                .get(name)
                .cloned()
                .ok_or_else(|| ClientError::NotFound(self.describe(name)))?;

            if stored.finalizers().is_empty() {
                store.objects.remove(name);
                ChangeEvent::Deleted(stored)
            } else if stored.meta().deletion_timestamp.is_some() {
                return Ok(());
            } else {
                let mut marked = stored;
                let version = self.next_version();
                let meta = marked.meta_mut();
                meta.deletion_timestamp = Some(Time(jiff::Timestamp::now()));
                meta.resource_version = Some(version);
                store.objects.insert(name.to_string(), marked.clone());
                ChangeEvent::Modified(marked)
            }
        };
        self.record(WriteKind::Delete, name);
        let _ = self.events.send(event);
        Ok(())
    }

    fn watch(&self) -> BoxStream<'static, Result<ChangeEvent<K>, ClientError>> {
        // Subscribe under the lock so no write falls between snapshot and stream.
        let (snapshot, rx) = {
            let store = lock(&self.store);
            let rx = self.events.subscribe();
            (store.objects.values().cloned().collect::<Vec<_>>(), rx)
        };
        let live = stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(event) => Some((Ok(event), rx)),
                Err(broadcast::error::RecvError::Lagged(missed)) => Some((
                    Err(ClientError::Unavailable(format!(
                        "watch fell behind by {missed} events"
                    ))),
                    rx,
                )),
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });
        stream::iter(snapshot.into_iter().map(|obj| Ok(ChangeEvent::Added(obj))))
            .chain(live)
            .boxed()
    }
}

/// A complete in-memory cluster: one store per managed kind sharing a
/// resource version counter and a write log.
#[derive(Clone)]
pub struct InMemoryCluster {
    pub instances: InMemoryResourceClient<Motis>,
    pub config_maps: InMemoryResourceClient<ConfigMap>,
    pub volumes: InMemoryResourceClient<PersistentVolumeClaim>,
    pub workloads: InMemoryResourceClient<Deployment>,
    pub refresh_jobs: InMemoryResourceClient<CronJob>,
    pub jobs: InMemoryResourceClient<Job>,
    log: Arc<WriteLog>,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    pub fn new() -> Self {
        let versions: Arc<Mutex<u64>> = Arc::default();
        let log: Arc<WriteLog> = Arc::default();
        Self {
            instances: InMemoryResourceClient::with_shared("Motis", versions.clone(), log.clone()),
            config_maps: InMemoryResourceClient::with_shared(
                "ConfigMap",
                versions.clone(),
                log.clone(),
            ),
            volumes: InMemoryResourceClient::with_shared(
                "PersistentVolumeClaim",
                versions.clone(),
                log.clone(),
            ),
            workloads: InMemoryResourceClient::with_shared(
                "Deployment",
                versions.clone(),
                log.clone(),
            ),
            refresh_jobs: InMemoryResourceClient::with_shared(
                "CronJob",
                versions.clone(),
                log.clone(),
            ),
            jobs: InMemoryResourceClient::with_shared("Job", versions, log.clone()),
            log,
        }
    }

    /// Clients for the reconciler and API server.
    pub fn clients(&self) -> Clients {
        Clients {
            instances: Arc::new(self.instances.clone()),
            config_maps: Arc::new(self.config_maps.clone()),
            volumes: Arc::new(self.volumes.clone()),
            workloads: Arc::new(self.workloads.clone()),
            refresh_jobs: Arc::new(self.refresh_jobs.clone()),
            jobs: Arc::new(self.jobs.clone()),
        }
    }

    /// All writes recorded so far.
    pub fn writes(&self) -> Vec<WriteRecord> {
        lock(&self.log.entries).clone()
    }

    /// Number of writes recorded so far.
    pub fn write_count(&self) -> usize {
        lock(&self.log.entries).len()
    }

    /// Run the garbage collector: drop objects whose owning Motis is gone.
    pub fn collect_garbage(&self) -> usize {
        let live: HashSet<String> = self
            .instances
            .objects()
            .iter()
            .filter_map(|m| m.uid())
            .collect();
        self.config_maps.collect_orphans(&live)
            + self.volumes.collect_orphans(&live)
            + self.workloads.collect_orphans(&live)
            + self.refresh_jobs.collect_orphans(&live)
            + self.jobs.collect_orphans(&live)
    }

    /// Number of objects (of any owned kind) labelled for `instance`.
    pub fn owned_object_count(&self, instance: &str) -> usize {
        fn count<K: Resource>(objects: Vec<K>, instance: &str) -> usize {
            objects
                .iter()
                .filter(|o| {
                    o.meta()
                        .labels
                        .as_ref()
                        .and_then(|l| l.get(crate::resources::common::INSTANCE_LABEL))
                        .is_some_and(|v| v == instance)
                })
                .count()
        }
        count(self.config_maps.objects(), instance)
            + count(self.volumes.objects(), instance)
            + count(self.workloads.objects(), instance)
            + count(self.refresh_jobs.objects(), instance)
            + count(self.jobs.objects(), instance)
    }
}
