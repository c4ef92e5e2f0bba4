//! Resource client layer.
//!
//! The controller never talks to `kube::Api` directly. Every kind it manages
//! is reached through [`ResourceClient`], which has two implementations:
//!
//! - [`KubeResourceClient`]: backed by the Kubernetes API server
//! - [`InMemoryResourceClient`]: an in-process object store with the same
//!   semantics (resource versions, generations, finalizers, conflicts), used
//!   as a test double for the reconciler and the HTTP API
//!
//! [`Clients`] bundles one client per managed kind and is handed to the
//! reconciler and API server by constructor injection.

mod cluster;
mod memory;

pub use cluster::KubeResourceClient;
pub use memory::{InMemoryCluster, InMemoryResourceClient, WriteKind, WriteRecord};

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim};
use thiserror::Error;

use crate::crd::Motis;

/// Errors returned by a [`ResourceClient`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An object with the same name already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic concurrency failure: the object changed since it was read.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The API server could not be reached or is overloaded.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The request was denied by RBAC or an admission policy.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The API server rejected the payload.
    #[error("invalid: {0}")]
    Invalid(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClientError::Conflict(_))
    }
}

impl From<kube::Error> for ClientError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => {
                let message = format!("{} ({})", resp.message, resp.reason);
                match resp.code {
                    404 => ClientError::NotFound(message),
                    409 if resp.reason == "AlreadyExists" => ClientError::AlreadyExists(message),
                    409 => ClientError::Conflict(message),
                    401 | 403 => ClientError::Forbidden(message),
                    429 => ClientError::Unavailable(message),
                    code if code >= 500 => ClientError::Unavailable(message),
                    _ => ClientError::Invalid(message),
                }
            }
            kube::Error::SerdeError(e) => ClientError::Invalid(e.to_string()),
            other => ClientError::Unavailable(other.to_string()),
        }
    }
}

/// A change observed on a watched kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent<K> {
    /// Object seen for the first time (including replays after a relist).
    Added(K),
    /// Object changed.
    Modified(K),
    /// Object removed.
    Deleted(K),
}

impl<K> ChangeEvent<K> {
    /// The object carried by the event.
    pub fn object(&self) -> &K {
        match self {
            ChangeEvent::Added(obj) | ChangeEvent::Modified(obj) | ChangeEvent::Deleted(obj) => obj,
        }
    }
}

/// Typed access to one namespaced kind.
#[async_trait]
pub trait ResourceClient<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    /// Create a new object. Fails with `AlreadyExists` if the name is taken.
    async fn create(&self, obj: &K) -> Result<K, ClientError>;

    /// Fetch an object by name.
    async fn get(&self, name: &str) -> Result<K, ClientError>;

    /// List objects, optionally filtered by a label selector (`k=v,k2=v2`).
    async fn list(&self, label_selector: Option<&str>) -> Result<Vec<K>, ClientError>;

    /// Replace an object. When `metadata.resourceVersion` is set, the write
    /// fails with `Conflict` if the stored object has moved on.
    async fn update(&self, obj: &K) -> Result<K, ClientError>;

    /// Replace the status subresource, with the same concurrency rules as
    /// [`ResourceClient::update`].
    async fn update_status(&self, obj: &K) -> Result<K, ClientError>;

    /// Delete an object by name.
    async fn delete(&self, name: &str) -> Result<(), ClientError>;

    /// Infinite stream of changes. Implementations restart transparently on
    /// connection loss, replaying current objects as `Added` after a relist.
    fn watch(&self) -> BoxStream<'static, Result<ChangeEvent<K>, ClientError>>;

    /// Fetch an object, mapping `NotFound` to `None`.
    async fn get_opt(&self, name: &str) -> Result<Option<K>, ClientError> {
        match self.get(name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(ClientError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// One client per kind the operator manages.
#[derive(Clone)]
pub struct Clients {
    pub instances: Arc<dyn ResourceClient<Motis>>,
    pub config_maps: Arc<dyn ResourceClient<ConfigMap>>,
    pub volumes: Arc<dyn ResourceClient<PersistentVolumeClaim>>,
    pub workloads: Arc<dyn ResourceClient<Deployment>>,
    pub refresh_jobs: Arc<dyn ResourceClient<CronJob>>,
    pub jobs: Arc<dyn ResourceClient<Job>>,
}

impl Clients {
    /// Clients backed by the Kubernetes API, scoped to one namespace.
    pub fn kube(client: kube::Client, namespace: &str) -> Self {
        Self {
            instances: Arc::new(KubeResourceClient::<Motis>::namespaced(client.clone(), namespace)),
            config_maps: Arc::new(KubeResourceClient::<ConfigMap>::namespaced(
                client.clone(),
                namespace,
            )),
            volumes: Arc::new(KubeResourceClient::<PersistentVolumeClaim>::namespaced(
                client.clone(),
                namespace,
            )),
            workloads: Arc::new(KubeResourceClient::<Deployment>::namespaced(
                client.clone(),
                namespace,
            )),
            refresh_jobs: Arc::new(KubeResourceClient::<CronJob>::namespaced(
                client.clone(),
                namespace,
            )),
            jobs: Arc::new(KubeResourceClient::<Job>::namespaced(client, namespace)),
        }
    }
}
