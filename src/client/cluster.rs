//! [`ResourceClient`] backed by the Kubernetes API server.

use std::fmt::Debug;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, future};
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{ChangeEvent, ClientError, ResourceClient};

/// Typed client for one namespaced kind.
#[derive(Clone)]
pub struct KubeResourceClient<K>
where
    K: Resource,
{
    api: Api<K>,
}

impl<K> KubeResourceClient<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    /// Create a client scoped to `namespace`.
    pub fn namespaced(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl<K> ResourceClient<K> for KubeResourceClient<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
    <K as Resource>::DynamicType: Default + Clone + Eq + std::hash::Hash,
{
    async fn create(&self, obj: &K) -> Result<K, ClientError> {
        Ok(self.api.create(&PostParams::default(), obj).await?)
    }

    async fn get(&self, name: &str) -> Result<K, ClientError> {
        Ok(self.api.get(name).await?)
    }

    async fn list(&self, label_selector: Option<&str>) -> Result<Vec<K>, ClientError> {
        let params = match label_selector {
            Some(selector) => ListParams::default().labels(selector),
            None => ListParams::default(),
        };
        Ok(self.api.list(&params).await?.items)
    }

    async fn update(&self, obj: &K) -> Result<K, ClientError> {
        let name = obj.name_any();
        Ok(self.api.replace(&name, &PostParams::default(), obj).await?)
    }

    async fn update_status(&self, obj: &K) -> Result<K, ClientError> {
        let name = obj.name_any();
        // A full replace of the status subresource carrying resourceVersion is
        // rejected with 409 when the stored object has moved on. Fields absent
        // from `obj` are cleared, unlike with a merge patch.
        let body = serde_json::to_vec(obj).map_err(|e| ClientError::Invalid(e.to_string()))?;
        Ok(self
            .api
            .replace_status(&name, &PostParams::default(), body)
            .await?)
    }

    async fn delete(&self, name: &str) -> Result<(), ClientError> {
        self.api
            .delete(name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(ClientError::from)
    }

    fn watch(&self) -> BoxStream<'static, Result<ChangeEvent<K>, ClientError>> {
        watcher(self.api.clone(), watcher::Config::default().any_semantic())
            .default_backoff()
            .filter_map(|event| {
                future::ready(match event {
                    Ok(watcher::Event::InitApply(obj)) => Some(Ok(ChangeEvent::Added(obj))),
                    Ok(watcher::Event::Apply(obj)) => Some(Ok(ChangeEvent::Modified(obj))),
                    Ok(watcher::Event::Delete(obj)) => Some(Ok(ChangeEvent::Deleted(obj))),
                    Ok(watcher::Event::Init | watcher::Event::InitDone) => None,
                    Err(e) => Some(Err(ClientError::Unavailable(e.to_string()))),
                })
            })
            .boxed()
    }
}
