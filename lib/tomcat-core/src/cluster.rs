//! Cluster access used by the reconciler and the watch bridges
//!
//! Everything that talks to the API server goes through [`ClusterClient`],
//! so reconciliation can run against an in-memory cluster in tests.

use crate::{CoreError, ManagedKind, ManagedResource, ObjectKey, Result};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource};
use kube_runtime::{watcher, WatchStreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::fmt::Debug;
use tomcat_api::{Tomcat, TomcatStatus};
use tracing::debug;

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "tomcat-operator";

/// A change observed on a watched resource kind
#[derive(Clone, Debug, PartialEq)]
pub enum ResourceEvent<K> {
    /// The object was created or modified (or listed on watch start)
    Applied(K),
    /// The object was removed
    Deleted(K),
}

/// A change to one entry of a Tomcat's finalizer list
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FinalizerChange {
    Add(String),
    Remove(String),
}

/// JSON Patch applying `change` to a finalizer list last seen as `current`.
///
/// The `test` operations make the write fail if the list changed since it
/// was read, so entries added by other controllers are never dropped.
/// Returns `None` when the change is already in effect.
pub fn finalizer_patch(current: &[String], change: &FinalizerChange) -> Option<serde_json::Value> {
    match change {
        FinalizerChange::Add(name) if current.contains(name) => None,
        FinalizerChange::Add(name) if current.is_empty() => Some(json!([
            { "op": "test", "path": "/metadata/finalizers", "value": null },
            { "op": "add", "path": "/metadata/finalizers", "value": [name] },
        ])),
        FinalizerChange::Add(name) => Some(json!([
            { "op": "test", "path": "/metadata/finalizers", "value": current },
            { "op": "add", "path": "/metadata/finalizers/-", "value": name },
        ])),
        FinalizerChange::Remove(name) => {
            let index = current.iter().position(|f| f == name)?;
            let path = format!("/metadata/finalizers/{}", index);
            Some(json!([
                { "op": "test", "path": path, "value": name },
                { "op": "remove", "path": path },
            ]))
        }
    }
}

/// Capability to read, write and watch the resources the operator touches
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Get a Tomcat by key, `None` if it does not exist
    async fn get_tomcat(&self, key: &ObjectKey) -> Result<Option<Tomcat>>;

    /// Write the status subresource of a Tomcat
    async fn patch_tomcat_status(&self, key: &ObjectKey, status: &TomcatStatus) -> Result<Tomcat>;

    /// Add or remove one finalizer, provided the list still equals `current`.
    /// Fails with [`CoreError::Conflict`] when it does not.
    async fn patch_tomcat_finalizers(
        &self,
        key: &ObjectKey,
        current: &[String],
        change: FinalizerChange,
    ) -> Result<Tomcat>;

    /// Watch Tomcats in the operator's scope
    fn watch_tomcats(&self) -> BoxStream<'static, Result<ResourceEvent<Tomcat>>>;

    /// Get a managed resource, `None` if it does not exist
    async fn get_managed(&self, kind: ManagedKind, key: &ObjectKey) -> Result<Option<ManagedResource>>;

    /// Create a managed resource
    async fn create_managed(&self, resource: &ManagedResource) -> Result<ManagedResource>;

    /// Replace a managed resource; fails with [`CoreError::Conflict`] when the
    /// resource version is stale
    async fn replace_managed(&self, resource: &ManagedResource) -> Result<ManagedResource>;

    /// Delete a managed resource; `Ok(false)` if it was already gone
    async fn delete_managed(&self, kind: ManagedKind, key: &ObjectKey) -> Result<bool>;

    /// Watch Deployments matching a label selector
    fn watch_workloads(&self, label_selector: &str) -> BoxStream<'static, Result<ResourceEvent<Deployment>>>;
}

/// [`ClusterClient`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    /// Restricts watches to one namespace when set
    namespace: Option<String>,
}

impl KubeCluster {
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self { client, namespace }
    }

    /// Get the underlying Kubernetes client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    fn scoped<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn namespaced<K>(&self, key: &ObjectKey) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), &key.namespace)
    }
}

fn conflict_or(err: kube::Error, key: &ObjectKey, kind: &str) -> CoreError {
    match err {
        // 422 is a failed JSON Patch `test`
        kube::Error::Api(resp) if resp.code == 409 || resp.code == 422 => {
            CoreError::Conflict(format!("{} {}: {}", kind, key, resp.message))
        }
        other => CoreError::KubernetesError(other),
    }
}

async fn create<K>(api: Api<K>, obj: &K) -> Result<K>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned,
{
    Ok(api.create(&PostParams::default(), obj).await?)
}

async fn replace<K>(api: Api<K>, key: &ObjectKey, kind: &str, obj: &K) -> Result<K>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned,
{
    api.replace(&key.name, &PostParams::default(), obj)
        .await
        .map_err(|e| conflict_or(e, key, kind))
}

async fn delete<K>(api: Api<K>, key: &ObjectKey) -> Result<bool>
where
    K: Resource + Clone + Debug + DeserializeOwned,
{
    match api.delete(&key.name, &DeleteParams::background()).await {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn watch_stream<K>(api: Api<K>, config: watcher::Config) -> BoxStream<'static, Result<ResourceEvent<K>>>
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + 'static,
{
    watcher(api, config)
        .default_backoff()
        .filter_map(|event| async move {
            match event {
                Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
                    Some(Ok(ResourceEvent::Applied(obj)))
                }
                Ok(watcher::Event::Delete(obj)) => Some(Ok(ResourceEvent::Deleted(obj))),
                Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => None,
                Err(e) => Some(Err(e.into())),
            }
        })
        .boxed()
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get_tomcat(&self, key: &ObjectKey) -> Result<Option<Tomcat>> {
        let api: Api<Tomcat> = self.namespaced(key);
        Ok(api.get_opt(&key.name).await?)
    }

    async fn patch_tomcat_status(&self, key: &ObjectKey, status: &TomcatStatus) -> Result<Tomcat> {
        let api: Api<Tomcat> = self.namespaced(key);
        let patch = json!({ "status": status });
        debug!("Patching status of Tomcat {}", key);
        Ok(api
            .patch_status(&key.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?)
    }

    async fn patch_tomcat_finalizers(
        &self,
        key: &ObjectKey,
        current: &[String],
        change: FinalizerChange,
    ) -> Result<Tomcat> {
        let api: Api<Tomcat> = self.namespaced(key);
        let Some(ops) = finalizer_patch(current, &change) else {
            return api
                .get_opt(&key.name)
                .await?
                .ok_or_else(|| CoreError::Internal(format!("Tomcat {} vanished", key)));
        };
        let patch: json_patch::Patch = serde_json::from_value(ops)?;
        debug!("Patching finalizers of Tomcat {}: {:?}", key, change);
        api.patch(&key.name, &PatchParams::default(), &Patch::<()>::Json(patch))
            .await
            .map_err(|e| conflict_or(e, key, "Tomcat"))
    }

    fn watch_tomcats(&self) -> BoxStream<'static, Result<ResourceEvent<Tomcat>>> {
        watch_stream(self.scoped::<Tomcat>(), watcher::Config::default())
    }

    async fn get_managed(&self, kind: ManagedKind, key: &ObjectKey) -> Result<Option<ManagedResource>> {
        Ok(match kind {
            ManagedKind::Workload => self
                .namespaced::<Deployment>(key)
                .get_opt(&key.name)
                .await?
                .map(ManagedResource::Workload),
            ManagedKind::Service => self
                .namespaced::<Service>(key)
                .get_opt(&key.name)
                .await?
                .map(ManagedResource::Service),
        })
    }

    async fn create_managed(&self, resource: &ManagedResource) -> Result<ManagedResource> {
        let key = resource.key()?;
        Ok(match resource {
            ManagedResource::Workload(d) => {
                ManagedResource::Workload(create(self.namespaced(&key), d).await?)
            }
            ManagedResource::Service(s) => {
                ManagedResource::Service(create(self.namespaced(&key), s).await?)
            }
        })
    }

    async fn replace_managed(&self, resource: &ManagedResource) -> Result<ManagedResource> {
        let key = resource.key()?;
        let kind = resource.kind().to_string();
        Ok(match resource {
            ManagedResource::Workload(d) => {
                ManagedResource::Workload(replace(self.namespaced(&key), &key, &kind, d).await?)
            }
            ManagedResource::Service(s) => {
                ManagedResource::Service(replace(self.namespaced(&key), &key, &kind, s).await?)
            }
        })
    }

    async fn delete_managed(&self, kind: ManagedKind, key: &ObjectKey) -> Result<bool> {
        match kind {
            ManagedKind::Workload => delete(self.namespaced::<Deployment>(key), key).await,
            ManagedKind::Service => delete(self.namespaced::<Service>(key), key).await,
        }
    }

    fn watch_workloads(&self, label_selector: &str) -> BoxStream<'static, Result<ResourceEvent<Deployment>>> {
        watch_stream(
            self.scoped::<Deployment>(),
            watcher::Config::default().labels(label_selector),
        )
    }
}
