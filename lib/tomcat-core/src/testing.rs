//! In-memory cluster for tests

use crate::cluster::FinalizerChange;
use crate::{ClusterClient, CoreError, ManagedKind, ManagedResource, ObjectKey, ResourceEvent, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::error::ErrorResponse;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tomcat_api::{Tomcat, TomcatStatus};

/// A write observed by the fake cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mutation {
    Create(ManagedKind, ObjectKey),
    Replace(ManagedKind, ObjectKey),
    Delete(ManagedKind, ObjectKey),
    Status(ObjectKey),
    Finalizers(ObjectKey),
}

struct WorkloadWatcher {
    selector: String,
    tx: mpsc::UnboundedSender<ResourceEvent<Deployment>>,
}

/// Equality-based label selector match, e.g. `a=b,c=d`
fn selects(selector: &str, workload: &Deployment) -> bool {
    let labels = workload.metadata.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => labels.contains_key(term),
        })
}

#[derive(Default)]
struct State {
    tomcats: HashMap<ObjectKey, Tomcat>,
    workloads: HashMap<ObjectKey, Deployment>,
    services: HashMap<ObjectKey, Service>,
    mutations: Vec<Mutation>,
    tomcat_watchers: Vec<mpsc::UnboundedSender<ResourceEvent<Tomcat>>>,
    workload_watchers: Vec<WorkloadWatcher>,
    workload_selectors: Vec<String>,
    active_writes: HashMap<ObjectKey, usize>,
    max_active_writes: usize,
}

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
    resource_version: AtomicU64,
    conflicts: AtomicU32,
    failures: AtomicU32,
    workload_watch_calls: AtomicU32,
    write_latency: Mutex<Option<Duration>>,
}

fn not_found(key: &ObjectKey) -> CoreError {
    CoreError::KubernetesError(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{} not found", key),
        reason: "NotFound".to_string(),
        code: 404,
    }))
}

impl State {
    fn notify_workloads(&mut self, event: ResourceEvent<Deployment>) {
        let workload = match &event {
            ResourceEvent::Applied(d) | ResourceEvent::Deleted(d) => d,
        };
        self.workload_watchers.retain(|w| {
            !selects(&w.selector, workload) || w.tx.send(event.clone()).is_ok()
        });
    }
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> Option<String> {
        Some((self.resource_version.fetch_add(1, Ordering::SeqCst) + 1).to_string())
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Fail the next `n` replace calls with a stale write conflict
    pub fn conflict_next_replaces(&self, n: u32) {
        self.conflicts.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` reads of managed resources with a transient error
    pub fn fail_next_reads(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Make every create and replace take this long
    pub fn set_write_latency(&self, latency: Duration) {
        *self.write_latency.lock().unwrap() = Some(latency);
    }

    pub fn mutations(&self) -> Vec<Mutation> {
        self.state.lock().unwrap().mutations.clone()
    }

    pub fn status_writes(&self, key: &ObjectKey) -> usize {
        self.mutations()
            .iter()
            .filter(|m| **m == Mutation::Status(key.clone()))
            .count()
    }

    /// Highest number of writes seen in flight for a single key
    pub fn max_concurrent_writes(&self) -> usize {
        self.state.lock().unwrap().max_active_writes
    }

    /// Label selectors of every Deployment watch opened so far
    pub fn workload_selectors(&self) -> Vec<String> {
        self.state.lock().unwrap().workload_selectors.clone()
    }

    pub fn workload_watch_calls(&self) -> u32 {
        self.workload_watch_calls.load(Ordering::SeqCst)
    }

    pub fn tomcat(&self, key: &ObjectKey) -> Option<Tomcat> {
        self.state.lock().unwrap().tomcats.get(key).cloned()
    }

    pub fn workload(&self, key: &ObjectKey) -> Option<Deployment> {
        self.state.lock().unwrap().workloads.get(key).cloned()
    }

    pub fn service(&self, key: &ObjectKey) -> Option<Service> {
        self.state.lock().unwrap().services.get(key).cloned()
    }

    /// Store a Tomcat as a user would, notifying Tomcat watchers
    pub fn put_tomcat(&self, mut tomcat: Tomcat) {
        let key = ObjectKey::of(&tomcat).unwrap();
        tomcat.metadata.resource_version = self.next_version();
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.tomcats.get(&key) {
            tomcat.status = existing.status.clone();
            tomcat.metadata.finalizers = existing.metadata.finalizers.clone();
        }
        state.tomcats.insert(key, tomcat.clone());
        state
            .tomcat_watchers
            .retain(|tx| tx.send(ResourceEvent::Applied(tomcat.clone())).is_ok());
    }

    /// Request deletion of a Tomcat; it stays until its finalizers are gone
    pub fn delete_tomcat(&self, key: &ObjectKey) {
        let mut state = self.state.lock().unwrap();
        let Some(tomcat) = state.tomcats.get_mut(key) else {
            return;
        };
        tomcat.metadata.deletion_timestamp = Some(Time(chrono_now()));
        let finalized = tomcat
            .metadata
            .finalizers
            .as_ref()
            .map_or(true, |f| f.is_empty());
        let event = if finalized {
            let removed = state.tomcats.remove(key).unwrap();
            ResourceEvent::Deleted(removed)
        } else {
            ResourceEvent::Applied(state.tomcats[key].clone())
        };
        state.tomcat_watchers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Another controller adding its own finalizer to a Tomcat
    pub fn add_foreign_finalizer(&self, key: &ObjectKey, name: &str) {
        let version = self.next_version();
        let mut state = self.state.lock().unwrap();
        if let Some(tomcat) = state.tomcats.get_mut(key) {
            tomcat
                .metadata
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(name.to_string());
            tomcat.metadata.resource_version = version;
        }
    }

    /// Simulate pods of a Deployment becoming ready
    pub fn set_ready_replicas(&self, key: &ObjectKey, ready: i32) {
        let version = self.next_version();
        let mut state = self.state.lock().unwrap();
        let Some(workload) = state.workloads.get_mut(key) else {
            return;
        };
        workload.metadata.resource_version = version;
        workload.status = Some(DeploymentStatus {
            ready_replicas: Some(ready),
            ..Default::default()
        });
        let event = ResourceEvent::Applied(workload.clone());
        state.notify_workloads(event);
    }

    /// Change a live Service behind the operator's back
    pub fn edit_service(&self, key: &ObjectKey, edit: impl FnOnce(&mut Service)) {
        let version = self.next_version();
        let mut state = self.state.lock().unwrap();
        if let Some(service) = state.services.get_mut(key) {
            edit(service);
            service.metadata.resource_version = version;
        }
    }

    async fn begin_write(&self, key: &ObjectKey) {
        {
            let mut state = self.state.lock().unwrap();
            let active = state.active_writes.entry(key.clone()).or_insert(0);
            *active += 1;
            let active = *active;
            state.max_active_writes = state.max_active_writes.max(active);
        }
        let latency = *self.write_latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn end_write(&self, key: &ObjectKey) {
        let mut state = self.state.lock().unwrap();
        if let Some(active) = state.active_writes.get_mut(key) {
            *active -= 1;
        }
    }

    fn store(&self, resource: ManagedResource, mutation: Mutation) -> Result<ManagedResource> {
        let key = resource.key()?;
        let version = self.next_version();
        let mut state = self.state.lock().unwrap();
        state.mutations.push(mutation);
        Ok(match resource {
            ManagedResource::Workload(mut d) => {
                d.metadata.resource_version = version;
                state.workloads.insert(key, d.clone());
                let event = ResourceEvent::Applied(d.clone());
                state.notify_workloads(event);
                ManagedResource::Workload(d)
            }
            ManagedResource::Service(mut s) => {
                s.metadata.resource_version = version;
                state.services.insert(key, s.clone());
                ManagedResource::Service(s)
            }
        })
    }

    fn live_version(&self, kind: ManagedKind, key: &ObjectKey) -> Option<Option<String>> {
        let state = self.state.lock().unwrap();
        match kind {
            ManagedKind::Workload => state
                .workloads
                .get(key)
                .map(|d| d.metadata.resource_version.clone()),
            ManagedKind::Service => state
                .services
                .get(key)
                .map(|s| s.metadata.resource_version.clone()),
        }
    }

    fn bump_version(&self, kind: ManagedKind, key: &ObjectKey) {
        let version = self.next_version();
        let mut state = self.state.lock().unwrap();
        match kind {
            ManagedKind::Workload => {
                if let Some(d) = state.workloads.get_mut(key) {
                    d.metadata.resource_version = version;
                }
            }
            ManagedKind::Service => {
                if let Some(s) = state.services.get_mut(key) {
                    s.metadata.resource_version = version;
                }
            }
        }
    }
}

fn chrono_now() -> k8s_openapi::chrono::DateTime<k8s_openapi::chrono::Utc> {
    k8s_openapi::chrono::Utc::now()
}

fn receiver_stream<T: Send + 'static>(rx: mpsc::UnboundedReceiver<T>) -> BoxStream<'static, Result<T>> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (Ok(item), rx)) }).boxed()
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_tomcat(&self, key: &ObjectKey) -> Result<Option<Tomcat>> {
        Ok(self.tomcat(key))
    }

    async fn patch_tomcat_status(&self, key: &ObjectKey, status: &TomcatStatus) -> Result<Tomcat> {
        let version = self.next_version();
        let mut state = self.state.lock().unwrap();
        let tomcat = state.tomcats.get_mut(key).ok_or_else(|| not_found(key))?;
        tomcat.status = Some(status.clone());
        tomcat.metadata.resource_version = version;
        let tomcat = tomcat.clone();
        state.mutations.push(Mutation::Status(key.clone()));
        state
            .tomcat_watchers
            .retain(|tx| tx.send(ResourceEvent::Applied(tomcat.clone())).is_ok());
        Ok(tomcat)
    }

    async fn patch_tomcat_finalizers(
        &self,
        key: &ObjectKey,
        current: &[String],
        change: FinalizerChange,
    ) -> Result<Tomcat> {
        let version = self.next_version();
        let mut state = self.state.lock().unwrap();
        let tomcat = state.tomcats.get_mut(key).ok_or_else(|| not_found(key))?;
        let mut finalizers = tomcat.metadata.finalizers.clone().unwrap_or_default();
        if finalizers != current {
            return Err(CoreError::Conflict(format!("finalizers of Tomcat {}", key)));
        }
        match change {
            FinalizerChange::Add(name) if !finalizers.contains(&name) => finalizers.push(name),
            FinalizerChange::Remove(name) => finalizers.retain(|f| *f != name),
            FinalizerChange::Add(_) => {}
        }
        tomcat.metadata.finalizers = Some(finalizers.clone());
        tomcat.metadata.resource_version = version;
        let tomcat = tomcat.clone();
        state.mutations.push(Mutation::Finalizers(key.clone()));
        let event = if finalizers.is_empty() && tomcat.metadata.deletion_timestamp.is_some() {
            state.tomcats.remove(key);
            ResourceEvent::Deleted(tomcat.clone())
        } else {
            ResourceEvent::Applied(tomcat.clone())
        };
        state.tomcat_watchers.retain(|tx| tx.send(event.clone()).is_ok());
        Ok(tomcat)
    }

    fn watch_tomcats(&self) -> BoxStream<'static, Result<ResourceEvent<Tomcat>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap();
        for tomcat in state.tomcats.values() {
            let _ = tx.send(ResourceEvent::Applied(tomcat.clone()));
        }
        state.tomcat_watchers.push(tx);
        receiver_stream(rx)
    }

    async fn get_managed(&self, kind: ManagedKind, key: &ObjectKey) -> Result<Option<ManagedResource>> {
        if Self::take(&self.failures) {
            return Err(CoreError::Internal("injected read failure".to_string()));
        }
        let state = self.state.lock().unwrap();
        Ok(match kind {
            ManagedKind::Workload => state.workloads.get(key).cloned().map(ManagedResource::Workload),
            ManagedKind::Service => state.services.get(key).cloned().map(ManagedResource::Service),
        })
    }

    async fn create_managed(&self, resource: &ManagedResource) -> Result<ManagedResource> {
        let key = resource.key()?;
        let kind = resource.kind();
        self.begin_write(&key).await;
        let result = if self.live_version(kind, &key).is_some() {
            Err(CoreError::Conflict(format!("{} {} already exists", kind, key)))
        } else {
            self.store(resource.clone(), Mutation::Create(kind, key.clone()))
        };
        self.end_write(&key);
        result
    }

    async fn replace_managed(&self, resource: &ManagedResource) -> Result<ManagedResource> {
        let key = resource.key()?;
        let kind = resource.kind();
        self.begin_write(&key).await;
        let result = if Self::take(&self.conflicts) {
            self.bump_version(kind, &key);
            Err(CoreError::Conflict(format!("{} {}", kind, key)))
        } else {
            let submitted = match resource {
                ManagedResource::Workload(d) => d.metadata.resource_version.clone(),
                ManagedResource::Service(s) => s.metadata.resource_version.clone(),
            };
            match self.live_version(kind, &key) {
                None => Err(not_found(&key)),
                Some(live) if live != submitted => {
                    Err(CoreError::Conflict(format!("{} {}", kind, key)))
                }
                Some(_) => self.store(resource.clone(), Mutation::Replace(kind, key.clone())),
            }
        };
        self.end_write(&key);
        result
    }

    async fn delete_managed(&self, kind: ManagedKind, key: &ObjectKey) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let existed = match kind {
            ManagedKind::Workload => {
                let removed = state.workloads.remove(key);
                if let Some(d) = removed.as_ref() {
                    state.notify_workloads(ResourceEvent::Deleted(d.clone()));
                }
                removed.is_some()
            }
            ManagedKind::Service => state.services.remove(key).is_some(),
        };
        if existed {
            state.mutations.push(Mutation::Delete(kind, key.clone()));
        }
        Ok(existed)
    }

    fn watch_workloads(&self, label_selector: &str) -> BoxStream<'static, Result<ResourceEvent<Deployment>>> {
        self.workload_watch_calls.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap();
        for workload in state.workloads.values() {
            if selects(label_selector, workload) {
                let _ = tx.send(ResourceEvent::Applied(workload.clone()));
            }
        }
        state.workload_selectors.push(label_selector.to_string());
        state.workload_watchers.push(WorkloadWatcher {
            selector: label_selector.to_string(),
            tx,
        });
        receiver_stream(rx)
    }
}
