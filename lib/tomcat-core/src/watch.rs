//! Watches that feed the reconcile queue
//!
//! The primary watch follows Tomcats. The secondary watch follows the
//! Deployments this operator created, so readiness changes re-trigger the
//! owning Tomcat even though its spec did not change.

use crate::trigger::stopped;
use crate::{desired, ClusterClient, ObjectKey, ResourceEvent, Result, Trigger, TriggerSender};
use futures::stream::{BoxStream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tomcat_api::Tomcat;
use tracing::{debug, info, warn};

/// Kind of change seen on a watched Deployment
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Created => write!(f, "created"),
            ChangeKind::Updated => write!(f, "updated"),
            ChangeKind::Deleted => write!(f, "deleted"),
        }
    }
}

/// Maps Deployment events to the Tomcat that owns the Deployment
#[derive(Debug, Default)]
pub struct WorkloadEventMapper {
    known: HashSet<ObjectKey>,
}

impl WorkloadEventMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify an event and return the owning Tomcat's key.
    /// Events for objects without a name or namespace are dropped.
    pub fn map(&mut self, event: &ResourceEvent<Deployment>) -> Option<(ChangeKind, ObjectKey)> {
        let (change, key) = match event {
            ResourceEvent::Applied(d) => {
                let key = ObjectKey::of(d).ok()?;
                let change = if self.known.insert(key.clone()) {
                    ChangeKind::Created
                } else {
                    ChangeKind::Updated
                };
                (change, key)
            }
            ResourceEvent::Deleted(d) => {
                let key = ObjectKey::of(d).ok()?;
                self.known.remove(&key);
                (ChangeKind::Deleted, key)
            }
        };
        // Deployments share namespace and name with their Tomcat
        Some((change, owner_of(&key)))
    }
}

/// Key of the Tomcat owning a managed resource
pub fn owner_of(managed: &ObjectKey) -> ObjectKey {
    managed.clone()
}

/// Lazily started watch on operator-owned Deployments
pub struct SecondaryWatchBridge {
    cluster: Arc<dyn ClusterClient>,
    triggers: TriggerSender,
    shutdown: watch::Receiver<bool>,
    subscribed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SecondaryWatchBridge {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        triggers: TriggerSender,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            cluster,
            triggers,
            shutdown,
            subscribed: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    /// Start the Deployment watch unless it is already running.
    /// Returns true if this call started it.
    pub async fn ensure_subscribed(&self) -> bool {
        if self
            .subscribed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let selector = desired::managed_selector();
        info!("Watching Deployments with {}", selector);
        let events = self.cluster.watch_workloads(&selector);
        let handle = tokio::spawn(forward_workload_events(
            events,
            self.triggers.clone(),
            self.shutdown.clone(),
        ));
        *self.task.lock().await = Some(handle);
        true
    }

    /// Wait for the forwarding task to finish after shutdown
    pub async fn join(&self) {
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Deployment watch task failed: {}", e);
            }
        }
    }
}

async fn forward_workload_events(
    mut events: BoxStream<'static, Result<ResourceEvent<Deployment>>>,
    triggers: TriggerSender,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut mapper = WorkloadEventMapper::new();
    loop {
        let event = tokio::select! {
            _ = stopped(&mut shutdown) => break,
            event = events.next() => event,
        };
        match event {
            Some(Ok(event)) => {
                let Some((change, key)) = mapper.map(&event) else {
                    continue;
                };
                debug!("Deployment {} {}, triggering Tomcat", key, change);
                if triggers.send(Trigger::secondary(key)).await.is_err() {
                    break;
                }
            }
            Some(Err(e)) => warn!("Deployment watch error: {}", e),
            None => {
                warn!("Deployment watch ended");
                break;
            }
        }
    }
    debug!("Deployment watch stopped");
}

/// Forward Tomcat events to the engine until shutdown
pub async fn run_primary_watch(
    cluster: Arc<dyn ClusterClient>,
    triggers: TriggerSender,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Watching Tomcats");
    let mut events: BoxStream<'static, Result<ResourceEvent<Tomcat>>> = cluster.watch_tomcats();
    loop {
        let event = tokio::select! {
            _ = stopped(&mut shutdown) => break,
            event = events.next() => event,
        };
        let tomcat = match event {
            Some(Ok(ResourceEvent::Applied(t))) | Some(Ok(ResourceEvent::Deleted(t))) => t,
            Some(Err(e)) => {
                warn!("Tomcat watch error: {}", e);
                continue;
            }
            None => {
                warn!("Tomcat watch ended");
                break;
            }
        };
        let Ok(key) = ObjectKey::of(&tomcat) else {
            continue;
        };
        if triggers.send(Trigger::primary(key)).await.is_err() {
            break;
        }
    }
    debug!("Tomcat watch stopped");
}
