//! Create-or-update and delete of the resources a Tomcat owns

use crate::{ClusterClient, CoreError, ManagedKind, ManagedResource, ObjectKey, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Fresh read-and-merge attempts before a conflict is handed to the engine
pub const MAX_CONFLICT_RETRIES: u32 = 3;

/// Applies desired manifests against live cluster state
///
/// Holds no state of its own; every call reads the live object first.
pub struct ResourceReconciler {
    cluster: Arc<dyn ClusterClient>,
    max_conflict_retries: u32,
}

impl ResourceReconciler {
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        Self {
            cluster,
            max_conflict_retries: MAX_CONFLICT_RETRIES,
        }
    }

    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    /// Create the Deployment or merge the owned fields into the live one
    pub async fn apply_workload(&self, desired: &Deployment) -> Result<Deployment> {
        let applied = self
            .apply(ManagedResource::Workload(desired.clone()))
            .await?;
        applied
            .into_workload()
            .ok_or_else(|| CoreError::Internal("apply returned a non-Deployment".to_string()))
    }

    /// Create the Service or merge the owned fields into the live one
    pub async fn apply_service(&self, desired: &Service) -> Result<Service> {
        let applied = self.apply(ManagedResource::Service(desired.clone())).await?;
        applied
            .into_service()
            .ok_or_else(|| CoreError::Internal("apply returned a non-Service".to_string()))
    }

    /// Delete both managed resources; absent ones are already converged
    pub async fn delete_managed(&self, key: &ObjectKey) -> Result<()> {
        for kind in ManagedKind::ALL {
            if self.cluster.get_managed(kind, key).await?.is_none() {
                debug!("{} {} already absent", kind, key);
                continue;
            }
            info!("Deleting {} {}", kind, key);
            if !self.cluster.delete_managed(kind, key).await? {
                debug!("{} {} vanished before delete", kind, key);
            }
        }
        Ok(())
    }

    async fn apply(&self, desired: ManagedResource) -> Result<ManagedResource> {
        let key = desired.key()?;
        let kind = desired.kind();
        let mut attempt = 0;
        loop {
            let Some(live) = self.cluster.get_managed(kind, &key).await? else {
                info!("Creating {} {}", kind, key);
                return self.cluster.create_managed(&desired).await;
            };

            let merged = merge(&live, &desired)?;
            if merged == live {
                debug!("{} {} already up to date", kind, key);
                return Ok(live);
            }

            info!("Updating {} {}", kind, key);
            match self.cluster.replace_managed(&merged).await {
                Err(e) if e.is_conflict() && attempt < self.max_conflict_retries => {
                    attempt += 1;
                    warn!("Stale write to {} {} ({}), re-reading", kind, key, e);
                }
                other => return other,
            }
        }
    }
}

/// Overlay the fields this operator controls onto a live object
pub fn merge(live: &ManagedResource, desired: &ManagedResource) -> Result<ManagedResource> {
    match (live, desired) {
        (ManagedResource::Workload(l), ManagedResource::Workload(d)) => {
            Ok(ManagedResource::Workload(merge_workload(l, d)?))
        }
        (ManagedResource::Service(l), ManagedResource::Service(d)) => {
            Ok(ManagedResource::Service(merge_service(l, d)?))
        }
        _ => Err(CoreError::Internal(format!(
            "cannot merge {} into {}",
            desired.kind(),
            live.kind()
        ))),
    }
}

fn merge_workload(live: &Deployment, desired: &Deployment) -> Result<Deployment> {
    let mut merged = live.clone();
    merge_meta(&mut merged.metadata, &desired.metadata)?;

    let Some(want) = desired.spec.as_ref() else {
        return Ok(merged);
    };
    let spec = merged.spec.get_or_insert_with(Default::default);
    spec.replicas = want.replicas;
    merge_labels(&mut spec.selector.match_labels, &want.selector.match_labels);
    if let Some(want_meta) = want.template.metadata.as_ref() {
        let meta = spec.template.metadata.get_or_insert_with(Default::default);
        merge_labels(&mut meta.labels, &want_meta.labels);
    }

    let want_container = want
        .template
        .spec
        .as_ref()
        .and_then(|pod| pod.containers.first());
    let pod = spec.template.spec.as_mut();
    if let (Some(want_container), Some(pod)) = (want_container, pod) {
        let target = match pod.containers.iter().position(|c| c.name == want_container.name) {
            Some(i) => pod.containers.get_mut(i),
            None => pod.containers.first_mut(),
        };
        if let Some(container) = target {
            container.image = want_container.image.clone();
        }
    }
    Ok(merged)
}

fn merge_service(live: &Service, desired: &Service) -> Result<Service> {
    let mut merged = live.clone();
    merge_meta(&mut merged.metadata, &desired.metadata)?;
    if let Some(want) = desired.spec.as_ref() {
        let spec = merged.spec.get_or_insert_with(Default::default);
        spec.selector = want.selector.clone();
    }
    Ok(merged)
}

fn merge_meta(live: &mut ObjectMeta, desired: &ObjectMeta) -> Result<()> {
    if let Some(owners) = desired.owner_references.as_ref() {
        check_controller(live, owners)?;
        merge_owners(&mut live.owner_references, owners);
    }
    merge_labels(&mut live.labels, &desired.labels);
    Ok(())
}

/// A live object may have at most one controller, and it has to be ours
fn check_controller(live: &ObjectMeta, desired: &[OwnerReference]) -> Result<()> {
    let is_controller = |o: &&OwnerReference| o.controller == Some(true);
    let Some(ours) = desired.iter().find(is_controller) else {
        return Ok(());
    };
    let foreign = live
        .owner_references
        .iter()
        .flatten()
        .find(|o| is_controller(o) && o.uid != ours.uid);
    match foreign {
        Some(other) => Err(CoreError::ForeignOwner(format!(
            "{}/{} (controller {} {})",
            live.namespace.as_deref().unwrap_or_default(),
            live.name.as_deref().unwrap_or_default(),
            other.kind,
            other.name
        ))),
        None => Ok(()),
    }
}

fn merge_labels(live: &mut Option<BTreeMap<String, String>>, desired: &Option<BTreeMap<String, String>>) {
    let Some(desired) = desired else {
        return;
    };
    let labels = live.get_or_insert_with(BTreeMap::new);
    for (k, v) in desired {
        if labels.get(k) != Some(v) {
            labels.insert(k.clone(), v.clone());
        }
    }
}

fn merge_owners(live: &mut Option<Vec<OwnerReference>>, desired: &[OwnerReference]) {
    let owners = live.get_or_insert_with(Vec::new);
    for owner in desired {
        if !owners.iter().any(|o| o.uid == owner.uid) {
            owners.push(owner.clone());
        }
    }
}
