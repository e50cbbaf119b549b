//! Reflects Deployment readiness back into the Tomcat status

use crate::{ClusterClient, ObjectKey, Result};
use k8s_openapi::api::apps::v1::Deployment;
use std::sync::Arc;
use tomcat_api::{Tomcat, TomcatStatus};
use tracing::{debug, info};

pub struct StatusSynchronizer {
    cluster: Arc<dyn ClusterClient>,
}

/// Status a Tomcat should report for its live Deployment
///
/// A Deployment without status (e.g. just created) counts as zero ready.
pub fn observed_status(workload: &Deployment) -> TomcatStatus {
    let ready = workload
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    TomcatStatus::with_ready_replicas(u32::try_from(ready).unwrap_or(0))
}

impl StatusSynchronizer {
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        Self { cluster }
    }

    /// Write the observed status if it differs from the last known one.
    /// Returns whether a write happened.
    pub async fn sync(&self, tomcat: &Tomcat, workload: &Deployment) -> Result<bool> {
        let key = ObjectKey::of(tomcat)?;
        let observed = observed_status(workload);
        let current = tomcat.status.clone().unwrap_or_default();
        if tomcat.status.is_some() && current == observed {
            debug!("Status of Tomcat {} unchanged", key);
            return Ok(false);
        }

        info!(
            "Updating status of Tomcat {} to {} ready replicas",
            key, observed.ready_replicas
        );
        self.cluster.patch_tomcat_status(&key, &observed).await?;
        Ok(true)
    }
}
