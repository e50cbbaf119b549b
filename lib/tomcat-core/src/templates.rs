//! Baseline manifests the desired state is built from

use crate::{CoreError, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use std::path::Path;
use tracing::info;

const DEPLOYMENT_YAML: &str = include_str!("../manifests/deployment.yaml");
const SERVICE_YAML: &str = include_str!("../manifests/service.yaml");

/// Parsed and validated baseline manifests
#[derive(Clone, Debug)]
pub struct ManifestTemplates {
    pub deployment: Deployment,
    pub service: Service,
}

impl ManifestTemplates {
    /// Templates compiled into the binary
    pub fn embedded() -> Result<Self> {
        Self::from_yaml(DEPLOYMENT_YAML, SERVICE_YAML)
    }

    /// Load `deployment.yaml` and `service.yaml` from a directory
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let deployment = std::fs::read_to_string(dir.join("deployment.yaml"))?;
        let service = std::fs::read_to_string(dir.join("service.yaml"))?;
        info!("Loaded manifest templates from {}", dir.display());
        Self::from_yaml(&deployment, &service)
    }

    pub fn from_yaml(deployment: &str, service: &str) -> Result<Self> {
        let templates = Self {
            deployment: serde_yaml::from_str(deployment)?,
            service: serde_yaml::from_str(service)?,
        };
        templates.validate()?;
        Ok(templates)
    }

    /// Check the fields the builder overlays are present
    pub fn validate(&self) -> Result<()> {
        let spec = self
            .deployment
            .spec
            .as_ref()
            .ok_or_else(|| CoreError::InvalidTemplate("deployment has no spec".to_string()))?;
        let pod = spec.template.spec.as_ref().ok_or_else(|| {
            CoreError::InvalidTemplate("deployment has no spec.template.spec".to_string())
        })?;
        if pod.containers.is_empty() {
            return Err(CoreError::InvalidTemplate(
                "deployment pod template has no containers".to_string(),
            ));
        }
        if self.service.spec.is_none() {
            return Err(CoreError::InvalidTemplate("service has no spec".to_string()));
        }
        Ok(())
    }
}
