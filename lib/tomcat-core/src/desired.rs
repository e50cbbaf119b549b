//! Desired Deployment and Service for a Tomcat

use crate::{CoreError, ManifestTemplates, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use tomcat_api::Tomcat;

/// Label shared by pod template, Deployment selector and Service selector
pub const APP_LABEL: &str = "app";
/// Label marking resources this operator owns; the workload watch selects on it
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "tomcat-operator";
/// Label naming the Tomcat a resource was created for
pub const CREATED_BY_LABEL: &str = "created-by";

/// Selector scoping the workload watch to operator-owned Deployments
pub fn managed_selector() -> String {
    format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE)
}

/// Target manifests for one Tomcat
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredState {
    pub workload: Deployment,
    pub service: Service,
}

/// Builds [`DesiredState`] from a Tomcat and the baseline templates
#[derive(Clone, Debug)]
pub struct DesiredStateBuilder {
    templates: ManifestTemplates,
    base_image: String,
}

impl DesiredStateBuilder {
    pub fn new(templates: ManifestTemplates, base_image: impl Into<String>) -> Self {
        Self {
            templates,
            base_image: base_image.into(),
        }
    }

    pub fn build(&self, tomcat: &Tomcat) -> Result<DesiredState> {
        let name = tomcat
            .meta()
            .name
            .clone()
            .ok_or(CoreError::MissingObjectKey(".metadata.name"))?;
        let namespace = tomcat
            .namespace()
            .ok_or(CoreError::MissingObjectKey(".metadata.namespace"))?;
        if tomcat.spec.version.trim().is_empty() {
            return Err(CoreError::InvalidSpec(format!(
                "Tomcat {}/{} has an empty version",
                namespace, name
            )));
        }
        let replicas = i32::try_from(tomcat.spec.replicas).map_err(|_| {
            CoreError::InvalidSpec(format!(
                "Tomcat {}/{} asks for {} replicas",
                namespace, name, tomcat.spec.replicas
            ))
        })?;
        let owner = tomcat.controller_owner_ref(&()).into_iter().collect::<Vec<_>>();
        let selector = app_labels(&name);
        let image = format!("{}:{}", self.base_image, tomcat.spec.version);

        let mut workload = self.templates.deployment.clone();
        workload.metadata.name = Some(name.clone());
        workload.metadata.namespace = Some(namespace.clone());
        workload.metadata.owner_references = Some(owner.clone());
        workload
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(owned_labels(&name));
        let spec = workload
            .spec
            .as_mut()
            .ok_or_else(|| CoreError::InvalidTemplate("deployment has no spec".to_string()))?;
        spec.replicas = Some(replicas);
        spec.selector
            .match_labels
            .get_or_insert_with(BTreeMap::new)
            .extend(selector.clone());
        spec.template
            .metadata
            .get_or_insert_with(Default::default)
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(selector);
        let container = spec
            .template
            .spec
            .as_mut()
            .and_then(|pod| pod.containers.first_mut())
            .ok_or_else(|| {
                CoreError::InvalidTemplate("deployment pod template has no containers".to_string())
            })?;
        container.image = Some(image);

        let mut service = self.templates.service.clone();
        service.metadata.name = Some(name.clone());
        service.metadata.namespace = Some(namespace);
        service.metadata.owner_references = Some(owner);
        service
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(owned_labels(&name));
        if service.spec.is_none() {
            return Err(CoreError::InvalidTemplate("service has no spec".to_string()));
        }
        select_pods(&mut service, &workload);

        Ok(DesiredState { workload, service })
    }
}

fn app_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL.to_string(), name.to_string())])
}

fn owned_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        (CREATED_BY_LABEL.to_string(), name.to_string()),
    ])
}

/// Pod template labels of a Deployment
pub fn template_labels(workload: &Deployment) -> BTreeMap<String, String> {
    workload
        .spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.labels.clone())
        .unwrap_or_default()
}

/// Point a Service at exactly the pod template labels of a Deployment.
///
/// Called again with the applied Deployment, since the live pod template
/// may carry labels beyond the ones this operator sets.
pub fn select_pods(service: &mut Service, workload: &Deployment) {
    if let Some(spec) = service.spec.as_mut() {
        spec.selector = Some(template_labels(workload));
    }
}

/// Selector of a Service
pub fn service_selector(service: &Service) -> BTreeMap<String, String> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.selector.clone())
        .unwrap_or_default()
}
