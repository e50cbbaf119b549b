//! Object identity shared by a Tomcat and the resources it owns

use crate::{CoreError, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use std::fmt;

/// Namespace and name of a namespaced object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a namespaced object; fails if name or namespace is unset
    pub fn of<K: ResourceExt>(obj: &K) -> Result<Self> {
        let name = obj
            .meta()
            .name
            .clone()
            .ok_or(CoreError::MissingObjectKey(".metadata.name"))?;
        let namespace = obj
            .namespace()
            .ok_or(CoreError::MissingObjectKey(".metadata.namespace"))?;
        Ok(Self { namespace, name })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The two resource kinds a Tomcat owns
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ManagedKind {
    Workload,
    Service,
}

impl ManagedKind {
    pub const ALL: [ManagedKind; 2] = [ManagedKind::Workload, ManagedKind::Service];
}

impl fmt::Display for ManagedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagedKind::Workload => write!(f, "Deployment"),
            ManagedKind::Service => write!(f, "Service"),
        }
    }
}

/// A live or desired managed resource
#[derive(Clone, Debug, PartialEq)]
pub enum ManagedResource {
    Workload(Deployment),
    Service(Service),
}

impl ManagedResource {
    pub fn kind(&self) -> ManagedKind {
        match self {
            ManagedResource::Workload(_) => ManagedKind::Workload,
            ManagedResource::Service(_) => ManagedKind::Service,
        }
    }

    pub fn key(&self) -> Result<ObjectKey> {
        match self {
            ManagedResource::Workload(d) => ObjectKey::of(d),
            ManagedResource::Service(s) => ObjectKey::of(s),
        }
    }

    pub fn into_workload(self) -> Option<Deployment> {
        match self {
            ManagedResource::Workload(d) => Some(d),
            ManagedResource::Service(_) => None,
        }
    }

    pub fn into_service(self) -> Option<Service> {
        match self {
            ManagedResource::Service(s) => Some(s),
            ManagedResource::Workload(_) => None,
        }
    }
}
