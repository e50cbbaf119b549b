//! Reconciliation core of the Tomcat operator
//!
//! This library provides:
//! - Desired Deployment/Service derivation from a Tomcat
//! - Create-or-update and cleanup of the managed resources
//! - Secondary watch on managed Deployments
//! - Status write-back and the per-Tomcat reconcile engine

pub mod backoff;
pub mod cluster;
pub mod config;
pub mod desired;
pub mod engine;
pub mod error;
pub mod key;
pub mod queue;
pub mod reconciler;
pub mod status;
pub mod templates;
pub mod trigger;
pub mod watch;

#[cfg(test)]
pub(crate) mod testing;

pub use backoff::ExponentialBackoff;
pub use cluster::{ClusterClient, FinalizerChange, KubeCluster, ResourceEvent};
pub use config::{LogFormat, OperatorConfig};
pub use desired::{DesiredState, DesiredStateBuilder};
pub use engine::{EngineConfig, ReconcileEngine, ReconcileOutcome};
pub use error::{CoreError, ErrorClass, Result};
pub use key::{ManagedKind, ManagedResource, ObjectKey};
pub use queue::KeyPhase;
pub use reconciler::ResourceReconciler;
pub use status::StatusSynchronizer;
pub use templates::ManifestTemplates;
pub use trigger::{Trigger, TriggerClosed, TriggerSender, TriggerSource};
pub use watch::{ChangeKind, SecondaryWatchBridge};
