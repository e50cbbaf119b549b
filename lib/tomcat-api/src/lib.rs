//! Tomcat operator API types and CRDs for Kubernetes integration
//!
//! This library defines the custom resource reconciled by the operator:
//! - Tomcat: a scalable Tomcat deployment fronted by a Service

pub mod v1;

pub use v1::{Tomcat, TomcatSpec, TomcatStatus, API_GROUP, API_VERSION, FINALIZER};
