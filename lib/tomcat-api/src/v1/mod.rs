/// API version v1 for Tomcat operator CRDs

pub mod tomcat;

pub use tomcat::{Tomcat, TomcatSpec, TomcatStatus};

/// API group for Tomcat operator resources
pub const API_GROUP: &str = "tomcatoperator.io";
/// API version for Tomcat operator resources
pub const API_VERSION: &str = "v1";
/// Finalizer that holds a Tomcat until its managed resources are removed
pub const FINALIZER: &str = "tomcatoperator.io/finalizer";
