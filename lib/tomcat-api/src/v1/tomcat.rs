use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Tomcat describes a set of identical Tomcat servers and the Service
/// that routes to them
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "tomcatoperator.io",
    version = "v1",
    kind = "Tomcat",
    plural = "tomcats",
    namespaced,
    derive = "Default",
    derive = "PartialEq",
    status = "TomcatStatus",
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyReplicas"}"#,
)]
pub struct TomcatSpec {
    /// Tomcat image tag, e.g. "9.0"
    pub version: String,

    /// Number of Tomcat pods to run
    #[serde(default)]
    pub replicas: u32,
}

/// Status of a Tomcat
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TomcatStatus {
    /// Pods of the managed Deployment that report ready
    #[serde(default)]
    pub ready_replicas: u32,
}

impl TomcatStatus {
    pub fn with_ready_replicas(ready_replicas: u32) -> Self {
        Self { ready_replicas }
    }
}
