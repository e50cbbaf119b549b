use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid manifest template: {0}")]
    InvalidTemplate(String),

    #[error("Invalid Tomcat spec: {0}")]
    InvalidSpec(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("{0} is controlled by another owner")]
    ForeignOwner(String),

    #[error("Conflicting write to {0}")]
    Conflict(String),

    #[error("Kubernetes error: {0}")]
    KubernetesError(#[from] kube::Error),

    #[error("Watch error: {0}")]
    WatchError(#[from] kube_runtime::watcher::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Manifest parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// How the engine treats a failed attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network, throttling or server side failures; retried with backoff
    Transient,
    /// A broken template or spec; retried with backoff but logged loudly
    Configuration,
    /// The live object moved underneath us; retried after a fresh read
    StaleWrite,
}

impl CoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CoreError::Conflict(_) => ErrorClass::StaleWrite,
            CoreError::KubernetesError(kube::Error::Api(resp)) if resp.code == 409 => {
                ErrorClass::StaleWrite
            }
            CoreError::InvalidTemplate(_)
            | CoreError::InvalidSpec(_)
            | CoreError::InvalidConfiguration(_)
            | CoreError::MissingObjectKey(_)
            | CoreError::ForeignOwner(_)
            | CoreError::YamlError(_) => ErrorClass::Configuration,
            _ => ErrorClass::Transient,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.class() == ErrorClass::StaleWrite
    }
}
