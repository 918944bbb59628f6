//! Error types for keelson-kube

use thiserror::Error;

use crate::plan::Report;

/// Result type for keelson-kube operations
pub type Result<T> = std::result::Result<T, KubeError>;

/// Errors that can occur while planning or executing a deploy
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KubeError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    /// Invalid manifest, annotation or release name
    #[error("validation failed: {0}")]
    Validation(#[from] keelson_core::CoreError),

    /// Create refused because the object already exists
    #[error("{resource} already exists")]
    AlreadyExists { resource: String },

    #[error("{resource} not found")]
    NotFound { resource: String },

    /// Server refused an in-place change of an immutable field
    #[error("cannot modify immutable field in {resource}: {message}")]
    ImmutableFieldConflict { resource: String, message: String },

    /// The cluster does not serve the resource's type
    #[error("unsupported resource type {api_version}/{kind} for {resource}")]
    UnsupportedResource {
        resource: String,
        api_version: String,
        kind: String,
    },

    /// Plan build aborted because resources need a delete and recreate
    #[error(
        "immutable fields changed in {} resource(s): {}\nHint: delete and recreate them manually, or set keelson.io/delete-policy: before-creation",
        resources.len(),
        resources.join(", ")
    )]
    ImmutableConflicts { resources: Vec<String> },

    /// Several targets of one operation failed
    #[error("{0}")]
    Multiple(MultiError),

    /// Readiness or absence tracking failed for at least one target
    #[error("tracking failed: {}", failures.join("; "))]
    TrackingFailed { failures: Vec<String> },

    #[error("operation timed out after {0}")]
    Timeout(String),

    /// Lease on the release lock was lost mid-deploy
    #[error("lock '{lock}' lost, aborting to avoid concurrent writers")]
    LockLost { lock: String },

    #[error("could not acquire lock '{lock}' after {attempts} attempt(s)")]
    LockAcquire { lock: String, attempts: u32 },

    #[error("release '{name}' not found in namespace '{namespace}'")]
    ReleaseNotFound { name: String, namespace: String },

    #[error("release '{name}' has no revision to roll back to{}", revision.map(|r| format!(" (revision {r} not found)")).unwrap_or_default())]
    NoRollbackTarget { name: String, revision: Option<u32> },

    #[error("release '{name}' revision {revision} already exists in namespace '{namespace}'")]
    ReleaseAlreadyExists {
        name: String,
        namespace: String,
        revision: u32,
    },

    /// Storage error
    #[error("storage error: {0}")]
    Storage(String),

    /// Release data too large
    #[error("release data too large ({size} bytes, max {max} bytes)")]
    ReleaseTooLarge { size: usize, max: usize },

    /// Cluster was mutated but the terminal release record could not be written
    #[error(
        "release '{name}' revision {revision} could not be marked {status}, record is left pending: {source}\nHint: inspect the release history before the next deploy"
    )]
    ReleaseRecordStuck {
        name: String,
        revision: u32,
        status: String,
        #[source]
        source: Box<KubeError>,
    },

    /// Failure of one plan operation
    #[error("{operation}: {source}")]
    Operation {
        operation: String,
        #[source]
        source: Box<KubeError>,
    },

    /// The deploy failed after reaching the cluster; carries what did complete
    #[error("deploy of release '{name}' revision {revision} failed: {source}")]
    DeployFailed {
        name: String,
        revision: u32,
        #[source]
        source: Box<KubeError>,
        report: Box<Report>,
    },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Compression error
    #[error("compression error: {0}")]
    Compression(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for KubeError {
    fn from(e: serde_json::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for KubeError {
    fn from(e: serde_yaml::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl KubeError {
    /// Check if this is a Kubernetes 404 Not Found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, KubeError::NotFound { .. })
            || matches!(self, KubeError::Api(kube::Error::Api(resp)) if resp.code == 404)
    }

    /// Check if this is a conflict error (409)
    pub fn is_conflict(&self) -> bool {
        matches!(self, KubeError::Api(kube::Error::Api(resp)) if resp.code == 409)
    }

    /// Wrap with the plan operation that produced it
    pub fn in_operation(self, operation: impl Into<String>) -> Self {
        KubeError::Operation {
            operation: operation.into(),
            source: Box::new(self),
        }
    }

    /// Whether the deploy must stop without running the failure plan
    pub fn is_lock_lost(&self) -> bool {
        match self {
            KubeError::LockLost { .. } => true,
            KubeError::Operation { source, .. } | KubeError::DeployFailed { source, .. } => {
                source.is_lock_lost()
            }
            _ => false,
        }
    }

    /// Whether a terminal release record write failed after the cluster was mutated
    pub fn is_record_stuck(&self) -> bool {
        match self {
            KubeError::ReleaseRecordStuck { .. } => true,
            KubeError::Operation { source, .. } | KubeError::DeployFailed { source, .. } => {
                source.is_record_stuck()
            }
            _ => false,
        }
    }

    /// Report of a failed deploy, if this error carries one
    pub fn report(&self) -> Option<&Report> {
        match self {
            KubeError::DeployFailed { report, .. } => Some(report),
            _ => None,
        }
    }
}

/// Errors collected from the targets of a single operation
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<(String, KubeError)>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, target: impl Into<String>, error: KubeError) {
        self.errors.push((target.into(), error));
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> impl Iterator<Item = (&str, &KubeError)> {
        self.errors.iter().map(|(t, e)| (t.as_str(), e))
    }

    /// `Ok` when nothing was collected, the lone error when there is one
    pub fn into_result(mut self) -> Result<()> {
        match self.errors.len() {
            0 => Ok(()),
            1 => {
                let (target, error) = self.errors.remove(0);
                Err(error.in_operation(target))
            }
            _ => Err(KubeError::Multiple(self)),
        }
    }
}

impl std::fmt::Display for MultiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} errors occurred:", self.errors.len())?;
        for (target, error) in &self.errors {
            write!(f, "\n  * {}: {}", target, error)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}
