//! Core error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid annotation {key}={value:?}: {reason}")]
    InvalidAnnotation {
        key: String,
        value: String,
        reason: String,
    },

    #[error("invalid resource {resource}: {source}")]
    InvalidResource {
        resource: String,
        #[source]
        source: Box<CoreError>,
    },

    #[error("invalid manifest (document {index}): {message}")]
    InvalidManifest { index: usize, message: String },

    #[error("invalid release name '{name}': {reason}")]
    InvalidReleaseName { name: String, reason: String },

    #[error("release revision {revision} cannot go from {from} to {to}")]
    IllegalTransition {
        revision: u32,
        from: String,
        to: String,
    },

    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl CoreError {
    /// Attach the offending resource to a validation error
    pub fn for_resource(self, resource: impl std::fmt::Display) -> Self {
        CoreError::InvalidResource {
            resource: resource.to_string(),
            source: Box::new(self),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
