//! Keelson Core - resource model and release records
//!
//! This crate holds the cluster-independent types of the deploy engine:
//! - `ResourceId` / `Resource`: identity and annotation-derived attributes of cluster objects
//! - `annotations`: the typed annotation registry
//! - `Release`: release revisions and their status lifecycle

pub mod annotations;
pub mod error;
pub mod release;
pub mod resource;

pub use annotations::{
    Annotation, DeletePolicy, ExternalDependency, FailMode, HookType, TrackTerminationMode,
    parse_annotations, parse_duration,
};
pub use error::{CoreError, Result};
pub use release::{DeployType, Release, ReleaseStatus, storage_key, validate_release_name};
pub use resource::{
    DesiredResources, Origin, Resource, ResourceAttrs, ResourceClass, ResourceId,
    normalized_object,
};
