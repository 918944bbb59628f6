//! Cluster client capability
//!
//! Everything the engine does to the cluster goes through [`ClusterClient`]:
//! - [`KubeCluster`]: kube-rs client with cached discovery and Server-Side Apply
//! - [`FakeCluster`]: in-memory cluster for tests, with failure injection

mod fake;
mod kube_cluster;

pub use fake::{FakeCluster, Mutation};
pub use kube_cluster::KubeCluster;

use async_trait::async_trait;
use keelson_core::{ExternalDependency, ResourceId};
use kube::api::DynamicObject;

use crate::error::Result;

/// Operations the engine needs from a cluster
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch the live object, `None` if it does not exist
    async fn get(&self, id: &ResourceId) -> Result<Option<DynamicObject>>;

    /// Create the object, failing with `KubeError::AlreadyExists` if it is present
    async fn create(&self, id: &ResourceId, object: &DynamicObject) -> Result<DynamicObject>;

    /// Server-Side Apply, returning the resulting object
    ///
    /// An in-place change of an immutable field fails with
    /// `KubeError::ImmutableFieldConflict`.
    async fn apply(
        &self,
        id: &ResourceId,
        object: &DynamicObject,
        dry_run: bool,
    ) -> Result<DynamicObject>;

    /// Delete the object; deleting an absent object succeeds
    async fn delete(&self, id: &ResourceId) -> Result<()>;

    /// Reload served types, needed after CRDs are installed
    async fn refresh_discovery(&self) -> Result<()>;

    /// Canonical type for a partial, case-insensitive `(group, version, kind)`
    ///
    /// Empty `group` or `version` match any; the preferred version wins.
    async fn resolve_type(&self, group: &str, version: &str, kind: &str) -> Result<ApiType>;
}

/// A served resource type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiType {
    pub group: String,
    pub version: String,
    pub kind: String,
}

/// Resolve an external dependency to a concrete reference
pub async fn resolve_dependency<C: ClusterClient + ?Sized>(
    client: &C,
    dependency: &ExternalDependency,
    default_namespace: &str,
) -> Result<ResourceId> {
    let api_type = client
        .resolve_type(&dependency.group, &dependency.version, &dependency.kind)
        .await?;
    let namespace = if keelson_core::resource::is_cluster_scoped(&api_type.kind) {
        None
    } else {
        Some(
            dependency
                .namespace
                .as_deref()
                .unwrap_or(default_namespace),
        )
    };
    Ok(ResourceId::new(
        &dependency.name,
        namespace,
        api_type.group,
        api_type.version,
        api_type.kind,
    ))
}
