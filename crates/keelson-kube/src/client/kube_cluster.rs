//! kube-rs backed cluster client
//!
//! Resolves every reference through a cached [`Discovery`] so that objects of any type,
//! including freshly installed CRDs, are handled as `DynamicObject`s.

use async_trait::async_trait;
use keelson_core::ResourceId;
use kube::{
    Client,
    api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams, PropagationPolicy},
    core::GroupVersionKind,
    discovery::{ApiCapabilities, ApiResource, Discovery, Scope},
};
use tokio::sync::RwLock;

use super::{ApiType, ClusterClient};
use crate::error::{KubeError, Result};

/// Cluster client talking to a real API server
pub struct KubeCluster {
    client: Client,
    discovery: RwLock<Discovery>,
    field_manager: String,
}

impl KubeCluster {
    /// Connect using the default kubeconfig / in-cluster config
    pub async fn new(field_manager: impl Into<String>) -> Result<Self> {
        let client = Client::try_default().await?;
        Self::with_client(client, field_manager).await
    }

    /// Create with an existing client
    pub async fn with_client(client: Client, field_manager: impl Into<String>) -> Result<Self> {
        let discovery = Discovery::new(client.clone()).run().await?;
        Ok(Self {
            client,
            discovery: RwLock::new(discovery),
            field_manager: field_manager.into(),
        })
    }

    /// Underlying kube client, shared with storage drivers and lockers
    pub fn kube_client(&self) -> Client {
        self.client.clone()
    }

    async fn resolve(&self, id: &ResourceId) -> Result<(ApiResource, ApiCapabilities)> {
        let gvk = GroupVersionKind::gvk(&id.group, &id.version, &id.kind);
        self.discovery
            .read()
            .await
            .resolve_gvk(&gvk)
            .ok_or_else(|| KubeError::UnsupportedResource {
                resource: id.to_string(),
                api_version: id.api_version(),
                kind: id.kind.clone(),
            })
    }

    async fn api(&self, id: &ResourceId) -> Result<Api<DynamicObject>> {
        let (resource, capabilities) = self.resolve(id).await?;
        Ok(match (&capabilities.scope, &id.namespace) {
            (Scope::Namespaced, Some(ns)) => {
                Api::namespaced_with(self.client.clone(), ns, &resource)
            }
            (Scope::Namespaced, None) => Api::default_namespaced_with(self.client.clone(), &resource),
            (Scope::Cluster, _) => Api::all_with(self.client.clone(), &resource),
        })
    }
}

/// Translate API errors into the distinct cases the engine branches on
fn classify_error(id: &ResourceId, err: kube::Error) -> KubeError {
    match &err {
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            KubeError::AlreadyExists {
                resource: id.to_string(),
            }
        }
        kube::Error::Api(resp) if resp.code == 404 => KubeError::NotFound {
            resource: id.to_string(),
        },
        kube::Error::Api(resp) if resp.code == 422 && is_immutable_message(&resp.message) => {
            KubeError::ImmutableFieldConflict {
                resource: id.to_string(),
                message: resp.message.clone(),
            }
        }
        _ => KubeError::Api(err),
    }
}

fn is_immutable_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("field is immutable")
        || message.contains("immutable field")
        || message.contains("may not change once set")
        || message.contains("updates to statefulset spec for fields other than")
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get(&self, id: &ResourceId) -> Result<Option<DynamicObject>> {
        let api = self.api(id).await?;
        api.get_opt(&id.name)
            .await
            .map_err(|e| classify_error(id, e))
    }

    async fn create(&self, id: &ResourceId, object: &DynamicObject) -> Result<DynamicObject> {
        let api = self.api(id).await?;
        let params = PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };
        api.create(&params, object)
            .await
            .map_err(|e| classify_error(id, e))
    }

    async fn apply(
        &self,
        id: &ResourceId,
        object: &DynamicObject,
        dry_run: bool,
    ) -> Result<DynamicObject> {
        let api = self.api(id).await?;

        let mut params = PatchParams::apply(&self.field_manager);
        params.force = true; // Take ownership of fields
        params.dry_run = dry_run;

        api.patch(&id.name, &params, &Patch::Apply(object))
            .await
            .map_err(|e| classify_error(id, e))
    }

    async fn delete(&self, id: &ResourceId) -> Result<()> {
        let api = self.api(id).await?;
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Foreground),
            ..Default::default()
        };

        match api.delete(&id.name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(classify_error(id, e)),
        }
    }

    async fn refresh_discovery(&self) -> Result<()> {
        let discovery = Discovery::new(self.client.clone()).run().await?;
        *self.discovery.write().await = discovery;
        tracing::debug!("discovery cache refreshed");
        Ok(())
    }

    async fn resolve_type(&self, group: &str, version: &str, kind: &str) -> Result<ApiType> {
        let discovery = self.discovery.read().await;

        for api_group in discovery.groups() {
            if !group.is_empty() && api_group.name() != group {
                continue;
            }
            let candidates = if version.is_empty() {
                api_group.recommended_resources()
            } else {
                api_group.versioned_resources(version)
            };
            if let Some((resource, _)) = candidates
                .into_iter()
                .find(|(ar, _)| ar.kind.eq_ignore_ascii_case(kind))
            {
                return Ok(ApiType {
                    group: resource.group,
                    version: resource.version,
                    kind: resource.kind,
                });
            }
        }

        Err(KubeError::UnsupportedResource {
            resource: kind.to_string(),
            api_version: if group.is_empty() {
                version.to_string()
            } else {
                format!("{}/{}", group, version)
            },
            kind: kind.to_string(),
        })
    }
}
