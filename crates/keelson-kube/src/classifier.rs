//! Desired vs live classification
//!
//! Every desired resource is compared with the cluster through a server-side dry-run
//! apply. Nothing here mutates the cluster.

use futures::{StreamExt, TryStreamExt, stream};
use keelson_core::{DesiredResources, Origin, Release, Resource, ResourceClass, normalized_object};
use serde::Serialize;
use std::collections::HashSet;
use tracing::instrument;

use crate::client::ClusterClient;
use crate::config::DeployContext;
use crate::error::{KubeError, Result};

/// How a desired resource relates to its live counterpart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceStatus {
    NonExisting,
    Outdated,
    /// Changed in a way that needs delete and recreate
    OutdatedImmutable,
    UpToDate,
    /// The cluster does not serve the type
    Unsupported,
}

/// A desired resource with what the cluster said about it
#[derive(Debug, Clone, Serialize)]
pub struct ClassifiedResource {
    pub local: Resource,
    /// Current object, when it exists
    pub live: Option<Resource>,
    /// Result of the dry-run apply, for outdated resources
    pub desired: Option<Resource>,
    pub status: ResourceStatus,
}

impl ClassifiedResource {
    pub fn exists(&self) -> bool {
        self.live.is_some()
    }

    /// UID of the live object
    pub fn live_uid(&self) -> Option<&str> {
        self.live.as_ref().and_then(|r| r.uid())
    }
}

pub type Classification = Vec<ClassifiedResource>;

/// Classification of everything one deploy touches
#[derive(Debug, Clone, Serialize)]
pub struct DeployClassification {
    pub namespace: ClassifiedResource,
    pub crds: Classification,
    pub hooks: Classification,
    pub general: Classification,
    /// Live resources of the previous release no longer desired
    pub orphans: Vec<Resource>,
}

impl DeployClassification {
    /// Every classified resource except the namespace
    pub fn resources(&self) -> impl Iterator<Item = &ClassifiedResource> {
        self.crds
            .iter()
            .chain(self.hooks.iter())
            .chain(self.general.iter())
    }
}

/// Classifies desired resources against the cluster
pub struct Classifier<'a, C: ?Sized> {
    client: &'a C,
    ctx: &'a DeployContext,
}

impl<'a, C: ClusterClient + ?Sized> Classifier<'a, C> {
    pub fn new(client: &'a C, ctx: &'a DeployContext) -> Self {
        Self { client, ctx }
    }

    /// Classify one resource
    ///
    /// With `allow_unsupported`, a type the cluster does not serve yields
    /// [`ResourceStatus::Unsupported`] instead of an error.
    pub async fn classify(
        &self,
        resource: &Resource,
        allow_unsupported: bool,
    ) -> Result<ClassifiedResource> {
        let unsupported = || ClassifiedResource {
            local: resource.clone(),
            live: None,
            desired: None,
            status: ResourceStatus::Unsupported,
        };

        let live = match self.client.get(&resource.id).await {
            Ok(Some(obj)) => resource.with_live_object(obj),
            Ok(None) => {
                return Ok(ClassifiedResource {
                    local: resource.clone(),
                    live: None,
                    desired: None,
                    status: ResourceStatus::NonExisting,
                });
            }
            Err(KubeError::UnsupportedResource { .. }) if allow_unsupported => {
                return Ok(unsupported());
            }
            Err(e) => return Err(e.in_operation(format!("get {}", resource.id))),
        };

        let (desired, status) = match self.client.apply(&resource.id, &resource.object, true).await {
            Ok(obj) => {
                let status = if normalized_object(&obj) == normalized_object(&live.object) {
                    ResourceStatus::UpToDate
                } else {
                    ResourceStatus::Outdated
                };
                (Some(resource.with_live_object(obj)), status)
            }
            Err(KubeError::ImmutableFieldConflict { message, .. }) => {
                tracing::debug!(resource = %resource.id, %message, "immutable field changed");
                (None, ResourceStatus::OutdatedImmutable)
            }
            Err(KubeError::UnsupportedResource { .. }) if allow_unsupported => {
                return Ok(unsupported());
            }
            Err(e) => return Err(e.in_operation(format!("dry-run apply {}", resource.id))),
        };

        tracing::debug!(resource = %resource.id, ?status, "classified");
        Ok(ClassifiedResource {
            local: resource.clone(),
            live: Some(live),
            desired,
            status,
        })
    }

    /// Classify many resources, at most `network_parallelism` at a time, keeping order
    pub async fn classify_all(
        &self,
        resources: &[Resource],
        allow_unsupported: bool,
    ) -> Result<Classification> {
        stream::iter(resources)
            .map(|r| self.classify(r, allow_unsupported))
            .buffered(self.ctx.config.network_parallelism.max(1))
            .try_collect()
            .await
    }

    /// Classify a whole deploy and find orphans of the previous release
    #[instrument(skip_all, fields(namespace = %namespace.id.name))]
    pub async fn classify_deploy(
        &self,
        namespace: &Resource,
        desired: &DesiredResources,
        previous: Option<&Release>,
    ) -> Result<DeployClassification> {
        let namespace_class = self.classify(namespace, false).await?;
        let crds = self.classify_all(&desired.crds, false).await?;
        let hooks = self.classify_all(&desired.hooks, true).await?;
        let general = self.classify_all(&desired.general, true).await?;

        let mut classification = DeployClassification {
            namespace: namespace_class,
            crds,
            hooks,
            general,
            orphans: Vec::new(),
        };
        if let Some(previous) = previous {
            classification.orphans = self
                .find_orphans(previous, &classification, &namespace.id.name)
                .await?;
        }

        tracing::info!(
            crds = classification.crds.len(),
            hooks = classification.hooks.len(),
            general = classification.general.len(),
            orphans = classification.orphans.len(),
            "classification complete"
        );
        Ok(classification)
    }

    /// Previous general resources that are not desired any more and still live
    ///
    /// A live object sharing its UID with a desired resource is the same object under
    /// another manifest and is not an orphan.
    async fn find_orphans(
        &self,
        previous: &Release,
        classification: &DeployClassification,
        default_namespace: &str,
    ) -> Result<Vec<Resource>> {
        let desired_ids: HashSet<_> = classification.resources().map(|c| &c.local.id).collect();
        let live_uids: HashSet<&str> = classification
            .resources()
            .filter_map(|c| c.live_uid())
            .collect();

        let mut candidates = Vec::new();
        for object in &previous.general_resources {
            let resource = Resource::from_object(
                object.clone(),
                ResourceClass::General,
                Origin::Local,
                default_namespace,
            )?;
            if !desired_ids.contains(&resource.id) {
                candidates.push(resource);
            }
        }

        let lookups = stream::iter(candidates)
            .map(|resource| async move {
                match self.client.get(&resource.id).await {
                    Ok(live) => Ok(live.map(|obj| resource.with_live_object(obj))),
                    Err(KubeError::UnsupportedResource { .. }) => {
                        tracing::warn!(resource = %resource.id, "orphan type no longer served, leaving it");
                        Ok(None)
                    }
                    Err(e) => Err(e.in_operation(format!("get {}", resource.id))),
                }
            })
            .buffered(self.ctx.config.network_parallelism.max(1))
            .try_collect::<Vec<_>>()
            .await?;

        Ok(lookups
            .into_iter()
            .flatten()
            .filter(|live| live.uid().is_none_or(|uid| !live_uids.contains(uid)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::FakeCluster;
    use keelson_core::DeployType;

    fn config_map(name: &str, value: &str) -> Resource {
        let yaml = format!(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {}\ndata:\n  key: {}\n",
            name, value
        );
        Resource::from_yaml(&yaml, ResourceClass::General, "prod").unwrap()
    }

    fn widget(name: &str) -> Resource {
        let yaml = format!(
            "apiVersion: example.com/v1\nkind: Widget\nmetadata:\n  name: {}\nspec: {{}}\n",
            name
        );
        Resource::from_yaml(&yaml, ResourceClass::General, "prod").unwrap()
    }

    #[tokio::test]
    async fn test_five_way_classification() {
        let cluster = FakeCluster::new();
        let ctx = DeployContext::default();

        let same = config_map("same", "v");
        let changed = config_map("changed", "new");
        let frozen = config_map("frozen", "new");
        let missing = config_map("missing", "v");
        let unknown = widget("w");

        cluster.insert(&same.id, same.object.clone());
        cluster.insert(&changed.id, config_map("changed", "old").object);
        cluster.insert(&frozen.id, config_map("frozen", "old").object);
        cluster.mark_immutable(&frozen.id);
        cluster.mark_unsupported("example.com", "Widget");

        let classifier = Classifier::new(&cluster, &ctx);
        let result = classifier
            .classify_all(
                &[same, changed, frozen, missing, unknown],
                true,
            )
            .await
            .unwrap();

        let statuses: Vec<ResourceStatus> = result.iter().map(|c| c.status).collect();
        assert_eq!(
            statuses,
            vec![
                ResourceStatus::UpToDate,
                ResourceStatus::Outdated,
                ResourceStatus::OutdatedImmutable,
                ResourceStatus::NonExisting,
                ResourceStatus::Unsupported,
            ]
        );
        assert!(result[1].desired.is_some());
        assert!(result[1].live.is_some());
        assert!(cluster.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_crd_is_an_error() {
        let cluster = FakeCluster::new();
        cluster.mark_unsupported("example.com", "Widget");
        let ctx = DeployContext::default();
        let classifier = Classifier::new(&cluster, &ctx);

        let err = classifier.classify(&widget("w"), false).await.unwrap_err();
        assert!(matches!(err, KubeError::Operation { .. }));
    }

    #[tokio::test]
    async fn test_orphans_exclude_shared_uid() {
        let cluster = FakeCluster::new();
        let ctx = DeployContext::default();

        let gone = config_map("gone", "v");
        let renamed_old = config_map("old-name", "v");
        let renamed_new = config_map("new-name", "v");
        let kept = config_map("kept", "v");
        cluster.insert(&gone.id, gone.object.clone());
        cluster.insert_with_uid(&renamed_old.id, renamed_old.object.clone(), "shared");
        cluster.insert_with_uid(&renamed_new.id, renamed_new.object.clone(), "shared");
        cluster.insert(&kept.id, kept.object.clone());

        let mut previous = Release::pending("web", "prod", 1, DeployType::Initial, None);
        previous.general_resources = vec![
            gone.object.clone(),
            renamed_old.object.clone(),
            kept.object.clone(),
            config_map("already-deleted", "v").object,
        ];

        let desired = DesiredResources {
            general: vec![renamed_new, kept],
            ..Default::default()
        };
        let namespace = Resource::release_namespace("prod").unwrap();
        let classification = Classifier::new(&cluster, &ctx)
            .classify_deploy(&namespace, &desired, Some(&previous))
            .await
            .unwrap();

        let orphans: Vec<String> = classification
            .orphans
            .iter()
            .map(|r| r.id.to_string())
            .collect();
        assert_eq!(orphans, vec!["prod/ConfigMap/gone"]);
        assert_eq!(classification.namespace.status, ResourceStatus::NonExisting);
    }
}
