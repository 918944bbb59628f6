//! Resource model
//!
//! A [`Resource`] is a cluster object together with its identity and the attributes
//! derived from its annotations. General resources, hooks, unmanaged resources and
//! standalone CRDs share one struct and are told apart by [`ResourceClass`]; the
//! annotation-derived [`ResourceAttrs`] are computed once when the resource is built.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use kube::core::TypeMeta;
use serde::{Deserialize, Serialize};

use crate::annotations::{
    self, Annotation, DeletePolicy, ExternalDependency, FailMode, HookType, TrackTerminationMode,
};
use crate::error::{CoreError, Result};

const CRD_KIND: &str = "CustomResourceDefinition";
const CRD_GROUP: &str = "apiextensions.k8s.io";

/// Kinds that are never namespaced
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "APIService",
    "CSIDriver",
    "CSINode",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "IngressClass",
    "MutatingWebhookConfiguration",
    "Namespace",
    "Node",
    "PersistentVolume",
    "PriorityClass",
    "RuntimeClass",
    "StorageClass",
    "ValidatingAdmissionPolicy",
    "ValidatingAdmissionPolicyBinding",
    "ValidatingWebhookConfiguration",
    "VolumeAttachment",
];

/// Identity of a cluster object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    pub name: String,
    /// `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// API group, empty for the core group
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl ResourceId {
    pub fn new(
        name: impl Into<String>,
        namespace: Option<&str>,
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.map(String::from),
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// Build the identity of an object, defaulting the namespace of namespaced kinds
    pub fn from_object(obj: &DynamicObject, default_namespace: &str) -> Result<Self> {
        let types = obj.types.as_ref().ok_or_else(|| CoreError::InvalidManifest {
            index: 0,
            message: "resource missing apiVersion or kind".to_string(),
        })?;
        let name = obj
            .metadata
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| CoreError::InvalidManifest {
                index: 0,
                message: format!("{} missing metadata.name", types.kind),
            })?;

        let (group, version) = split_api_version(&types.api_version);
        let namespace = if is_cluster_scoped(&types.kind) {
            None
        } else {
            Some(
                obj.metadata
                    .namespace
                    .clone()
                    .unwrap_or_else(|| default_namespace.to_string()),
            )
        };

        Ok(Self {
            name,
            namespace,
            group,
            version,
            kind: types.kind.clone(),
        })
    }

    /// Two references match iff every field is equal
    pub fn matches(&self, other: &ResourceId) -> bool {
        self == other
    }

    /// `group/version`, or just `version` for the core group
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn is_crd(&self) -> bool {
        self.kind == CRD_KIND && self.group == CRD_GROUP
    }

    pub fn is_namespace(&self) -> bool {
        self.kind == "Namespace" && self.group.is_empty()
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", ns, self.kind, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Split `apps/v1` into (`apps`, `v1`) and `v1` into (``, `v1`)
pub fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.rsplit_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED_KINDS.contains(&kind)
}

/// Which role a resource plays in a release
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceClass {
    /// Regular chart resource owned by the release
    General,
    /// Lifecycle hook
    Hook,
    /// Pre-existing object the release uses but does not own (e.g. its namespace)
    Unmanaged,
    /// CRD preloaded before anything else
    StandaloneCrd,
}

/// Where the object came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Origin {
    /// Rendered from the chart, not yet observed
    Local,
    /// Fetched from the cluster
    Live,
}

/// Attributes derived from annotations, resolved once per resource
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceAttrs {
    pub weight: i32,
    pub hook_types: BTreeSet<HookType>,
    pub delete_policies: BTreeSet<DeletePolicy>,
    pub keep_on_deletion: bool,
    pub external_dependencies: Vec<ExternalDependency>,
    pub fail_mode: FailMode,
    pub track_termination_mode: TrackTerminationMode,
    #[serde(default, with = "humantime_serde")]
    pub no_activity_timeout: Option<Duration>,
}

impl ResourceAttrs {
    /// Fold parsed annotations into attributes
    pub fn resolve(parsed: Vec<Annotation>, class: ResourceClass) -> Result<Self> {
        let mut attrs = ResourceAttrs::default();
        let mut weight = None;
        let mut hook_weight = None;
        let mut keelson_policies = None;
        let mut helm_policies = None;
        let mut dep_resources: BTreeMap<String, ExternalDependency> = BTreeMap::new();
        let mut dep_namespaces: BTreeMap<String, String> = BTreeMap::new();

        for annotation in parsed {
            match annotation {
                Annotation::Weight(w) => weight = Some(w),
                Annotation::HookWeight(w) => hook_weight = Some(w),
                Annotation::Hook(types) => attrs.hook_types = types,
                Annotation::HookDeletePolicy(p) => helm_policies = Some(p),
                Annotation::DeletePolicy(p) => keelson_policies = Some(p),
                Annotation::ResourcePolicyKeep(keep) => attrs.keep_on_deletion = keep,
                Annotation::ExternalDependencyResource {
                    id,
                    kind,
                    version,
                    group,
                    name,
                } => {
                    dep_resources.insert(
                        id.clone(),
                        ExternalDependency {
                            id,
                            kind,
                            version,
                            group,
                            name,
                            namespace: None,
                        },
                    );
                }
                Annotation::ExternalDependencyNamespace { id, namespace } => {
                    dep_namespaces.insert(id, namespace);
                }
                Annotation::FailMode(mode) => attrs.fail_mode = mode,
                Annotation::TrackTerminationMode(mode) => attrs.track_termination_mode = mode,
                Annotation::NoActivityTimeout(t) => attrs.no_activity_timeout = Some(t),
            }
        }

        // keelson weight wins; hook weight only applies to hooks
        attrs.weight = match class {
            ResourceClass::Hook => weight.or(hook_weight).unwrap_or(0),
            _ => weight.unwrap_or(0),
        };

        attrs.delete_policies = match (keelson_policies, helm_policies, class) {
            (Some(p), _, _) => p,
            (None, Some(p), _) => p,
            (None, None, ResourceClass::Hook) => [DeletePolicy::BeforeCreation].into_iter().collect(),
            (None, None, _) => BTreeSet::new(),
        };

        for (id, namespace) in dep_namespaces {
            match dep_resources.get_mut(&id) {
                Some(dep) => dep.namespace = Some(namespace),
                None => {
                    return Err(CoreError::InvalidAnnotation {
                        key: format!("{}{}", id, annotations::keelson::EXTERNAL_DEPENDENCY_NAMESPACE_SUFFIX),
                        value: namespace,
                        reason: "no matching external-dependency resource annotation".to_string(),
                    });
                }
            }
        }
        attrs.external_dependencies = dep_resources.into_values().collect();

        Ok(attrs)
    }
}

/// A cluster object with its identity and resolved attributes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub class: ResourceClass,
    pub origin: Origin,
    pub object: DynamicObject,
    pub attrs: ResourceAttrs,
}

impl Resource {
    /// Build a resource, parsing its annotations
    pub fn from_object(
        mut object: DynamicObject,
        class: ResourceClass,
        origin: Origin,
        default_namespace: &str,
    ) -> Result<Self> {
        let id = ResourceId::from_object(&object, default_namespace)?;
        if object.metadata.namespace.is_none() {
            object.metadata.namespace = id.namespace.clone();
        }

        let annotations = object.metadata.annotations.clone().unwrap_or_default();
        let attrs = annotations::parse_annotations(&annotations)
            .and_then(|parsed| ResourceAttrs::resolve(parsed, class))
            .map_err(|e| e.for_resource(&id))?;

        if class == ResourceClass::Hook && attrs.hook_types.is_empty() {
            return Err(CoreError::InvalidAnnotation {
                key: annotations::helm::HOOK.to_string(),
                value: String::new(),
                reason: "hook resource without hook types".to_string(),
            }
            .for_resource(&id));
        }

        Ok(Self {
            id,
            class,
            origin,
            object,
            attrs,
        })
    }

    /// Parse a single YAML document
    pub fn from_yaml(doc: &str, class: ResourceClass, default_namespace: &str) -> Result<Self> {
        let object: DynamicObject = serde_yaml::from_str(doc)?;
        Self::from_object(object, class, Origin::Local, default_namespace)
    }

    /// The unmanaged namespace object a release is deployed into
    pub fn release_namespace(name: &str) -> Result<Self> {
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut object: DynamicObject = serde_json::from_value(serde_json::to_value(&ns)?)?;
        object.types = Some(TypeMeta {
            api_version: "v1".to_string(),
            kind: "Namespace".to_string(),
        });
        Self::from_object(object, ResourceClass::Unmanaged, Origin::Local, name)
    }

    /// Cluster-assigned UID (live objects only)
    pub fn uid(&self) -> Option<&str> {
        self.object.metadata.uid.as_deref()
    }

    /// The same resource as observed in the cluster
    pub fn with_live_object(&self, live: DynamicObject) -> Self {
        Self {
            id: self.id.clone(),
            class: self.class,
            origin: Origin::Live,
            object: live,
            attrs: self.attrs.clone(),
        }
    }
}

/// Whether the resource is a hook attached to the given event
pub fn hook_matches(resource: &Resource, hook: HookType) -> bool {
    resource.class == ResourceClass::Hook && resource.attrs.hook_types.contains(&hook)
}

pub fn has_delete_policy(resource: &Resource, policy: DeletePolicy) -> bool {
    resource.attrs.delete_policies.contains(&policy)
}

/// Whether the deploy blocks on this resource becoming ready
pub fn is_blocking(resource: &Resource) -> bool {
    resource.attrs.track_termination_mode == TrackTerminationMode::WaitUntilReady
}

/// Whether a tracking failure of this resource may be ignored
pub fn failure_ignored(resource: &Resource) -> bool {
    resource.attrs.fail_mode == FailMode::IgnoreAndContinue
}

/// Does the document carry a hook annotation?
pub fn is_hook_object(object: &DynamicObject) -> bool {
    object
        .metadata
        .annotations
        .as_ref()
        .map(|a| a.contains_key(annotations::helm::HOOK))
        .unwrap_or(false)
}

/// The object as JSON with server-managed fields and status removed
///
/// Two objects that normalize to the same value describe the same desired state.
pub fn normalized_object(object: &DynamicObject) -> serde_json::Value {
    let mut value = serde_json::to_value(object).unwrap_or(serde_json::Value::Null);
    if let Some(map) = value.as_object_mut() {
        map.remove("status");
        if let Some(meta) = map.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            for field in [
                "resourceVersion",
                "uid",
                "generation",
                "creationTimestamp",
                "managedFields",
                "selfLink",
            ] {
                meta.remove(field);
            }
        }
    }
    value
}

/// Desired resources of a deploy, partitioned by role
#[derive(Debug, Clone, Default)]
pub struct DesiredResources {
    pub crds: Vec<Resource>,
    pub hooks: Vec<Resource>,
    pub general: Vec<Resource>,
}

impl DesiredResources {
    /// Partition rendered manifests and preloaded CRD manifests
    pub fn from_manifests(
        manifest: &str,
        crd_manifest: Option<&str>,
        default_namespace: &str,
    ) -> Result<Self> {
        let mut desired = DesiredResources::default();

        if let Some(crds) = crd_manifest {
            for (index, object) in split_documents(crds)? {
                let resource = Resource::from_object(
                    object,
                    ResourceClass::StandaloneCrd,
                    Origin::Local,
                    default_namespace,
                )?;
                if !resource.id.is_crd() {
                    return Err(CoreError::InvalidManifest {
                        index,
                        message: format!("{} in CRD manifests is not a CRD", resource.id),
                    });
                }
                desired.crds.push(resource);
            }
        }

        for (_, object) in split_documents(manifest)? {
            let class = if is_hook_object(&object) {
                ResourceClass::Hook
            } else {
                ResourceClass::General
            };
            let resource = Resource::from_object(object, class, Origin::Local, default_namespace)?;
            match class {
                ResourceClass::Hook => desired.hooks.push(resource),
                _ => desired.general.push(resource),
            }
        }

        Ok(desired)
    }

    pub fn is_empty(&self) -> bool {
        self.crds.is_empty() && self.hooks.is_empty() && self.general.is_empty()
    }
}

/// Split a multi-document manifest into objects, skipping empty documents
pub fn split_documents(manifest: &str) -> Result<Vec<(usize, DynamicObject)>> {
    let mut objects = Vec::new();

    for (index, doc) in manifest.split("\n---").enumerate() {
        let doc = doc.trim().trim_start_matches("---").trim();
        if doc
            .lines()
            .all(|l| l.trim().is_empty() || l.trim().starts_with('#'))
        {
            continue;
        }

        let object: DynamicObject =
            serde_yaml::from_str(doc).map_err(|e| CoreError::InvalidManifest {
                index,
                message: e.to_string(),
            })?;
        if object.types.is_none() {
            return Err(CoreError::InvalidManifest {
                index,
                message: "resource missing apiVersion or kind".to_string(),
            });
        }
        objects.push((index, object));
    }

    Ok(objects)
}
