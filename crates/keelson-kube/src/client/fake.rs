//! In-memory cluster for testing
//!
//! Stores objects keyed by reference, assigns UIDs and resource versions, and records
//! every mutation so tests can assert on what the engine actually did.

use async_trait::async_trait;
use keelson_core::{ResourceId, normalized_object};
use kube::api::DynamicObject;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{ApiType, ClusterClient};
use crate::error::{KubeError, Result};

/// A recorded cluster mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Create(ResourceId),
    Apply(ResourceId),
    Delete(ResourceId),
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ResourceId, DynamicObject>,
    mutations: Vec<Mutation>,
    dry_runs: usize,
    next_uid: u64,
    next_version: u64,
    /// Kinds the cluster does not serve, as `group/kind`
    unsupported: HashSet<String>,
    /// Objects whose spec may not change in place
    immutable: HashSet<ResourceId>,
    /// Injected failures per reference
    failures: HashMap<ResourceId, String>,
    discovery_refreshes: usize,
    /// Stall every delete call this long
    delete_delay: Option<Duration>,
}

/// In-memory cluster client for testing
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed a live object, returning it with its assigned UID
    pub fn insert(&self, id: &ResourceId, object: DynamicObject) -> DynamicObject {
        let mut state = self.state();
        let stored = state.store(id, object, None);
        state.objects.insert(id.clone(), stored.clone());
        stored
    }

    /// Seed a live object under an explicit UID
    pub fn insert_with_uid(&self, id: &ResourceId, object: DynamicObject, uid: &str) -> DynamicObject {
        let mut state = self.state();
        let mut stored = state.store(id, object, None);
        stored.metadata.uid = Some(uid.to_string());
        state.objects.insert(id.clone(), stored.clone());
        stored
    }

    /// Replace the `status` of a live object
    pub fn set_status(&self, id: &ResourceId, status: serde_json::Value) {
        if let Some(obj) = self.state().objects.get_mut(id) {
            obj.data["status"] = status;
        }
    }

    pub fn remove(&self, id: &ResourceId) {
        self.state().objects.remove(id);
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.state().objects.contains_key(id)
    }

    pub fn object(&self, id: &ResourceId) -> Option<DynamicObject> {
        self.state().objects.get(id).cloned()
    }

    /// Stop serving a type
    pub fn mark_unsupported(&self, group: &str, kind: &str) {
        self.state().unsupported.insert(format!("{}/{}", group, kind));
    }

    /// Refuse in-place changes to an object
    pub fn mark_immutable(&self, id: &ResourceId) {
        self.state().immutable.insert(id.clone());
    }

    /// Make every mutation of `id` fail
    pub fn fail_on(&self, id: &ResourceId, message: impl Into<String>) {
        self.state().failures.insert(id.clone(), message.into());
    }

    /// Mutations performed so far, in order
    /// Make every delete hang for `delay` before it takes effect
    pub fn delay_deletes(&self, delay: Duration) {
        self.state().delete_delay = Some(delay);
    }

    pub fn mutations(&self) -> Vec<Mutation> {
        self.state().mutations.clone()
    }

    pub fn dry_run_count(&self) -> usize {
        self.state().dry_runs
    }

    pub fn discovery_refreshes(&self) -> usize {
        self.state().discovery_refreshes
    }

    fn check_supported(state: &State, id: &ResourceId) -> Result<()> {
        if state.unsupported.contains(&format!("{}/{}", id.group, id.kind)) {
            return Err(KubeError::UnsupportedResource {
                resource: id.to_string(),
                api_version: id.api_version(),
                kind: id.kind.clone(),
            });
        }
        Ok(())
    }

    fn check_failure(state: &State, id: &ResourceId) -> Result<()> {
        match state.failures.get(id) {
            Some(message) => Err(KubeError::Storage(format!("{}: {}", id, message))),
            None => Ok(()),
        }
    }
}

impl State {
    /// The object as the server would persist it
    fn store(
        &mut self,
        id: &ResourceId,
        mut object: DynamicObject,
        previous: Option<&DynamicObject>,
    ) -> DynamicObject {
        self.next_version += 1;
        object.metadata.namespace = id.namespace.clone();
        object.metadata.resource_version = Some(self.next_version.to_string());
        match previous {
            Some(prev) => {
                object.metadata.uid = prev.metadata.uid.clone();
                object.metadata.creation_timestamp = prev.metadata.creation_timestamp.clone();
                if let Some(status) = prev.data.get("status") {
                    object.data["status"] = status.clone();
                }
            }
            None => {
                self.next_uid += 1;
                object.metadata.uid = Some(format!("uid-{}", self.next_uid));
            }
        }
        object
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get(&self, id: &ResourceId) -> Result<Option<DynamicObject>> {
        let state = self.state();
        Self::check_supported(&state, id)?;
        Ok(state.objects.get(id).cloned())
    }

    async fn create(&self, id: &ResourceId, object: &DynamicObject) -> Result<DynamicObject> {
        let mut state = self.state();
        Self::check_supported(&state, id)?;
        Self::check_failure(&state, id)?;
        if state.objects.contains_key(id) {
            return Err(KubeError::AlreadyExists {
                resource: id.to_string(),
            });
        }
        let stored = state.store(id, object.clone(), None);
        state.objects.insert(id.clone(), stored.clone());
        state.mutations.push(Mutation::Create(id.clone()));
        Ok(stored)
    }

    async fn apply(
        &self,
        id: &ResourceId,
        object: &DynamicObject,
        dry_run: bool,
    ) -> Result<DynamicObject> {
        let mut state = self.state();
        Self::check_supported(&state, id)?;
        if !dry_run {
            Self::check_failure(&state, id)?;
        }

        let previous = state.objects.get(id).cloned();
        let mut result = state.store(id, object.clone(), previous.as_ref());

        if let Some(prev) = &previous {
            let changed = normalized_object(prev) != normalized_object(&result);
            if changed && state.immutable.contains(id) {
                return Err(KubeError::ImmutableFieldConflict {
                    resource: id.to_string(),
                    message: "field is immutable".to_string(),
                });
            }
            if !changed {
                result.metadata.resource_version = prev.metadata.resource_version.clone();
            }
        }

        if dry_run {
            state.dry_runs += 1;
        } else {
            state.objects.insert(id.clone(), result.clone());
            state.mutations.push(Mutation::Apply(id.clone()));
        }
        Ok(result)
    }

    async fn delete(&self, id: &ResourceId) -> Result<()> {
        let delay = self.state().delete_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        Self::check_supported(&state, id)?;
        Self::check_failure(&state, id)?;
        state.objects.remove(id);
        state.mutations.push(Mutation::Delete(id.clone()));
        Ok(())
    }

    async fn refresh_discovery(&self) -> Result<()> {
        self.state().discovery_refreshes += 1;
        Ok(())
    }

    async fn resolve_type(&self, group: &str, version: &str, kind: &str) -> Result<ApiType> {
        let state = self.state();
        state
            .objects
            .keys()
            .find(|id| {
                id.kind.eq_ignore_ascii_case(kind)
                    && (group.is_empty() || id.group == group)
                    && (version.is_empty() || id.version == version)
            })
            .map(|id| ApiType {
                group: id.group.clone(),
                version: id.version.clone(),
                kind: id.kind.clone(),
            })
            .ok_or_else(|| KubeError::UnsupportedResource {
                resource: kind.to_string(),
                api_version: version.to_string(),
                kind: kind.to_string(),
            })
    }
}
