//! In-memory storage driver
//!
//! Stores releases in memory, useful for unit tests and dry runs without a
//! Kubernetes cluster. Failures can be injected to exercise error paths.

use async_trait::async_trait;
use keelson_core::Release;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{CompressionMethod, LabelSelector, StorageDriver, storage_labels};
use crate::error::{KubeError, Result};

type Key = (String, String, u32);

#[derive(Default)]
struct State {
    /// (namespace, name, revision) -> release
    releases: BTreeMap<Key, Release>,
    counts: OperationCounts,
    /// Statuses whose update is rejected
    failing_updates: Vec<keelson_core::ReleaseStatus>,
    fail_creates: bool,
}

/// Counts of operations performed for testing assertions
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OperationCounts {
    pub queries: usize,
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
}

/// In-memory storage driver
#[derive(Clone, Default)]
pub struct MemoryDriver {
    state: Arc<Mutex<State>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create with pre-populated releases
    pub fn with_releases(releases: Vec<Release>) -> Self {
        let driver = Self::new();
        {
            let mut state = driver.state();
            for release in releases {
                state.releases.insert(key(&release), release);
            }
        }
        driver
    }

    /// Get operation counts for assertions
    pub fn operation_counts(&self) -> OperationCounts {
        self.state().counts.clone()
    }

    /// All stored releases, ordered by namespace, name and revision
    pub fn all_releases(&self) -> Vec<Release> {
        self.state().releases.values().cloned().collect()
    }

    pub fn release_count(&self) -> usize {
        self.state().releases.len()
    }

    /// Reject updates that would store a record in `status`
    pub fn fail_updates_to(&self, status: keelson_core::ReleaseStatus) {
        self.state().failing_updates.push(status);
    }

    /// Reject every create
    pub fn fail_creates(&self) {
        self.state().fail_creates = true;
    }
}

fn key(release: &Release) -> Key {
    (
        release.namespace.clone(),
        release.name.clone(),
        release.revision,
    )
}

#[async_trait]
impl StorageDriver for MemoryDriver {
    async fn create(&self, release: &Release) -> Result<()> {
        let mut state = self.state();
        state.counts.creates += 1;

        if state.fail_creates {
            return Err(KubeError::Storage(format!(
                "injected create failure for {}",
                release.storage_key()
            )));
        }

        let key = key(release);
        if state.releases.contains_key(&key) {
            return Err(KubeError::ReleaseAlreadyExists {
                name: release.name.clone(),
                namespace: release.namespace.clone(),
                revision: release.revision,
            });
        }
        state.releases.insert(key, release.clone());
        Ok(())
    }

    async fn update(&self, release: &Release) -> Result<()> {
        let mut state = self.state();
        state.counts.updates += 1;

        if state.failing_updates.contains(&release.status) {
            return Err(KubeError::Storage(format!(
                "injected update failure for {} ({})",
                release.storage_key(),
                release.status
            )));
        }

        state.releases.insert(key(release), release.clone());
        Ok(())
    }

    async fn query(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<Release>> {
        let mut state = self.state();
        state.counts.queries += 1;

        Ok(state
            .releases
            .iter()
            .filter(|((ns, _, _), _)| ns == namespace)
            .map(|(_, r)| r)
            .filter(|r| selector.matches(&storage_labels(r, CompressionMethod::None)))
            .cloned()
            .collect())
    }

    async fn delete(&self, namespace: &str, name: &str, revision: u32) -> Result<()> {
        let mut state = self.state();
        state.counts.deletes += 1;
        state
            .releases
            .remove(&(namespace.to_string(), name.to_string(), revision));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keelson_core::{DeployType, ReleaseStatus};

    fn release(name: &str, revision: u32) -> Release {
        Release::pending(name, "default", revision, DeployType::Upgrade, None)
    }

    #[tokio::test]
    async fn test_create_duplicate_fails() {
        let driver = MemoryDriver::new();
        driver.create(&release("web", 1)).await.unwrap();
        let err = driver.create(&release("web", 1)).await.unwrap_err();
        assert!(matches!(err, KubeError::ReleaseAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_query_by_release_name() {
        let driver = MemoryDriver::with_releases(vec![
            release("web", 1),
            release("web", 2),
            release("api", 1),
        ]);
        let found = driver
            .query("default", &LabelSelector::release("web"))
            .await
            .unwrap();
        assert_eq!(found.iter().map(|r| r.revision).collect::<Vec<_>>(), vec![1, 2]);
        assert!(driver
            .query("other", &LabelSelector::release("web"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_injected_update_failure() {
        let driver = MemoryDriver::new();
        driver.fail_updates_to(ReleaseStatus::Deployed);
        let mut rel = release("web", 1);
        driver.create(&rel).await.unwrap();
        rel.succeed().unwrap();

        assert!(driver.update(&rel).await.is_err());
        assert_eq!(driver.all_releases()[0].status, ReleaseStatus::PendingUpgrade);
    }

    #[tokio::test]
    async fn test_operation_counts() {
        let driver = MemoryDriver::new();
        driver.create(&release("web", 1)).await.unwrap();
        driver.update(&release("web", 1)).await.unwrap();
        driver.delete("default", "web", 1).await.unwrap();
        driver.delete("default", "web", 1).await.unwrap();

        let counts = driver.operation_counts();
        assert_eq!(counts.creates, 1);
        assert_eq!(counts.updates, 1);
        assert_eq!(counts.deletes, 2);
        assert_eq!(driver.release_count(), 0);
    }
}
