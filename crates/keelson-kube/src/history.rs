//! Release history
//!
//! An in-memory index over the stored revisions of one release, loaded once per deploy.
//! Writes go through the storage driver first and only then update the index, under a
//! single writer lock.

use keelson_core::{Release, ReleaseStatus};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{KubeError, Result};
use crate::storage::{LabelSelector, StorageDriver};

/// Revisions of one release, oldest first
pub struct History<S: ?Sized> {
    storage: Arc<S>,
    name: String,
    namespace: String,
    index: RwLock<Vec<Release>>,
    writer: tokio::sync::Mutex<()>,
}

impl<S: StorageDriver + ?Sized> History<S> {
    /// Load every revision of `name` from storage
    pub async fn load(storage: Arc<S>, name: &str, namespace: &str) -> Result<Self> {
        let mut releases = storage
            .query(namespace, &LabelSelector::release(name))
            .await?;
        releases.sort_by_key(|r| r.revision);
        releases.dedup_by_key(|r| r.revision);

        tracing::debug!(
            release = name,
            namespace,
            revisions = releases.len(),
            "loaded release history"
        );

        Ok(Self {
            storage,
            name: name.to_string(),
            namespace: namespace.to_string(),
            index: RwLock::new(releases),
            writer: tokio::sync::Mutex::new(()),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Release>> {
        self.index.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Release>> {
        self.index.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// All revisions, oldest first
    pub fn releases(&self) -> Vec<Release> {
        self.read().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Revision number the next deploy will use
    pub fn next_revision(&self) -> u32 {
        self.read().last().map(|r| r.revision + 1).unwrap_or(1)
    }

    pub fn release(&self, revision: u32) -> Option<Release> {
        self.read().iter().find(|r| r.revision == revision).cloned()
    }

    /// Highest revision regardless of status
    pub fn last_release(&self) -> Option<Release> {
        self.read().last().cloned()
    }

    /// Newest revision that deployed successfully
    pub fn last_deployed_release(&self) -> Option<Release> {
        last_deployed(self.read().iter().rev())
    }

    /// Like [`Self::last_deployed_release`], never returning the newest revision
    pub fn last_deployed_release_except_last_release(&self) -> Option<Release> {
        last_deployed(self.read().iter().rev().skip(1))
    }

    /// Store a new revision
    pub async fn create_release(&self, release: &Release) -> Result<()> {
        let _guard = self.writer.lock().await;

        if let Some(last) = self.read().last()
            && release.revision <= last.revision
        {
            return Err(KubeError::ReleaseAlreadyExists {
                name: release.name.clone(),
                namespace: release.namespace.clone(),
                revision: release.revision,
            });
        }

        self.storage.create(release).await?;
        self.write().push(release.clone());
        tracing::debug!(
            release = %release.name,
            revision = release.revision,
            status = %release.status,
            "created release record"
        );
        Ok(())
    }

    /// Overwrite an indexed revision
    pub async fn update_release(&self, release: &Release) -> Result<()> {
        let _guard = self.writer.lock().await;

        if !self.read().iter().any(|r| r.revision == release.revision) {
            return Err(KubeError::ReleaseNotFound {
                name: format!("{} revision {}", release.name, release.revision),
                namespace: release.namespace.clone(),
            });
        }

        self.storage.update(release).await?;
        if let Some(slot) = self
            .write()
            .iter_mut()
            .find(|r| r.revision == release.revision)
        {
            *slot = release.clone();
        }
        tracing::debug!(
            release = %release.name,
            revision = release.revision,
            status = %release.status,
            "updated release record"
        );
        Ok(())
    }

    /// Trim to at most `max` revisions; 0 keeps everything
    ///
    /// Only the oldest revisions go, and never a Deployed one or the newest.
    /// Returns the removed revision numbers.
    pub async fn prune(&self, max: usize) -> Result<Vec<u32>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let _guard = self.writer.lock().await;

        let candidates: Vec<u32> = {
            let index = self.read();
            let excess = index.len().saturating_sub(max);
            let newest = index.last().map(|r| r.revision);
            index
                .iter()
                .filter(|r| r.status != ReleaseStatus::Deployed && Some(r.revision) != newest)
                .map(|r| r.revision)
                .take(excess)
                .collect()
        };

        for revision in &candidates {
            self.storage
                .delete(&self.namespace, &self.name, *revision)
                .await?;
            self.write().retain(|r| r.revision != *revision);
            tracing::debug!(release = %self.name, revision, "pruned release revision");
        }
        Ok(candidates)
    }
}

/// First successful revision walking newest to oldest
///
/// An uninstall stops the walk: nothing before it can be resumed from.
fn last_deployed<'a>(mut newest_first: impl Iterator<Item = &'a Release>) -> Option<Release> {
    newest_first.find_map(|r| match r.status {
        ReleaseStatus::Deployed | ReleaseStatus::Superseded => Some(Some(r.clone())),
        ReleaseStatus::Uninstalled | ReleaseStatus::Uninstalling => Some(None),
        _ => None,
    })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryDriver;
    use keelson_core::DeployType;

    fn release(revision: u32, status: ReleaseStatus) -> Release {
        let mut rel = Release::pending("web", "prod", revision, DeployType::Upgrade, None);
        rel.status = status;
        rel
    }

    async fn history(statuses: &[ReleaseStatus]) -> (Arc<MemoryDriver>, History<MemoryDriver>) {
        let releases = statuses
            .iter()
            .enumerate()
            .map(|(i, s)| release(i as u32 + 1, *s))
            .collect();
        let driver = Arc::new(MemoryDriver::with_releases(releases));
        let history = History::load(driver.clone(), "web", "prod").await.unwrap();
        (driver, history)
    }

    #[tokio::test]
    async fn test_empty_history() {
        let (_, history) = history(&[]).await;
        assert!(history.is_empty());
        assert_eq!(history.next_revision(), 1);
        assert!(history.last_release().is_none());
        assert!(history.last_deployed_release().is_none());
    }

    #[tokio::test]
    async fn test_last_deployed_skips_failed_and_pending() {
        use ReleaseStatus::*;
        let (_, history) = history(&[Superseded, Deployed, Failed, PendingUpgrade]).await;
        assert_eq!(history.last_release().unwrap().revision, 4);
        assert_eq!(history.last_deployed_release().unwrap().revision, 2);
    }

    #[tokio::test]
    async fn test_last_deployed_stops_at_uninstall() {
        use ReleaseStatus::*;
        let (_, history) = history(&[Deployed, Uninstalled, Failed]).await;
        assert!(history.last_deployed_release().is_none());
    }

    #[tokio::test]
    async fn test_except_last_release() {
        use ReleaseStatus::*;
        let (_, history) = history(&[Superseded, Deployed]).await;
        assert_eq!(history.last_deployed_release().unwrap().revision, 2);
        assert_eq!(
            history
                .last_deployed_release_except_last_release()
                .unwrap()
                .revision,
            1
        );
    }

    #[tokio::test]
    async fn test_update_requires_indexed_revision() {
        let (_, history) = history(&[ReleaseStatus::Deployed]).await;
        let err = history
            .update_release(&release(5, ReleaseStatus::Failed))
            .await
            .unwrap_err();
        assert!(matches!(err, KubeError::ReleaseNotFound { .. }));
    }

    #[tokio::test]
    async fn test_create_then_update() {
        let (driver, history) = history(&[ReleaseStatus::Deployed]).await;
        let mut pending = release(2, ReleaseStatus::PendingUpgrade);
        history.create_release(&pending).await.unwrap();
        pending.succeed().unwrap();
        history.update_release(&pending).await.unwrap();

        assert_eq!(history.release(2).unwrap().status, ReleaseStatus::Deployed);
        assert_eq!(driver.release_count(), 2);
        assert!(history.create_release(&release(2, ReleaseStatus::PendingUpgrade)).await.is_err());
    }

    #[tokio::test]
    async fn test_prune_keeps_deployed_and_newest() {
        use ReleaseStatus::*;
        let (driver, history) = history(&[Deployed, Superseded, Failed, PendingUpgrade]).await;

        let removed = history.prune(3).await.unwrap();
        assert_eq!(removed, vec![2]);
        assert_eq!(driver.operation_counts().deletes, 1);
        assert!(history.release(1).is_some());

        let removed = history.prune(1).await.unwrap();
        assert_eq!(removed, vec![3]);
        assert_eq!(
            history.releases().iter().map(|r| r.revision).collect::<Vec<_>>(),
            vec![1, 4]
        );
    }
}
