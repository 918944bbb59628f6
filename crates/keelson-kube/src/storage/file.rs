//! File-based storage driver
//!
//! Stores release records in local files. Useful for:
//! - Development and testing without a Kubernetes cluster
//! - Offline scenarios
//!
//! Layout: `<base>/<namespace>/<name>/v<revision>.json`, compressed with the
//! configured method.

use async_trait::async_trait;
use keelson_core::Release;
use std::path::{Path, PathBuf};

use super::{LabelSelector, StorageConfig, StorageDriver, compress, decompress, storage_labels};
use crate::error::{KubeError, Result};

/// File-based storage driver
pub struct FileDriver {
    /// Base directory for storing releases
    base_dir: PathBuf,
    config: StorageConfig,
}

impl FileDriver {
    /// Create a new file driver
    pub fn new(base_dir: PathBuf, config: StorageConfig) -> Result<Self> {
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir, config })
    }

    fn release_path(&self, namespace: &str, name: &str, revision: u32) -> PathBuf {
        self.base_dir
            .join(namespace)
            .join(name)
            .join(format!("v{}.json", revision))
    }

    fn write_release(&self, release: &Release) -> Result<()> {
        let path = self.release_path(&release.namespace, &release.name, release.revision);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_vec(release)?;
        let data = compress(&json, self.config.compression)?;
        std::fs::write(&path, data)?;
        Ok(())
    }

    fn read_release(&self, path: &Path) -> Result<Release> {
        let data = std::fs::read(path)?;
        let decompressed = decompress(&data, self.config.compression)?;
        Ok(serde_json::from_slice(&decompressed)?)
    }

    fn subdirs(path: &Path) -> Result<Vec<PathBuf>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        Ok(std::fs::read_dir(path)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect())
    }
}

#[async_trait]
impl StorageDriver for FileDriver {
    async fn create(&self, release: &Release) -> Result<()> {
        let path = self.release_path(&release.namespace, &release.name, release.revision);
        if path.exists() {
            return Err(KubeError::ReleaseAlreadyExists {
                name: release.name.clone(),
                namespace: release.namespace.clone(),
                revision: release.revision,
            });
        }
        self.write_release(release)
    }

    async fn update(&self, release: &Release) -> Result<()> {
        self.write_release(release)
    }

    async fn query(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<Release>> {
        let mut releases = Vec::new();

        for name_dir in Self::subdirs(&self.base_dir.join(namespace))? {
            let files: Vec<PathBuf> = std::fs::read_dir(&name_dir)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
                .collect();

            for file in files {
                match self.read_release(&file) {
                    Ok(release) => {
                        if selector.matches(&storage_labels(&release, self.config.compression)) {
                            releases.push(release);
                        }
                    }
                    Err(e) => tracing::warn!(
                        path = %file.display(),
                        error = %e,
                        "skipping unreadable release record"
                    ),
                }
            }
        }

        releases.sort_by_key(|r| r.revision);
        Ok(releases)
    }

    async fn delete(&self, namespace: &str, name: &str, revision: u32) -> Result<()> {
        let path = self.release_path(namespace, name, revision);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keelson_core::DeployType;
    use tempfile::TempDir;

    fn driver() -> (TempDir, FileDriver) {
        let dir = TempDir::new().unwrap();
        let driver = FileDriver::new(dir.path().to_path_buf(), StorageConfig::default()).unwrap();
        (dir, driver)
    }

    #[tokio::test]
    async fn test_create_and_query() {
        let (_dir, driver) = driver();
        let first = Release::pending("web", "prod", 1, DeployType::Initial, None);
        let other = Release::pending("api", "prod", 1, DeployType::Initial, None);
        driver.create(&first).await.unwrap();
        driver.create(&other).await.unwrap();

        let found = driver
            .query("prod", &LabelSelector::release("web"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "web");
    }

    #[tokio::test]
    async fn test_create_duplicate_fails() {
        let (_dir, driver) = driver();
        let release = Release::pending("web", "prod", 1, DeployType::Initial, None);
        driver.create(&release).await.unwrap();

        let err = driver.create(&release).await.unwrap_err();
        assert!(matches!(err, KubeError::ReleaseAlreadyExists { revision: 1, .. }));
    }

    #[tokio::test]
    async fn test_update_changes_status_label() {
        let (_dir, driver) = driver();
        let mut release = Release::pending("web", "prod", 1, DeployType::Initial, None);
        driver.create(&release).await.unwrap();
        release.succeed().unwrap();
        driver.update(&release).await.unwrap();

        let deployed = driver
            .query("prod", &LabelSelector::release("web").with("status", "deployed"))
            .await
            .unwrap();
        assert_eq!(deployed.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_absent_is_ok() {
        let (_dir, driver) = driver();
        driver.delete("prod", "web", 7).await.unwrap();
        assert!(driver.query("prod", &LabelSelector::new()).await.unwrap().is_empty());
    }
}
