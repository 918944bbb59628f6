//! Wiring of the deploy engine to a real cluster

use keelson_kube::{
    ConfigMapDriver, ConfigMapLocker, DeployConfig, DeployContext, Deployer, DriverKind,
    FileDriver, KubeCluster, MemoryDriver, PollingTracker, SecretsDriver, StorageConfig,
    StorageDriver, FIELD_MANAGER,
};
use kube::Client;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{CliError, Result};

pub type ClusterDeployer =
    Deployer<KubeCluster, PollingTracker<KubeCluster>, dyn StorageDriver, ConfigMapLocker>;

/// Options shared by every command
#[derive(Debug, Clone)]
pub struct Settings {
    pub namespace: String,
    pub driver: DriverKind,
    pub config: DeployConfig,
}

impl Settings {
    pub fn load(namespace: &str, driver: &str, config_path: Option<&Path>) -> Result<Self> {
        let driver: DriverKind = driver.parse()?;
        let config = match config_path {
            Some(path) => DeployConfig::from_file(path).map_err(|e| CliError::Config {
                message: format!("{}: {}", path.display(), e),
            })?,
            None => DeployConfig::default(),
        };
        Ok(Self {
            namespace: namespace.to_string(),
            driver,
            config,
        })
    }

    fn storage_config(&self) -> StorageConfig {
        StorageConfig {
            driver: self.driver,
            ..Default::default()
        }
    }
}

/// Directory of the file storage driver
fn releases_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("keelson")
        .join("releases")
}

/// Open the configured storage; the client is only needed by in-cluster drivers
pub fn open_storage(settings: &Settings, client: Option<&Client>) -> Result<Arc<dyn StorageDriver>> {
    let config = settings.storage_config();
    let in_cluster = |client: Option<&Client>| {
        client.cloned().ok_or_else(|| CliError::Config {
            message: format!("storage driver {:?} needs a cluster connection", settings.driver),
        })
    };
    let storage: Arc<dyn StorageDriver> = match settings.driver {
        DriverKind::Secrets => Arc::new(SecretsDriver::with_client(in_cluster(client)?, config)),
        DriverKind::ConfigMap => Arc::new(ConfigMapDriver::with_client(in_cluster(client)?, config)),
        DriverKind::File => Arc::new(FileDriver::new(releases_dir(), config)?),
        DriverKind::Memory => {
            tracing::warn!("memory storage keeps no history between runs");
            Arc::new(MemoryDriver::new())
        }
    };
    Ok(storage)
}

/// Storage for read-only commands, connecting only when the driver needs it
pub async fn storage_only(settings: &Settings) -> Result<Arc<dyn StorageDriver>> {
    match settings.driver {
        DriverKind::File | DriverKind::Memory => open_storage(settings, None),
        _ => {
            let client = Client::try_default().await.map_err(keelson_kube::KubeError::from)?;
            open_storage(settings, Some(&client))
        }
    }
}

/// Connect to the cluster and build a deployer
pub async fn connect(settings: &Settings) -> Result<ClusterDeployer> {
    let client = Client::try_default().await.map_err(keelson_kube::KubeError::from)?;
    let cluster = Arc::new(KubeCluster::with_client(client.clone(), FIELD_MANAGER).await?);
    let tracker = Arc::new(PollingTracker::new(cluster.clone()));
    let storage = open_storage(settings, Some(&client))?;

    let ctx = DeployContext::new(settings.config.clone());
    let locker = Arc::new(ConfigMapLocker::new(
        client,
        settings.namespace.clone(),
        ctx.owner.clone(),
        settings.config.lock_lease_duration,
    ));
    tracing::debug!(owner = %ctx.owner, driver = ?settings.driver, "connected");

    Ok(Deployer::new(cluster, tracker, storage, locker, ctx))
}
