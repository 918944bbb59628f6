//! Deploy configuration and the per-invocation context

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{KubeError, Result};

/// Field manager name for Server-Side Apply
pub const FIELD_MANAGER: &str = "keelson";

/// Tunables of a deploy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeployConfig {
    /// Upper bound on concurrent API calls within one step
    pub network_parallelism: usize,

    #[serde(with = "humantime_serde")]
    pub creation_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub readiness_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub deletion_timeout: Duration,

    /// Interval between tracker polls
    #[serde(with = "humantime_serde")]
    pub poll_period: Duration,

    /// Revisions kept per release, 0 keeps everything
    pub max_history: usize,

    pub lock_acquire_attempts: u32,

    #[serde(with = "humantime_serde")]
    pub lock_retry_backoff: Duration,

    pub lock_release_attempts: u32,

    #[serde(with = "humantime_serde")]
    pub lock_lease_duration: Duration,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            network_parallelism: 30,
            creation_timeout: Duration::from_secs(300),
            readiness_timeout: Duration::from_secs(300),
            deletion_timeout: Duration::from_secs(300),
            poll_period: Duration::from_secs(2),
            max_history: 10,
            lock_acquire_attempts: 30,
            lock_retry_backoff: Duration::from_secs(2),
            lock_release_attempts: 5,
            lock_lease_duration: Duration::from_secs(30),
        }
    }
}

impl DeployConfig {
    /// Load from a YAML file; missing keys keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DeployConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.network_parallelism == 0 {
            return Err(KubeError::InvalidConfig(
                "networkParallelism must be at least 1".to_string(),
            ));
        }
        if self.lock_acquire_attempts == 0 {
            return Err(KubeError::InvalidConfig(
                "lockAcquireAttempts must be at least 1".to_string(),
            ));
        }
        if self.poll_period.is_zero() {
            return Err(KubeError::InvalidConfig(
                "pollPeriod must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// State threaded through classify, plan and execute for one deploy
#[derive(Debug, Clone)]
pub struct DeployContext {
    pub config: DeployConfig,
    /// Server-Side Apply field manager
    pub field_manager: String,
    /// Lock holder identity
    pub owner: String,
}

impl DeployContext {
    pub fn new(config: DeployConfig) -> Self {
        Self {
            config,
            field_manager: FIELD_MANAGER.to_string(),
            owner: default_owner(),
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }
}

impl Default for DeployContext {
    fn default() -> Self {
        Self::new(DeployConfig::default())
    }
}

fn default_owner() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{}-{}", host, std::process::id())
}
