//! Kubernetes Secrets storage driver
//!
//! The default driver: one Secret of type `keelson.io/release.v1` per revision,
//! named `keelson.release.v1.<name>.v<revision>`.

use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use keelson_core::{Release, storage_key};
use kube::Client;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use std::collections::BTreeMap;

use super::{LabelSelector, StorageConfig, StorageDriver, encode_for_storage, parse_record, storage_labels};
use crate::error::{KubeError, Result};

const SECRET_TYPE: &str = "keelson.io/release.v1";

/// Kubernetes Secrets storage driver
pub struct SecretsDriver {
    client: Client,
    config: StorageConfig,
}

impl SecretsDriver {
    /// Create a new Secrets driver
    pub async fn new(config: StorageConfig) -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self { client, config })
    }

    /// Create with an existing client
    pub fn with_client(client: Client, config: StorageConfig) -> Self {
        Self { client, config }
    }

    /// Get the Secret API for a namespace
    fn secrets_api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Build a Secret from a release
    fn build_secret(&self, release: &Release) -> Result<Secret> {
        let encoded = encode_for_storage(release, self.config.compression)?;

        let mut data = BTreeMap::new();
        data.insert("release".to_string(), ByteString(encoded.into_bytes()));

        Ok(Secret {
            metadata: ObjectMeta {
                name: Some(release.storage_key()),
                namespace: Some(release.namespace.clone()),
                labels: Some(storage_labels(release, self.config.compression)),
                ..Default::default()
            },
            type_: Some(SECRET_TYPE.to_string()),
            data: Some(data),
            ..Default::default()
        })
    }

    /// Parse a release from a Secret
    fn parse_secret(&self, secret: &Secret) -> Result<Release> {
        let data = secret
            .data
            .as_ref()
            .and_then(|d| d.get("release"))
            .ok_or_else(|| KubeError::Storage("Secret missing 'release' data".to_string()))?;

        let encoded = std::str::from_utf8(&data.0)
            .map_err(|e| KubeError::Storage(format!("Invalid UTF-8 in secret: {}", e)))?;

        parse_record(encoded, secret.metadata.labels.as_ref(), self.config.compression)
    }
}

#[async_trait]
impl StorageDriver for SecretsDriver {
    async fn create(&self, release: &Release) -> Result<()> {
        let secret = self.build_secret(release)?;
        match self
            .secrets_api(&release.namespace)
            .create(&PostParams::default(), &secret)
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 => Err(KubeError::ReleaseAlreadyExists {
                name: release.name.clone(),
                namespace: release.namespace.clone(),
                revision: release.revision,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, release: &Release) -> Result<()> {
        let secret = self.build_secret(release)?;
        self.secrets_api(&release.namespace)
            .replace(&release.storage_key(), &PostParams::default(), &secret)
            .await?;
        Ok(())
    }

    async fn query(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<Release>> {
        let lp = ListParams::default().labels(&selector.to_string());
        let secrets = self.secrets_api(namespace).list(&lp).await?;

        let mut releases = Vec::with_capacity(secrets.items.len());
        for secret in &secrets.items {
            match self.parse_secret(secret) {
                Ok(release) => releases.push(release),
                Err(e) => tracing::warn!(
                    secret = secret.metadata.name.as_deref().unwrap_or_default(),
                    error = %e,
                    "skipping unreadable release record"
                ),
            }
        }
        Ok(releases)
    }

    async fn delete(&self, namespace: &str, name: &str, revision: u32) -> Result<()> {
        match self
            .secrets_api(namespace)
            .delete(&storage_key(name, revision), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keelson_core::DeployType;

    #[tokio::test]
    async fn test_secret_layout() {
        let client = Client::try_from(kube::Config::new("http://127.0.0.1:1".parse().unwrap())).unwrap();
        let driver = SecretsDriver::with_client(client, StorageConfig::default());
        let release = Release::pending("myapp", "default", 3, DeployType::Upgrade, None);

        let secret = driver.build_secret(&release).unwrap();
        assert_eq!(secret.metadata.name.as_deref(), Some("keelson.release.v1.myapp.v3"));
        assert_eq!(secret.type_.as_deref(), Some(SECRET_TYPE));
        let labels = secret.metadata.labels.as_ref().unwrap();
        assert_eq!(labels["status"], "pending-upgrade");
        assert_eq!(labels["compression"], "zstd");

        let parsed = driver.parse_secret(&secret).unwrap();
        assert_eq!(parsed.revision, 3);
    }
}
