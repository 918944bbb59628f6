//! ConfigMap storage driver
//!
//! Same layout as the Secrets driver, with the encoded record in `data.release`.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use keelson_core::{Release, storage_key};
use kube::Client;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use std::collections::BTreeMap;

use super::{LabelSelector, StorageConfig, StorageDriver, encode_for_storage, parse_record, storage_labels};
use crate::error::{KubeError, Result};

/// ConfigMap storage driver
pub struct ConfigMapDriver {
    client: Client,
    config: StorageConfig,
}

impl ConfigMapDriver {
    pub async fn new(config: StorageConfig) -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self { client, config })
    }

    pub fn with_client(client: Client, config: StorageConfig) -> Self {
        Self { client, config }
    }

    fn api(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn build_configmap(&self, release: &Release) -> Result<ConfigMap> {
        let encoded = encode_for_storage(release, self.config.compression)?;

        Ok(ConfigMap {
            metadata: ObjectMeta {
                name: Some(release.storage_key()),
                namespace: Some(release.namespace.clone()),
                labels: Some(storage_labels(release, self.config.compression)),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("release".to_string(), encoded)])),
            ..Default::default()
        })
    }

    fn parse_configmap(&self, cm: &ConfigMap) -> Result<Release> {
        let encoded = cm
            .data
            .as_ref()
            .and_then(|d| d.get("release"))
            .ok_or_else(|| KubeError::Storage("ConfigMap missing 'release' data".to_string()))?;
        parse_record(encoded, cm.metadata.labels.as_ref(), self.config.compression)
    }
}

#[async_trait]
impl StorageDriver for ConfigMapDriver {
    async fn create(&self, release: &Release) -> Result<()> {
        let cm = self.build_configmap(release)?;
        match self
            .api(&release.namespace)
            .create(&PostParams::default(), &cm)
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
        let cm = self.build_configmap(release)?;
        self.api(&release.namespace)
            .replace(&release.storage_key(), &PostParams::default(), &cm)
            .await?;
        Ok(())
    }

    async fn query(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<Release>> {
        let lp = ListParams::default().labels(&selector.to_string());
        let list = self.api(namespace).list(&lp).await?;

        let mut releases = Vec::with_capacity(list.items.len());
        for cm in &list.items {
            match self.parse_configmap(cm) {
                Ok(release) => releases.push(release),
                Err(e) => tracing::warn!(
                    configmap = cm.metadata.name.as_deref().unwrap_or_default(),
                    error = %e,
                    "skipping unreadable release record"
                ),
            }
        }
        Ok(releases)
    }

    async fn delete(&self, namespace: &str, name: &str, revision: u32) -> Result<()> {
        match self
            .api(namespace)
            .delete(&storage_key(name, revision), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
