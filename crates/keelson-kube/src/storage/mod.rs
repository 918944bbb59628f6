//! Storage drivers for persisting release records
//!
//! keelson supports multiple storage backends:
//! - **Secrets** (default): one Kubernetes Secret per revision
//! - **ConfigMap**: one ConfigMap per revision (less secure, but more accessible)
//! - **File**: local files (for development/testing)
//! - **Memory**: in-process store for tests
//!
//! Records are JSON, compressed (zstd by default) and base64 encoded, and carry the
//! labels `owner`, `name`, `namespace`, `revision` and `status` for selector queries.

mod configmap;
mod file;
mod memory;
mod secrets;

pub use configmap::ConfigMapDriver;
pub use file::FileDriver;
pub use memory::{MemoryDriver, OperationCounts};
pub use secrets::SecretsDriver;

use async_trait::async_trait;
use keelson_core::Release;
use keelson_core::release::OWNER;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{KubeError, Result};

/// Maximum size for a single Kubernetes Secret/ConfigMap (1MB - some overhead)
pub const MAX_RESOURCE_SIZE: usize = 1_000_000;

/// Label recording how the payload is compressed
const COMPRESSION_LABEL: &str = "compression";

/// Storage driver trait for release persistence
///
/// Implementations must be Send + Sync for use across async tasks.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Store a new revision, failing if it already exists
    async fn create(&self, release: &Release) -> Result<()>;

    /// Overwrite an existing revision
    async fn update(&self, release: &Release) -> Result<()>;

    /// All records in `namespace` whose labels match `selector`
    async fn query(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<Release>>;

    /// Remove one revision; removing an absent revision succeeds
    async fn delete(&self, namespace: &str, name: &str, revision: u32) -> Result<()>;
}

#[async_trait]
impl<S: StorageDriver + ?Sized> StorageDriver for Arc<S> {
    async fn create(&self, release: &Release) -> Result<()> {
        (**self).create(release).await
    }

    async fn update(&self, release: &Release) -> Result<()> {
        (**self).update(release).await
    }

    async fn query(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<Release>> {
        (**self).query(namespace, selector).await
    }

    async fn delete(&self, namespace: &str, name: &str, revision: u32) -> Result<()> {
        (**self).delete(namespace, name, revision).await
    }
}

/// Equality-based label selector
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector(BTreeMap<String, String>);

impl LabelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record of one release
    pub fn release(name: &str) -> Self {
        Self::new().with("owner", OWNER).with("name", name)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }
}

impl std::fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        f.write_str(&parts.join(","))
    }
}

/// Which backend holds the release records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    #[default]
    Secrets,
    ConfigMap,
    File,
    Memory,
}

impl std::str::FromStr for DriverKind {
    type Err = KubeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "secrets" | "secret" => Ok(Self::Secrets),
            "configmap" | "configmaps" => Ok(Self::ConfigMap),
            "file" => Ok(Self::File),
            "memory" => Ok(Self::Memory),
            other => Err(KubeError::InvalidConfig(format!(
                "unknown storage driver '{}', expected secrets, configmap, file or memory",
                other
            ))),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Compression method
    pub compression: CompressionMethod,
    pub driver: DriverKind,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            compression: CompressionMethod::Zstd { level: 3 },
            driver: DriverKind::Secrets,
        }
    }
}

/// Compression method for release data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    /// No compression
    None,

    /// Gzip compression (Helm-compatible)
    Gzip { level: u32 },

    /// Zstd compression (better ratio, faster)
    Zstd { level: i32 },
}

impl Default for CompressionMethod {
    fn default() -> Self {
        Self::Zstd { level: 3 }
    }
}

impl CompressionMethod {
    fn label(&self) -> &'static str {
        match self {
            CompressionMethod::None => "none",
            CompressionMethod::Gzip { .. } => "gzip",
            CompressionMethod::Zstd { .. } => "zstd",
        }
    }

    fn from_label(label: Option<&String>, fallback: CompressionMethod) -> CompressionMethod {
        match label.map(String::as_str) {
            Some("none") => CompressionMethod::None,
            Some("gzip") => CompressionMethod::Gzip { level: 6 },
            Some("zstd") => CompressionMethod::Zstd { level: 3 },
            _ => fallback,
        }
    }
}

/// Compress data using the configured method
#[must_use = "compression result should be used"]
pub fn compress(data: &[u8], method: CompressionMethod) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Gzip { level } => {
            use std::io::Write;
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::new(level));
            encoder
                .write_all(data)
                .map_err(|e| KubeError::Compression(e.to_string()))?;
            encoder
                .finish()
                .map_err(|e| KubeError::Compression(e.to_string()))
        }
        CompressionMethod::Zstd { level } => zstd::encode_all(std::io::Cursor::new(data), level)
            .map_err(|e| KubeError::Compression(e.to_string())),
    }
}

/// Decompress data
#[must_use = "decompression result should be used"]
pub fn decompress(data: &[u8], method: CompressionMethod) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Gzip { .. } => {
            use std::io::Read;
            let mut decoder = flate2::read::GzDecoder::new(data);
            let mut decompressed = Vec::new();
            decoder
                .read_to_end(&mut decompressed)
                .map_err(|e| KubeError::Compression(e.to_string()))?;
            Ok(decompressed)
        }
        CompressionMethod::Zstd { .. } => zstd::decode_all(std::io::Cursor::new(data))
            .map_err(|e| KubeError::Compression(e.to_string())),
    }
}

/// Encode data for storage (serialize + compress + base64), enforcing the size limit
#[must_use = "encoded data should be used for storage"]
pub fn encode_for_storage(release: &Release, compression: CompressionMethod) -> Result<String> {
    let json = serde_json::to_vec(release)?;
    let compressed = compress(&json, compression)?;
    let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &compressed);
    if encoded.len() > MAX_RESOURCE_SIZE {
        return Err(KubeError::ReleaseTooLarge {
            size: encoded.len(),
            max: MAX_RESOURCE_SIZE,
        });
    }
    Ok(encoded)
}

/// Decode data from storage (base64 + decompress + deserialize)
#[must_use = "decoded release should be used"]
pub fn decode_from_storage(data: &str, compression: CompressionMethod) -> Result<Release> {
    let decoded = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, data)
        .map_err(|e| KubeError::Serialization(format!("base64 decode error: {}", e)))?;
    let decompressed = decompress(&decoded, compression)?;
    Ok(serde_json::from_slice(&decompressed)?)
}

/// Labels applied to a stored record object
#[must_use = "labels should be applied to resources"]
pub fn storage_labels(
    release: &Release,
    compression: CompressionMethod,
) -> BTreeMap<String, String> {
    let mut labels = release.storage_labels();
    labels.insert(COMPRESSION_LABEL.to_string(), compression.label().to_string());
    labels
}

/// Decode a stored record using the compression named in its labels
fn parse_record(
    encoded: &str,
    labels: Option<&BTreeMap<String, String>>,
    fallback: CompressionMethod,
) -> Result<Release> {
    let compression =
        CompressionMethod::from_label(labels.and_then(|l| l.get(COMPRESSION_LABEL)), fallback);
    decode_from_storage(encoded, compression)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keelson_core::DeployType;

    fn test_release() -> Release {
        let mut release = Release::pending("web", "prod", 1, DeployType::Initial, None);
        release.notes = Some("Installation notes".to_string());
        release.labels.insert("team".to_string(), "core".to_string());
        release
    }

    #[test]
    fn test_compression_roundtrip_gzip() {
        let data = b"Hello, World! This is test data for compression.";
        let compressed = compress(data, CompressionMethod::Gzip { level: 6 }).unwrap();
        let decompressed = decompress(&compressed, CompressionMethod::Gzip { level: 6 }).unwrap();
        assert_eq!(data.as_slice(), decompressed.as_slice());
    }

    #[test]
    fn test_encode_decode_keeps_fields() {
        let release = test_release();
        let encoded = encode_for_storage(&release, CompressionMethod::default()).unwrap();
        let decoded = decode_from_storage(&encoded, CompressionMethod::default()).unwrap();

        assert_eq!(decoded.name, "web");
        assert_eq!(decoded.revision, 1);
        assert_eq!(decoded.notes.as_deref(), Some("Installation notes"));
        assert_eq!(decoded.labels.get("team").map(String::as_str), Some("core"));
    }

    #[test]
    fn test_decode_invalid_base64() {
        let result = decode_from_storage("not valid base64!!!", CompressionMethod::None);
        assert!(result.is_err());
    }

    #[test]
    fn test_compression_read_from_labels() {
        let release = test_release();
        let encoded = encode_for_storage(&release, CompressionMethod::Gzip { level: 6 }).unwrap();
        let labels = storage_labels(&release, CompressionMethod::Gzip { level: 6 });
        assert_eq!(labels["compression"], "gzip");

        let decoded =
            parse_record(&encoded, Some(&labels), CompressionMethod::Zstd { level: 3 }).unwrap();
        assert_eq!(decoded.revision, 1);
    }

    #[test]
    fn test_label_selector() {
        let selector = LabelSelector::release("web");
        assert_eq!(selector.to_string(), "name=web,owner=keelson");

        let labels = storage_labels(&test_release(), CompressionMethod::None);
        assert!(selector.matches(&labels));
        assert!(!LabelSelector::release("api").matches(&labels));
    }

    #[test]
    fn test_driver_kind_parse() {
        assert_eq!("configmap".parse::<DriverKind>().unwrap(), DriverKind::ConfigMap);
        assert!("sql".parse::<DriverKind>().is_err());
    }
}
