//! CLI commands

use std::path::{Path, PathBuf};

use crate::backend::Settings;
use crate::error::{CliError, Result};

pub mod deploy;
pub mod history;
pub mod plan;
pub mod rollback;
pub mod status;

/// Flags shared by every command
#[derive(Debug, Clone)]
pub struct Global {
    pub namespace: String,
    pub storage: String,
    pub config: Option<PathBuf>,
}

impl Global {
    pub fn settings(&self) -> Result<Settings> {
        Settings::load(&self.namespace, &self.storage, self.config.as_deref())
    }
}

/// Reject a bad release name before any IO
pub fn check_release_name(name: &str) -> Result<()> {
    keelson_core::validate_release_name(name).map_err(|e| CliError::validation(e.to_string()))
}

pub fn read_manifest(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| CliError::io_at(path, e))
}

/// Manifest plus optional CRD manifest, as one request
pub fn load_request(
    global: &Global,
    release: &str,
    manifest: &Path,
    crds: Option<&Path>,
) -> Result<keelson_kube::DeployRequest> {
    check_release_name(release)?;
    let mut request =
        keelson_kube::DeployRequest::new(release, &global.namespace, read_manifest(manifest)?);
    if let Some(crds) = crds {
        request = request.with_crds(read_manifest(crds)?);
    }
    Ok(request)
}
