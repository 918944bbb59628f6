//! Release records and their status lifecycle

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::api::DynamicObject;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::annotations::HookType;
use crate::error::{CoreError, Result};

/// Owner label value on every stored record
pub const OWNER: &str = "keelson";

/// Maximum length of a release name
pub const MAX_RELEASE_NAME_LEN: usize = 53;

static RELEASE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("valid regex"));

/// Validate a release name (DNS-1123 label, at most 53 characters)
pub fn validate_release_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| CoreError::InvalidReleaseName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.len() > MAX_RELEASE_NAME_LEN {
        return Err(invalid("name is longer than 53 characters"));
    }
    if !RELEASE_NAME.is_match(name) {
        return Err(invalid(
            "must consist of lower case alphanumeric characters or '-', and start and end with an alphanumeric character",
        ));
    }
    Ok(())
}

/// Status of a release revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseStatus {
    #[default]
    Unknown,
    PendingInstall,
    PendingUpgrade,
    PendingRollback,
    Deployed,
    Failed,
    Superseded,
    Uninstalling,
    Uninstalled,
    Skipped,
}

impl ReleaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseStatus::Unknown => "unknown",
            ReleaseStatus::PendingInstall => "pending-install",
            ReleaseStatus::PendingUpgrade => "pending-upgrade",
            ReleaseStatus::PendingRollback => "pending-rollback",
            ReleaseStatus::Deployed => "deployed",
            ReleaseStatus::Failed => "failed",
            ReleaseStatus::Superseded => "superseded",
            ReleaseStatus::Uninstalling => "uninstalling",
            ReleaseStatus::Uninstalled => "uninstalled",
            ReleaseStatus::Skipped => "skipped",
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            ReleaseStatus::PendingInstall
                | ReleaseStatus::PendingUpgrade
                | ReleaseStatus::PendingRollback
        )
    }

    /// A terminal record is never mutated again, only pruned
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReleaseStatus::Deployed | ReleaseStatus::Failed | ReleaseStatus::Superseded
        )
    }

    /// Deployed now or at some point in the past
    pub fn is_successful(&self) -> bool {
        matches!(self, ReleaseStatus::Deployed | ReleaseStatus::Superseded)
    }
}

impl std::fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of deploy being performed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeployType {
    /// No release history at all
    Initial,
    /// History exists but nothing was ever deployed successfully
    Install,
    Upgrade,
    Rollback,
}

impl DeployType {
    pub fn pending_status(&self) -> ReleaseStatus {
        match self {
            DeployType::Initial | DeployType::Install => ReleaseStatus::PendingInstall,
            DeployType::Upgrade => ReleaseStatus::PendingUpgrade,
            DeployType::Rollback => ReleaseStatus::PendingRollback,
        }
    }

    pub fn pre_hook(&self) -> HookType {
        match self {
            DeployType::Initial | DeployType::Install => HookType::PreInstall,
            DeployType::Upgrade => HookType::PreUpgrade,
            DeployType::Rollback => HookType::PreRollback,
        }
    }

    pub fn post_hook(&self) -> HookType {
        match self {
            DeployType::Initial | DeployType::Install => HookType::PostInstall,
            DeployType::Upgrade => HookType::PostUpgrade,
            DeployType::Rollback => HookType::PostRollback,
        }
    }
}

impl std::fmt::Display for DeployType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeployType::Initial => "initial",
            DeployType::Install => "install",
            DeployType::Upgrade => "upgrade",
            DeployType::Rollback => "rollback",
        };
        f.write_str(s)
    }
}

/// One revision of a release
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    pub name: String,
    pub namespace: String,
    /// Monotonic per (name, namespace), starting at 1
    pub revision: u32,
    pub status: ReleaseStatus,
    pub first_deployed: DateTime<Utc>,
    pub last_deployed: DateTime<Utc>,
    #[serde(default)]
    pub hook_resources: Vec<DynamicObject>,
    #[serde(default)]
    pub general_resources: Vec<DynamicObject>,
    #[serde(default)]
    pub override_values: serde_json::Value,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Human-readable reason for the current status
    #[serde(default)]
    pub description: String,
}

impl Release {
    /// A new revision in the pending state matching `deploy_type`
    ///
    /// `first_deployed` is inherited from the previous revision when there is one.
    pub fn pending(
        name: impl Into<String>,
        namespace: impl Into<String>,
        revision: u32,
        deploy_type: DeployType,
        previous: Option<&Release>,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            namespace: namespace.into(),
            revision,
            status: deploy_type.pending_status(),
            first_deployed: previous.map(|p| p.first_deployed).unwrap_or(now),
            last_deployed: now,
            hook_resources: Vec::new(),
            general_resources: Vec::new(),
            override_values: serde_json::Value::Null,
            notes: None,
            labels: BTreeMap::new(),
            description: format!("{} in progress", deploy_type),
        }
    }

    /// Pending → Deployed
    pub fn succeed(&mut self) -> Result<()> {
        self.transition(ReleaseStatus::Deployed, |s| s.is_pending())?;
        self.last_deployed = Utc::now();
        self.description = "deploy complete".to_string();
        Ok(())
    }

    /// Pending → Failed
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(ReleaseStatus::Failed, |s| s.is_pending())?;
        self.description = reason.into();
        Ok(())
    }

    /// Deployed → Superseded
    pub fn supersede(&mut self) -> Result<()> {
        self.transition(ReleaseStatus::Superseded, |s| *s == ReleaseStatus::Deployed)?;
        self.description = "superseded by a newer revision".to_string();
        Ok(())
    }

    fn transition(&mut self, to: ReleaseStatus, allowed: impl Fn(&ReleaseStatus) -> bool) -> Result<()> {
        if !allowed(&self.status) {
            return Err(CoreError::IllegalTransition {
                revision: self.revision,
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }

    /// A copy of this pending release as it will look once deployed
    pub fn succeeded(&self) -> Result<Self> {
        let mut rel = self.clone();
        rel.succeed()?;
        Ok(rel)
    }

    /// Name of the storage object holding this revision
    pub fn storage_key(&self) -> String {
        storage_key(&self.name, self.revision)
    }

    /// Labels identifying this record in storage
    pub fn storage_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.labels.clone();
        labels.insert("owner".to_string(), OWNER.to_string());
        labels.insert("name".to_string(), self.name.clone());
        labels.insert("namespace".to_string(), self.namespace.clone());
        labels.insert("revision".to_string(), self.revision.to_string());
        labels.insert("status".to_string(), self.status.to_string());
        labels
    }
}

/// `keelson.release.v1.<name>.v<revision>`
pub fn storage_key(name: &str, revision: u32) -> String {
    format!("keelson.release.v1.{}.v{}", name, revision)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(revision: u32) -> Release {
        Release::pending("web", "prod", revision, DeployType::Upgrade, None)
    }

    #[test]
    fn test_release_name_validation() {
        assert!(validate_release_name("web-app").is_ok());
        assert!(validate_release_name("a1").is_ok());
        assert!(validate_release_name("").is_err());
        assert!(validate_release_name("Web").is_err());
        assert!(validate_release_name("-web").is_err());
        assert!(validate_release_name("web_app").is_err());
        assert!(validate_release_name(&"a".repeat(54)).is_err());
        assert!(validate_release_name(&"a".repeat(53)).is_ok());
    }

    #[test]
    fn test_pending_status_follows_deploy_type() {
        assert_eq!(
            Release::pending("web", "prod", 1, DeployType::Initial, None).status,
            ReleaseStatus::PendingInstall
        );
        assert_eq!(pending(2).status, ReleaseStatus::PendingUpgrade);
        assert_eq!(
            Release::pending("web", "prod", 3, DeployType::Rollback, None).status,
            ReleaseStatus::PendingRollback
        );
    }

    #[test]
    fn test_first_deployed_inherited() {
        let mut first = pending(1);
        first.first_deployed = DateTime::from_timestamp(1_000, 0).unwrap();
        let second = Release::pending("web", "prod", 2, DeployType::Upgrade, Some(&first));
        assert_eq!(second.first_deployed, first.first_deployed);
    }

    #[test]
    fn test_legal_transitions() {
        let mut rel = pending(1);
        rel.succeed().unwrap();
        assert_eq!(rel.status, ReleaseStatus::Deployed);
        rel.supersede().unwrap();
        assert_eq!(rel.status, ReleaseStatus::Superseded);

        let mut rel = pending(2);
        rel.fail("readiness timeout").unwrap();
        assert_eq!(rel.status, ReleaseStatus::Failed);
        assert_eq!(rel.description, "readiness timeout");
    }

    #[test]
    fn test_terminal_records_are_frozen() {
        let mut rel = pending(1);
        rel.fail("boom").unwrap();
        assert!(matches!(
            rel.succeed(),
            Err(CoreError::IllegalTransition { revision: 1, .. })
        ));
        assert!(rel.supersede().is_err());

        let mut rel = pending(2);
        assert!(rel.supersede().is_err());
        rel.succeed().unwrap();
        assert!(rel.fail("late").is_err());
    }

    #[test]
    fn test_storage_labels() {
        let rel = pending(4);
        let labels = rel.storage_labels();
        assert_eq!(labels["owner"], "keelson");
        assert_eq!(labels["name"], "web");
        assert_eq!(labels["revision"], "4");
        assert_eq!(labels["status"], "pending-upgrade");
        assert_eq!(rel.storage_key(), "keelson.release.v1.web.v4");
    }

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_string(&ReleaseStatus::PendingRollback).unwrap();
        assert_eq!(json, "\"pending-rollback\"");
        let rel = pending(1);
        let back: Release = serde_json::from_str(&serde_json::to_string(&rel).unwrap()).unwrap();
        assert_eq!(back.revision, 1);
        assert_eq!(back.status, ReleaseStatus::PendingUpgrade);
    }
}
