//! Annotation registry with Helm compatibility
//!
//! Every annotation on a resource is resolved exactly once, when the resource is
//! constructed, into a closed set of [`Annotation`] variants. Keys are matched against a
//! static registry of parsers. Both `keelson.io/*` and `helm.sh/*` keys are understood so
//! that existing Helm charts deploy unchanged.
//!
//! Parsing is total: a malformed value, or an unknown key inside the `keelson.io`
//! domain, is a validation error. Foreign annotations are ignored.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// keelson-native annotations
pub mod keelson {
    /// Annotation domain, used to detect unknown keys
    pub const DOMAIN: &str = "keelson.io";
    /// Ordering weight for hooks and general resources
    pub const WEIGHT: &str = "keelson.io/weight";
    /// Delete policy (before-creation, succeeded, failed)
    pub const DELETE_POLICY: &str = "keelson.io/delete-policy";
    /// What a tracking failure of this resource does to the deploy
    pub const FAIL_MODE: &str = "keelson.io/fail-mode";
    /// Whether the deploy waits for this resource to become ready
    pub const TRACK_TERMINATION_MODE: &str = "keelson.io/track-termination-mode";
    /// Maximum time without progress while tracking
    pub const NO_ACTIVITY_TIMEOUT: &str = "keelson.io/no-activity-timeout";
    /// Suffix of `<id>.external-dependency.keelson.io/resource`
    pub const EXTERNAL_DEPENDENCY_RESOURCE_SUFFIX: &str = ".external-dependency.keelson.io/resource";
    /// Suffix of `<id>.external-dependency.keelson.io/namespace`
    pub const EXTERNAL_DEPENDENCY_NAMESPACE_SUFFIX: &str =
        ".external-dependency.keelson.io/namespace";
}

/// Helm-compatible annotations (for migration)
pub mod helm {
    /// Hook events annotation
    pub const HOOK: &str = "helm.sh/hook";
    /// Hook weight for ordering
    pub const HOOK_WEIGHT: &str = "helm.sh/hook-weight";
    /// Hook delete policy
    pub const HOOK_DELETE_POLICY: &str = "helm.sh/hook-delete-policy";
    /// Resource policy (keep on deletion)
    pub const RESOURCE_POLICY: &str = "helm.sh/resource-policy";
}

/// Lifecycle event a hook is attached to
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum HookType {
    PreInstall,
    PostInstall,
    PreUpgrade,
    PostUpgrade,
    PreRollback,
    PostRollback,
    PreDelete,
    PostDelete,
    Test,
}

impl HookType {
    /// Parse a single hook event name
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "pre-install" => Self::PreInstall,
            "post-install" => Self::PostInstall,
            "pre-upgrade" => Self::PreUpgrade,
            "post-upgrade" => Self::PostUpgrade,
            "pre-rollback" => Self::PreRollback,
            "post-rollback" => Self::PostRollback,
            "pre-delete" => Self::PreDelete,
            "post-delete" => Self::PostDelete,
            // test-success is the Helm 2 spelling
            "test" | "test-success" => Self::Test,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreInstall => "pre-install",
            Self::PostInstall => "post-install",
            Self::PreUpgrade => "pre-upgrade",
            Self::PostUpgrade => "post-upgrade",
            Self::PreRollback => "pre-rollback",
            Self::PostRollback => "post-rollback",
            Self::PreDelete => "pre-delete",
            Self::PostDelete => "post-delete",
            Self::Test => "test",
        }
    }

    /// Is this a "pre" event (before the main resources)?
    pub fn is_pre(&self) -> bool {
        matches!(
            self,
            Self::PreInstall | Self::PreUpgrade | Self::PreRollback | Self::PreDelete
        )
    }

    /// Is this a "post" event (after the main resources)?
    pub fn is_post(&self) -> bool {
        matches!(
            self,
            Self::PostInstall | Self::PostUpgrade | Self::PostRollback | Self::PostDelete
        )
    }
}

impl std::fmt::Display for HookType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When a resource is deleted relative to its own lifecycle
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum DeletePolicy {
    /// Delete an existing instance before creating it again
    BeforeCreation,
    /// Delete once it became ready
    AfterSucceeded,
    /// Delete if tracking it failed
    AfterFailed,
}

impl DeletePolicy {
    fn parse_keelson(value: &str) -> Option<Self> {
        Some(match value {
            "before-creation" => Self::BeforeCreation,
            "succeeded" => Self::AfterSucceeded,
            "failed" => Self::AfterFailed,
            _ => return None,
        })
    }

    fn parse_helm(value: &str) -> Option<Self> {
        Some(match value {
            "before-hook-creation" => Self::BeforeCreation,
            "hook-succeeded" => Self::AfterSucceeded,
            "hook-failed" => Self::AfterFailed,
            _ => return None,
        })
    }
}

/// What a tracking failure of the resource does to the deploy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailMode {
    /// Fail the whole deploy (default)
    #[default]
    FailWholeDeploy,
    /// Log the failure and carry on
    IgnoreAndContinue,
}

/// Whether the deploy waits for the resource to become ready
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrackTerminationMode {
    /// Block until ready (default)
    #[default]
    WaitUntilReady,
    /// Do not wait for readiness
    NonBlocking,
}

/// Reference to a resource outside the release that must be ready first
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExternalDependency {
    /// Identifier shared by the `resource`/`namespace` annotation pair
    pub id: String,
    /// Resource kind as written by the user (case-insensitive)
    pub kind: String,
    /// API version, empty when the kind alone should be resolved
    pub version: String,
    /// API group, empty for the core group or when unresolved
    pub group: String,
    pub name: String,
    /// Namespace; `None` means the dependent resource's own namespace
    pub namespace: Option<String>,
}

/// A parsed annotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Annotation {
    Weight(i32),
    HookWeight(i32),
    Hook(BTreeSet<HookType>),
    HookDeletePolicy(BTreeSet<DeletePolicy>),
    DeletePolicy(BTreeSet<DeletePolicy>),
    ResourcePolicyKeep(bool),
    ExternalDependencyResource {
        id: String,
        kind: String,
        version: String,
        group: String,
        name: String,
    },
    ExternalDependencyNamespace {
        id: String,
        namespace: String,
    },
    FailMode(FailMode),
    TrackTerminationMode(TrackTerminationMode),
    NoActivityTimeout(Duration),
}

/// How a registry entry recognizes its key
enum KeyMatcher {
    Exact(&'static str),
    /// `<id><suffix>`, the id is handed to the parser
    Suffix(&'static str),
}

type ParseFn = fn(id: &str, value: &str) -> std::result::Result<Annotation, String>;

struct Entry {
    matcher: KeyMatcher,
    parse: ParseFn,
}

static REGISTRY: &[Entry] = &[
    Entry {
        matcher: KeyMatcher::Exact(keelson::WEIGHT),
        parse: |_, v| parse_int(v).map(Annotation::Weight),
    },
    Entry {
        matcher: KeyMatcher::Exact(helm::HOOK_WEIGHT),
        parse: |_, v| parse_int(v).map(Annotation::HookWeight),
    },
    Entry {
        matcher: KeyMatcher::Exact(helm::HOOK),
        parse: |_, v| parse_hook_types(v).map(Annotation::Hook),
    },
    Entry {
        matcher: KeyMatcher::Exact(helm::HOOK_DELETE_POLICY),
        parse: |_, v| {
            parse_policy_list(v, DeletePolicy::parse_helm).map(Annotation::HookDeletePolicy)
        },
    },
    Entry {
        matcher: KeyMatcher::Exact(keelson::DELETE_POLICY),
        parse: |_, v| {
            parse_policy_list(v, DeletePolicy::parse_keelson).map(Annotation::DeletePolicy)
        },
    },
    Entry {
        matcher: KeyMatcher::Exact(helm::RESOURCE_POLICY),
        parse: |_, v| match v.trim() {
            "keep" => Ok(Annotation::ResourcePolicyKeep(true)),
            "delete" | "" => Ok(Annotation::ResourcePolicyKeep(false)),
            other => Err(format!("expected \"keep\" or \"delete\", got {:?}", other)),
        },
    },
    Entry {
        matcher: KeyMatcher::Exact(keelson::FAIL_MODE),
        parse: |_, v| match v.trim() {
            "FailWholeDeployProcessImmediately" | "fail-whole-deploy" => {
                Ok(Annotation::FailMode(FailMode::FailWholeDeploy))
            }
            "IgnoreAndContinueDeployProcess" | "ignore-and-continue" => {
                Ok(Annotation::FailMode(FailMode::IgnoreAndContinue))
            }
            other => Err(format!("unknown fail mode {:?}", other)),
        },
    },
    Entry {
        matcher: KeyMatcher::Exact(keelson::TRACK_TERMINATION_MODE),
        parse: |_, v| match v.trim() {
            "WaitUntilResourceReady" | "wait-until-ready" => Ok(
                Annotation::TrackTerminationMode(TrackTerminationMode::WaitUntilReady),
            ),
            "NonBlocking" | "non-blocking" => Ok(Annotation::TrackTerminationMode(
                TrackTerminationMode::NonBlocking,
            )),
            other => Err(format!("unknown track termination mode {:?}", other)),
        },
    },
    Entry {
        matcher: KeyMatcher::Exact(keelson::NO_ACTIVITY_TIMEOUT),
        parse: |_, v| {
            parse_duration(v)
                .map(Annotation::NoActivityTimeout)
                .ok_or_else(|| "expected a duration like 30s, 5m or 1h".to_string())
        },
    },
    Entry {
        matcher: KeyMatcher::Suffix(keelson::EXTERNAL_DEPENDENCY_RESOURCE_SUFFIX),
        parse: parse_external_dependency_resource,
    },
    Entry {
        matcher: KeyMatcher::Suffix(keelson::EXTERNAL_DEPENDENCY_NAMESPACE_SUFFIX),
        parse: |id, v| {
            let namespace = v.trim();
            if namespace.is_empty() {
                return Err("namespace must not be empty".to_string());
            }
            Ok(Annotation::ExternalDependencyNamespace {
                id: id.to_string(),
                namespace: namespace.to_string(),
            })
        },
    },
];

/// Resolve every annotation of a resource through the registry
pub fn parse_annotations(annotations: &BTreeMap<String, String>) -> Result<Vec<Annotation>> {
    let mut parsed = Vec::with_capacity(annotations.len());

    for (key, value) in annotations {
        let invalid = |reason: String| CoreError::InvalidAnnotation {
            key: key.clone(),
            value: value.clone(),
            reason,
        };

        match lookup(key) {
            Some((entry, id)) => parsed.push((entry.parse)(id, value).map_err(invalid)?),
            None if in_keelson_domain(key) => {
                return Err(invalid("unknown keelson annotation".to_string()));
            }
            None => {}
        }
    }

    Ok(parsed)
}

fn lookup(key: &str) -> Option<(&'static Entry, &str)> {
    REGISTRY.iter().find_map(|entry| match entry.matcher {
        KeyMatcher::Exact(exact) if key == exact => Some((entry, "")),
        KeyMatcher::Suffix(suffix) => key
            .strip_suffix(suffix)
            .filter(|id| is_valid_id(id))
            .map(|id| (entry, id)),
        _ => None,
    })
}

fn in_keelson_domain(key: &str) -> bool {
    key.split_once('/')
        .map(|(prefix, _)| prefix == keelson::DOMAIN || prefix.ends_with(".keelson.io"))
        .unwrap_or(false)
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn parse_int(value: &str) -> std::result::Result<i32, String> {
    value
        .trim()
        .parse()
        .map_err(|_| "expected an integer".to_string())
}

/// Parse hook events from annotation value
fn parse_hook_types(value: &str) -> std::result::Result<BTreeSet<HookType>, String> {
    let mut hooks = BTreeSet::new();
    for part in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let hook = HookType::parse(part).ok_or_else(|| format!("unknown hook type {:?}", part))?;
        hooks.insert(hook);
    }
    if hooks.is_empty() {
        return Err("at least one hook type is required".to_string());
    }
    Ok(hooks)
}

fn parse_policy_list(
    value: &str,
    parse_one: fn(&str) -> Option<DeletePolicy>,
) -> std::result::Result<BTreeSet<DeletePolicy>, String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|p| parse_one(p).ok_or_else(|| format!("unknown delete policy {:?}", p)))
        .collect()
}

/// Parse `Kind[.version[.group]]/name`
fn parse_external_dependency_resource(
    id: &str,
    value: &str,
) -> std::result::Result<Annotation, String> {
    let (type_part, name) = value
        .trim()
        .split_once('/')
        .ok_or_else(|| "expected <kind>[.<version>.<group>]/<name>".to_string())?;

    if type_part.is_empty() || name.is_empty() || name.contains('/') {
        return Err("expected <kind>[.<version>.<group>]/<name>".to_string());
    }

    let mut parts = type_part.splitn(3, '.');
    let kind = parts.next().unwrap_or_default().to_string();
    let version = parts.next().unwrap_or_default().to_string();
    let group = parts.next().unwrap_or_default().to_string();

    Ok(Annotation::ExternalDependencyResource {
        id: id.to_string(),
        kind,
        version,
        group,
        name: name.to_string(),
    })
}

/// Parse timeout duration from string (e.g., "5m", "300s", "1h")
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let (num_str, unit) = if let Some(stripped) = value.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = value.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped, "h")
    } else {
        // Assume seconds if no unit
        (value, "s")
    };

    let num: u64 = num_str.parse().ok()?;

    match unit {
        "ms" => Some(Duration::from_millis(num)),
        "s" => Some(Duration::from_secs(num)),
        "m" => num.checked_mul(60).map(Duration::from_secs),
        "h" => num.checked_mul(3600).map(Duration::from_secs),
        _ => None,
    }
}
