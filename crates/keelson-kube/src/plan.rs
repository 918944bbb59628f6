//! Deploy plans and execution reports
//!
//! A [`Plan`] is an ordered list of phases, each an ordered list of operations. The
//! builder decides the order and batching; the executor only walks it and records
//! each operation's terminal status.

use keelson_core::{ExternalDependency, Release, Resource, ResourceId};
use kube::api::DynamicObject;
use serde::Serialize;
use std::fmt::Write as _;

use crate::tracker::TrackTarget;

/// Phases of a deploy, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseKind {
    Namespace,
    PendingRelease,
    Crds,
    PreHooks,
    General,
    PostHooks,
    Cleanup,
    Finalize,
    /// Failure plan: mark the release failed
    FailRelease,
    /// Failure plan: delete resources with an after-failed policy
    FailureCleanup,
}

impl PhaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseKind::Namespace => "namespace",
            PhaseKind::PendingRelease => "pending-release",
            PhaseKind::Crds => "crds",
            PhaseKind::PreHooks => "pre-hooks",
            PhaseKind::General => "general",
            PhaseKind::PostHooks => "post-hooks",
            PhaseKind::Cleanup => "cleanup",
            PhaseKind::Finalize => "finalize",
            PhaseKind::FailRelease => "fail-release",
            PhaseKind::FailureCleanup => "failure-cleanup",
        }
    }
}

impl std::fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal status of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What an operation does
///
/// Resource operations carry every target of their batch; the executor runs the
/// targets of one operation concurrently.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OperationKind {
    Create { targets: Vec<Resource> },
    /// Delete, wait for absence, create
    Recreate { targets: Vec<Resource> },
    Update { targets: Vec<Resource> },
    Delete { targets: Vec<ResourceId> },
    TrackReadiness { targets: Vec<TrackTarget> },
    TrackAbsence { targets: Vec<ResourceId> },
    /// Wait for resources outside the release, resolved at execution time
    TrackExternalDependencyReadiness {
        dependencies: Vec<ExternalDependency>,
        namespace: String,
    },
    CreateReleaseRecord { release: Box<Release> },
    /// Store the record as given, already transitioned
    UpdateReleaseRecord { release: Box<Release> },
}

impl OperationKind {
    /// Whether executing the operation changes the cluster or the history
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            OperationKind::Create { .. }
                | OperationKind::Recreate { .. }
                | OperationKind::Update { .. }
                | OperationKind::Delete { .. }
        )
    }

    /// References of every cluster object the operation touches
    pub fn target_ids(&self) -> Vec<&ResourceId> {
        match self {
            OperationKind::Create { targets }
            | OperationKind::Recreate { targets }
            | OperationKind::Update { targets } => targets.iter().map(|r| &r.id).collect(),
            OperationKind::Delete { targets } | OperationKind::TrackAbsence { targets } => {
                targets.iter().collect()
            }
            OperationKind::TrackReadiness { targets } => targets.iter().map(|t| &t.id).collect(),
            OperationKind::TrackExternalDependencyReadiness { .. }
            | OperationKind::CreateReleaseRecord { .. }
            | OperationKind::UpdateReleaseRecord { .. } => Vec::new(),
        }
    }

    fn describe(&self) -> String {
        let ids = |ids: Vec<&ResourceId>| {
            ids.iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        match self {
            OperationKind::TrackExternalDependencyReadiness {
                dependencies,
                namespace,
            } => dependencies
                .iter()
                .map(|d| {
                    format!(
                        "{}/{}/{}",
                        d.namespace.as_deref().unwrap_or(namespace),
                        d.kind,
                        d.name
                    )
                })
                .collect::<Vec<_>>()
                .join(", "),
            OperationKind::CreateReleaseRecord { release }
            | OperationKind::UpdateReleaseRecord { release } => {
                format!("{} revision {} ({})", release.name, release.revision, release.status)
            }
            other => ids(other.target_ids()),
        }
    }
}

/// One step of a plan
#[derive(Debug, Clone, Serialize)]
pub struct Operation {
    /// Stable identifier, unique within its plan
    pub id: String,
    #[serde(flatten)]
    pub kind: OperationKind,
    pub status: OperationStatus,
}

impl Operation {
    pub fn new(id: impl Into<String>, kind: OperationKind) -> Self {
        Self {
            id: id.into(),
            kind,
            status: OperationStatus::Pending,
        }
    }
}

/// A group of operations run in order
#[derive(Debug, Clone, Serialize)]
pub struct Phase {
    pub kind: PhaseKind,
    pub operations: Vec<Operation>,
}

/// A resource the plan leaves alone, with why
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Skipped {
    pub id: ResourceId,
    pub reason: String,
}

/// Ordered phases of a deploy
#[derive(Debug, Clone, Default, Serialize)]
pub struct Plan {
    pub phases: Vec<Phase>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<Skipped>,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a phase; empty phases are dropped
    pub fn push_phase(&mut self, kind: PhaseKind, operations: Vec<Operation>) {
        if !operations.is_empty() {
            self.phases.push(Phase { kind, operations });
        }
    }

    pub fn phase(&self, kind: PhaseKind) -> Option<&Phase> {
        self.phases.iter().find(|p| p.kind == kind)
    }

    /// Every operation in execution order
    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.phases.iter().flat_map(|p| p.operations.iter())
    }

    pub fn operation(&self, id: &str) -> Option<&Operation> {
        self.operations().find(|op| op.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// Whether any operation mutates the cluster
    pub fn has_mutations(&self) -> bool {
        self.operations().any(|op| op.kind.is_mutation())
    }

    /// Operations that ended in failure
    pub fn failed_operations(&self) -> impl Iterator<Item = &Operation> {
        self.operations()
            .filter(|op| op.status == OperationStatus::Failed)
    }

    /// Human-readable listing, one line per operation
    pub fn render(&self) -> String {
        let mut out = String::new();
        for phase in &self.phases {
            let _ = writeln!(out, "{}:", phase.kind);
            for op in &phase.operations {
                let _ = writeln!(out, "  [{}] {} {}", op.status, op.id, op.kind.describe());
            }
        }
        if !self.skipped.is_empty() {
            let _ = writeln!(out, "skipped:");
            for skipped in &self.skipped {
                let _ = writeln!(out, "  {} ({})", skipped.id, skipped.reason);
            }
        }
        out
    }
}

/// What an execution did to the cluster
#[derive(Debug, Clone, Default, Serialize)]
pub struct Report {
    pub created: Vec<(ResourceId, DynamicObject)>,
    pub recreated: Vec<(ResourceId, DynamicObject)>,
    pub updated: Vec<(ResourceId, DynamicObject)>,
    pub deleted: Vec<ResourceId>,
}

impl Report {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
            && self.recreated.is_empty()
            && self.updated.is_empty()
            && self.deleted.is_empty()
    }

    /// Fold another report into this one
    pub fn merge(&mut self, other: Report) {
        self.created.extend(other.created);
        self.recreated.extend(other.recreated);
        self.updated.extend(other.updated);
        self.deleted.extend(other.deleted);
    }

    /// One-line summary of the counts
    pub fn summary(&self) -> String {
        format!(
            "{} created, {} recreated, {} updated, {} deleted",
            self.created.len(),
            self.recreated.len(),
            self.updated.len(),
            self.deleted.len()
        )
    }
}
