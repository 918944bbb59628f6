//! Failure plan builder
//!
//! After a deploy plan fails, marks the pending release failed and removes resources
//! whose delete policy asks for it when their readiness tracking failed.

use keelson_core::{Release, ResourceClass, ResourceId};
use std::collections::HashSet;

use crate::error::Result;
use crate::plan::{Operation, OperationKind, OperationStatus, PhaseKind, Plan};
use crate::plan_builder::{CleanupCandidate, record_name};

/// Builds the secondary plan run after a failed deploy
pub struct FailurePlanBuilder<'a> {
    failed: &'a Plan,
    candidates: &'a [CleanupCandidate],
    pending: &'a Release,
    reason: String,
}

impl<'a> FailurePlanBuilder<'a> {
    /// `failed` is the executed deploy plan, with operation statuses filled in
    pub fn new(failed: &'a Plan, candidates: &'a [CleanupCandidate], pending: &'a Release) -> Self {
        Self {
            failed,
            candidates,
            pending,
            reason: "deploy failed".to_string(),
        }
    }

    /// Description stored on the failed release
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn build(&self) -> Result<Plan> {
        let mut failed_release = self.pending.clone();
        failed_release.fail(self.reason.clone())?;

        let mut plan = Plan::new();
        plan.push_phase(
            PhaseKind::FailRelease,
            vec![Operation::new(
                format!("fail-release/{}", record_name(self.pending)),
                OperationKind::UpdateReleaseRecord {
                    release: Box::new(failed_release),
                },
            )],
        );

        let targets = self.cleanup_targets();
        if !targets.is_empty() {
            tracing::info!(count = targets.len(), "cleaning up resources after failure");
            plan.push_phase(
                PhaseKind::FailureCleanup,
                vec![
                    Operation::new(
                        "delete/failure-cleanup",
                        OperationKind::Delete {
                            targets: targets.clone(),
                        },
                    ),
                    Operation::new(
                        "track-absence/failure-cleanup",
                        OperationKind::TrackAbsence { targets },
                    ),
                ],
            );
        }
        Ok(plan)
    }

    /// Candidates whose tracking failed, excluding CRDs, one per (id, pre, post)
    fn cleanup_targets(&self) -> Vec<ResourceId> {
        let failed_ops: HashSet<&str> = self
            .failed
            .operations()
            .filter(|op| op.status == OperationStatus::Failed)
            .map(|op| op.id.as_str())
            .collect();

        let mut seen = HashSet::new();
        let mut ids = HashSet::new();
        let mut targets = Vec::new();
        for candidate in self.candidates {
            let resource = &candidate.resource;
            if !failed_ops.contains(candidate.track_operation.as_str())
                || resource.class == ResourceClass::StandaloneCrd
                || resource.id.is_crd()
            {
                continue;
            }
            if !seen.insert((&resource.id, candidate.pre, candidate.post)) {
                continue;
            }
            // one delete per object even when it appears under several event flags
            if ids.insert(&resource.id) {
                targets.push(resource.id.clone());
            }
        }
        targets.sort();
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keelson_core::{DeployType, ReleaseStatus, Resource};

    fn job(name: &str) -> Resource {
        let yaml = format!(
            "apiVersion: batch/v1\nkind: Job\nmetadata:\n  name: {}\n  annotations:\n    helm.sh/hook: pre-upgrade\n    helm.sh/hook-delete-policy: hook-failed\nspec:\n  template: {{}}\n",
            name
        );
        Resource::from_yaml(&yaml, ResourceClass::Hook, "prod").unwrap()
    }

    fn crd() -> Resource {
        let yaml = "apiVersion: apiextensions.k8s.io/v1\nkind: CustomResourceDefinition\nmetadata:\n  name: widgets.example.com\n";
        Resource::from_yaml(yaml, ResourceClass::StandaloneCrd, "prod").unwrap()
    }

    fn candidate(resource: Resource, track_operation: &str, pre: bool, post: bool) -> CleanupCandidate {
        CleanupCandidate {
            resource,
            track_operation: track_operation.to_string(),
            pre,
            post,
        }
    }

    fn executed_plan(failed: &[&str]) -> Plan {
        let mut plan = Plan::new();
        let ops = ["track-readiness/pre-hooks/w0", "track-readiness/pre-hooks/w5"]
            .iter()
            .map(|id| {
                let mut op = Operation::new(*id, OperationKind::TrackReadiness { targets: Vec::new() });
                op.status = if failed.contains(id) {
                    OperationStatus::Failed
                } else {
                    OperationStatus::Completed
                };
                op
            })
            .collect();
        plan.push_phase(PhaseKind::PreHooks, ops);
        plan
    }

    fn pending() -> Release {
        Release::pending("web", "prod", 3, DeployType::Upgrade, None)
    }

    #[test]
    fn test_marks_release_failed() {
        let failed = executed_plan(&[]);
        let pending = pending();
        let plan = FailurePlanBuilder::new(&failed, &[], &pending)
            .reason("readiness timed out")
            .build()
            .unwrap();

        assert_eq!(plan.phases.len(), 1);
        let op = plan.operation("fail-release/web.v3").unwrap();
        match &op.kind {
            OperationKind::UpdateReleaseRecord { release } => {
                assert_eq!(release.status, ReleaseStatus::Failed);
                assert_eq!(release.description, "readiness timed out");
            }
            other => panic!("unexpected operation {other:?}"),
        }
    }

    #[test]
    fn test_only_failed_tracking_is_cleaned() {
        let failed = executed_plan(&["track-readiness/pre-hooks/w5"]);
        let pending = pending();
        let candidates = vec![
            candidate(job("passed"), "track-readiness/pre-hooks/w0", true, false),
            candidate(job("broken"), "track-readiness/pre-hooks/w5", true, false),
        ];
        let plan = FailurePlanBuilder::new(&failed, &candidates, &pending)
            .build()
            .unwrap();

        let cleanup = plan.phase(PhaseKind::FailureCleanup).unwrap();
        match &cleanup.operations[0].kind {
            OperationKind::Delete { targets } => {
                assert_eq!(targets.len(), 1);
                assert_eq!(targets[0].name, "broken");
            }
            other => panic!("unexpected operation {other:?}"),
        }
        assert_eq!(cleanup.operations[1].id, "track-absence/failure-cleanup");
    }

    #[test]
    fn test_crds_never_cleaned() {
        let failed = executed_plan(&["track-readiness/pre-hooks/w0"]);
        let pending = pending();
        let candidates = vec![candidate(crd(), "track-readiness/pre-hooks/w0", false, false)];
        let plan = FailurePlanBuilder::new(&failed, &candidates, &pending)
            .build()
            .unwrap();
        assert!(plan.phase(PhaseKind::FailureCleanup).is_none());
    }

    #[test]
    fn test_hook_on_both_events_deleted_once() {
        let failed = executed_plan(&["track-readiness/pre-hooks/w0"]);
        let pending = pending();
        let hook = job("migrate");
        let candidates = vec![
            candidate(hook.clone(), "track-readiness/pre-hooks/w0", true, true),
            candidate(hook.clone(), "track-readiness/pre-hooks/w0", true, true),
            candidate(hook, "track-readiness/pre-hooks/w0", true, false),
        ];
        let plan = FailurePlanBuilder::new(&failed, &candidates, &pending)
            .build()
            .unwrap();

        let delete = plan.operation("delete/failure-cleanup").unwrap();
        assert_eq!(delete.kind.target_ids().len(), 1);
    }

    #[test]
    fn test_already_failed_release_is_rejected() {
        let failed = executed_plan(&[]);
        let mut release = pending();
        release.fail("earlier").unwrap();
        assert!(FailurePlanBuilder::new(&failed, &[], &release).build().is_err());
    }
}
