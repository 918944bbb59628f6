//! Deploy plan builder
//!
//! Turns a [`DeployClassification`] into an ordered [`Plan`]:
//!
//! 1. release namespace
//! 2. pending release record
//! 3. preloaded CRDs
//! 4. pre-hooks of the deploy event
//! 5. general resources
//! 6. post-hooks of the deploy event
//! 7. cleanup of orphans
//! 8. succeed the new release, supersede the previous one
//!
//! Phases 3 to 6 are split into weight groups run in ascending order. Within a group,
//! external dependencies are awaited first, then resources are recreated, created and
//! updated in batches, then tracked.

use keelson_core::{
    DeletePolicy, DeployType, ExternalDependency, Release, ReleaseStatus, Resource, ResourceId,
    resource::{has_delete_policy, hook_matches},
};
use std::collections::BTreeMap;

use crate::classifier::{ClassifiedResource, DeployClassification, ResourceStatus};
use crate::error::{KubeError, Result};
use crate::plan::{Operation, OperationKind, PhaseKind, Plan, Skipped};
use crate::tracker::TrackTarget;

/// What happens to one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Create,
    Recreate,
    Update,
    /// Track readiness without mutating
    Track,
}

impl Action {
    fn mutates(&self) -> bool {
        !matches!(self, Action::Track)
    }
}

enum Selection {
    Act(Action),
    Skip(String),
    /// Immutable change without a recreate policy
    Conflict,
}

/// A resource to delete if its readiness tracking fails
#[derive(Debug, Clone)]
pub struct CleanupCandidate {
    pub resource: Resource,
    /// Operation whose failure triggers the cleanup
    pub track_operation: String,
    /// Whether the resource runs on the pre event of the deploy
    pub pre: bool,
    /// Whether the resource runs on the post event of the deploy
    pub post: bool,
}

/// Output of [`DeployPlanBuilder::build`]
#[derive(Debug, Clone)]
pub struct BuiltPlan {
    pub plan: Plan,
    pub cleanup_on_failure: Vec<CleanupCandidate>,
}

/// Builds the plan of one deploy
pub struct DeployPlanBuilder<'a> {
    classification: &'a DeployClassification,
    deploy_type: DeployType,
    pending: &'a Release,
    succeeded: &'a Release,
    previous: Option<&'a Release>,
    supersede: Option<&'a Release>,
}

type Selected<'c> = Vec<(&'c ClassifiedResource, Selection)>;

/// Which part of the deploy a resource belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Partition {
    /// Namespace and CRDs
    Fixed,
    Hooks,
    General,
}

impl<'a> DeployPlanBuilder<'a> {
    pub fn new(
        classification: &'a DeployClassification,
        deploy_type: DeployType,
        pending: &'a Release,
        succeeded: &'a Release,
    ) -> Self {
        Self {
            classification,
            deploy_type,
            pending,
            succeeded,
            previous: None,
            supersede: None,
        }
    }

    /// Newest revision before this deploy, whatever its status
    pub fn previous(mut self, previous: Option<&'a Release>) -> Self {
        self.previous = previous;
        self
    }

    /// Deployed revision to mark superseded on success
    pub fn supersede(mut self, release: Option<&'a Release>) -> Self {
        self.supersede = release;
        self
    }

    fn previous_deployed(&self) -> bool {
        self.previous
            .is_some_and(|r| r.status == ReleaseStatus::Deployed)
    }

    pub fn build(&self) -> Result<BuiltPlan> {
        let classification = self.classification;
        let pre_event = self.deploy_type.pre_hook();
        let post_event = self.deploy_type.post_hook();

        let namespace = self.select(&classification.namespace, Partition::Fixed, false);
        let crds = self.select_all(classification.crds.iter(), |_| false, Partition::Fixed);
        let pre_hooks = self.select_all(
            classification
                .hooks
                .iter()
                .filter(|c| hook_matches(&c.local, pre_event)),
            |_| false,
            Partition::Hooks,
        );
        let general = self.select_all(classification.general.iter(), |_| false, Partition::General);
        let post_hooks = self.select_all(
            classification
                .hooks
                .iter()
                .filter(|c| hook_matches(&c.local, post_event)),
            |c| hook_matches(&c.local, pre_event),
            Partition::Hooks,
        );

        // CRDs and the namespace are never recreated
        let crd_conflicts = conflicts(std::iter::once(&namespace).chain(crds.iter()));
        if !crd_conflicts.is_empty() {
            return Err(KubeError::ImmutableConflicts {
                resources: crd_conflicts,
            });
        }
        let resource_conflicts = conflicts(pre_hooks.iter().chain(general.iter()).chain(post_hooks.iter()));
        if !resource_conflicts.is_empty() {
            return Err(KubeError::ImmutableConflicts {
                resources: resource_conflicts,
            });
        }

        let mut plan = Plan::new();
        let (orphans, kept): (Vec<&Resource>, Vec<&Resource>) = classification
            .orphans
            .iter()
            .partition(|r| !r.attrs.keep_on_deletion);
        for resource in kept {
            plan.skipped.push(Skipped {
                id: resource.id.clone(),
                reason: "kept by resource policy".to_string(),
            });
        }

        let mutates = std::iter::once(&namespace.1)
            .chain(crds.iter().map(|(_, s)| s))
            .chain(pre_hooks.iter().map(|(_, s)| s))
            .chain(general.iter().map(|(_, s)| s))
            .chain(post_hooks.iter().map(|(_, s)| s))
            .any(|s| matches!(s, Selection::Act(a) if a.mutates()))
            || !orphans.is_empty();
        let skip_up_to_date = self.previous_deployed() && !mutates;
        if skip_up_to_date {
            tracing::debug!("previous release deployed and nothing changed, skipping up-to-date resources");
        }

        let mut cleanup_on_failure = Vec::new();

        plan.push_phase(PhaseKind::Namespace, self.namespace_operations(namespace));
        plan.push_phase(
            PhaseKind::PendingRelease,
            vec![Operation::new(
                format!("create-release/{}", record_name(self.pending)),
                OperationKind::CreateReleaseRecord {
                    release: Box::new(self.pending.clone()),
                },
            )],
        );

        for (phase, selected) in [
            (PhaseKind::Crds, crds),
            (PhaseKind::PreHooks, pre_hooks),
            (PhaseKind::General, general),
            (PhaseKind::PostHooks, post_hooks),
        ] {
            let actions = self.resolve(selected, skip_up_to_date, &mut plan.skipped);
            let operations = self.weight_groups(phase, actions, &mut cleanup_on_failure);
            plan.push_phase(phase, operations);
        }

        plan.push_phase(PhaseKind::Cleanup, cleanup_operations(&orphans));
        plan.push_phase(PhaseKind::Finalize, self.finalize_operations()?);

        tracing::debug!(
            phases = plan.phases.len(),
            operations = plan.operations().count(),
            skipped = plan.skipped.len(),
            "plan built"
        );
        Ok(BuiltPlan {
            plan,
            cleanup_on_failure,
        })
    }

    fn select_all<'c>(
        &self,
        resources: impl Iterator<Item = &'c ClassifiedResource>,
        ran_in_pre: impl Fn(&ClassifiedResource) -> bool,
        partition: Partition,
    ) -> Selected<'c> {
        let mut selected: Selected<'c> = resources
            .map(|c| {
                let (_, selection) = self.select(c, partition, ran_in_pre(c));
                (c, selection)
            })
            .collect();
        selected.sort_by(|(a, _), (b, _)| a.local.id.cmp(&b.local.id));
        selected
    }

    /// Pick the action for one resource
    ///
    /// Hooks run on every deploy: an existing hook with a before-creation policy is
    /// recreated even when up to date. A hook that already ran in the pre phase counts
    /// as existing in the post phase. CRDs and the namespace ignore delete policies: an
    /// immutable change to them is always a conflict.
    fn select<'c>(
        &self,
        c: &'c ClassifiedResource,
        partition: Partition,
        ran_in_pre: bool,
    ) -> (&'c ClassifiedResource, Selection) {
        let hook = partition == Partition::Hooks;
        let recreate = partition != Partition::Fixed
            && has_delete_policy(&c.local, DeletePolicy::BeforeCreation);

        if ran_in_pre && c.status != ResourceStatus::Unsupported {
            let action = if has_delete_policy(&c.local, DeletePolicy::AfterSucceeded) {
                Action::Create
            } else if recreate {
                Action::Recreate
            } else {
                Action::Track
            };
            return (c, Selection::Act(action));
        }

        let selection = match c.status {
            ResourceStatus::Unsupported => {
                let reason = if self.previous_deployed() {
                    "type not served by the cluster, previously applied"
                } else {
                    "type not served by the cluster"
                };
                Selection::Skip(reason.to_string())
            }
            ResourceStatus::NonExisting => Selection::Act(Action::Create),
            _ if hook && recreate => Selection::Act(Action::Recreate),
            ResourceStatus::Outdated | ResourceStatus::OutdatedImmutable if recreate => {
                Selection::Act(Action::Recreate)
            }
            ResourceStatus::OutdatedImmutable => Selection::Conflict,
            ResourceStatus::Outdated => Selection::Act(Action::Update),
            ResourceStatus::UpToDate => Selection::Act(Action::Track),
        };
        (c, selection)
    }

    /// Drop skipped resources, recording why
    fn resolve<'c>(
        &self,
        selected: Selected<'c>,
        skip_up_to_date: bool,
        skipped: &mut Vec<Skipped>,
    ) -> Vec<(&'c ClassifiedResource, Action)> {
        let mut actions = Vec::new();
        for (c, selection) in selected {
            match selection {
                Selection::Act(Action::Track) if skip_up_to_date => skipped.push(Skipped {
                    id: c.local.id.clone(),
                    reason: "up to date".to_string(),
                }),
                Selection::Act(action) => actions.push((c, action)),
                Selection::Skip(reason) => skipped.push(Skipped {
                    id: c.local.id.clone(),
                    reason,
                }),
                Selection::Conflict => {}
            }
        }
        actions
    }

    /// The release namespace is re-tracked whenever it exists
    fn namespace_operations(&self, (c, selection): (&ClassifiedResource, Selection)) -> Vec<Operation> {
        let Selection::Act(action) = selection else {
            return Vec::new();
        };
        let target = c.local.clone();
        let mut operations = Vec::new();
        match action {
            Action::Create | Action::Recreate => operations.push(Operation::new(
                "create/namespace",
                OperationKind::Create {
                    targets: vec![target.clone()],
                },
            )),
            Action::Update => operations.push(Operation::new(
                "update/namespace",
                OperationKind::Update {
                    targets: vec![target.clone()],
                },
            )),
            Action::Track => {}
        }
        operations.push(Operation::new(
            "track-readiness/namespace",
            OperationKind::TrackReadiness {
                targets: vec![TrackTarget::from_resource(&target)],
            },
        ));
        operations
    }

    fn weight_groups(
        &self,
        phase: PhaseKind,
        actions: Vec<(&ClassifiedResource, Action)>,
        cleanup: &mut Vec<CleanupCandidate>,
    ) -> Vec<Operation> {
        let mut groups: BTreeMap<i32, Vec<(&ClassifiedResource, Action)>> = BTreeMap::new();
        for (c, action) in actions {
            groups.entry(c.local.attrs.weight).or_default().push((c, action));
        }

        let hooks = matches!(phase, PhaseKind::PreHooks | PhaseKind::PostHooks);
        let pre_event = self.deploy_type.pre_hook();
        let post_event = self.deploy_type.post_hook();
        let mut operations = Vec::new();

        for (weight, group) in groups {
            let op_id = |verb: &str| format!("{}/{}/w{}", verb, phase, weight);

            let mut dependencies: Vec<ExternalDependency> = group
                .iter()
                .flat_map(|(c, _)| {
                    c.local.attrs.external_dependencies.iter().map(move |dep| {
                        let mut dep = dep.clone();
                        if dep.namespace.is_none() {
                            dep.namespace = c.local.id.namespace.clone();
                        }
                        dep
                    })
                })
                .collect();
            dependencies.sort();
            dependencies.dedup();
            if !dependencies.is_empty() {
                operations.push(Operation::new(
                    op_id("track-external"),
                    OperationKind::TrackExternalDependencyReadiness {
                        dependencies,
                        namespace: self.pending.namespace.clone(),
                    },
                ));
            }

            for (verb, wanted) in [
                ("recreate", Action::Recreate),
                ("create", Action::Create),
                ("update", Action::Update),
            ] {
                let targets: Vec<Resource> = group
                    .iter()
                    .filter(|(_, a)| *a == wanted)
                    .map(|(c, _)| c.local.clone())
                    .collect();
                if targets.is_empty() {
                    continue;
                }
                let kind = match wanted {
                    Action::Recreate => OperationKind::Recreate { targets },
                    Action::Create => OperationKind::Create { targets },
                    _ => OperationKind::Update { targets },
                };
                operations.push(Operation::new(op_id(verb), kind));
            }

            let track_id = op_id("track-readiness");
            operations.push(Operation::new(
                track_id.clone(),
                OperationKind::TrackReadiness {
                    targets: group
                        .iter()
                        .map(|(c, _)| TrackTarget::from_resource(&c.local))
                        .collect(),
                },
            ));

            for (c, _) in &group {
                if has_delete_policy(&c.local, DeletePolicy::AfterFailed) {
                    cleanup.push(CleanupCandidate {
                        resource: c.local.clone(),
                        track_operation: track_id.clone(),
                        pre: hook_matches(&c.local, pre_event),
                        post: hook_matches(&c.local, post_event),
                    });
                }
            }

            if hooks {
                let succeeded: Vec<ResourceId> = group
                    .iter()
                    .filter(|(c, _)| has_delete_policy(&c.local, DeletePolicy::AfterSucceeded))
                    .map(|(c, _)| c.local.id.clone())
                    .collect();
                if !succeeded.is_empty() {
                    operations.push(Operation::new(
                        op_id("delete"),
                        OperationKind::Delete {
                            targets: succeeded.clone(),
                        },
                    ));
                    operations.push(Operation::new(
                        op_id("track-absence"),
                        OperationKind::TrackAbsence { targets: succeeded },
                    ));
                }
            }
        }

        operations
    }

    fn finalize_operations(&self) -> Result<Vec<Operation>> {
        let mut operations = vec![Operation::new(
            format!("succeed-release/{}", record_name(self.succeeded)),
            OperationKind::UpdateReleaseRecord {
                release: Box::new(self.succeeded.clone()),
            },
        )];

        if let Some(previous) = self.supersede
            && previous.status == ReleaseStatus::Deployed
            && previous.revision != self.succeeded.revision
        {
            let mut superseded = previous.clone();
            superseded.supersede()?;
            operations.push(Operation::new(
                format!("supersede-release/{}", record_name(previous)),
                OperationKind::UpdateReleaseRecord {
                    release: Box::new(superseded),
                },
            ));
        }
        Ok(operations)
    }
}

/// `web.v3`
pub(crate) fn record_name(release: &Release) -> String {
    format!("{}.v{}", release.name, release.revision)
}

fn conflicts<'c, 'x>(
    selected: impl Iterator<Item = &'x (&'c ClassifiedResource, Selection)>,
) -> Vec<String>
where
    'c: 'x,
{
    selected
        .filter(|(_, s)| matches!(s, Selection::Conflict))
        .map(|(c, _)| c.local.id.to_string())
        .collect()
}

fn cleanup_operations(orphans: &[&Resource]) -> Vec<Operation> {
    if orphans.is_empty() {
        return Vec::new();
    }
    let mut targets: Vec<ResourceId> = orphans.iter().map(|r| r.id.clone()).collect();
    targets.sort();
    vec![
        Operation::new(
            "delete/cleanup",
            OperationKind::Delete {
                targets: targets.clone(),
            },
        ),
        Operation::new("track-absence/cleanup", OperationKind::TrackAbsence { targets }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::OperationStatus;
    use keelson_core::ResourceClass;

    fn resource(yaml: &str, class: ResourceClass) -> Resource {
        Resource::from_yaml(yaml, class, "prod").unwrap()
    }

    fn config_map(name: &str, annotations: &str) -> Resource {
        resource(
            &format!(
                "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {}\n  annotations: {{{}}}\n",
                name, annotations
            ),
            ResourceClass::General,
        )
    }

    fn hook(name: &str, annotations: &str) -> Resource {
        resource(
            &format!(
                "apiVersion: batch/v1\nkind: Job\nmetadata:\n  name: {}\n  annotations: {{{}}}\nspec:\n  template: {{}}\n",
                name, annotations
            ),
            ResourceClass::Hook,
        )
    }

    fn crd(name: &str) -> Resource {
        resource(
            &format!(
                "apiVersion: apiextensions.k8s.io/v1\nkind: CustomResourceDefinition\nmetadata:\n  name: {}\n",
                name
            ),
            ResourceClass::StandaloneCrd,
        )
    }

    fn classified(local: Resource, status: ResourceStatus) -> ClassifiedResource {
        let live = match status {
            ResourceStatus::NonExisting | ResourceStatus::Unsupported => None,
            _ => Some(local.with_live_object(local.object.clone())),
        };
        ClassifiedResource {
            local,
            live,
            desired: None,
            status,
        }
    }

    fn classification(namespace: ResourceStatus) -> DeployClassification {
        DeployClassification {
            namespace: classified(Resource::release_namespace("prod").unwrap(), namespace),
            crds: Vec::new(),
            hooks: Vec::new(),
            general: Vec::new(),
            orphans: Vec::new(),
        }
    }

    fn releases(deploy_type: DeployType, revision: u32) -> (Release, Release) {
        let pending = Release::pending("web", "prod", revision, deploy_type, None);
        let succeeded = pending.succeeded().unwrap();
        (pending, succeeded)
    }

    fn deployed(revision: u32) -> Release {
        let mut rel = Release::pending("web", "prod", revision, DeployType::Initial, None);
        rel.succeed().unwrap();
        rel
    }

    fn op_ids(plan: &Plan) -> Vec<&str> {
        plan.operations().map(|op| op.id.as_str()).collect()
    }

    #[test]
    fn test_fresh_install_plan() {
        let mut c = classification(ResourceStatus::NonExisting);
        c.general
            .push(classified(config_map("settings", ""), ResourceStatus::NonExisting));
        c.hooks.push(classified(
            hook("notify", "helm.sh/hook: post-install"),
            ResourceStatus::NonExisting,
        ));
        let (pending, succeeded) = releases(DeployType::Initial, 1);

        let built = DeployPlanBuilder::new(&c, DeployType::Initial, &pending, &succeeded)
            .build()
            .unwrap();

        assert_eq!(
            op_ids(&built.plan),
            vec![
                "create/namespace",
                "track-readiness/namespace",
                "create-release/web.v1",
                "create/general/w0",
                "track-readiness/general/w0",
                "create/post-hooks/w0",
                "track-readiness/post-hooks/w0",
                "succeed-release/web.v1",
            ]
        );
        assert!(built
            .plan
            .operations()
            .all(|op| op.status == OperationStatus::Pending));
    }

    #[test]
    fn test_noop_upgrade_only_tracks() {
        let mut c = classification(ResourceStatus::UpToDate);
        c.general
            .push(classified(config_map("settings", ""), ResourceStatus::UpToDate));
        let previous = deployed(1);
        let (pending, succeeded) = releases(DeployType::Upgrade, 2);

        let built = DeployPlanBuilder::new(&c, DeployType::Upgrade, &pending, &succeeded)
            .previous(Some(&previous))
            .supersede(Some(&previous))
            .build()
            .unwrap();

        assert!(!built.plan.has_mutations());
        assert_eq!(
            op_ids(&built.plan),
            vec![
                "track-readiness/namespace",
                "create-release/web.v2",
                "succeed-release/web.v2",
                "supersede-release/web.v1",
            ]
        );
        assert_eq!(built.plan.skipped[0].reason, "up to date");
    }

    #[test]
    fn test_up_to_date_retracked_after_failed_release() {
        let mut c = classification(ResourceStatus::UpToDate);
        c.general
            .push(classified(config_map("settings", ""), ResourceStatus::UpToDate));
        let mut previous = Release::pending("web", "prod", 1, DeployType::Initial, None);
        previous.fail("boom").unwrap();
        let (pending, succeeded) = releases(DeployType::Install, 2);

        let built = DeployPlanBuilder::new(&c, DeployType::Install, &pending, &succeeded)
            .previous(Some(&previous))
            .build()
            .unwrap();

        assert!(built.plan.operation("track-readiness/general/w0").is_some());
        assert!(built.plan.operation("supersede-release/web.v1").is_none());
    }

    #[test]
    fn test_changed_resource_forces_tracking_of_up_to_date_ones() {
        let mut c = classification(ResourceStatus::UpToDate);
        c.general
            .push(classified(config_map("same", ""), ResourceStatus::UpToDate));
        c.general
            .push(classified(config_map("changed", ""), ResourceStatus::Outdated));
        let previous = deployed(1);
        let (pending, succeeded) = releases(DeployType::Upgrade, 2);

        let built = DeployPlanBuilder::new(&c, DeployType::Upgrade, &pending, &succeeded)
            .previous(Some(&previous))
            .build()
            .unwrap();

        let OperationKind::TrackReadiness { targets } =
            &built.plan.operation("track-readiness/general/w0").unwrap().kind
        else {
            panic!("expected a readiness operation");
        };
        assert_eq!(targets.len(), 2);
        let OperationKind::Update { targets } =
            &built.plan.operation("update/general/w0").unwrap().kind
        else {
            panic!("expected an update operation");
        };
        assert_eq!(targets[0].id.name, "changed");
    }

    #[test]
    fn test_hook_with_before_creation_is_recreated() {
        let mut c = classification(ResourceStatus::UpToDate);
        c.hooks.push(classified(
            hook(
                "migrate",
                "helm.sh/hook: pre-upgrade, helm.sh/hook-delete-policy: before-hook-creation",
            ),
            ResourceStatus::UpToDate,
        ));
        let previous = deployed(1);
        let (pending, succeeded) = releases(DeployType::Upgrade, 2);

        let built = DeployPlanBuilder::new(&c, DeployType::Upgrade, &pending, &succeeded)
            .previous(Some(&previous))
            .build()
            .unwrap();

        assert!(built.plan.operation("recreate/pre-hooks/w0").is_some());
        assert!(built.plan.operation("update/pre-hooks/w0").is_none());
    }

    #[test]
    fn test_immutable_without_recreate_aborts_listing_all() {
        let mut c = classification(ResourceStatus::UpToDate);
        c.general
            .push(classified(config_map("a", ""), ResourceStatus::OutdatedImmutable));
        c.general
            .push(classified(config_map("b", ""), ResourceStatus::OutdatedImmutable));
        let (pending, succeeded) = releases(DeployType::Upgrade, 2);

        let err = DeployPlanBuilder::new(&c, DeployType::Upgrade, &pending, &succeeded)
            .build()
            .unwrap_err();
        match err {
            KubeError::ImmutableConflicts { resources } => {
                assert_eq!(resources, vec!["prod/ConfigMap/a", "prod/ConfigMap/b"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_immutable_with_recreate_policy() {
        let mut c = classification(ResourceStatus::UpToDate);
        c.general.push(classified(
            config_map("a", "keelson.io/delete-policy: before-creation"),
            ResourceStatus::OutdatedImmutable,
        ));
        let (pending, succeeded) = releases(DeployType::Upgrade, 2);

        let built = DeployPlanBuilder::new(&c, DeployType::Upgrade, &pending, &succeeded)
            .build()
            .unwrap();
        assert!(built.plan.operation("recreate/general/w0").is_some());
        assert!(!built
            .plan
            .operations()
            .any(|op| matches!(op.kind, OperationKind::Update { .. })));
    }

    #[test]
    fn test_immutable_crd_always_aborts() {
        let mut c = classification(ResourceStatus::UpToDate);
        c.crds.push(classified(
            crd("widgets.example.com"),
            ResourceStatus::OutdatedImmutable,
        ));
        c.general
            .push(classified(config_map("a", ""), ResourceStatus::OutdatedImmutable));
        let (pending, succeeded) = releases(DeployType::Upgrade, 2);

        let err = DeployPlanBuilder::new(&c, DeployType::Upgrade, &pending, &succeeded)
            .build()
            .unwrap_err();
        assert!(
            matches!(err, KubeError::ImmutableConflicts { resources } if resources == vec!["CustomResourceDefinition/widgets.example.com"])
        );
    }

    #[test]
    fn test_immutable_crd_with_recreate_policy_still_aborts() {
        let mut c = classification(ResourceStatus::UpToDate);
        let widgets = resource(
            "apiVersion: apiextensions.k8s.io/v1\nkind: CustomResourceDefinition\nmetadata:\n  name: widgets.example.com\n  annotations:\n    keelson.io/delete-policy: before-creation\n",
            ResourceClass::StandaloneCrd,
        );
        assert!(has_delete_policy(&widgets, DeletePolicy::BeforeCreation));
        c.crds
            .push(classified(widgets, ResourceStatus::OutdatedImmutable));
        let (pending, succeeded) = releases(DeployType::Upgrade, 2);

        let err = DeployPlanBuilder::new(&c, DeployType::Upgrade, &pending, &succeeded)
            .build()
            .unwrap_err();
        match err {
            KubeError::ImmutableConflicts { resources } => {
                assert_eq!(resources, vec!["CustomResourceDefinition/widgets.example.com"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_weight_ordering() {
        let mut c = classification(ResourceStatus::UpToDate);
        c.general.push(classified(
            config_map("late", "keelson.io/weight: \"10\""),
            ResourceStatus::NonExisting,
        ));
        c.general.push(classified(
            config_map("early", "keelson.io/weight: \"-5\""),
            ResourceStatus::NonExisting,
        ));
        c.general
            .push(classified(config_map("middle", ""), ResourceStatus::NonExisting));
        let (pending, succeeded) = releases(DeployType::Initial, 1);

        let built = DeployPlanBuilder::new(&c, DeployType::Initial, &pending, &succeeded)
            .build()
            .unwrap();
        let general: Vec<&str> = built
            .plan
            .phase(PhaseKind::General)
            .unwrap()
            .operations
            .iter()
            .map(|op| op.id.as_str())
            .collect();
        assert_eq!(
            general,
            vec![
                "create/general/w-5",
                "track-readiness/general/w-5",
                "create/general/w0",
                "track-readiness/general/w0",
                "create/general/w10",
                "track-readiness/general/w10",
            ]
        );
    }

    #[test]
    fn test_orphans_cleaned_unless_kept() {
        let mut c = classification(ResourceStatus::UpToDate);
        c.orphans.push(config_map("old", ""));
        c.orphans
            .push(config_map("precious", "helm.sh/resource-policy: keep"));
        let previous = deployed(1);
        let (pending, succeeded) = releases(DeployType::Upgrade, 2);

        let built = DeployPlanBuilder::new(&c, DeployType::Upgrade, &pending, &succeeded)
            .previous(Some(&previous))
            .build()
            .unwrap();

        let cleanup = built.plan.phase(PhaseKind::Cleanup).unwrap();
        assert_eq!(cleanup.operations.len(), 2);
        match &cleanup.operations[0].kind {
            OperationKind::Delete { targets } => {
                assert_eq!(targets.len(), 1);
                assert_eq!(targets[0].name, "old");
            }
            other => panic!("unexpected operation {other:?}"),
        }
        assert!(matches!(cleanup.operations[1].kind, OperationKind::TrackAbsence { .. }));
        assert_eq!(built.plan.skipped[0].reason, "kept by resource policy");
    }

    #[test]
    fn test_hook_delete_policies() {
        let mut c = classification(ResourceStatus::UpToDate);
        c.hooks.push(classified(
            hook(
                "migrate",
                "helm.sh/hook: pre-upgrade, helm.sh/hook-delete-policy: \"hook-succeeded,hook-failed\"",
            ),
            ResourceStatus::NonExisting,
        ));
        let (pending, succeeded) = releases(DeployType::Upgrade, 2);

        let built = DeployPlanBuilder::new(&c, DeployType::Upgrade, &pending, &succeeded)
            .build()
            .unwrap();

        let ids: Vec<&str> = built
            .plan
            .phase(PhaseKind::PreHooks)
            .unwrap()
            .operations
            .iter()
            .map(|op| op.id.as_str())
            .collect();
        assert_eq!(
            ids,
            vec![
                "create/pre-hooks/w0",
                "track-readiness/pre-hooks/w0",
                "delete/pre-hooks/w0",
                "track-absence/pre-hooks/w0",
            ]
        );
        assert_eq!(built.cleanup_on_failure.len(), 1);
        let candidate = &built.cleanup_on_failure[0];
        assert_eq!(candidate.track_operation, "track-readiness/pre-hooks/w0");
        assert!(candidate.pre && !candidate.post);
    }

    #[test]
    fn test_hooks_of_other_events_ignored() {
        let mut c = classification(ResourceStatus::UpToDate);
        c.hooks.push(classified(
            hook("smoke", "helm.sh/hook: test"),
            ResourceStatus::NonExisting,
        ));
        let (pending, succeeded) = releases(DeployType::Upgrade, 2);

        let built = DeployPlanBuilder::new(&c, DeployType::Upgrade, &pending, &succeeded)
            .build()
            .unwrap();
        assert!(built.plan.phase(PhaseKind::PreHooks).is_none());
        assert!(built.plan.phase(PhaseKind::PostHooks).is_none());
    }

    #[test]
    fn test_hook_in_pre_and_post_exists_in_post() {
        let mut c = classification(ResourceStatus::UpToDate);
        c.hooks.push(classified(
            hook("both", "helm.sh/hook: \"pre-install,post-install\""),
            ResourceStatus::NonExisting,
        ));
        let (pending, succeeded) = releases(DeployType::Initial, 1);

        let built = DeployPlanBuilder::new(&c, DeployType::Initial, &pending, &succeeded)
            .build()
            .unwrap();
        assert!(built.plan.operation("create/pre-hooks/w0").is_some());
        assert!(built.plan.operation("recreate/post-hooks/w0").is_some());
    }

    #[test]
    fn test_unsupported_skipped() {
        let mut c = classification(ResourceStatus::UpToDate);
        c.general.push(classified(
            resource(
                "apiVersion: example.com/v1\nkind: Widget\nmetadata:\n  name: w\n",
                ResourceClass::General,
            ),
            ResourceStatus::Unsupported,
        ));
        let previous = deployed(1);
        let (pending, succeeded) = releases(DeployType::Upgrade, 2);

        let built = DeployPlanBuilder::new(&c, DeployType::Upgrade, &pending, &succeeded)
            .previous(Some(&previous))
            .build()
            .unwrap();
        assert!(built.plan.phase(PhaseKind::General).is_none());
        assert_eq!(
            built.plan.skipped[0].reason,
            "type not served by the cluster, previously applied"
        );
    }

    #[test]
    fn test_external_dependencies_tracked_first() {
        let mut c = classification(ResourceStatus::UpToDate);
        c.general.push(classified(
            config_map(
                "app",
                "db.external-dependency.keelson.io/resource: statefulset/postgres",
            ),
            ResourceStatus::NonExisting,
        ));
        let (pending, succeeded) = releases(DeployType::Initial, 1);

        let built = DeployPlanBuilder::new(&c, DeployType::Initial, &pending, &succeeded)
            .build()
            .unwrap();
        let general = &built.plan.phase(PhaseKind::General).unwrap().operations;
        match &general[0].kind {
            OperationKind::TrackExternalDependencyReadiness { dependencies, .. } => {
                assert_eq!(dependencies[0].name, "postgres");
                assert_eq!(dependencies[0].namespace.as_deref(), Some("prod"));
            }
            other => panic!("unexpected operation {other:?}"),
        }
        assert_eq!(general[1].id, "create/general/w0");
    }

    #[test]
    fn test_same_inputs_same_plan() {
        let mut c = classification(ResourceStatus::UpToDate);
        c.general
            .push(classified(config_map("b", ""), ResourceStatus::Outdated));
        c.general
            .push(classified(config_map("a", ""), ResourceStatus::NonExisting));
        let (pending, succeeded) = releases(DeployType::Upgrade, 2);

        let builder = DeployPlanBuilder::new(&c, DeployType::Upgrade, &pending, &succeeded);
        let first = builder.build().unwrap().plan.render();
        let second = builder.build().unwrap().plan.render();
        assert_eq!(first, second);
    }
}
