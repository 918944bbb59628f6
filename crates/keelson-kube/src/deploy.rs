//! Deploy orchestration
//!
//! Ties the pieces together for one release:
//!
//! ```text
//! lock -> load history -> classify -> build plan -> execute -> prune history -> unlock
//!                                                        \-> failure plan ----/
//! ```
//!
//! Execution races the lock lease; when the lease is lost nothing else is attempted.

use keelson_core::{
    DeployType, DesiredResources, Origin, Release, Resource, ResourceClass,
    validate_release_name,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::instrument;

use crate::classifier::Classifier;
use crate::client::ClusterClient;
use crate::config::DeployContext;
use crate::error::{KubeError, Result};
use crate::executor::Executor;
use crate::failure::FailurePlanBuilder;
use crate::history::History;
use crate::lock::{LockGuard, LockManager, Locker};
use crate::plan::{OperationStatus, Plan, Report};
use crate::plan_builder::{BuiltPlan, DeployPlanBuilder};
use crate::storage::StorageDriver;
use crate::tracker::Tracker;

/// Pre-rendered manifests to deploy as a release
#[derive(Debug, Clone, Default)]
pub struct DeployRequest {
    pub name: String,
    pub namespace: String,
    /// Multi-document YAML of hooks and general resources
    pub manifest: String,
    /// Multi-document YAML of CRDs applied before everything else
    pub crd_manifest: Option<String>,
    pub notes: Option<String>,
}

impl DeployRequest {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, manifest: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            manifest: manifest.into(),
            ..Default::default()
        }
    }

    pub fn with_crds(mut self, crd_manifest: impl Into<String>) -> Self {
        self.crd_manifest = Some(crd_manifest.into());
        self
    }
}

/// Result of a successful deploy
#[derive(Debug, Clone, Serialize)]
pub struct DeployOutcome {
    pub deploy_type: DeployType,
    /// The release as stored after success
    pub release: Release,
    /// Executed plan with every operation completed
    pub plan: Plan,
    pub report: Report,
    /// Revisions removed by history trimming
    pub pruned: Vec<u32>,
}

/// What a deploy would do, without doing it
#[derive(Debug, Clone, Serialize)]
pub struct DeployPreview {
    pub deploy_type: DeployType,
    pub release: Release,
    pub plan: Plan,
}

struct Prepared {
    deploy_type: DeployType,
    pending: Release,
    succeeded: Release,
    built: BuiltPlan,
}

/// Deploys releases
pub struct Deployer<C: ?Sized, T: ?Sized, S: ?Sized, L: ?Sized> {
    client: Arc<C>,
    tracker: Arc<T>,
    storage: Arc<S>,
    locks: LockManager<L>,
    ctx: DeployContext,
}

impl<C, T, S, L> Deployer<C, T, S, L>
where
    C: ClusterClient + ?Sized,
    T: Tracker + ?Sized,
    S: StorageDriver + ?Sized,
    L: Locker + ?Sized,
{
    pub fn new(client: Arc<C>, tracker: Arc<T>, storage: Arc<S>, locker: Arc<L>, ctx: DeployContext) -> Self {
        let locks = LockManager::new(locker, &ctx.config);
        Self {
            client,
            tracker,
            storage,
            locks,
            ctx,
        }
    }

    pub fn context(&self) -> &DeployContext {
        &self.ctx
    }

    /// Load the history of a release
    pub async fn history(&self, name: &str, namespace: &str) -> Result<History<S>> {
        History::load(self.storage.clone(), name, namespace).await
    }

    /// Deploy `request` as the next revision of its release
    #[instrument(skip_all, fields(release = %request.name, namespace = %request.namespace))]
    pub async fn deploy(&self, request: &DeployRequest) -> Result<DeployOutcome> {
        validate_release_name(&request.name)?;
        let guard = self.locks.lock_release(&request.name).await?;

        let result: Result<DeployOutcome> = async {
            let history = self.history(&request.name, &request.namespace).await?;
            let desired = DesiredResources::from_manifests(
                &request.manifest,
                request.crd_manifest.as_deref(),
                &request.namespace,
            )?;
            let deploy_type = deploy_type_for(&history);
            self.run(&guard, &history, &desired, deploy_type, request.notes.clone())
                .await
        }
        .await;

        self.finish(guard, result).await
    }

    /// Classify and build the plan of `request` without locking or executing
    #[instrument(skip_all, fields(release = %request.name, namespace = %request.namespace))]
    pub async fn plan_only(&self, request: &DeployRequest) -> Result<DeployPreview> {
        validate_release_name(&request.name)?;
        let history = self.history(&request.name, &request.namespace).await?;
        let desired = DesiredResources::from_manifests(
            &request.manifest,
            request.crd_manifest.as_deref(),
            &request.namespace,
        )?;
        let prepared = self
            .prepare(&history, &desired, deploy_type_for(&history), request.notes.clone())
            .await?;
        Ok(DeployPreview {
            deploy_type: prepared.deploy_type,
            release: prepared.pending,
            plan: prepared.built.plan,
        })
    }

    /// Redeploy the resources of an earlier revision
    ///
    /// Without `revision`, targets the last deployed release other than the newest one.
    #[instrument(skip(self))]
    pub async fn rollback(&self, name: &str, namespace: &str, revision: Option<u32>) -> Result<DeployOutcome> {
        validate_release_name(name)?;
        let guard = self.locks.lock_release(name).await?;

        let result: Result<DeployOutcome> = async {
            let history = self.history(name, namespace).await?;
            let target = match revision {
                Some(revision) => history.release(revision),
                None => history.last_deployed_release_except_last_release(),
            }
            .ok_or_else(|| KubeError::NoRollbackTarget {
                name: name.to_string(),
                revision,
            })?;
            tracing::info!(revision = target.revision, "rolling back");

            let desired = stored_resources(&target)?;
            let notes = Some(format!("rollback to revision {}", target.revision));
            self.run(&guard, &history, &desired, DeployType::Rollback, notes)
                .await
        }
        .await;

        self.finish(guard, result).await
    }

    /// Release the lock unless it was lost
    async fn finish(&self, guard: LockGuard, result: Result<DeployOutcome>) -> Result<DeployOutcome> {
        if guard.is_lost() {
            tracing::error!(lock = %guard.name(), "lock lost, stopping without further changes");
            return result;
        }
        self.locks.unlock(guard).await;
        result
    }

    async fn prepare(
        &self,
        history: &History<S>,
        desired: &DesiredResources,
        deploy_type: DeployType,
        notes: Option<String>,
    ) -> Result<Prepared> {
        let previous = history.last_release();
        let deployed = history.last_deployed_release();
        if let Some(previous) = &previous
            && previous.status.is_pending()
        {
            tracing::warn!(
                revision = previous.revision,
                status = %previous.status,
                "previous revision was left pending"
            );
        }

        let namespace = Resource::release_namespace(history.namespace())?;
        let classification = Classifier::new(self.client.as_ref(), &self.ctx)
            .classify_deploy(&namespace, desired, previous.as_ref())
            .await?;

        let mut pending = Release::pending(
            history.name(),
            history.namespace(),
            history.next_revision(),
            deploy_type,
            previous.as_ref(),
        );
        pending.general_resources = desired.general.iter().map(|r| r.object.clone()).collect();
        pending.hook_resources = desired.hooks.iter().map(|r| r.object.clone()).collect();
        pending.notes = notes;
        let succeeded = pending.succeeded()?;

        let built = DeployPlanBuilder::new(&classification, deploy_type, &pending, &succeeded)
            .previous(previous.as_ref())
            .supersede(deployed.as_ref())
            .build()?;

        tracing::info!(
            revision = pending.revision,
            %deploy_type,
            operations = built.plan.operations().count(),
            "plan built"
        );
        Ok(Prepared {
            deploy_type,
            pending,
            succeeded,
            built,
        })
    }

    async fn run(
        &self,
        guard: &LockGuard,
        history: &History<S>,
        desired: &DesiredResources,
        deploy_type: DeployType,
        notes: Option<String>,
    ) -> Result<DeployOutcome> {
        let Prepared {
            deploy_type,
            pending,
            succeeded,
            built,
        } = self.prepare(history, desired, deploy_type, notes).await?;
        let BuiltPlan {
            mut plan,
            cleanup_on_failure,
        } = built;

        let mut report = Report::default();
        let error = match self.execute(guard, history, &mut plan, &mut report).await {
            Ok(()) => {
                let pruned = match history.prune(self.ctx.config.max_history).await {
                    Ok(pruned) => pruned,
                    Err(e) => {
                        tracing::warn!(error = %e, "could not trim release history");
                        Vec::new()
                    }
                };
                tracing::info!(revision = succeeded.revision, summary = %report.summary(), "deploy succeeded");
                return Ok(DeployOutcome {
                    deploy_type,
                    release: succeeded,
                    plan,
                    report,
                    pruned,
                });
            }
            Err(e) => e,
        };

        let failed = |source: KubeError, report: Report| KubeError::DeployFailed {
            name: pending.name.clone(),
            revision: pending.revision,
            source: Box::new(source),
            report: Box::new(report),
        };

        if error.is_lock_lost() || error.is_record_stuck() {
            return Err(failed(error, report));
        }
        if !pending_recorded(&plan) {
            tracing::error!(error = %error, "deploy aborted before the release was recorded");
            return Err(failed(error, report));
        }

        tracing::warn!(revision = pending.revision, error = %error, "deploy failed, running failure plan");
        let mut failure_plan = FailurePlanBuilder::new(&plan, &cleanup_on_failure, &pending)
            .reason(error.to_string())
            .build()?;
        let mut failure_report = Report::default();
        if let Err(failure_error) = self
            .execute(guard, history, &mut failure_plan, &mut failure_report)
            .await
        {
            tracing::error!(original = %error, error = %failure_error, "failure plan failed");
            return Err(failure_error);
        }

        report.merge(failure_report);
        Err(failed(error, report))
    }

    /// Execute `plan`, aborting as soon as the lock lease is lost
    async fn execute(
        &self,
        guard: &LockGuard,
        history: &History<S>,
        plan: &mut Plan,
        report: &mut Report,
    ) -> Result<()> {
        let executor = Executor::new(self.client.as_ref(), self.tracker.as_ref(), history, &self.ctx);
        tokio::select! {
            biased;
            () = guard.lost() => Err(KubeError::LockLost {
                lock: guard.name().to_string(),
            }),
            result = executor.execute(plan, report) => result,
        }
    }
}

/// Initial without history, Install while nothing was ever deployed, Upgrade otherwise
fn deploy_type_for<S: StorageDriver + ?Sized>(history: &History<S>) -> DeployType {
    if history.is_empty() {
        DeployType::Initial
    } else if history.last_deployed_release().is_none() {
        DeployType::Install
    } else {
        DeployType::Upgrade
    }
}

/// Whether the pending release record was written
fn pending_recorded(plan: &Plan) -> bool {
    plan.phase(crate::plan::PhaseKind::PendingRelease)
        .is_some_and(|phase| {
            phase
                .operations
                .iter()
                .all(|op| op.status == OperationStatus::Completed)
        })
}

/// Desired resources recorded in an earlier revision
fn stored_resources(release: &Release) -> Result<DesiredResources> {
    let to_resources = |objects: &[kube::api::DynamicObject], class: ResourceClass| {
        objects
            .iter()
            .map(|o| Resource::from_object(o.clone(), class, Origin::Local, &release.namespace))
            .collect::<keelson_core::Result<Vec<_>>>()
    };
    Ok(DesiredResources {
        crds: Vec::new(),
        hooks: to_resources(&release.hook_resources, ResourceClass::Hook)?,
        general: to_resources(&release.general_resources, ResourceClass::General)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{FakeCluster, Mutation};
    use crate::lock::MemoryLocker;
    use crate::storage::MemoryDriver;
    use crate::tracker::FakeTracker;
    use keelson_core::{ReleaseStatus, ResourceId};

    const MANIFEST: &str = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
data:
  mode: blue
---
apiVersion: batch/v1
kind: Job
metadata:
  name: migrate
  annotations:
    helm.sh/hook: pre-install,pre-upgrade
    helm.sh/hook-delete-policy: hook-failed
spec:
  template: {}
";

    type TestDeployer = Deployer<FakeCluster, FakeTracker, MemoryDriver, MemoryLocker>;

    struct Fixture {
        cluster: Arc<FakeCluster>,
        tracker: Arc<FakeTracker>,
        storage: Arc<MemoryDriver>,
        locker: Arc<MemoryLocker>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                cluster: Arc::new(FakeCluster::new()),
                tracker: Arc::new(FakeTracker::new()),
                storage: Arc::new(MemoryDriver::new()),
                locker: Arc::new(MemoryLocker::new()),
            }
        }

        fn deployer(&self) -> TestDeployer {
            Deployer::new(
                self.cluster.clone(),
                self.tracker.clone(),
                self.storage.clone(),
                self.locker.clone(),
                DeployContext::default(),
            )
        }
    }

    fn request(manifest: &str) -> DeployRequest {
        DeployRequest::new("web", "prod", manifest)
    }

    fn job_id() -> ResourceId {
        ResourceId::new("migrate", Some("prod"), "batch", "v1", "Job")
    }

    #[tokio::test]
    async fn test_initial_then_upgrade() {
        let fx = Fixture::new();
        let deployer = fx.deployer();

        let first = deployer.deploy(&request(MANIFEST)).await.unwrap();
        assert_eq!(first.deploy_type, DeployType::Initial);
        assert_eq!(first.release.status, ReleaseStatus::Deployed);
        assert!(!fx.locker.is_held("release.web"));

        let changed = MANIFEST.replace("mode: blue", "mode: green");
        let second = deployer.deploy(&request(&changed)).await.unwrap();
        assert_eq!(second.deploy_type, DeployType::Upgrade);
        assert_eq!(second.release.revision, 2);
        assert_eq!(second.report.updated.len(), 1);

        let statuses: Vec<ReleaseStatus> =
            fx.storage.all_releases().iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![ReleaseStatus::Superseded, ReleaseStatus::Deployed]);
    }

    #[tokio::test]
    async fn test_failed_hook_marks_release_failed_and_cleans_up() {
        let fx = Fixture::new();
        fx.tracker.fail_readiness(&job_id());

        let err = fx.deployer().deploy(&request(MANIFEST)).await.unwrap_err();
        let report = err.report().unwrap();
        assert!(report.deleted.contains(&job_id()));
        assert!(!fx.cluster.contains(&job_id()));

        let releases = fx.storage.all_releases();
        assert_eq!(releases.len(), 1);
        assert_eq!(releases[0].status, ReleaseStatus::Failed);
        assert!(!fx.locker.is_held("release.web"));

        // next attempt installs over the failed revision
        let fx_tracker_ok = Fixture {
            tracker: Arc::new(FakeTracker::new()),
            ..fx
        };
        let outcome = fx_tracker_ok.deployer().deploy(&request(MANIFEST)).await.unwrap();
        assert_eq!(outcome.deploy_type, DeployType::Install);
        assert_eq!(outcome.release.revision, 2);
    }

    #[tokio::test]
    async fn test_validation_error_before_any_mutation() {
        let fx = Fixture::new();
        let err = fx
            .deployer()
            .deploy(&DeployRequest::new("Not_Valid", "prod", MANIFEST))
            .await
            .unwrap_err();
        assert!(matches!(err, KubeError::Validation(_)));
        assert!(fx.cluster.mutations().is_empty());
        assert_eq!(fx.locker.attempts(), 0);
    }

    #[tokio::test]
    async fn test_pending_record_failure_aborts_before_resources() {
        let fx = Fixture::new();
        fx.storage.fail_creates();

        let err = fx.deployer().deploy(&request(MANIFEST)).await.unwrap_err();
        assert!(matches!(err, KubeError::DeployFailed { .. }));
        let settings = ResourceId::new("settings", Some("prod"), "", "v1", "ConfigMap");
        assert!(!fx.cluster.contains(&settings));
        // only the namespace was created
        assert_eq!(fx.cluster.mutations().len(), 1);
    }

    #[tokio::test]
    async fn test_stuck_record_skips_failure_plan() {
        let fx = Fixture::new();
        fx.storage.fail_updates_to(ReleaseStatus::Deployed);

        let err = fx.deployer().deploy(&request(MANIFEST)).await.unwrap_err();
        assert!(err.is_record_stuck());
        assert_eq!(
            fx.storage.all_releases()[0].status,
            ReleaseStatus::PendingInstall
        );
    }

    #[tokio::test]
    async fn test_plan_only_does_not_touch_anything() {
        let fx = Fixture::new();
        let preview = fx.deployer().plan_only(&request(MANIFEST)).await.unwrap();
        assert_eq!(preview.deploy_type, DeployType::Initial);
        assert!(preview.plan.has_mutations());
        assert!(fx.cluster.mutations().is_empty());
        assert_eq!(fx.storage.release_count(), 0);
        assert_eq!(fx.locker.attempts(), 0);
    }

    #[tokio::test]
    async fn test_rollback_restores_previous_revision() {
        let fx = Fixture::new();
        let deployer = fx.deployer();
        deployer.deploy(&request(MANIFEST)).await.unwrap();
        let changed = MANIFEST.replace("mode: blue", "mode: green");
        deployer.deploy(&request(&changed)).await.unwrap();

        let outcome = deployer.rollback("web", "prod", None).await.unwrap();
        assert_eq!(outcome.deploy_type, DeployType::Rollback);
        assert_eq!(outcome.release.revision, 3);

        let settings = ResourceId::new("settings", Some("prod"), "", "v1", "ConfigMap");
        let live = fx.cluster.object(&settings).unwrap();
        assert_eq!(live.data["data"]["mode"], "blue");
        assert!(fx.cluster.mutations().contains(&Mutation::Apply(settings)));
    }

    #[tokio::test]
    async fn test_rollback_without_target() {
        let fx = Fixture::new();
        let deployer = fx.deployer();
        deployer.deploy(&request(MANIFEST)).await.unwrap();

        let err = deployer.rollback("web", "prod", None).await.unwrap_err();
        assert!(matches!(err, KubeError::NoRollbackTarget { revision: None, .. }));
        let err = deployer.rollback("web", "prod", Some(9)).await.unwrap_err();
        assert!(err.to_string().contains("revision 9 not found"));
    }
}
