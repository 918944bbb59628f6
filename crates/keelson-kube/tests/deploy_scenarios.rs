//! End-to-end deploys against the in-memory cluster, storage and locker

use keelson_core::{DeployType, ReleaseStatus};
use keelson_kube::{
    DeployConfig, DeployContext, DeployRequest, Deployer, FakeCluster, FakeTracker, MemoryDriver,
    MemoryLocker, OperationKind, PhaseKind,
};
use std::sync::Arc;
use std::time::Duration;

const APP: &str = "\
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  replicas: 2
  selector:
    matchLabels:
      app: web
  template:
    metadata:
      labels:
        app: web
    spec:
      containers:
        - name: web
          image: nginx:1.27
---
apiVersion: batch/v1
kind: Job
metadata:
  name: smoke
  annotations:
    helm.sh/hook: post-install
    helm.sh/hook-weight: \"0\"
spec:
  template: {}
";

const WITH_MIGRATION: &str = "\
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
    helm.sh/hook-delete-policy: before-hook-creation
spec:
  template: {}
";

struct Env {
    cluster: Arc<FakeCluster>,
    tracker: Arc<FakeTracker>,
    storage: Arc<MemoryDriver>,
    locker: Arc<MemoryLocker>,
    ctx: DeployContext,
}

impl Env {
    fn new() -> Self {
        let config = DeployConfig {
            lock_retry_backoff: Duration::from_millis(10),
            lock_acquire_attempts: 500,
            ..Default::default()
        };
        Self {
            cluster: Arc::new(FakeCluster::new()),
            tracker: Arc::new(FakeTracker::new()),
            storage: Arc::new(MemoryDriver::new()),
            locker: Arc::new(MemoryLocker::new()),
            ctx: DeployContext::new(config),
        }
    }

    fn with_tracker_delay(mut self, delay: Duration) -> Self {
        self.tracker = Arc::new(FakeTracker::new().with_delay(delay));
        self
    }

    fn deployer(&self) -> Deployer<FakeCluster, FakeTracker, MemoryDriver, MemoryLocker> {
        Deployer::new(
            self.cluster.clone(),
            self.tracker.clone(),
            self.storage.clone(),
            self.locker.clone(),
            self.ctx.clone(),
        )
    }
}

fn request(manifest: &str) -> DeployRequest {
    DeployRequest::new("web", "prod", manifest)
}

mod fresh_install {
    use super::*;

    #[tokio::test]
    async fn test_phases_of_initial_deploy() {
        let env = Env::new();
        let outcome = env.deployer().deploy(&request(APP)).await.unwrap();

        assert_eq!(outcome.deploy_type, DeployType::Initial);
        let phases: Vec<PhaseKind> = outcome.plan.phases.iter().map(|p| p.kind).collect();
        assert_eq!(
            phases,
            vec![
                PhaseKind::Namespace,
                PhaseKind::PendingRelease,
                PhaseKind::General,
                PhaseKind::PostHooks,
                PhaseKind::Finalize,
            ]
        );

        let ids: Vec<&str> = outcome.plan.operations().map(|op| op.id.as_str()).collect();
        assert_eq!(
            ids,
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
        assert_eq!(outcome.report.created.len(), 3);
        assert_eq!(env.storage.all_releases()[0].status, ReleaseStatus::Deployed);
    }
}

mod noop_upgrade {
    use super::*;

    #[tokio::test]
    async fn test_identical_redeploy_only_verifies() {
        let env = Env::new();
        let deployer = env.deployer();
        deployer.deploy(&request(APP)).await.unwrap();
        let mutations_before = env.cluster.mutations().len();

        let outcome = deployer.deploy(&request(APP)).await.unwrap();
        assert_eq!(outcome.deploy_type, DeployType::Upgrade);
        assert!(!outcome.plan.has_mutations());
        assert!(outcome.report.is_empty());
        assert_eq!(env.cluster.mutations().len(), mutations_before);

        for op in outcome.plan.operations() {
            assert!(
                matches!(
                    op.kind,
                    OperationKind::TrackReadiness { .. }
                        | OperationKind::CreateReleaseRecord { .. }
                        | OperationKind::UpdateReleaseRecord { .. }
                ),
                "unexpected operation {}",
                op.id
            );
        }
        assert!(outcome.plan.operation("succeed-release/web.v2").is_some());
        assert!(outcome.plan.operation("supersede-release/web.v1").is_some());

        let statuses: Vec<ReleaseStatus> =
            env.storage.all_releases().iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![ReleaseStatus::Superseded, ReleaseStatus::Deployed]);
    }
}

mod hook_recreate {
    use super::*;

    #[tokio::test]
    async fn test_existing_hook_is_recreated() {
        let env = Env::new();
        let deployer = env.deployer();
        deployer.deploy(&request(WITH_MIGRATION)).await.unwrap();

        let preview = deployer.plan_only(&request(WITH_MIGRATION)).await.unwrap();
        assert_eq!(preview.deploy_type, DeployType::Upgrade);
        let pre_hooks = preview.plan.phase(PhaseKind::PreHooks).unwrap();
        assert!(
            pre_hooks
                .operations
                .iter()
                .any(|op| matches!(op.kind, OperationKind::Recreate { .. }))
        );
        assert!(
            !pre_hooks
                .operations
                .iter()
                .any(|op| matches!(op.kind, OperationKind::Update { .. }))
        );
    }
}

mod lock_contention {
    use super::*;

    #[tokio::test]
    async fn test_second_deploy_waits_for_first() {
        let env = Env::new().with_tracker_delay(Duration::from_millis(40));
        let first = env.deployer();
        let second = env.deployer();

        let first_req = request(WITH_MIGRATION);
        let (a, b) = tokio::join!(
            first.deploy(&first_req),
            async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                second.deploy(&request(WITH_MIGRATION)).await
            }
        );
        let a = a.unwrap();
        let b = b.unwrap();

        assert_eq!(a.release.revision, 1);
        assert_eq!(b.release.revision, 2);
        assert_eq!(b.deploy_type, DeployType::Upgrade);
        // the second deploy retried while the first held the lock
        assert!(env.locker.attempts() > 2);
        assert!(!env.locker.is_held("release.web"));
    }

    #[tokio::test]
    async fn test_lost_lease_stops_deploy() {
        let env = Env::new().with_tracker_delay(Duration::from_millis(200));
        let deployer = env.deployer();

        let req = request(WITH_MIGRATION);
        let (result, ()) = tokio::join!(deployer.deploy(&req), async {
            // past the namespace phase, inside pre-hook tracking
            tokio::time::sleep(Duration::from_millis(300)).await;
            env.locker.revoke("release.web");
        });

        let err = result.unwrap_err();
        assert!(err.is_lock_lost());
        // no failure plan ran
        let releases = env.storage.all_releases();
        assert_eq!(releases.len(), 1);
        assert_eq!(releases[0].status, ReleaseStatus::PendingInstall);
    }
}
