//! Plan executor
//!
//! Walks a [`Plan`] phase by phase and operation by operation. Targets of one resource
//! operation run concurrently, bounded by `network_parallelism`, and all their errors
//! are collected before the operation is declared failed. The first failed operation
//! stops the execution; nothing is rolled back here.

use futures::{StreamExt, stream};
use keelson_core::{Release, Resource, ResourceId};
use kube::api::DynamicObject;
use std::future::Future;
use std::time::Duration;
use tracing::instrument;

use crate::client::{ClusterClient, resolve_dependency};
use crate::config::DeployContext;
use crate::error::{KubeError, MultiError, Result};
use crate::history::History;
use crate::plan::{OperationKind, OperationStatus, PhaseKind, Plan, Report};
use crate::storage::StorageDriver;
use crate::tracker::{TrackOptions, TrackTarget, Tracker};

/// Where a successful target ends up in the report
enum Outcome {
    Created(DynamicObject),
    Recreated(DynamicObject),
    Updated(DynamicObject),
    Deleted,
}

/// Executes plans against a cluster, a tracker and a release history
pub struct Executor<'a, C: ?Sized, T: ?Sized, S: ?Sized> {
    client: &'a C,
    tracker: &'a T,
    history: &'a History<S>,
    ctx: &'a DeployContext,
}

impl<'a, C, T, S> Executor<'a, C, T, S>
where
    C: ClusterClient + ?Sized,
    T: Tracker + ?Sized,
    S: StorageDriver + ?Sized,
{
    pub fn new(client: &'a C, tracker: &'a T, history: &'a History<S>, ctx: &'a DeployContext) -> Self {
        Self {
            client,
            tracker,
            history,
            ctx,
        }
    }

    /// Execute every operation in order, recording statuses in `plan`
    ///
    /// On failure the failed operation is marked [`OperationStatus::Failed`], later
    /// operations stay pending and `report` holds what did complete.
    #[instrument(skip_all, fields(phases = plan.phases.len()))]
    pub async fn execute(&self, plan: &mut Plan, report: &mut Report) -> Result<()> {
        for phase in plan.phases.iter_mut() {
            tracing::info!(phase = %phase.kind, operations = phase.operations.len(), "starting phase");

            for op in phase.operations.iter_mut() {
                tracing::debug!(operation = %op.id, "executing");
                match self.run(&op.kind, report).await {
                    Ok(()) => op.status = OperationStatus::Completed,
                    Err(e) => {
                        op.status = OperationStatus::Failed;
                        tracing::warn!(operation = %op.id, error = %e, "operation failed");
                        return Err(e.in_operation(op.id.clone()));
                    }
                }
            }

            if phase.kind == PhaseKind::Crds {
                self.client.refresh_discovery().await?;
            }
        }
        Ok(())
    }

    async fn run(&self, kind: &OperationKind, report: &mut Report) -> Result<()> {
        let config = &self.ctx.config;
        match kind {
            OperationKind::Create { targets } => {
                self.for_each(targets, report, |r| self.create(r)).await
            }
            OperationKind::Recreate { targets } => {
                self.for_each(targets, report, |r| self.recreate(r)).await
            }
            OperationKind::Update { targets } => {
                self.for_each(targets, report, |r| self.update(r)).await
            }
            OperationKind::Delete { targets } => {
                self.for_each_id(targets, report, |id| async move {
                    self.delete(id).await.map(|()| Outcome::Deleted)
                })
                .await
            }
            OperationKind::TrackReadiness { targets } => {
                self.tracker
                    .track_readiness(targets, self.track_options(config.readiness_timeout))
                    .await
            }
            OperationKind::TrackAbsence { targets } => {
                self.tracker
                    .track_absence(targets, self.track_options(config.deletion_timeout))
                    .await
            }
            OperationKind::TrackExternalDependencyReadiness {
                dependencies,
                namespace,
            } => {
                let mut targets = Vec::with_capacity(dependencies.len());
                for dependency in dependencies {
                    let id = resolve_dependency(self.client, dependency, namespace).await?;
                    tracing::debug!(dependency = %dependency.id, resource = %id, "waiting for external dependency");
                    targets.push(TrackTarget::new(id));
                }
                self.tracker
                    .track_readiness(&targets, self.track_options(config.readiness_timeout))
                    .await
            }
            OperationKind::CreateReleaseRecord { release } => {
                self.history.create_release(release).await
            }
            OperationKind::UpdateReleaseRecord { release } => self.update_record(release).await,
        }
    }

    fn track_options(&self, timeout: Duration) -> TrackOptions {
        TrackOptions {
            timeout,
            poll_period: self.ctx.config.poll_period,
        }
    }

    /// Terminal writes are not retried; a failure leaves the record behind the cluster
    async fn update_record(&self, release: &Release) -> Result<()> {
        match self.history.update_release(release).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!(
                    release = %release.name,
                    revision = release.revision,
                    status = %release.status,
                    error = %e,
                    "could not write terminal release record, cluster already mutated"
                );
                Err(KubeError::ReleaseRecordStuck {
                    name: release.name.clone(),
                    revision: release.revision,
                    status: release.status.to_string(),
                    source: Box::new(e),
                })
            }
        }
    }

    async fn for_each<'r, F, Fut>(
        &self,
        targets: &'r [Resource],
        report: &mut Report,
        action: F,
    ) -> Result<()>
    where
        F: Fn(&'r Resource) -> Fut,
        Fut: Future<Output = Result<Outcome>>,
    {
        let results: Vec<(ResourceId, Result<Outcome>)> = stream::iter(targets)
            .map(|r| {
                let fut = action(r);
                async move { (r.id.clone(), fut.await) }
            })
            .buffer_unordered(self.ctx.config.network_parallelism.max(1))
            .collect()
            .await;
        record(results, report)
    }

    async fn for_each_id<'r, F, Fut>(
        &self,
        ids: &'r [ResourceId],
        report: &mut Report,
        action: F,
    ) -> Result<()>
    where
        F: Fn(&'r ResourceId) -> Fut,
        Fut: Future<Output = Result<Outcome>>,
    {
        let results: Vec<(ResourceId, Result<Outcome>)> = stream::iter(ids)
            .map(|id| {
                let fut = action(id);
                async move { (id.clone(), fut.await) }
            })
            .buffer_unordered(self.ctx.config.network_parallelism.max(1))
            .collect()
            .await;
        record(results, report)
    }

    /// Create, applying instead when the object already exists
    async fn create(&self, resource: &Resource) -> Result<Outcome> {
        let timeout = self.ctx.config.creation_timeout;
        with_timeout(timeout, &format!("create {}", resource.id), async {
            match self.client.create(&resource.id, &resource.object).await {
                Ok(obj) => Ok(Outcome::Created(obj)),
                Err(KubeError::AlreadyExists { .. }) => {
                    tracing::debug!(resource = %resource.id, "already exists, applying instead");
                    let obj = self.client.apply(&resource.id, &resource.object, false).await?;
                    Ok(Outcome::Updated(obj))
                }
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn update(&self, resource: &Resource) -> Result<Outcome> {
        let timeout = self.ctx.config.creation_timeout;
        with_timeout(timeout, &format!("update {}", resource.id), async {
            let obj = self.client.apply(&resource.id, &resource.object, false).await?;
            Ok(Outcome::Updated(obj))
        })
        .await
    }

    async fn delete(&self, id: &ResourceId) -> Result<()> {
        let timeout = self.ctx.config.deletion_timeout;
        with_timeout(timeout, &format!("delete {}", id), self.client.delete(id)).await
    }

    /// Delete, wait until gone, create again
    async fn recreate(&self, resource: &Resource) -> Result<Outcome> {
        let config = &self.ctx.config;
        self.delete(&resource.id).await?;
        self.tracker
            .track_absence(
                std::slice::from_ref(&resource.id),
                self.track_options(config.deletion_timeout),
            )
            .await?;
        let obj = with_timeout(
            config.creation_timeout,
            &format!("create {}", resource.id),
            self.client.create(&resource.id, &resource.object),
        )
        .await?;
        Ok(Outcome::Recreated(obj))
    }
}

async fn with_timeout<T>(
    limit: Duration,
    what: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(KubeError::Timeout(format!("{:?} ({})", limit, what))),
    }
}

/// Fold per-target results into the report, collecting every failure
fn record(mut results: Vec<(ResourceId, Result<Outcome>)>, report: &mut Report) -> Result<()> {
    results.sort_by(|(a, _), (b, _)| a.cmp(b));

    let mut errors = MultiError::new();
    for (id, result) in results {
        match result {
            Ok(Outcome::Created(obj)) => report.created.push((id, obj)),
            Ok(Outcome::Recreated(obj)) => report.recreated.push((id, obj)),
            Ok(Outcome::Updated(obj)) => report.updated.push((id, obj)),
            Ok(Outcome::Deleted) => report.deleted.push(id),
            Err(e) => errors.push(id.to_string(), e),
        }
    }
    errors.into_result()
}
