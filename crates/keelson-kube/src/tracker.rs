//! Readiness and absence tracking
//!
//! [`PollingTracker`] spawns one task per tracked resource. Each task polls the cluster
//! until its target settles and sends a single [`TrackOutcome`] over a channel; one
//! collector owns every outcome and decides whether the operation failed.

use async_trait::async_trait;
use keelson_core::{FailMode, Resource, ResourceId, TrackTerminationMode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::client::ClusterClient;
use crate::error::{KubeError, Result};
use crate::readiness::{self, Readiness};

/// A resource whose readiness is tracked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackTarget {
    pub id: ResourceId,
    pub fail_mode: FailMode,
    pub termination_mode: TrackTerminationMode,
    /// Fail if the reported state does not change for this long
    #[serde(default, with = "humantime_serde")]
    pub no_activity_timeout: Option<Duration>,
}

impl TrackTarget {
    pub fn new(id: ResourceId) -> Self {
        Self {
            id,
            fail_mode: FailMode::default(),
            termination_mode: TrackTerminationMode::default(),
            no_activity_timeout: None,
        }
    }

    pub fn from_resource(resource: &Resource) -> Self {
        Self {
            id: resource.id.clone(),
            fail_mode: resource.attrs.fail_mode,
            termination_mode: resource.attrs.track_termination_mode,
            no_activity_timeout: resource.attrs.no_activity_timeout,
        }
    }

    fn is_blocking(&self) -> bool {
        self.termination_mode == TrackTerminationMode::WaitUntilReady
    }
}

/// Timing of one tracking call
#[derive(Debug, Clone, Copy)]
pub struct TrackOptions {
    pub timeout: Duration,
    pub poll_period: Duration,
}

/// What a tracking task concluded about its target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackOutcome {
    Settled(ResourceId),
    Failed(ResourceId, String),
}

/// Waits for resources to become ready or to disappear
#[async_trait]
pub trait Tracker: Send + Sync {
    /// Block until every blocking target is ready
    async fn track_readiness(&self, targets: &[TrackTarget], opts: TrackOptions) -> Result<()>;

    /// Block until every target is gone
    async fn track_absence(&self, targets: &[ResourceId], opts: TrackOptions) -> Result<()>;
}

/// Fold the outcomes of one operation into its result
///
/// Failures of `ignore-and-continue` targets are logged and dropped.
pub fn settle(targets: &[TrackTarget], outcomes: Vec<TrackOutcome>) -> Result<()> {
    let ignored: HashSet<&ResourceId> = targets
        .iter()
        .filter(|t| t.fail_mode == FailMode::IgnoreAndContinue)
        .map(|t| &t.id)
        .collect();

    let mut failures: Vec<String> = Vec::new();
    for outcome in outcomes {
        if let TrackOutcome::Failed(id, reason) = outcome {
            if ignored.contains(&id) {
                tracing::warn!(resource = %id, %reason, "tracking failed, ignored by fail mode");
            } else {
                failures.push(format!("{}: {}", id, reason));
            }
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        failures.sort();
        Err(KubeError::TrackingFailed { failures })
    }
}

/// Tracker polling a [`ClusterClient`]
pub struct PollingTracker<C> {
    client: Arc<C>,
}

impl<C: ClusterClient + 'static> PollingTracker<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }

    /// Spawn one poll task per target and collect their outcomes
    async fn collect<T, F, Fut>(&self, targets: Vec<T>, poll: F) -> Vec<TrackOutcome>
    where
        T: Send + 'static,
        F: Fn(Arc<C>, T) -> Fut,
        Fut: std::future::Future<Output = TrackOutcome> + Send + 'static,
    {
        let expected = targets.len();
        let (tx, mut rx) = mpsc::channel(expected.max(1));
        let mut tasks = JoinSet::new();

        for target in targets {
            let tx = tx.clone();
            let task = poll(self.client.clone(), target);
            tasks.spawn(async move {
                let _ = tx.send(task.await).await;
            });
        }
        drop(tx);

        let mut outcomes = Vec::with_capacity(expected);
        while let Some(outcome) = rx.recv().await {
            outcomes.push(outcome);
        }
        while tasks.join_next().await.is_some() {}
        outcomes
    }
}

async fn poll_ready<C: ClusterClient>(
    client: Arc<C>,
    target: TrackTarget,
    opts: TrackOptions,
) -> TrackOutcome {
    let deadline = Instant::now() + opts.timeout;
    let mut last_state = String::new();
    let mut last_change = Instant::now();

    loop {
        let state = match client.get(&target.id).await {
            Ok(Some(obj)) => match readiness::evaluate(&obj) {
                Readiness::Ready => {
                    tracing::debug!(resource = %target.id, "ready");
                    return TrackOutcome::Settled(target.id);
                }
                Readiness::Failed(reason) => return TrackOutcome::Failed(target.id, reason),
                Readiness::Pending(state) => state,
            },
            Ok(None) => "not found".to_string(),
            Err(e) => format!("get failed: {}", e),
        };

        let now = Instant::now();
        if state != last_state {
            tracing::debug!(resource = %target.id, %state, "waiting for readiness");
            last_state = state;
            last_change = now;
        }
        if let Some(limit) = target.no_activity_timeout
            && now.duration_since(last_change) >= limit
        {
            return TrackOutcome::Failed(
                target.id,
                format!("no activity for {:?}, last state: {}", limit, last_state),
            );
        }
        if now >= deadline {
            return TrackOutcome::Failed(
                target.id,
                format!("not ready after {:?}: {}", opts.timeout, last_state),
            );
        }
        tokio::time::sleep(opts.poll_period).await;
    }
}

async fn poll_absent<C: ClusterClient>(
    client: Arc<C>,
    id: ResourceId,
    opts: TrackOptions,
) -> TrackOutcome {
    let deadline = Instant::now() + opts.timeout;
    loop {
        match client.get(&id).await {
            Ok(None) => return TrackOutcome::Settled(id),
            Err(KubeError::UnsupportedResource { .. }) => return TrackOutcome::Settled(id),
            Ok(Some(_)) | Err(_) => {}
        }
        if Instant::now() >= deadline {
            return TrackOutcome::Failed(id, format!("still present after {:?}", opts.timeout));
        }
        tokio::time::sleep(opts.poll_period).await;
    }
}

#[async_trait]
impl<C: ClusterClient + 'static> Tracker for PollingTracker<C> {
    async fn track_readiness(&self, targets: &[TrackTarget], opts: TrackOptions) -> Result<()> {
        let blocking: Vec<TrackTarget> = targets.iter().filter(|t| t.is_blocking()).cloned().collect();
        let outcomes = self
            .collect(blocking, move |client, target| poll_ready(client, target, opts))
            .await;
        settle(targets, outcomes)
    }

    async fn track_absence(&self, targets: &[ResourceId], opts: TrackOptions) -> Result<()> {
        let outcomes = self
            .collect(targets.to_vec(), move |client, id| poll_absent(client, id, opts))
            .await;
        settle(&[], outcomes)
    }
}

/// A recorded tracker call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackCall {
    Readiness(Vec<ResourceId>),
    Absence(Vec<ResourceId>),
}

#[derive(Default)]
struct FakeState {
    calls: Vec<TrackCall>,
    failing: HashSet<ResourceId>,
    delay: Option<Duration>,
}

/// Tracker for tests: everything settles at once unless told to fail
#[derive(Clone, Default)]
pub struct FakeTracker {
    state: Arc<Mutex<FakeState>>,
}

impl FakeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make readiness of `id` fail
    pub fn fail_readiness(&self, id: &ResourceId) {
        self.state().failing.insert(id.clone());
    }

    /// Sleep this long in every call
    pub fn with_delay(self, delay: Duration) -> Self {
        self.state().delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<TrackCall> {
        self.state().calls.clone()
    }
}

#[async_trait]
impl Tracker for FakeTracker {
    async fn track_readiness(&self, targets: &[TrackTarget], _opts: TrackOptions) -> Result<()> {
        let (delay, outcomes) = {
            let mut state = self.state();
            state.calls.push(TrackCall::Readiness(
                targets.iter().map(|t| t.id.clone()).collect(),
            ));
            let outcomes = targets
                .iter()
                .filter(|t| t.is_blocking())
                .map(|t| {
                    if state.failing.contains(&t.id) {
                        TrackOutcome::Failed(t.id.clone(), "injected failure".to_string())
                    } else {
                        TrackOutcome::Settled(t.id.clone())
                    }
                })
                .collect();
            (state.delay, outcomes)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        settle(targets, outcomes)
    }

    async fn track_absence(&self, targets: &[ResourceId], _opts: TrackOptions) -> Result<()> {
        let delay = {
            let mut state = self.state();
            state.calls.push(TrackCall::Absence(targets.to_vec()));
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}
