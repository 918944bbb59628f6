//! Release locks
//!
//! One deploy at a time per release. A [`Locker`] makes single acquisition attempts and
//! keeps the lease alive; [`LockManager`] adds retries and backoff on top.
//!
//! A held lock exposes a lease-lost signal through [`LockGuard::lost`]. Callers race
//! their work against it and stop at once when it fires.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use kube::api::{Api, PostParams};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::config::DeployConfig;
use crate::error::{KubeError, Result};

/// Name of the coordination ConfigMap in the release namespace
pub const LOCKS_CONFIGMAP: &str = "keelson-locks";

/// Annotation prefix of one lock entry in the coordination ConfigMap
const LOCK_ANNOTATION_PREFIX: &str = "lock.keelson.io/";

/// Name of the lock guarding a release
pub fn release_lock_name(release: &str) -> String {
    format!("release.{}", release)
}

/// A held lock
///
/// Dropping the guard stops lease renewal without releasing; the lease then expires.
pub struct LockGuard {
    name: String,
    token: String,
    lost: watch::Receiver<bool>,
    renewal: Option<JoinHandle<()>>,
}

impl LockGuard {
    pub fn new(name: impl Into<String>, token: impl Into<String>, lost: watch::Receiver<bool>) -> Self {
        Self {
            name: name.into(),
            token: token.into(),
            lost,
            renewal: None,
        }
    }

    /// Attach the task keeping the lease alive
    pub fn with_renewal(mut self, renewal: JoinHandle<()>) -> Self {
        self.renewal = Some(renewal);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identifies this acquisition, distinct across re-acquisitions by the same owner
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_lost(&self) -> bool {
        *self.lost.borrow()
    }

    /// Resolves once the lease is lost; never resolves otherwise
    pub async fn lost(&self) {
        let mut rx = self.lost.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // signal source gone without a loss
                std::future::pending::<()>().await;
            }
        }
    }

    fn stop_renewal(&mut self) {
        if let Some(handle) = self.renewal.take() {
            handle.abort();
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.stop_renewal();
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("lost", &self.is_lost())
            .finish()
    }
}

/// Lock backend
#[async_trait]
pub trait Locker: Send + Sync {
    /// One acquisition attempt; `None` when someone else holds the lock
    async fn try_acquire(&self, name: &str) -> Result<Option<LockGuard>>;

    /// Give the lock up
    async fn release(&self, guard: &LockGuard) -> Result<()>;
}

fn new_token() -> String {
    format!("{:016x}", rand::rng().random::<u64>())
}

/// Lease entry stored per lock in the coordination ConfigMap
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaseRecord {
    holder: String,
    token: String,
    renewed_at: DateTime<Utc>,
    lease_seconds: u64,
}

impl LeaseRecord {
    /// An entry whose lease cannot be represented counts as expired
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        i64::try_from(self.lease_seconds)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|lease| self.renewed_at.checked_add_signed(lease))
            .is_none_or(|expires| expires < now)
    }
}

/// Locks stored as annotations of a ConfigMap in the release namespace
#[derive(Clone)]
pub struct ConfigMapLocker {
    client: Client,
    namespace: String,
    owner: String,
    lease: Duration,
}

impl ConfigMapLocker {
    pub fn new(client: Client, namespace: impl Into<String>, owner: impl Into<String>, lease: Duration) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            owner: owner.into(),
            lease,
        }
    }

    fn api(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Fetch the coordination ConfigMap, creating it on first use
    async fn coordination_map(&self) -> Result<ConfigMap> {
        let api = self.api();
        if let Some(cm) = api.get_opt(LOCKS_CONFIGMAP).await? {
            return Ok(cm);
        }

        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(LOCKS_CONFIGMAP.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some([("owner".to_string(), "keelson".to_string())].into()),
                ..Default::default()
            },
            ..Default::default()
        };
        match api.create(&PostParams::default(), &cm).await {
            Ok(created) => Ok(created),
            // created concurrently
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(api.get(LOCKS_CONFIGMAP).await?),
            Err(e) => Err(e.into()),
        }
    }

    fn record(&self, token: &str) -> LeaseRecord {
        LeaseRecord {
            holder: self.owner.clone(),
            token: token.to_string(),
            renewed_at: Utc::now(),
            lease_seconds: self.lease.as_secs().max(1),
        }
    }

    /// Write `record` under `name`, `false` on a resourceVersion conflict
    async fn write(&self, mut cm: ConfigMap, name: &str, record: Option<&LeaseRecord>) -> Result<bool> {
        let key = format!("{}{}", LOCK_ANNOTATION_PREFIX, name);
        let annotations = cm.metadata.annotations.get_or_insert_with(Default::default);
        match record {
            Some(record) => {
                annotations.insert(key, serde_json::to_string(record)?);
            }
            None => {
                annotations.remove(&key);
            }
        }
        match self
            .api()
            .replace(LOCKS_CONFIGMAP, &PostParams::default(), &cm)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn current(cm: &ConfigMap, name: &str) -> Option<LeaseRecord> {
        let key = format!("{}{}", LOCK_ANNOTATION_PREFIX, name);
        let raw = cm.metadata.annotations.as_ref()?.get(&key)?;
        match serde_json::from_str(raw) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(lock = %name, error = %e, "ignoring unreadable lock entry");
                None
            }
        }
    }

    /// Refresh our lease, `Ok(false)` when it is no longer ours
    async fn renew(&self, name: &str, token: &str) -> Result<bool> {
        loop {
            let cm = self.api().get(LOCKS_CONFIGMAP).await?;
            match Self::current(&cm, name) {
                Some(record) if record.token == token => {}
                _ => return Ok(false),
            }
            if self.write(cm, name, Some(&self.record(token))).await? {
                return Ok(true);
            }
            // another lock in the same map changed, read again
        }
    }

    fn spawn_renewal(&self, name: String, token: String, lost: watch::Sender<bool>) -> JoinHandle<()> {
        let locker = self.clone();
        let period = (self.lease / 3).max(Duration::from_millis(100));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            let mut last_renewed = tokio::time::Instant::now();
            loop {
                interval.tick().await;
                match locker.renew(&name, &token).await {
                    Ok(true) => {
                        last_renewed = tokio::time::Instant::now();
                        tracing::trace!(lock = %name, "lease renewed");
                    }
                    Ok(false) => {
                        tracing::error!(lock = %name, "lease taken over by another holder");
                        let _ = lost.send(true);
                        return;
                    }
                    Err(e) if last_renewed.elapsed() >= locker.lease => {
                        tracing::error!(lock = %name, error = %e, "lease expired before it could be renewed");
                        let _ = lost.send(true);
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(lock = %name, error = %e, "lease renewal failed, retrying");
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Locker for ConfigMapLocker {
    async fn try_acquire(&self, name: &str) -> Result<Option<LockGuard>> {
        let cm = self.coordination_map().await?;
        if let Some(current) = Self::current(&cm, name)
            && !current.is_expired(Utc::now())
        {
            tracing::debug!(lock = %name, holder = %current.holder, "lock held");
            return Ok(None);
        }

        let token = new_token();
        if !self.write(cm, name, Some(&self.record(&token))).await? {
            return Ok(None);
        }

        let (tx, rx) = watch::channel(false);
        let renewal = self.spawn_renewal(name.to_string(), token.clone(), tx);
        Ok(Some(LockGuard::new(name, token, rx).with_renewal(renewal)))
    }

    async fn release(&self, guard: &LockGuard) -> Result<()> {
        loop {
            let cm = self.api().get(LOCKS_CONFIGMAP).await?;
            match Self::current(&cm, guard.name()) {
                Some(record) if record.token == guard.token() => {}
                _ => {
                    tracing::warn!(lock = %guard.name(), "lock no longer held, nothing to release");
                    return Ok(());
                }
            }
            if self.write(cm, guard.name(), None).await? {
                return Ok(());
            }
        }
    }
}

struct Held {
    token: String,
    lost: watch::Sender<bool>,
}

#[derive(Default)]
struct MemoryState {
    held: HashMap<String, Held>,
    attempts: usize,
    failing_releases: u32,
}

/// In-process locker for testing
#[derive(Clone, Default)]
pub struct MemoryLocker {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryLocker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take the lock away from its holder, signalling the loss
    pub fn revoke(&self, name: &str) {
        if let Some(held) = self.state().held.remove(name) {
            let _ = held.lost.send(true);
        }
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.state().held.contains_key(name)
    }

    /// Number of acquisition attempts so far
    pub fn attempts(&self) -> usize {
        self.state().attempts
    }

    /// Make the next `count` releases fail
    pub fn fail_releases(&self, count: u32) {
        self.state().failing_releases = count;
    }
}

#[async_trait]
impl Locker for MemoryLocker {
    async fn try_acquire(&self, name: &str) -> Result<Option<LockGuard>> {
        let mut state = self.state();
        state.attempts += 1;
        if state.held.contains_key(name) {
            return Ok(None);
        }
        let token = new_token();
        let (tx, rx) = watch::channel(false);
        state.held.insert(
            name.to_string(),
            Held {
                token: token.clone(),
                lost: tx,
            },
        );
        Ok(Some(LockGuard::new(name, token, rx)))
    }

    async fn release(&self, guard: &LockGuard) -> Result<()> {
        let mut state = self.state();
        if state.failing_releases > 0 {
            state.failing_releases -= 1;
            return Err(KubeError::Storage(format!("injected release failure for {}", guard.name())));
        }
        if state
            .held
            .get(guard.name())
            .is_some_and(|held| held.token == guard.token())
        {
            state.held.remove(guard.name());
        }
        Ok(())
    }
}

/// Acquires and releases release locks with retries
pub struct LockManager<L: ?Sized> {
    locker: Arc<L>,
    acquire_attempts: u32,
    release_attempts: u32,
    backoff: Duration,
}

impl<L: Locker + ?Sized> LockManager<L> {
    pub fn new(locker: Arc<L>, config: &DeployConfig) -> Self {
        Self {
            locker,
            acquire_attempts: config.lock_acquire_attempts.max(1),
            release_attempts: config.lock_release_attempts.max(1),
            backoff: config.lock_retry_backoff,
        }
    }

    /// Backoff plus up to half of it again as jitter
    fn delay(&self) -> Duration {
        let max_jitter = (self.backoff.as_millis() / 2) as u64;
        let jitter = if max_jitter == 0 {
            0
        } else {
            rand::rng().random_range(0..=max_jitter)
        };
        self.backoff + Duration::from_millis(jitter)
    }

    /// Lock `release`, waiting while another deploy holds it
    #[instrument(skip(self))]
    pub async fn lock_release(&self, release: &str) -> Result<LockGuard> {
        let name = release_lock_name(release);
        for attempt in 1..=self.acquire_attempts {
            match self.locker.try_acquire(&name).await {
                Ok(Some(guard)) => {
                    tracing::debug!(lock = %name, attempt, "lock acquired");
                    return Ok(guard);
                }
                Ok(None) => {
                    tracing::info!(lock = %name, attempt, "waiting for lock held by another deploy");
                }
                Err(e) => {
                    tracing::warn!(lock = %name, attempt, error = %e, "lock attempt failed");
                }
            }
            if attempt < self.acquire_attempts {
                tokio::time::sleep(self.delay()).await;
            }
        }
        Err(KubeError::LockAcquire {
            lock: name,
            attempts: self.acquire_attempts,
        })
    }

    /// Release the lock; failures are logged, the lease expires on its own
    pub async fn unlock(&self, mut guard: LockGuard) {
        guard.stop_renewal();
        for attempt in 1..=self.release_attempts {
            match self.locker.release(&guard).await {
                Ok(()) => {
                    tracing::debug!(lock = %guard.name(), "lock released");
                    return;
                }
                Err(e) => {
                    tracing::warn!(lock = %guard.name(), attempt, error = %e, "could not release lock");
                }
            }
            if attempt < self.release_attempts {
                tokio::time::sleep(self.delay()).await;
            }
        }
        tracing::error!(
            lock = %guard.name(),
            "giving up on releasing the lock, it is freed when its lease expires"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(attempts: u32) -> DeployConfig {
        DeployConfig {
            lock_acquire_attempts: attempts,
            lock_release_attempts: 3,
            lock_retry_backoff: Duration::from_millis(5),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_lock_and_unlock() {
        let locker = Arc::new(MemoryLocker::new());
        let manager = LockManager::new(locker.clone(), &config(3));

        let guard = manager.lock_release("web").await.unwrap();
        assert_eq!(guard.name(), "release.web");
        assert!(locker.is_held("release.web"));
        assert!(!guard.is_lost());

        manager.unlock(guard).await;
        assert!(!locker.is_held("release.web"));
    }

    #[tokio::test]
    async fn test_gives_up_after_attempts() {
        let locker = Arc::new(MemoryLocker::new());
        let manager = LockManager::new(locker.clone(), &config(3));
        let _held = manager.lock_release("web").await.unwrap();

        let err = manager.lock_release("web").await.unwrap_err();
        assert!(matches!(err, KubeError::LockAcquire { attempts: 3, .. }));
        assert_eq!(locker.attempts(), 4);
    }

    #[tokio::test]
    async fn test_waits_for_holder() {
        let locker = Arc::new(MemoryLocker::new());
        let manager = Arc::new(LockManager::new(locker.clone(), &config(200)));
        let first = manager.lock_release("web").await.unwrap();

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.lock_release("web").await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        manager.unlock(first).await;
        let second = waiter.await.unwrap().unwrap();
        assert!(locker.is_held(second.name()));
    }

    #[tokio::test]
    async fn test_revoke_signals_loss() {
        let locker = Arc::new(MemoryLocker::new());
        let manager = LockManager::new(locker.clone(), &config(1));
        let guard = manager.lock_release("web").await.unwrap();

        locker.revoke("release.web");
        tokio::time::timeout(Duration::from_secs(1), guard.lost())
            .await
            .unwrap();
        assert!(guard.is_lost());
    }

    #[tokio::test]
    async fn test_unlock_retries_then_gives_up_quietly() {
        let locker = Arc::new(MemoryLocker::new());
        let manager = LockManager::new(locker.clone(), &config(1));

        let guard = manager.lock_release("web").await.unwrap();
        locker.fail_releases(2);
        manager.unlock(guard).await;
        assert!(!locker.is_held("release.web"));

        let guard = manager.lock_release("web").await.unwrap();
        locker.fail_releases(10);
        manager.unlock(guard).await;
        assert!(locker.is_held("release.web"));
    }

    #[test]
    fn test_lease_expiry() {
        let now = Utc::now();
        let record = LeaseRecord {
            holder: "ci-1".into(),
            token: "abc".into(),
            renewed_at: now - chrono::Duration::seconds(45),
            lease_seconds: 30,
        };
        assert!(record.is_expired(now));
        assert!(!LeaseRecord { lease_seconds: 60, ..record }.is_expired(now));
    }

    #[test]
    fn test_corrupt_lease_counts_as_expired() {
        let now = Utc::now();
        let record = LeaseRecord {
            holder: "ci-1".into(),
            token: "abc".into(),
            renewed_at: now,
            lease_seconds: u64::MAX,
        };
        assert!(record.is_expired(now));
        assert!(LeaseRecord { lease_seconds: i64::MAX as u64, ..record.clone() }.is_expired(now));
        assert!(
            LeaseRecord {
                renewed_at: DateTime::<Utc>::MAX_UTC,
                lease_seconds: 30,
                ..record
            }
            .is_expired(now)
        );
    }

    #[test]
    fn test_lease_record_format() {
        let record = LeaseRecord {
            holder: "ci-1".into(),
            token: "abc".into(),
            renewed_at: DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            lease_seconds: 30,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["holder"], "ci-1");
        assert_eq!(json["leaseSeconds"], 30);
        assert_eq!(json["renewedAt"], "2026-01-01T00:00:00Z");
    }
}
