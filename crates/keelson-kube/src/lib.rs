//! Keelson Kube - the Kubernetes deploy engine
//!
//! This crate provides:
//! - **Classifier**: compare desired resources with the cluster through dry-run applies
//! - **Plan Builder**: order a deploy into phases and weight groups of batched operations
//! - **Executor**: run a plan with bounded concurrency and fail-fast semantics
//! - **Failure Plan**: mark a failed release and clean up after failed hooks
//! - **Release History**: revisions of a release over pluggable storage drivers
//! - **Lock Manager**: one deploy at a time per release, with lease-loss detection
//! - **Deployer**: the whole pipeline, plus plan-only previews and rollbacks

pub mod classifier;
pub mod client;
pub mod config;
pub mod deploy;
pub mod error;
pub mod executor;
pub mod failure;
pub mod history;
pub mod lock;
pub mod plan;
pub mod plan_builder;
pub mod readiness;
pub mod storage;
pub mod tracker;

pub use classifier::{
    Classification, ClassifiedResource, Classifier, DeployClassification, ResourceStatus,
};
pub use client::{ClusterClient, FakeCluster, KubeCluster, Mutation};
pub use config::{DeployConfig, DeployContext, FIELD_MANAGER};
pub use deploy::{DeployOutcome, DeployPreview, DeployRequest, Deployer};
pub use error::{KubeError, MultiError, Result};
pub use executor::Executor;
pub use failure::FailurePlanBuilder;
pub use history::History;
pub use lock::{ConfigMapLocker, LockGuard, LockManager, Locker, MemoryLocker};
pub use plan::{Operation, OperationKind, OperationStatus, Phase, PhaseKind, Plan, Report, Skipped};
pub use plan_builder::{BuiltPlan, CleanupCandidate, DeployPlanBuilder};
pub use readiness::Readiness;
pub use storage::{
    CompressionMethod, ConfigMapDriver, DriverKind, FileDriver, LabelSelector, MemoryDriver,
    OperationCounts, SecretsDriver, StorageConfig, StorageDriver,
};
pub use tracker::{FakeTracker, PollingTracker, TrackOptions, TrackTarget, Tracker};
