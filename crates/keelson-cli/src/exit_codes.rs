//! Standard exit codes for CLI operations
//!
//! These exit codes follow Unix conventions and sysexits.h where applicable.

#![allow(dead_code)]

/// Success - operation completed without errors
pub const SUCCESS: i32 = 0;

/// General error - unspecified failure
pub const ERROR: i32 = 1;

/// Validation error - invalid release name, manifest, annotation or immutable conflict
pub const VALIDATION_ERROR: i32 = 2;

/// Deploy failed after reaching the cluster; the release is marked failed
pub const DEPLOY_FAILED: i32 = 3;

/// Lock could not be acquired
pub const LOCK_ERROR: i32 = 4;

/// IO error - file not found, permission denied, etc.
pub const IO_ERROR: i32 = 5;

/// Lock lease lost mid-deploy, the process stopped without further changes
pub const LOCK_LOST: i32 = 6;

/// Cluster changed but the release record could not be finalized
pub const RECORD_STUCK: i32 = 7;

/// Configuration error - unreadable or invalid configuration (sysexits.h EX_CONFIG)
pub const CONFIG_ERROR: i32 = 78;
