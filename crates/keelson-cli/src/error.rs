//! CLI error types with exit code handling
//!
//! Every failure is mapped to a [`CliError`] so `main` can pick the exit code.

use keelson_kube::KubeError;
use miette::Diagnostic;
use thiserror::Error;

use crate::exit_codes;

/// CLI-specific error type that includes exit code information
#[derive(Error, Debug, Diagnostic, Clone)]
pub enum CliError {
    /// Invalid input rejected before touching the cluster
    #[error("Validation failed: {message}")]
    #[diagnostic(code(keelson::cli::validation))]
    Validation {
        message: String,
        #[help]
        help: Option<String>,
    },

    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(keelson::cli::config))]
    Config { message: String },

    /// Deploy failed and the failure plan ran
    #[error("{message}")]
    #[diagnostic(code(keelson::cli::deploy_failed))]
    DeployFailed {
        message: String,
        #[help]
        summary: Option<String>,
    },

    #[error("{message}")]
    #[diagnostic(
        code(keelson::cli::lock),
        help("another deploy of this release may still be running")
    )]
    Lock { message: String },

    #[error("{message}")]
    #[diagnostic(
        code(keelson::cli::lock_lost),
        help("the release may be left pending; check `keelson status` before deploying again")
    )]
    LockLost { message: String },

    #[error("{message}")]
    #[diagnostic(code(keelson::cli::record_stuck))]
    RecordStuck { message: String },

    /// IO error (file not found, permissions, etc.)
    #[error("IO error: {message}")]
    #[diagnostic(code(keelson::cli::io))]
    Io { message: String },

    /// Cluster or storage error
    #[error("{message}")]
    #[diagnostic(code(keelson::cli::kube))]
    Kube { message: String },
}

impl CliError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Validation { .. } => exit_codes::VALIDATION_ERROR,
            CliError::Config { .. } => exit_codes::CONFIG_ERROR,
            CliError::DeployFailed { .. } => exit_codes::DEPLOY_FAILED,
            CliError::Lock { .. } => exit_codes::LOCK_ERROR,
            CliError::LockLost { .. } => exit_codes::LOCK_LOST,
            CliError::RecordStuck { .. } => exit_codes::RECORD_STUCK,
            CliError::Io { .. } => exit_codes::IO_ERROR,
            CliError::Kube { .. } => exit_codes::ERROR,
        }
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            help: None,
        }
    }

    /// Create a validation error with help text
    pub fn validation_with_help(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            help: Some(help.into()),
        }
    }

    /// IO error naming the file involved
    pub fn io_at(path: &std::path::Path, err: std::io::Error) -> Self {
        Self::Io {
            message: format!("{}: {}", path.display(), err),
        }
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        CliError::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CliError {
    fn from(err: serde_json::Error) -> Self {
        CliError::Kube {
            message: format!("could not encode output: {}", err),
        }
    }
}

impl From<KubeError> for CliError {
    fn from(err: KubeError) -> Self {
        let message = err.to_string();
        if err.is_lock_lost() {
            return CliError::LockLost { message };
        }
        if err.is_record_stuck() {
            return CliError::RecordStuck { message };
        }
        match &err {
            KubeError::Validation(_) | KubeError::ImmutableConflicts { .. } => {
                CliError::Validation {
                    message,
                    help: None,
                }
            }
            KubeError::NoRollbackTarget { .. } => CliError::validation_with_help(
                message,
                "run `keelson history` to list the available revisions",
            ),
            KubeError::InvalidConfig(_) => CliError::Config { message },
            KubeError::LockAcquire { .. } => CliError::Lock { message },
            KubeError::DeployFailed { report, .. } => CliError::DeployFailed {
                message,
                summary: Some(format!("completed before the failure: {}", report.summary())),
            },
            KubeError::Io(_) => CliError::Io { message },
            _ => CliError::Kube { message },
        }
    }
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
