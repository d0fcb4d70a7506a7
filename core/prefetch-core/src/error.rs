//! Error types for prefetch-core operations.

use std::path::PathBuf;

/// All errors that can occur in prefetch-core operations.
///
/// Per-activity failures never abort a per-package or per-device compile
/// pass; the compile entry points fold these into a boolean aggregate and
/// leave the detail in logs.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Package not found: {name}@{version}")]
    PackageNotFound { name: String, version: i64 },

    #[error("Activity not found: {name} (package_id {package_id})")]
    ActivityNotFound { name: String, package_id: i64 },

    #[error("Insufficient evidence: {got} usable traces, need {need}")]
    InsufficientEvidence { got: usize, need: usize },

    #[error("Package manager unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Database error: {context}: {source}")]
    Db {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Compiler child terminated abnormally")]
    ChildAbnormal,

    #[error("Compiler exited with status {0}")]
    ChildFailed(i32),

    #[error("Directory creation failed: {path}: {source}")]
    MkdirFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CoreError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        CoreError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn db(context: impl Into<String>, source: rusqlite::Error) -> Self {
        CoreError::Db {
            context: context.into(),
            source,
        }
    }
}

/// Convenience type alias for Results using CoreError.
pub type Result<T> = std::result::Result<T, CoreError>;
