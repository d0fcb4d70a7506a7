//! Deterministic artifact addressing.
//!
//! Prefetch files and raw traces live in a per-component directory tree
//! derived purely from the (package, activity, version) triple, so every
//! call site that needs a path computes the same one.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{CoreError, Result};

pub const COMPILED_TRACE_FILE_NAME: &str = "compiled_trace.pb";

/// The (package, activity, version) triple addressing prefetch artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionedComponentName {
    pub package_name: String,
    pub activity_name: String,
    pub version: i64,
}

impl VersionedComponentName {
    pub fn new(
        package_name: impl Into<String>,
        activity_name: impl Into<String>,
        version: i64,
    ) -> Self {
        Self {
            package_name: package_name.into(),
            activity_name: activity_name.into(),
            version,
        }
    }

    /// Directory holding every artifact for this component version.
    pub fn component_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.package_name)
            .join(self.version.to_string())
            .join(&self.activity_name)
    }

    /// Path of the compiled prefetch file. Pure: two calls with the same
    /// triple and root always agree.
    pub fn compiled_trace_path(&self, root: &Path) -> PathBuf {
        self.component_dir(root).join(COMPILED_TRACE_FILE_NAME)
    }

    /// Path for the raw trace captured for one launch history.
    pub fn raw_trace_path(&self, root: &Path, history_id: i64) -> PathBuf {
        self.component_dir(root)
            .join("raw_traces")
            .join(format!("{}.pb", history_id))
    }
}

impl fmt::Display for VersionedComponentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{}",
            self.package_name, self.activity_name, self.version
        )
    }
}

/// Creates the parent directories of `path` if they do not exist.
pub fn mkdir_with_parents(path: &Path) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) => parent,
        None => return Ok(()),
    };
    std::fs::create_dir_all(parent).map_err(|err| CoreError::MkdirFailed {
        path: parent.to_path_buf(),
        source: err,
    })
}
