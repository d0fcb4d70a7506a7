//! Installed-package versions from a local manifest.
//!
//! The platform package manager is an external collaborator; this daemon
//! reads its view of installed versions from a `packages.json` file
//! (`{"name": version}`) maintained alongside the data directory.

use std::collections::HashMap;
use std::path::PathBuf;

use prefetch_core::version_map::PackageManagerRemote;
use prefetch_core::{CoreError, Result};
use tracing::warn;

pub struct PackageListRemote {
    manifest_path: PathBuf,
}

impl PackageListRemote {
    pub fn new(manifest_path: PathBuf) -> Self {
        Self { manifest_path }
    }

    fn read_manifest(&self) -> Result<HashMap<String, i64>> {
        let contents = match fs_err::read_to_string(&self.manifest_path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    path = %self.manifest_path.display(),
                    "No package manifest, starting with an empty version map"
                );
                return Ok(HashMap::new());
            }
            Err(err) => {
                return Err(CoreError::RemoteUnavailable(format!(
                    "cannot read package manifest: {}",
                    err
                )))
            }
        };

        serde_json::from_str(&contents).map_err(|err| {
            CoreError::RemoteUnavailable(format!("package manifest is invalid JSON: {}", err))
        })
    }
}

impl PackageManagerRemote for PackageListRemote {
    fn package_version_map(&self) -> Result<HashMap<String, i64>> {
        self.read_manifest()
    }

    fn package_version(&self, package_name: &str) -> Option<i64> {
        match self.read_manifest() {
            Ok(manifest) => manifest.get(package_name).copied(),
            Err(err) => {
                warn!(error = %err, package = package_name, "Package version lookup failed");
                None
            }
        }
    }
}
