//! Package-version cache over the remote package manager.
//!
//! The event router asks for versions on every persisted launch, so the
//! answers are memoized here. The cache is only touched from
//! non-latency-critical paths, which is why the on-demand remote query runs
//! while the cache mutex is held.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, error, warn};

use crate::error::{CoreError, Result};

/// Sentinel returned when a package version cannot be resolved.
pub const UNKNOWN_VERSION: i64 = -1;

/// Source of installed-package versions. The production implementation talks
/// to the platform package manager; tests substitute a fake.
pub trait PackageManagerRemote: Send + Sync {
    /// Full name→version snapshot of the installed packages.
    fn package_version_map(&self) -> Result<HashMap<String, i64>>;

    /// Version of a single package, or None when the remote cannot resolve it.
    fn package_version(&self, package_name: &str) -> Option<i64>;
}

pub struct PackageVersionMap {
    remote: Box<dyn PackageManagerRemote>,
    versions: Mutex<HashMap<String, i64>>,
}

impl PackageVersionMap {
    /// Builds the cache from a full remote snapshot. A failed snapshot is
    /// fatal to the service.
    pub fn create(remote: Box<dyn PackageManagerRemote>) -> Result<Self> {
        let versions = remote
            .package_version_map()
            .map_err(|err| CoreError::RemoteUnavailable(err.to_string()))?;
        debug!(packages = versions.len(), "Package version map created");
        Ok(Self {
            remote,
            versions: Mutex::new(versions),
        })
    }

    /// Atomically replaces the map with a fresh snapshot.
    pub fn update(&self) -> Result<()> {
        let fresh = self.remote.package_version_map()?;
        let mut versions = self.lock_versions();
        let old_size = versions.len();
        *versions = fresh;
        debug!(
            old_size,
            new_size = versions.len(),
            "Package version map refreshed"
        );
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.lock_versions().len()
    }

    /// Returns the cached version, filling the cache from the remote on a
    /// miss. Returns [`UNKNOWN_VERSION`] when the remote cannot resolve the
    /// package either.
    pub fn get_or_query_package_version(&self, package_name: &str) -> i64 {
        let mut versions = self.lock_versions();
        if let Some(version) = versions.get(package_name) {
            return *version;
        }

        warn!(package = package_name, "Version not cached, querying remote");
        match self.remote.package_version(package_name) {
            Some(version) => {
                versions.insert(package_name.to_string(), version);
                version
            }
            None => {
                error!(package = package_name, "Cannot resolve package version");
                UNKNOWN_VERSION
            }
        }
    }

    fn lock_versions(&self) -> std::sync::MutexGuard<'_, HashMap<String, i64>> {
        match self.versions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeRemote {
        snapshot: HashMap<String, i64>,
        on_demand: HashMap<String, i64>,
        snapshot_fails: bool,
        queries: Arc<AtomicUsize>,
    }

    impl FakeRemote {
        fn new(snapshot: &[(&str, i64)], on_demand: &[(&str, i64)]) -> Self {
            Self {
                snapshot: snapshot
                    .iter()
                    .map(|(name, version)| (name.to_string(), *version))
                    .collect(),
                on_demand: on_demand
                    .iter()
                    .map(|(name, version)| (name.to_string(), *version))
                    .collect(),
                snapshot_fails: false,
                queries: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn failing() -> Self {
            let mut remote = Self::new(&[], &[]);
            remote.snapshot_fails = true;
            remote
        }
    }

    impl PackageManagerRemote for FakeRemote {
        fn package_version_map(&self) -> Result<HashMap<String, i64>> {
            if self.snapshot_fails {
                return Err(CoreError::RemoteUnavailable("no service".to_string()));
            }
            Ok(self.snapshot.clone())
        }

        fn package_version(&self, package_name: &str) -> Option<i64> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            self.on_demand.get(package_name).copied()
        }
    }

    #[test]
    fn create_snapshots_the_remote() {
        let map = PackageVersionMap::create(Box::new(FakeRemote::new(
            &[("com.example.mail", 1), ("com.example.cam", 7)],
            &[],
        )))
        .expect("create");

        assert_eq!(map.size(), 2);
        assert_eq!(map.get_or_query_package_version("com.example.cam"), 7);
    }

    #[test]
    fn create_fails_when_remote_unreachable() {
        let result = PackageVersionMap::create(Box::new(FakeRemote::failing()));
        assert!(matches!(result, Err(CoreError::RemoteUnavailable(_))));
    }

    #[test]
    fn miss_queries_remote_then_caches() {
        let remote = Box::new(FakeRemote::new(
            &[("com.example.mail", 1)],
            &[("com.example.other", 2)],
        ));
        let map = PackageVersionMap::create(remote).expect("create");

        assert_eq!(map.get_or_query_package_version("com.example.other"), 2);
        // Second lookup is served from the writeback, not the remote.
        assert_eq!(map.get_or_query_package_version("com.example.other"), 2);
        assert_eq!(map.size(), 2);
    }

    #[test]
    fn second_lookup_skips_remote() {
        let remote = FakeRemote::new(&[], &[("com.example.other", 2)]);
        let queries = Arc::clone(&remote.queries);
        let map = PackageVersionMap::create(Box::new(remote)).expect("create");

        assert_eq!(map.get_or_query_package_version("com.example.other"), 2);
        assert_eq!(map.get_or_query_package_version("com.example.other"), 2);

        assert_eq!(queries.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unresolvable_package_yields_sentinel() {
        let map =
            PackageVersionMap::create(Box::new(FakeRemote::new(&[], &[]))).expect("create");
        assert_eq!(
            map.get_or_query_package_version("com.example.ghost"),
            UNKNOWN_VERSION
        );
        // Failed lookups are not cached.
        assert_eq!(map.size(), 0);
    }

    #[test]
    fn update_replaces_snapshot() {
        let map = PackageVersionMap::create(Box::new(FakeRemote::new(
            &[("com.example.mail", 1)],
            &[],
        )))
        .expect("create");
        assert_eq!(map.size(), 1);

        map.update().expect("update");
        assert_eq!(map.size(), 1);
        assert_eq!(map.get_or_query_package_version("com.example.mail"), 1);
    }
}
