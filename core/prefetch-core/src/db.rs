//! SQLite persistence for prefetchd.
//!
//! Single-writer store shared by the event router and the maintenance
//! controller. The schema is intentionally small: observed packages and
//! activities, per-launch history rows, captured raw traces, and the
//! compiled prefetch artifacts.

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::PathBuf;

use crate::error::{CoreError, Result};
use crate::paths::VersionedComponentName;

pub struct Db {
    path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRow {
    pub id: i64,
    pub name: String,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityRow {
    pub id: i64,
    pub name: String,
    pub package_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchHistoryRow {
    pub id: i64,
    pub activity_id: i64,
    pub temperature: i64,
    pub trace_enabled: bool,
    pub intent_started_ns: Option<i64>,
    pub total_time_ns: Option<i64>,
    pub report_fully_drawn_ns: Option<i64>,
}

/// Insertion value for a launch history; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewLaunchHistory {
    pub activity_id: i64,
    pub temperature: i64,
    pub trace_enabled: bool,
    pub intent_started_ns: Option<i64>,
    pub total_time_ns: Option<i64>,
    pub report_fully_drawn_ns: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTraceRow {
    pub id: i64,
    pub history_id: i64,
    pub file_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefetchFileRow {
    pub id: i64,
    pub activity_id: i64,
    pub file_path: String,
}

impl Db {
    /// Opens the store at `path`, creating the schema if needed.
    pub fn open(path: PathBuf) -> Result<Self> {
        let db = Self { path };
        db.init_schema()?;
        Ok(db)
    }

    pub fn select_packages(&self) -> Result<Vec<PackageRow>> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT id, name, version FROM packages ORDER BY id ASC")
                .map_err(|err| CoreError::db("prepare packages query", err))?;

            let rows = stmt
                .query_map([], |row| {
                    Ok(PackageRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        version: row.get(2)?,
                    })
                })
                .map_err(|err| CoreError::db("query packages", err))?;

            let mut packages = Vec::new();
            for row in rows {
                packages.push(row.map_err(|err| CoreError::db("decode package row", err))?);
            }
            Ok(packages)
        })
    }

    pub fn select_package_by_name_and_version(
        &self,
        name: &str,
        version: i64,
    ) -> Result<Option<PackageRow>> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT id, name, version FROM packages WHERE name = ?1 AND version = ?2",
                params![name, version],
                |row| {
                    Ok(PackageRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        version: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(|err| CoreError::db("query package by name and version", err))
        })
    }

    /// Returns the existing (name, version) row or inserts a new one.
    pub fn get_or_insert_package(&self, name: &str, version: i64) -> Result<PackageRow> {
        if let Some(existing) = self.select_package_by_name_and_version(name, version)? {
            return Ok(existing);
        }
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO packages (name, version) VALUES (?1, ?2) \
                 ON CONFLICT(name, version) DO NOTHING",
                params![name, version],
            )
            .map_err(|err| CoreError::db("insert package", err))?;
            conn.query_row(
                "SELECT id, name, version FROM packages WHERE name = ?1 AND version = ?2",
                params![name, version],
                |row| {
                    Ok(PackageRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        version: row.get(2)?,
                    })
                },
            )
            .map_err(|err| CoreError::db("reread inserted package", err))
        })
    }

    pub fn select_activities_by_package_id(&self, package_id: i64) -> Result<Vec<ActivityRow>> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, name, package_id FROM activities \
                     WHERE package_id = ?1 ORDER BY id ASC",
                )
                .map_err(|err| CoreError::db("prepare activities query", err))?;

            let rows = stmt
                .query_map(params![package_id], |row| {
                    Ok(ActivityRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        package_id: row.get(2)?,
                    })
                })
                .map_err(|err| CoreError::db("query activities", err))?;

            let mut activities = Vec::new();
            for row in rows {
                activities.push(row.map_err(|err| CoreError::db("decode activity row", err))?);
            }
            Ok(activities)
        })
    }

    pub fn select_activity_by_name_and_package_id(
        &self,
        name: &str,
        package_id: i64,
    ) -> Result<Option<ActivityRow>> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT id, name, package_id FROM activities \
                 WHERE name = ?1 AND package_id = ?2",
                params![name, package_id],
                |row| {
                    Ok(ActivityRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        package_id: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(|err| CoreError::db("query activity by name and package", err))
        })
    }

    pub fn get_or_insert_activity(&self, name: &str, package_id: i64) -> Result<ActivityRow> {
        if let Some(existing) = self.select_activity_by_name_and_package_id(name, package_id)? {
            return Ok(existing);
        }
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO activities (name, package_id) VALUES (?1, ?2) \
                 ON CONFLICT(name, package_id) DO NOTHING",
                params![name, package_id],
            )
            .map_err(|err| CoreError::db("insert activity", err))?;
            conn.query_row(
                "SELECT id, name, package_id FROM activities \
                 WHERE name = ?1 AND package_id = ?2",
                params![name, package_id],
                |row| {
                    Ok(ActivityRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        package_id: row.get(2)?,
                    })
                },
            )
            .map_err(|err| CoreError::db("reread inserted activity", err))
        })
    }

    pub fn insert_launch_history(&self, new: &NewLaunchHistory) -> Result<LaunchHistoryRow> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO launch_histories \
                    (activity_id, temperature, trace_enabled, intent_started_ns, \
                     total_time_ns, report_fully_drawn_ns) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    new.activity_id,
                    new.temperature,
                    new.trace_enabled,
                    new.intent_started_ns,
                    new.total_time_ns,
                    new.report_fully_drawn_ns,
                ],
            )
            .map_err(|err| CoreError::db("insert launch history", err))?;

            let id = conn.last_insert_rowid();
            Ok(LaunchHistoryRow {
                id,
                activity_id: new.activity_id,
                temperature: new.temperature,
                trace_enabled: new.trace_enabled,
                intent_started_ns: new.intent_started_ns,
                total_time_ns: new.total_time_ns,
                report_fully_drawn_ns: new.report_fully_drawn_ns,
            })
        })
    }

    /// Histories eligible for compilation. Callers must not filter these
    /// further; the eligibility policy lives in this query alone.
    pub fn select_activity_history_for_compile(
        &self,
        activity_id: i64,
    ) -> Result<Vec<LaunchHistoryRow>> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, activity_id, temperature, trace_enabled, \
                            intent_started_ns, total_time_ns, report_fully_drawn_ns \
                     FROM launch_histories \
                     WHERE activity_id = ?1 AND trace_enabled = 1 \
                     ORDER BY id ASC",
                )
                .map_err(|err| CoreError::db("prepare history query", err))?;

            let rows = stmt
                .query_map(params![activity_id], |row| {
                    Ok(LaunchHistoryRow {
                        id: row.get(0)?,
                        activity_id: row.get(1)?,
                        temperature: row.get(2)?,
                        trace_enabled: row.get(3)?,
                        intent_started_ns: row.get(4)?,
                        total_time_ns: row.get(5)?,
                        report_fully_drawn_ns: row.get(6)?,
                    })
                })
                .map_err(|err| CoreError::db("query histories", err))?;

            let mut histories = Vec::new();
            for row in rows {
                histories.push(row.map_err(|err| CoreError::db("decode history row", err))?);
            }
            Ok(histories)
        })
    }

    /// Records a late fully-drawn report against an already persisted history.
    pub fn update_report_fully_drawn(&self, history_id: i64, timestamp_ns: i64) -> Result<()> {
        self.with_connection(|conn| {
            let updated = conn
                .execute(
                    "UPDATE launch_histories SET report_fully_drawn_ns = ?2 WHERE id = ?1",
                    params![history_id, timestamp_ns],
                )
                .map_err(|err| CoreError::db("update report fully drawn", err))?;
            if updated == 0 {
                tracing::warn!(history_id, "No history row for fully-drawn report");
            }
            Ok(())
        })
    }

    pub fn insert_raw_trace(&self, history_id: i64, file_path: &str) -> Result<RawTraceRow> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO raw_traces (history_id, file_path) VALUES (?1, ?2)",
                params![history_id, file_path],
            )
            .map_err(|err| CoreError::db("insert raw trace", err))?;

            Ok(RawTraceRow {
                id: conn.last_insert_rowid(),
                history_id,
                file_path: file_path.to_string(),
            })
        })
    }

    pub fn select_raw_trace_by_history_id(&self, history_id: i64) -> Result<Option<RawTraceRow>> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT id, history_id, file_path FROM raw_traces WHERE history_id = ?1",
                params![history_id],
                |row| {
                    Ok(RawTraceRow {
                        id: row.get(0)?,
                        history_id: row.get(1)?,
                        file_path: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(|err| CoreError::db("query raw trace", err))
        })
    }

    pub fn insert_prefetch_file(
        &self,
        activity_id: i64,
        file_path: &str,
    ) -> Result<PrefetchFileRow> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO prefetch_files (activity_id, file_path) VALUES (?1, ?2)",
                params![activity_id, file_path],
            )
            .map_err(|err| CoreError::db("insert prefetch file", err))?;

            Ok(PrefetchFileRow {
                id: conn.last_insert_rowid(),
                activity_id,
                file_path: file_path.to_string(),
            })
        })
    }

    /// The current (newest) prefetch file for the component triple, or None
    /// when the triple is unknown or nothing was compiled yet.
    pub fn select_prefetch_file_by_vcn(
        &self,
        vcn: &VersionedComponentName,
    ) -> Result<Option<PrefetchFileRow>> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT pf.id, pf.activity_id, pf.file_path \
                 FROM prefetch_files pf \
                 JOIN activities a ON a.id = pf.activity_id \
                 JOIN packages p ON p.id = a.package_id \
                 WHERE p.name = ?1 AND p.version = ?2 AND a.name = ?3 \
                 ORDER BY pf.id DESC LIMIT 1",
                params![vcn.package_name, vcn.version, vcn.activity_name],
                |row| {
                    Ok(PrefetchFileRow {
                        id: row.get(0)?,
                        activity_id: row.get(1)?,
                        file_path: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(|err| CoreError::db("query prefetch file by component", err))
        })
    }

    fn init_schema(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS packages (
                    id INTEGER PRIMARY KEY,
                    name TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    UNIQUE(name, version)
                 );
                 CREATE TABLE IF NOT EXISTS activities (
                    id INTEGER PRIMARY KEY,
                    name TEXT NOT NULL,
                    package_id INTEGER NOT NULL REFERENCES packages(id),
                    UNIQUE(name, package_id)
                 );
                 CREATE TABLE IF NOT EXISTS launch_histories (
                    id INTEGER PRIMARY KEY,
                    activity_id INTEGER NOT NULL REFERENCES activities(id),
                    temperature INTEGER NOT NULL DEFAULT 0,
                    trace_enabled INTEGER NOT NULL DEFAULT 0,
                    intent_started_ns INTEGER,
                    total_time_ns INTEGER,
                    report_fully_drawn_ns INTEGER
                 );
                 CREATE TABLE IF NOT EXISTS raw_traces (
                    id INTEGER PRIMARY KEY,
                    history_id INTEGER NOT NULL UNIQUE REFERENCES launch_histories(id),
                    file_path TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS prefetch_files (
                    id INTEGER PRIMARY KEY,
                    activity_id INTEGER NOT NULL REFERENCES activities(id),
                    file_path TEXT NOT NULL
                 );
                 COMMIT;",
            )
            .map_err(|err| CoreError::db("initialize schema", err))
        })
    }

    fn with_connection<T>(&self, op: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.open_connection()?;
        op(&mut conn)
    }

    fn open_connection(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| CoreError::io("create database dir", err))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| CoreError::db("open sqlite db", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| CoreError::db("enable WAL", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| CoreError::db("set synchronous", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| CoreError::db("set busy_timeout", err))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|err| CoreError::db("enable foreign keys", err))?;

        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, Db) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Db::open(temp_dir.path().join("state.db")).expect("db init");
        (temp_dir, db)
    }

    fn history(activity_id: i64, trace_enabled: bool) -> NewLaunchHistory {
        NewLaunchHistory {
            activity_id,
            temperature: 0,
            trace_enabled,
            intent_started_ns: Some(1_000),
            total_time_ns: Some(300),
            report_fully_drawn_ns: None,
        }
    }

    #[test]
    fn package_name_version_is_unique() {
        let (_guard, db) = test_db();

        let first = db.get_or_insert_package("com.example.mail", 1).unwrap();
        let second = db.get_or_insert_package("com.example.mail", 1).unwrap();
        assert_eq!(first, second);

        let upgraded = db.get_or_insert_package("com.example.mail", 2).unwrap();
        assert_ne!(first.id, upgraded.id);

        assert_eq!(db.select_packages().unwrap().len(), 2);
    }

    #[test]
    fn selects_package_by_name_and_version() {
        let (_guard, db) = test_db();
        db.get_or_insert_package("com.example.mail", 3).unwrap();

        let found = db
            .select_package_by_name_and_version("com.example.mail", 3)
            .unwrap();
        assert!(found.is_some());

        let missing = db
            .select_package_by_name_and_version("com.example.mail", 4)
            .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn activities_scoped_to_package() {
        let (_guard, db) = test_db();
        let pkg_v1 = db.get_or_insert_package("com.example.mail", 1).unwrap();
        let pkg_v2 = db.get_or_insert_package("com.example.mail", 2).unwrap();

        let a1 = db.get_or_insert_activity("Inbox", pkg_v1.id).unwrap();
        let a1_again = db.get_or_insert_activity("Inbox", pkg_v1.id).unwrap();
        let a2 = db.get_or_insert_activity("Inbox", pkg_v2.id).unwrap();

        assert_eq!(a1, a1_again);
        assert_ne!(a1.id, a2.id);
        assert_eq!(db.select_activities_by_package_id(pkg_v1.id).unwrap().len(), 1);
    }

    #[test]
    fn compile_eligibility_excludes_untraced_histories() {
        let (_guard, db) = test_db();
        let pkg = db.get_or_insert_package("com.example.mail", 1).unwrap();
        let activity = db.get_or_insert_activity("Inbox", pkg.id).unwrap();

        db.insert_launch_history(&history(activity.id, true)).unwrap();
        db.insert_launch_history(&history(activity.id, false)).unwrap();
        db.insert_launch_history(&history(activity.id, true)).unwrap();

        let eligible = db
            .select_activity_history_for_compile(activity.id)
            .unwrap();
        assert_eq!(eligible.len(), 2);
        assert!(eligible.iter().all(|h| h.trace_enabled));
    }

    #[test]
    fn updates_report_fully_drawn_after_insert() {
        let (_guard, db) = test_db();
        let pkg = db.get_or_insert_package("com.example.mail", 1).unwrap();
        let activity = db.get_or_insert_activity("Inbox", pkg.id).unwrap();
        let row = db.insert_launch_history(&history(activity.id, true)).unwrap();
        assert_eq!(row.report_fully_drawn_ns, None);

        db.update_report_fully_drawn(row.id, 12_345).unwrap();

        let histories = db
            .select_activity_history_for_compile(activity.id)
            .unwrap();
        assert_eq!(histories[0].report_fully_drawn_ns, Some(12_345));
    }

    #[test]
    fn raw_trace_is_at_most_one_per_history() {
        let (_guard, db) = test_db();
        let pkg = db.get_or_insert_package("com.example.mail", 1).unwrap();
        let activity = db.get_or_insert_activity("Inbox", pkg.id).unwrap();
        let row = db.insert_launch_history(&history(activity.id, true)).unwrap();

        db.insert_raw_trace(row.id, "/traces/1.pb").unwrap();
        assert!(db.insert_raw_trace(row.id, "/traces/other.pb").is_err());

        let trace = db
            .select_raw_trace_by_history_id(row.id)
            .unwrap()
            .expect("trace row");
        assert_eq!(trace.file_path, "/traces/1.pb");
    }

    #[test]
    fn prefetch_file_round_trips_through_component_name() {
        let (_guard, db) = test_db();
        let pkg = db.get_or_insert_package("com.example.mail", 5).unwrap();
        let activity = db.get_or_insert_activity("Inbox", pkg.id).unwrap();

        let inserted = db
            .insert_prefetch_file(activity.id, "/prefetch/compiled_trace.pb")
            .unwrap();

        let vcn = VersionedComponentName::new("com.example.mail", "Inbox", 5);
        let selected = db
            .select_prefetch_file_by_vcn(&vcn)
            .unwrap()
            .expect("prefetch row");
        assert_eq!(selected.file_path, inserted.file_path);
        assert_eq!(selected.activity_id, activity.id);
    }

    #[test]
    fn newest_prefetch_file_wins() {
        let (_guard, db) = test_db();
        let pkg = db.get_or_insert_package("com.example.mail", 5).unwrap();
        let activity = db.get_or_insert_activity("Inbox", pkg.id).unwrap();

        db.insert_prefetch_file(activity.id, "/prefetch/old.pb").unwrap();
        db.insert_prefetch_file(activity.id, "/prefetch/new.pb").unwrap();

        let vcn = VersionedComponentName::new("com.example.mail", "Inbox", 5);
        let selected = db.select_prefetch_file_by_vcn(&vcn).unwrap().unwrap();
        assert_eq!(selected.file_path, "/prefetch/new.pb");
    }

    #[test]
    fn unknown_component_has_no_prefetch_file() {
        let (_guard, db) = test_db();
        let vcn = VersionedComponentName::new("com.example.none", "Missing", 1);
        assert!(db.select_prefetch_file_by_vcn(&vcn).unwrap().is_none());
    }
}
