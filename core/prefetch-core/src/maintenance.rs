//! Idle-time compilation of raw launch traces into prefetch files.
//!
//! The controller walks the store and, for every activity with enough
//! usable raw traces, runs the external compiler binary over them and
//! records the resulting artifact. Per-activity failures never abort a
//! per-package or device-wide pass; the aggregate result is folded with AND.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local, Utc};
use tracing::{debug, error};

use crate::db::{Db, LaunchHistoryRow};
use crate::dump::Printer;
use crate::error::{CoreError, Result};
use crate::paths::{mkdir_with_parents, VersionedComponentName};

pub const DEFAULT_MIN_TRACES: usize = 3;
pub const DEFAULT_COMPILER_PATH: &str = "/usr/libexec/prefetchd/prefetch-compiler";

/// Seam for spawning the compiler child, so tests never fork real
/// processes. The wait on the child lives inside the implementation, which
/// is also where a future timeout/kill supervisor would attach.
pub trait CompilerExec: Send + Sync {
    fn run_compiler(&self, binary: &Path, argv: &[String]) -> io::Result<ExitStatus>;
}

/// Spawns the real compiler. The child inherits the daemon's environment.
pub struct SystemExec;

impl CompilerExec for SystemExec {
    fn run_compiler(&self, binary: &Path, argv: &[String]) -> io::Result<ExitStatus> {
        let mut child = Command::new(binary).args(argv).spawn()?;
        child.wait()
    }
}

/// One raw trace handed to the compiler, with the timestamp ceiling beyond
/// which its events are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationInput {
    pub filename: String,
    pub timestamp_limit_ns: u64,
}

#[derive(Clone)]
pub struct ControllerParameters {
    /// Recompile even when the output file already exists on disk.
    pub recompile: bool,
    /// Minimum usable raw traces before a compile is attempted.
    pub min_traces: usize,
    pub output_text: bool,
    pub inode_textcache: Option<PathBuf>,
    pub verbose: bool,
    pub compiler_path: PathBuf,
    /// Root of the derived prefetch-file tree.
    pub prefetch_root: PathBuf,
    pub exec: Arc<dyn CompilerExec>,
}

impl ControllerParameters {
    pub fn new(prefetch_root: PathBuf, exec: Arc<dyn CompilerExec>) -> Self {
        Self {
            recompile: false,
            min_traces: DEFAULT_MIN_TRACES,
            output_text: false,
            inode_textcache: None,
            verbose: false,
            compiler_path: PathBuf::from(DEFAULT_COMPILER_PATH),
            prefetch_root,
            exec,
        }
    }
}

/// Statistics from the most recent device-wide pass, for operator dumps.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastJobInfo {
    pub last_run: Option<DateTime<Utc>>,
    pub activities_last_compiled: usize,
}

pub struct CompilationController {
    params: ControllerParameters,
    last_job_info: Mutex<LastJobInfo>,
}

impl CompilationController {
    pub fn new(params: ControllerParameters) -> Self {
        Self {
            params,
            last_job_info: Mutex::new(LastJobInfo::default()),
        }
    }

    pub fn params(&self) -> &ControllerParameters {
        &self.params
    }

    pub fn last_job_info(&self) -> LastJobInfo {
        *self.lock_job_info()
    }

    /// Compiles every activity of every package in the store.
    pub fn compile_device(&self, db_path: &Path) -> bool {
        let db = match self.open_db(db_path) {
            Some(db) => db,
            None => return false,
        };

        self.lock_job_info().activities_last_compiled = 0;

        let packages = match db.select_packages() {
            Ok(packages) => packages,
            Err(err) => {
                error!(error = %err, "Cannot list packages for device compile");
                return false;
            }
        };

        let mut ret = true;
        for package in packages {
            if !self.compile_package_rows(&db, &package.name, package.version, package.id) {
                ret = false;
            }
        }

        self.lock_job_info().last_run = Some(Utc::now());
        ret
    }

    /// Compiles every activity of one (name, version) package.
    pub fn compile_package(&self, db_path: &Path, package_name: &str, version: i64) -> bool {
        let db = match self.open_db(db_path) {
            Some(db) => db,
            None => return false,
        };
        match self.resolve_package(&db, package_name, version) {
            Ok(package_id) => self.compile_package_rows(&db, package_name, version, package_id),
            Err(err) => {
                error!(error = %err, "Compile package failed");
                false
            }
        }
    }

    /// Compiles a single (package, activity, version) component.
    pub fn compile_activity(
        &self,
        db_path: &Path,
        package_name: &str,
        activity_name: &str,
        version: i64,
    ) -> bool {
        let db = match self.open_db(db_path) {
            Some(db) => db,
            None => return false,
        };
        match self.resolve_package(&db, package_name, version) {
            Ok(package_id) => {
                self.compile_one_activity(&db, package_id, package_name, activity_name, version)
            }
            Err(err) => {
                error!(error = %err, "Compile activity failed");
                false
            }
        }
    }

    fn open_db(&self, db_path: &Path) -> Option<Db> {
        match Db::open(db_path.to_path_buf()) {
            Ok(db) => Some(db),
            Err(err) => {
                error!(error = %err, path = %db_path.display(), "Cannot open database");
                None
            }
        }
    }

    fn resolve_package(&self, db: &Db, package_name: &str, version: i64) -> Result<i64> {
        db.select_package_by_name_and_version(package_name, version)?
            .map(|package| package.id)
            .ok_or_else(|| CoreError::PackageNotFound {
                name: package_name.to_string(),
                version,
            })
    }

    fn compile_package_rows(
        &self,
        db: &Db,
        package_name: &str,
        version: i64,
        package_id: i64,
    ) -> bool {
        let activities = match db.select_activities_by_package_id(package_id) {
            Ok(activities) => activities,
            Err(err) => {
                error!(error = %err, package = package_name, "Cannot list activities");
                return false;
            }
        };

        let mut ret = true;
        for activity in activities {
            if !self.compile_one_activity(db, package_id, package_name, &activity.name, version) {
                ret = false;
            }
        }
        ret
    }

    fn compile_one_activity(
        &self,
        db: &Db,
        package_id: i64,
        package_name: &str,
        activity_name: &str,
        version: i64,
    ) -> bool {
        match self.try_compile_activity(db, package_id, package_name, activity_name, version) {
            Ok(()) => true,
            Err(CoreError::InsufficientEvidence { got, need }) => {
                // Normal for young activities; not an error.
                debug!(
                    activity = activity_name,
                    traces = got,
                    min_traces = need,
                    "Not enough traces for compilation"
                );
                false
            }
            Err(err) => {
                error!(
                    error = %err,
                    package = package_name,
                    activity = activity_name,
                    "Compile activity failed"
                );
                false
            }
        }
    }

    fn try_compile_activity(
        &self,
        db: &Db,
        package_id: i64,
        package_name: &str,
        activity_name: &str,
        version: i64,
    ) -> Result<()> {
        let vcn = VersionedComponentName::new(package_name, activity_name, version);
        let output_file = vcn.compiled_trace_path(&self.params.prefetch_root);

        if !self.params.recompile && output_file.exists() {
            debug!(path = %output_file.display(), "Compiled trace already exists");
            return Ok(());
        }

        let activity = db
            .select_activity_by_name_and_package_id(activity_name, package_id)?
            .ok_or_else(|| CoreError::ActivityNotFound {
                name: activity_name.to_string(),
                package_id,
            })?;

        let histories = db.select_activity_history_for_compile(activity.id)?;
        let inputs = collect_compilation_inputs(db, &histories);

        if inputs.len() < self.params.min_traces {
            return Err(CoreError::InsufficientEvidence {
                got: inputs.len(),
                need: self.params.min_traces,
            });
        }

        self.lock_job_info().activities_last_compiled += 1;

        debug!(
            package = package_name,
            activity = activity_name,
            version,
            output = %output_file.display(),
            traces = inputs.len(),
            "Compiling activity"
        );

        mkdir_with_parents(&output_file)?;

        let argv = self.make_compiler_args(&inputs, &output_file);
        self.run_compiler(&argv)?;

        // An insert failure leaves a valid artifact on disk; the next pass
        // short-circuits on file existence when recompile is off.
        db.insert_prefetch_file(activity.id, &output_file.to_string_lossy())?;
        Ok(())
    }

    /// Composes the compiler argument vector: inputs, then the timestamp
    /// limits in parallel order, then the output and option flags.
    fn make_compiler_args(&self, inputs: &[CompilationInput], output_file: &Path) -> Vec<String> {
        let mut argv = Vec::with_capacity(inputs.len() * 3 + 6);

        for input in inputs {
            argv.push(input.filename.clone());
        }
        for input in inputs {
            argv.push("--timestamp_limit_ns".to_string());
            argv.push(input.timestamp_limit_ns.to_string());
        }

        if self.params.output_text {
            argv.push("--output-text".to_string());
        }

        argv.push("--output-proto".to_string());
        argv.push(output_file.to_string_lossy().into_owned());

        if let Some(inode_textcache) = &self.params.inode_textcache {
            argv.push("--inode-textcache".to_string());
            argv.push(inode_textcache.to_string_lossy().into_owned());
        }

        if self.params.verbose {
            argv.push("--verbose".to_string());
        }

        argv
    }

    fn run_compiler(&self, argv: &[String]) -> Result<()> {
        debug!(
            compiler = %self.params.compiler_path.display(),
            argv = ?argv,
            "Spawning compiler"
        );

        let status = self
            .params
            .exec
            .run_compiler(&self.params.compiler_path, argv)
            .map_err(|err| CoreError::io("spawn compiler", err))?;

        if status.success() {
            debug!("Compiler finished, status: 0");
            return Ok(());
        }
        match status.code() {
            Some(code) => Err(CoreError::ChildFailed(code)),
            None => Err(CoreError::ChildAbnormal),
        }
    }

    /// Operator dump: job statistics followed by per-activity compile state.
    pub fn dump(&self, db: &Db, printer: &mut dyn Printer) {
        printer.print_line("Background job:");
        match self.last_job_info.try_lock() {
            Ok(info) => {
                match info.last_run {
                    Some(last_run) => printer.print_line(&format!(
                        "  Last run at: {}",
                        format_local_time(last_run)
                    )),
                    None => printer.print_line("  Last run at: (None)"),
                }
                printer.print_line(&format!(
                    "  Activities last compiled: {}",
                    info.activities_last_compiled
                ));
            }
            Err(_) => {
                printer.print_line("  (possible deadlock)");
            }
        }
        printer.print_line("");

        self.dump_all_packages(db, printer);
    }

    fn dump_all_packages(&self, db: &Db, printer: &mut dyn Printer) {
        printer.print_line("Package history in database:");

        let packages = match db.select_packages() {
            Ok(packages) => packages,
            Err(err) => {
                printer.print_line(&format!("  (query failed: {})", err));
                return;
            }
        };

        for package in packages {
            let activities = match db.select_activities_by_package_id(package.id) {
                Ok(activities) => activities,
                Err(err) => {
                    printer.print_line(&format!("  (query failed: {})", err));
                    continue;
                }
            };
            for activity in activities {
                self.dump_package_activity(db, printer, &package.name, package.version, &activity.name, activity.id);
            }
        }

        printer.print_line("");
    }

    fn dump_package_activity(
        &self,
        db: &Db,
        printer: &mut dyn Printer,
        package_name: &str,
        version: i64,
        activity_name: &str,
        activity_id: i64,
    ) {
        let vcn = VersionedComponentName::new(package_name, activity_name, version);
        printer.print_line(&format!("  {}", vcn));

        let prefetch_file = db.select_prefetch_file_by_vcn(&vcn).unwrap_or_default();
        let histories = db
            .select_activity_history_for_compile(activity_id)
            .unwrap_or_default();
        let inputs = collect_compilation_inputs(db, &histories);

        if let Some(prefetch_file) = prefetch_file {
            let path = Path::new(&prefetch_file.file_path);
            if path.exists() {
                printer.print_line("    Compiled Status: Usable compiled trace");
            } else {
                printer.print_line("    Compiled Status: Prefetch file deleted from disk.");
            }

            match std::fs::metadata(path) {
                Ok(metadata) => {
                    printer.print_line(&format!(
                        "      Bytes to be prefetched: {}",
                        metadata.len()
                    ));
                    let modified = metadata
                        .modified()
                        .map(|time| format_local_time(DateTime::<Utc>::from(time)))
                        .unwrap_or_else(|err| format!("(failed to stat: {})", err));
                    printer.print_line(&format!("      Time compiled: {}", modified));
                }
                Err(_) => {
                    printer.print_line("      Bytes to be prefetched: (bad file path)");
                }
            }
            printer.print_line(&format!("      {}", prefetch_file.file_path));
        } else if inputs.len() >= self.params.min_traces {
            printer.print_line(&format!(
                "    Compiled Status: Raw traces pending compilation ({})",
                inputs.len()
            ));
        } else {
            printer.print_line(&format!(
                "    Compiled Status: Need {} more traces for compilation",
                self.params.min_traces - inputs.len()
            ));
        }

        printer.print_line("    Raw traces:");
        printer.print_line(&format!("      Trace count: {}", inputs.len()));
        for input in &inputs {
            printer.print_line(&format!("      {}", input.filename));
        }
    }

    fn lock_job_info(&self) -> std::sync::MutexGuard<'_, LastJobInfo> {
        match self.last_job_info.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Resolves each history's raw trace and timestamp ceiling. Histories with
/// no raw trace are dropped with an error log.
fn collect_compilation_inputs(db: &Db, histories: &[LaunchHistoryRow]) -> Vec<CompilationInput> {
    let mut inputs = Vec::with_capacity(histories.len());

    for history in histories {
        let raw_trace = match db.select_raw_trace_by_history_id(history.id) {
            Ok(Some(raw_trace)) => raw_trace,
            Ok(None) => {
                error!(history_id = history.id, "Cannot find raw trace for history");
                continue;
            }
            Err(err) => {
                error!(error = %err, history_id = history.id, "Raw trace lookup failed");
                continue;
            }
        };

        inputs.push(CompilationInput {
            filename: raw_trace.file_path,
            timestamp_limit_ns: effective_timestamp_limit(history),
        });
    }

    inputs
}

/// The ceiling beyond which trace events are ignored: fully-drawn report if
/// present, else total launch time, else unbounded.
fn effective_timestamp_limit(history: &LaunchHistoryRow) -> u64 {
    if let Some(report_fully_drawn_ns) = history.report_fully_drawn_ns {
        report_fully_drawn_ns as u64
    } else if let Some(total_time_ns) = history.total_time_ns {
        total_time_ns as u64
    } else {
        error!(
            history_id = history.id,
            "No timestamp exists, using the max value"
        );
        u64::MAX
    }
}

fn format_local_time(time: DateTime<Utc>) -> String {
    time.with_timezone(&Local)
        .format("%a %b %d %H:%M:%S %Y")
        .to_string()
}
