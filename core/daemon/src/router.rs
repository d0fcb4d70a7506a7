//! Event routing between the IPC surface and the orchestration core.
//!
//! Intent-start and launch-start arrivals are handled synchronously on the
//! caller's thread; starving the caller is an accepted trade for starting
//! the tracing session with minimal latency. Everything else is deferred to
//! a background worker, and maintenance jobs get their own worker so a
//! compile pass never delays launch handling.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use prefetch_core::db::{Db, NewLaunchHistory};
use prefetch_core::dump::Printer;
use prefetch_core::maintenance::CompilationController;
use prefetch_core::paths::{mkdir_with_parents, VersionedComponentName};
use prefetch_core::session_tracker::{Handle, SessionTracker};
use prefetch_core::version_map::PackageVersionMap;
use prefetchd_protocol::{
    AppLaunchEvent, AppLaunchKind, JobKind, JobScheduledEvent, RequestId, TaskResult, TaskState,
    Temperature,
};
use tracing::{debug, error, info, warn};

/// Sink for asynchronous task-result notification.
///
/// For one request id every `on_progress` happens before `on_complete`,
/// `on_complete` fires exactly once, and nothing is delivered afterwards.
pub trait TaskResultCallbacks: Send + Sync {
    fn on_progress(&self, request_id: RequestId, result: TaskResult);
    fn on_complete(&self, request_id: RequestId, result: TaskResult);
}

pub struct RouterConfig {
    pub db_path: PathBuf,
    pub raw_trace_root: PathBuf,
}

struct InFlightLaunch {
    handle: Handle,
    intent_started_ns: Option<u64>,
    package_name: Option<String>,
    activity_name: Option<String>,
    temperature: Option<Temperature>,
}

/// How many persisted (sequence_id, history_id) pairs are kept around for
/// late fully-drawn reports. A report for an evicted launch is dropped.
const RECENT_HISTORY_CAP: usize = 64;

struct RouterShared {
    config: RouterConfig,
    tracker: Arc<SessionTracker>,
    version_map: Arc<PackageVersionMap>,
    controller: Arc<CompilationController>,
    db: Db,
    launches: Mutex<HashMap<i64, InFlightLaunch>>,
    recent_histories: Mutex<VecDeque<(i64, i64)>>,
    callbacks: Mutex<Option<Arc<dyn TaskResultCallbacks>>>,
}

enum LaunchTask {
    Deferred(RequestId, AppLaunchEvent),
}

enum JobTask {
    CompilePass(RequestId),
}

pub struct EventRouter {
    shared: Arc<RouterShared>,
    launch_tx: Mutex<Option<Sender<LaunchTask>>>,
    job_tx: Mutex<Option<Sender<JobTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl EventRouter {
    pub fn new(
        config: RouterConfig,
        tracker: Arc<SessionTracker>,
        version_map: Arc<PackageVersionMap>,
        controller: Arc<CompilationController>,
    ) -> prefetch_core::Result<Self> {
        let db = Db::open(config.db_path.clone())?;
        let shared = Arc::new(RouterShared {
            config,
            tracker,
            version_map,
            controller,
            db,
            launches: Mutex::new(HashMap::new()),
            recent_histories: Mutex::new(VecDeque::new()),
            callbacks: Mutex::new(None),
        });

        let (launch_tx, launch_rx) = mpsc::channel::<LaunchTask>();
        let launch_shared = Arc::clone(&shared);
        let launch_worker = std::thread::Builder::new()
            .name("launch-worker".to_string())
            .spawn(move || {
                for LaunchTask::Deferred(request_id, event) in launch_rx {
                    launch_shared.handle_deferred_launch(request_id, &event);
                }
            })
            .map_err(|err| prefetch_core::CoreError::io("spawn launch worker", err))?;

        let (job_tx, job_rx) = mpsc::channel::<JobTask>();
        let job_shared = Arc::clone(&shared);
        let job_worker = std::thread::Builder::new()
            .name("maintenance-worker".to_string())
            .spawn(move || {
                for JobTask::CompilePass(request_id) in job_rx {
                    job_shared.run_compile_pass(request_id);
                }
            })
            .map_err(|err| prefetch_core::CoreError::io("spawn maintenance worker", err))?;

        Ok(Self {
            shared,
            launch_tx: Mutex::new(Some(launch_tx)),
            job_tx: Mutex::new(Some(job_tx)),
            workers: Mutex::new(vec![launch_worker, job_worker]),
        })
    }

    pub fn set_task_result_callbacks(&self, callbacks: Arc<dyn TaskResultCallbacks>) {
        let mut slot = lock(&self.shared.callbacks);
        if slot.is_some() {
            warn!("Task result callbacks already set, replacing");
        }
        *slot = Some(callbacks);
    }

    /// Routes one app-launch event. Intent-start and launch-start are
    /// handled before returning; other kinds are queued for the worker.
    pub fn on_app_launch_event(&self, request_id: RequestId, event: &AppLaunchEvent) -> bool {
        debug!(
            request_id = request_id.request_id,
            kind = ?event.kind,
            sequence_id = event.sequence_id,
            "App launch event"
        );

        match event.kind {
            AppLaunchKind::IntentStarted => {
                self.shared.handle_intent_started(event);
                self.shared
                    .complete(request_id, TaskResult::new(TaskState::Completed));
                true
            }
            AppLaunchKind::ActivityLaunched => {
                self.shared.handle_activity_launched(event);
                self.shared
                    .complete(request_id, TaskResult::new(TaskState::Completed));
                true
            }
            _ => {
                self.shared
                    .progress(request_id, TaskResult::new(TaskState::Began));
                let sender = lock(&self.launch_tx);
                match sender.as_ref() {
                    Some(sender) => sender
                        .send(LaunchTask::Deferred(request_id, event.clone()))
                        .is_ok(),
                    None => {
                        warn!("Launch worker is shut down, dropping event");
                        false
                    }
                }
            }
        }
    }

    /// Starts or acknowledges a background maintenance job.
    pub fn on_job_scheduled_event(&self, request_id: RequestId, event: &JobScheduledEvent) -> bool {
        info!(
            request_id = request_id.request_id,
            kind = ?event.kind,
            job_id = event.job_id,
            "Job scheduled event"
        );

        match event.kind {
            JobKind::StartJob => {
                self.shared
                    .progress(request_id, TaskResult::new(TaskState::Began));
                let sender = lock(&self.job_tx);
                match sender.as_ref() {
                    Some(sender) => sender.send(JobTask::CompilePass(request_id)).is_ok(),
                    None => {
                        warn!("Maintenance worker is shut down, dropping job");
                        false
                    }
                }
            }
            JobKind::StopJob => {
                // Compiler children are never cancelled once launched; a
                // running pass is waited out.
                info!(job_id = event.job_id, "Stop requested, pass will drain");
                self.shared
                    .complete(request_id, TaskResult::new(TaskState::Completed));
                true
            }
        }
    }

    /// Blocks until the background workers have quiesced.
    pub fn join(&self) {
        lock(&self.launch_tx).take();
        lock(&self.job_tx).take();
        for worker in lock(&self.workers).drain(..) {
            if worker.join().is_err() {
                error!("Router worker panicked");
            }
        }
    }

    /// Operator dump of the tracker and the maintenance state.
    pub fn dump(&self, printer: &mut dyn Printer) {
        self.shared.tracker.dump(printer);
        self.shared.controller.dump(&self.shared.db, printer);
    }
}

#[cfg(test)]
impl EventRouter {
    fn in_flight_launches(&self) -> usize {
        lock(&self.shared.launches).len()
    }

    fn recent_history_count(&self) -> usize {
        lock(&self.shared.recent_histories).len()
    }
}

impl RouterShared {
    fn handle_intent_started(&self, event: &AppLaunchEvent) {
        let mut launches = lock(&self.launches);

        if let Some(stale) = launches.remove(&event.sequence_id) {
            warn!(
                sequence_id = event.sequence_id,
                "Intent re-started with a session in flight, destroying it"
            );
            self.tracker.destroy(stale.handle);
        }

        // The engine config is owned by the tracing backend; the session
        // only needs a handle.
        let handle = self.tracker.create(b"", Box::new(|_, _| {}));
        self.tracker.start_tracing(handle);

        launches.insert(
            event.sequence_id,
            InFlightLaunch {
                handle,
                intent_started_ns: event.timestamp_ns,
                package_name: None,
                activity_name: None,
                temperature: None,
            },
        );
    }

    fn handle_activity_launched(&self, event: &AppLaunchEvent) {
        let mut launches = lock(&self.launches);
        let launch = match launches.get_mut(&event.sequence_id) {
            Some(launch) => launch,
            None => {
                warn!(
                    sequence_id = event.sequence_id,
                    "Activity launched without a tracked intent"
                );
                return;
            }
        };

        launch.package_name = event.package_name.clone();
        launch.activity_name = event.activity_name.clone();
        launch.temperature = event.temperature;

        // Only cold launches produce useful traces; anything else abandons
        // the session.
        if event.temperature != Some(Temperature::Cold) {
            debug!(
                sequence_id = event.sequence_id,
                temperature = ?event.temperature,
                "Non-cold launch, abandoning tracing session"
            );
            let handle = launch.handle;
            launches.remove(&event.sequence_id);
            self.tracker.destroy(handle);
        }
    }

    fn handle_deferred_launch(&self, request_id: RequestId, event: &AppLaunchEvent) {
        let result = match event.kind {
            AppLaunchKind::ActivityLaunchFinished => self.handle_launch_finished(event),
            AppLaunchKind::ReportFullyDrawn => self.handle_report_fully_drawn(event),
            AppLaunchKind::ActivityLaunchCancelled | AppLaunchKind::IntentFailed => {
                self.handle_launch_abandoned(event);
                true
            }
            AppLaunchKind::IntentStarted | AppLaunchKind::ActivityLaunched => {
                // Critical kinds never reach the worker.
                error!(kind = ?event.kind, "Critical launch kind on the deferred path");
                false
            }
        };

        let state = if result {
            TaskState::Completed
        } else {
            TaskState::Error
        };
        self.complete(request_id, TaskResult::new(state));
    }

    /// Persists one finished launch: history row, raw trace file, raw trace
    /// row. The session is destroyed and the in-flight record erased
    /// whatever the outcome; only the (sequence, history) pair survives, in
    /// a bounded window, for a late fully-drawn report.
    fn handle_launch_finished(&self, event: &AppLaunchEvent) -> bool {
        let launch = match lock(&self.launches).remove(&event.sequence_id) {
            Some(launch) => launch,
            None => {
                debug!(
                    sequence_id = event.sequence_id,
                    "Launch finished for an untracked sequence"
                );
                return true;
            }
        };

        let handle = launch.handle;

        let (package_name, activity_name) = match (launch.package_name, launch.activity_name) {
            (Some(package_name), Some(activity_name)) => (package_name, activity_name),
            _ => {
                warn!(
                    sequence_id = event.sequence_id,
                    "Launch finished before a component was reported"
                );
                self.tracker.destroy(handle);
                return false;
            }
        };

        let intent_started_ns = launch.intent_started_ns;
        let temperature = temperature_code(launch.temperature);

        let buffer = self.tracker.read_trace(handle);
        self.tracker.destroy(handle);

        let version = self.version_map.get_or_query_package_version(&package_name);

        let package = match self.db.get_or_insert_package(&package_name, version) {
            Ok(package) => package,
            Err(err) => {
                error!(error = %err, package = package_name, "Cannot persist package");
                return false;
            }
        };
        let activity = match self.db.get_or_insert_activity(&activity_name, package.id) {
            Ok(activity) => activity,
            Err(err) => {
                error!(error = %err, activity = activity_name, "Cannot persist activity");
                return false;
            }
        };

        let history = match self.db.insert_launch_history(&NewLaunchHistory {
            activity_id: activity.id,
            temperature,
            trace_enabled: !buffer.is_empty(),
            intent_started_ns: intent_started_ns.map(|ns| ns as i64),
            total_time_ns: event.timestamp_ns.map(|ns| ns as i64),
            report_fully_drawn_ns: None,
        }) {
            Ok(history) => history,
            Err(err) => {
                error!(error = %err, "Cannot persist launch history");
                return false;
            }
        };

        self.remember_history(event.sequence_id, history.id);

        if buffer.is_empty() {
            debug!(
                sequence_id = event.sequence_id,
                "Empty trace buffer, nothing to store"
            );
            return true;
        }

        let vcn = VersionedComponentName::new(package_name, activity_name, version);
        let trace_path = vcn.raw_trace_path(&self.config.raw_trace_root, history.id);
        if let Err(err) = mkdir_with_parents(&trace_path) {
            error!(error = %err, "Cannot create raw trace directory");
            return false;
        }
        if let Err(err) = std::fs::write(&trace_path, &buffer) {
            error!(error = %err, path = %trace_path.display(), "Cannot write raw trace");
            return false;
        }

        match self
            .db
            .insert_raw_trace(history.id, &trace_path.to_string_lossy())
        {
            Ok(_) => true,
            Err(err) => {
                error!(error = %err, "Cannot persist raw trace row");
                false
            }
        }
    }

    fn handle_report_fully_drawn(&self, event: &AppLaunchEvent) -> bool {
        let history_id = match self.take_history(event.sequence_id) {
            Some(history_id) => history_id,
            None => {
                debug!(
                    sequence_id = event.sequence_id,
                    "Fully-drawn report without a persisted history"
                );
                return true;
            }
        };

        let timestamp_ns = match event.timestamp_ns {
            Some(timestamp_ns) => timestamp_ns as i64,
            None => return false,
        };

        match self.db.update_report_fully_drawn(history_id, timestamp_ns) {
            Ok(()) => true,
            Err(err) => {
                error!(error = %err, history_id, "Cannot record fully-drawn report");
                false
            }
        }
    }

    fn handle_launch_abandoned(&self, event: &AppLaunchEvent) {
        let handle = {
            let mut launches = lock(&self.launches);
            match launches.remove(&event.sequence_id) {
                Some(launch) => launch.handle,
                None => return,
            }
        };
        self.tracker.destroy(handle);
    }

    fn remember_history(&self, sequence_id: i64, history_id: i64) {
        let mut recent = lock(&self.recent_histories);
        recent.push_back((sequence_id, history_id));
        while recent.len() > RECENT_HISTORY_CAP {
            recent.pop_front();
        }
    }

    fn take_history(&self, sequence_id: i64) -> Option<i64> {
        let mut recent = lock(&self.recent_histories);
        let index = recent.iter().position(|(seq, _)| *seq == sequence_id)?;
        recent.remove(index).map(|(_, history_id)| history_id)
    }

    fn run_compile_pass(&self, request_id: RequestId) {
        self.progress(request_id, TaskResult::new(TaskState::Ongoing));
        let ok = self.controller.compile_device(&self.config.db_path);
        info!(
            request_id = request_id.request_id,
            ok, "Compile pass finished"
        );
        let state = if ok {
            TaskState::Completed
        } else {
            TaskState::Error
        };
        self.complete(request_id, TaskResult::new(state));
    }

    fn progress(&self, request_id: RequestId, result: TaskResult) {
        if let Some(callbacks) = lock(&self.callbacks).clone() {
            callbacks.on_progress(request_id, result);
        }
    }

    fn complete(&self, request_id: RequestId, result: TaskResult) {
        match lock(&self.callbacks).clone() {
            Some(callbacks) => callbacks.on_complete(request_id, result),
            None => {
                // Normal when no listener is registered yet.
                warn!(
                    request_id = request_id.request_id,
                    "Drop result, no listener registered"
                );
            }
        }
    }
}

fn temperature_code(temperature: Option<Temperature>) -> i64 {
    match temperature {
        Some(Temperature::Cold) | None => 0,
        Some(Temperature::Warm) => 1,
        Some(Temperature::Hot) => 2,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prefetch_core::maintenance::{CompilerExec, ControllerParameters};
    use prefetch_core::session_tracker::{
        EngineState, StateChangedCallback, TraceBuffer, TraceEngine,
    };
    use prefetch_core::version_map::PackageManagerRemote;
    use std::collections::HashMap;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Duration;

    struct FakeEngine {
        next_handle: AtomicI64,
    }

    impl FakeEngine {
        fn new() -> Self {
            Self {
                next_handle: AtomicI64::new(1),
            }
        }
    }

    impl TraceEngine for FakeEngine {
        fn create(&self, _config: &[u8], _callback: StateChangedCallback) -> i64 {
            self.next_handle.fetch_add(1, Ordering::SeqCst)
        }

        fn start_tracing(&self, _handle: i64) {}

        fn read_trace(&self, _handle: i64) -> TraceBuffer {
            vec![1, 2, 3, 4]
        }

        fn destroy(&self, _handle: i64) {}

        fn poll_state(&self, _handle: i64) -> EngineState {
            0
        }
    }

    struct FakeRemote;

    impl PackageManagerRemote for FakeRemote {
        fn package_version_map(&self) -> prefetch_core::Result<HashMap<String, i64>> {
            Ok([("com.example.mail".to_string(), 5)].into())
        }

        fn package_version(&self, _package_name: &str) -> Option<i64> {
            None
        }
    }

    struct FakeExec;

    impl CompilerExec for FakeExec {
        fn run_compiler(
            &self,
            _binary: &std::path::Path,
            _argv: &[String],
        ) -> std::io::Result<ExitStatus> {
            Ok(ExitStatus::from_raw(0))
        }
    }

    #[derive(Default)]
    struct RecordingCallbacks {
        events: Mutex<Vec<(i64, TaskState, bool)>>,
    }

    impl RecordingCallbacks {
        fn events(&self) -> Vec<(i64, TaskState, bool)> {
            self.events.lock().unwrap().clone()
        }

        fn wait_for_complete(&self, request_id: i64) {
            for _ in 0..200 {
                let done = self
                    .events()
                    .iter()
                    .any(|(id, _, terminal)| *id == request_id && *terminal);
                if done {
                    return;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            panic!("request {} never completed", request_id);
        }
    }

    impl TaskResultCallbacks for RecordingCallbacks {
        fn on_progress(&self, request_id: RequestId, result: TaskResult) {
            self.events
                .lock()
                .unwrap()
                .push((request_id.request_id, result.state, false));
        }

        fn on_complete(&self, request_id: RequestId, result: TaskResult) {
            self.events
                .lock()
                .unwrap()
                .push((request_id.request_id, result.state, true));
        }
    }

    struct Fixture {
        _temp: tempfile::TempDir,
        db: Db,
        router: EventRouter,
        callbacks: Arc<RecordingCallbacks>,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = tempfile::tempdir().expect("temp dir");
            let db_path = temp.path().join("state.db");
            let db = Db::open(db_path.clone()).expect("db init");

            let tracker = Arc::new(SessionTracker::new(Box::new(FakeEngine::new())));
            let version_map = Arc::new(
                PackageVersionMap::create(Box::new(FakeRemote)).expect("version map"),
            );
            let controller = Arc::new(CompilationController::new(ControllerParameters::new(
                temp.path().join("prefetch"),
                Arc::new(FakeExec),
            )));

            let router = EventRouter::new(
                RouterConfig {
                    db_path,
                    raw_trace_root: temp.path().join("raw"),
                },
                tracker,
                version_map,
                controller,
            )
            .expect("router");

            let callbacks = Arc::new(RecordingCallbacks::default());
            router.set_task_result_callbacks(callbacks.clone());

            Self {
                _temp: temp,
                db,
                router,
                callbacks,
            }
        }

        fn launch_event(kind: AppLaunchKind, sequence_id: i64) -> AppLaunchEvent {
            AppLaunchEvent {
                kind,
                sequence_id,
                package_name: None,
                activity_name: None,
                temperature: None,
                timestamp_ns: None,
            }
        }

        fn drive_cold_launch(&self, sequence_id: i64, first_request: i64) {
            let mut intent = Self::launch_event(AppLaunchKind::IntentStarted, sequence_id);
            intent.timestamp_ns = Some(1_000);
            assert!(self
                .router
                .on_app_launch_event(RequestId::new(first_request), &intent));

            let mut launched = Self::launch_event(AppLaunchKind::ActivityLaunched, sequence_id);
            launched.package_name = Some("com.example.mail".to_string());
            launched.activity_name = Some("Inbox".to_string());
            launched.temperature = Some(Temperature::Cold);
            assert!(self
                .router
                .on_app_launch_event(RequestId::new(first_request + 1), &launched));

            let mut finished =
                Self::launch_event(AppLaunchKind::ActivityLaunchFinished, sequence_id);
            finished.timestamp_ns = Some(300);
            assert!(self
                .router
                .on_app_launch_event(RequestId::new(first_request + 2), &finished));
            self.callbacks.wait_for_complete(first_request + 2);
        }
    }

    #[test]
    fn cold_launch_persists_history_and_raw_trace() {
        let fixture = Fixture::new();
        fixture.drive_cold_launch(1, 100);

        let package = fixture
            .db
            .select_package_by_name_and_version("com.example.mail", 5)
            .unwrap()
            .expect("package row");
        let activity = fixture
            .db
            .select_activity_by_name_and_package_id("Inbox", package.id)
            .unwrap()
            .expect("activity row");
        let histories = fixture
            .db
            .select_activity_history_for_compile(activity.id)
            .unwrap();
        assert_eq!(histories.len(), 1);
        assert_eq!(histories[0].total_time_ns, Some(300));
        assert_eq!(histories[0].intent_started_ns, Some(1_000));

        let raw_trace = fixture
            .db
            .select_raw_trace_by_history_id(histories[0].id)
            .unwrap()
            .expect("raw trace row");
        let bytes = std::fs::read(&raw_trace.file_path).expect("trace file");
        assert_eq!(bytes, vec![1, 2, 3, 4]);
    }

    #[test]
    fn fully_drawn_report_lands_on_the_history() {
        let fixture = Fixture::new();
        fixture.drive_cold_launch(1, 100);

        let mut report = Fixture::launch_event(AppLaunchKind::ReportFullyDrawn, 1);
        report.timestamp_ns = Some(250);
        assert!(fixture
            .router
            .on_app_launch_event(RequestId::new(103), &report));
        fixture.callbacks.wait_for_complete(103);

        let package = fixture
            .db
            .select_package_by_name_and_version("com.example.mail", 5)
            .unwrap()
            .unwrap();
        let activity = fixture
            .db
            .select_activity_by_name_and_package_id("Inbox", package.id)
            .unwrap()
            .unwrap();
        let histories = fixture
            .db
            .select_activity_history_for_compile(activity.id)
            .unwrap();
        assert_eq!(histories[0].report_fully_drawn_ns, Some(250));
    }

    #[test]
    fn finished_launch_clears_in_flight_state() {
        let fixture = Fixture::new();
        fixture.drive_cold_launch(1, 100);

        // The in-flight record is erased when the launch finishes; only the
        // bounded (sequence, history) pair remains for a late report.
        assert_eq!(fixture.router.in_flight_launches(), 0);
        assert_eq!(fixture.router.recent_history_count(), 1);

        let mut report = Fixture::launch_event(AppLaunchKind::ReportFullyDrawn, 1);
        report.timestamp_ns = Some(250);
        fixture
            .router
            .on_app_launch_event(RequestId::new(103), &report);
        fixture.callbacks.wait_for_complete(103);

        assert_eq!(fixture.router.recent_history_count(), 0);
    }

    #[test]
    fn fully_drawn_report_for_evicted_launch_is_dropped() {
        let fixture = Fixture::new();
        for sequence_id in 1..=(RECENT_HISTORY_CAP as i64 + 1) {
            fixture.drive_cold_launch(sequence_id, sequence_id * 10);
        }
        assert_eq!(fixture.router.in_flight_launches(), 0);
        assert_eq!(fixture.router.recent_history_count(), RECENT_HISTORY_CAP);

        // Sequence 1 was evicted from the recent window; its report lands
        // nowhere.
        let mut report = Fixture::launch_event(AppLaunchKind::ReportFullyDrawn, 1);
        report.timestamp_ns = Some(250);
        assert!(fixture
            .router
            .on_app_launch_event(RequestId::new(9000), &report));
        fixture.callbacks.wait_for_complete(9000);

        let package = fixture
            .db
            .select_package_by_name_and_version("com.example.mail", 5)
            .unwrap()
            .unwrap();
        let activity = fixture
            .db
            .select_activity_by_name_and_package_id("Inbox", package.id)
            .unwrap()
            .unwrap();
        let histories = fixture
            .db
            .select_activity_history_for_compile(activity.id)
            .unwrap();
        assert_eq!(histories[0].report_fully_drawn_ns, None);
    }

    #[test]
    fn warm_launch_abandons_the_session() {
        let fixture = Fixture::new();

        let mut intent = Fixture::launch_event(AppLaunchKind::IntentStarted, 2);
        intent.timestamp_ns = Some(1_000);
        fixture
            .router
            .on_app_launch_event(RequestId::new(200), &intent);

        let mut launched = Fixture::launch_event(AppLaunchKind::ActivityLaunched, 2);
        launched.package_name = Some("com.example.mail".to_string());
        launched.activity_name = Some("Inbox".to_string());
        launched.temperature = Some(Temperature::Warm);
        fixture
            .router
            .on_app_launch_event(RequestId::new(201), &launched);

        let mut finished = Fixture::launch_event(AppLaunchKind::ActivityLaunchFinished, 2);
        finished.timestamp_ns = Some(300);
        fixture
            .router
            .on_app_launch_event(RequestId::new(202), &finished);
        fixture.callbacks.wait_for_complete(202);

        assert!(fixture
            .db
            .select_package_by_name_and_version("com.example.mail", 5)
            .unwrap()
            .is_none());
    }

    #[test]
    fn cancelled_launch_destroys_and_persists_nothing() {
        let fixture = Fixture::new();

        let mut intent = Fixture::launch_event(AppLaunchKind::IntentStarted, 3);
        intent.timestamp_ns = Some(1_000);
        fixture
            .router
            .on_app_launch_event(RequestId::new(300), &intent);

        let cancelled = Fixture::launch_event(AppLaunchKind::ActivityLaunchCancelled, 3);
        fixture
            .router
            .on_app_launch_event(RequestId::new(301), &cancelled);
        fixture.callbacks.wait_for_complete(301);

        assert!(fixture.db.select_packages().unwrap().is_empty());
    }

    #[test]
    fn job_start_runs_a_compile_pass() {
        let fixture = Fixture::new();

        let event = JobScheduledEvent {
            kind: JobKind::StartJob,
            job_id: 1,
        };
        assert!(fixture
            .router
            .on_job_scheduled_event(RequestId::new(400), &event));
        fixture.callbacks.wait_for_complete(400);

        let events = fixture.callbacks.events();
        let for_request: Vec<_> = events.iter().filter(|(id, _, _)| *id == 400).collect();
        // Began, Ongoing, then the terminal completion.
        assert!(for_request.len() >= 2);
        assert!(for_request.last().unwrap().2);
        assert_eq!(for_request.last().unwrap().1, TaskState::Completed);
    }

    #[test]
    fn stop_job_is_acknowledged() {
        let fixture = Fixture::new();
        let event = JobScheduledEvent {
            kind: JobKind::StopJob,
            job_id: 1,
        };
        assert!(fixture
            .router
            .on_job_scheduled_event(RequestId::new(500), &event));
        fixture.callbacks.wait_for_complete(500);
    }

    #[test]
    fn complete_fires_exactly_once_per_request() {
        let fixture = Fixture::new();
        fixture.drive_cold_launch(1, 100);

        let job = JobScheduledEvent {
            kind: JobKind::StartJob,
            job_id: 9,
        };
        fixture
            .router
            .on_job_scheduled_event(RequestId::new(103), &job);
        fixture.callbacks.wait_for_complete(103);
        fixture.router.join();

        let events = fixture.callbacks.events();
        let mut completions: HashMap<i64, usize> = HashMap::new();
        let mut seen_complete: HashMap<i64, bool> = HashMap::new();
        for (id, _, terminal) in &events {
            if *terminal {
                *completions.entry(*id).or_default() += 1;
                seen_complete.insert(*id, true);
            } else {
                // No progress after a terminal result for the same id.
                assert!(!seen_complete.get(id).copied().unwrap_or(false));
            }
        }
        for (id, count) in completions {
            assert_eq!(count, 1, "request {} completed more than once", id);
        }
    }

    #[test]
    fn events_after_join_are_rejected() {
        let fixture = Fixture::new();
        fixture.router.join();

        let mut finished = Fixture::launch_event(AppLaunchKind::ActivityLaunchFinished, 8);
        finished.timestamp_ns = Some(1);
        assert!(!fixture
            .router
            .on_app_launch_event(RequestId::new(600), &finished));

        let job = JobScheduledEvent {
            kind: JobKind::StartJob,
            job_id: 2,
        };
        assert!(!fixture
            .router
            .on_job_scheduled_event(RequestId::new(601), &job));
    }

    #[test]
    fn dump_covers_tracker_and_maintenance() {
        let fixture = Fixture::new();
        let mut printer = prefetch_core::dump::StringPrinter::new();
        fixture.router.dump(&mut printer);
        let report = printer.into_string();
        assert!(report.contains("Tracing session tracker:"));
        assert!(report.contains("Background job:"));
    }
}
