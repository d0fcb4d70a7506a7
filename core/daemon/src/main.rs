//! prefetchd entrypoint.
//!
//! A small service that observes application launches over a unix socket,
//! supervises tracing sessions per launch, and compiles the accumulated
//! traces into prefetch files during idle maintenance windows.

use fs_err as fs;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use prefetch_core::dump::StringPrinter;
use prefetch_core::maintenance::{CompilationController, ControllerParameters, SystemExec};
use prefetch_core::session_tracker::SessionTracker;
use prefetch_core::version_map::PackageVersionMap;
use prefetchd_protocol::{
    parse_app_launch, parse_job_scheduled, ErrorInfo, Method, Request, RequestId, Response,
    TaskResult, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};

mod engine;
mod packages;
mod router;

use engine::StubTraceEngine;
use packages::PackageListRemote;
use router::{EventRouter, RouterConfig, TaskResultCallbacks};

const SOCKET_NAME: &str = "daemon.sock";
const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;

fn main() {
    init_logging();

    let data_dir = match daemon_data_dir() {
        Ok(dir) => dir,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon data directory");
            std::process::exit(1);
        }
    };

    let socket_path = data_dir.join(SOCKET_NAME);
    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }
    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    let router = match build_router(&data_dir) {
        Ok(router) => Arc::new(router),
        Err(err) => {
            error!(error = %err, "Failed to initialize prefetchd");
            std::process::exit(1);
        }
    };
    router.set_task_result_callbacks(Arc::new(LogCallbacks));

    info!(path = %socket_path.display(), "prefetchd started");

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let router = Arc::clone(&router);
                thread::spawn(|| handle_connection(stream, router));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

fn build_router(data_dir: &Path) -> Result<EventRouter, String> {
    let tracker = Arc::new(SessionTracker::new(Box::new(StubTraceEngine::new())));

    let remote = PackageListRemote::new(data_dir.join("packages.json"));
    // An unreachable package source at startup is fatal to the service.
    let version_map = Arc::new(
        PackageVersionMap::create(Box::new(remote))
            .map_err(|err| format!("Failed to create package version map: {}", err))?,
    );

    let controller = Arc::new(CompilationController::new(ControllerParameters::new(
        data_dir.join("prefetch"),
        Arc::new(SystemExec),
    )));

    EventRouter::new(
        RouterConfig {
            db_path: data_dir.join("daemon").join("state.db"),
            raw_trace_root: data_dir.join("raw_traces"),
        },
        tracker,
        version_map,
        controller,
    )
    .map_err(|err| format!("Failed to start event router: {}", err))
}

/// Default callback sink: results go to the log until an IPC listener is
/// wired up.
struct LogCallbacks;

impl TaskResultCallbacks for LogCallbacks {
    fn on_progress(&self, request_id: RequestId, result: TaskResult) {
        info!(
            request_id = request_id.request_id,
            state = ?result.state,
            "Task progress"
        );
    }

    fn on_complete(&self, request_id: RequestId, result: TaskResult) {
        info!(
            request_id = request_id.request_id,
            state = ?result.state,
            "Task complete"
        );
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn daemon_data_dir() -> Result<PathBuf, String> {
    if let Some(dir) = std::env::var_os("PREFETCHD_DATA_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".prefetchd"))
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, router: Arc<EventRouter>) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    let response = handle_request(request, router);
    let _ = write_response(&mut stream, response);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    if buffer.is_empty() {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let request_bytes = match newline_index {
        Some(index) => {
            if buffer.len() > index + 1 {
                let trailing = &buffer[index + 1..];
                if trailing.iter().any(|b| !b.is_ascii_whitespace()) {
                    warn!("Extra bytes detected after newline; ignoring trailing data");
                }
            }
            &buffer[..index]
        }
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, router: Arc<EventRouter>) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    match request.method {
        Method::GetHealth => {
            let data = serde_json::json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
            });
            Response::ok(request.id, data)
        }
        Method::AppLaunchEvent => {
            let params = match request.params {
                Some(params) => params,
                None => {
                    return Response::error(request.id, "invalid_params", "event payload required")
                }
            };
            let (request_id, event) = match parse_app_launch(params) {
                Ok(parsed) => parsed,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            if router.on_app_launch_event(request_id, &event) {
                Response::ok(request.id, serde_json::json!({"accepted": true}))
            } else {
                Response::error(request.id, "router_unavailable", "event was not accepted")
            }
        }
        Method::JobScheduledEvent => {
            let params = match request.params {
                Some(params) => params,
                None => {
                    return Response::error(request.id, "invalid_params", "event payload required")
                }
            };
            let (request_id, event) = match parse_job_scheduled(params) {
                Ok(parsed) => parsed,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            if router.on_job_scheduled_event(request_id, &event) {
                Response::ok(request.id, serde_json::json!({"accepted": true}))
            } else {
                Response::error(request.id, "router_unavailable", "job was not accepted")
            }
        }
        Method::Dump => {
            let mut printer = StringPrinter::new();
            router.dump(&mut printer);
            Response::ok(
                request.id,
                serde_json::json!({"report": printer.into_string()}),
            )
        }
    }
}

fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, &response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
