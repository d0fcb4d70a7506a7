//! IPC protocol types and validation for prefetchd.
//!
//! This crate is shared by the daemon and its clients to prevent schema drift.
//! The daemon remains the authority on validation, but clients can reuse the
//! same types to construct valid requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    AppLaunchEvent,
    JobScheduledEvent,
    Dump,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

/// Identifies one inbound request for callback correlation.
///
/// All task-result callbacks for the same request id are sequentially
/// consistent; ids for distinct requests carry no ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestId {
    pub request_id: i64,
}

impl RequestId {
    pub fn new(request_id: i64) -> Self {
        Self { request_id }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum TaskState {
    Began,
    Ongoing,
    Completed,
    Error,
}

/// Outcome value delivered through the task-result callback sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskResult {
    pub state: TaskState,
}

impl TaskResult {
    pub fn new(state: TaskState) -> Self {
        Self { state }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, TaskState::Completed | TaskState::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum AppLaunchKind {
    IntentStarted,
    IntentFailed,
    ActivityLaunched,
    ActivityLaunchFinished,
    ActivityLaunchCancelled,
    ReportFullyDrawn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Temperature {
    Cold,
    Warm,
    Hot,
}

/// One step of an application-launch sequence.
///
/// A launch is identified by `sequence_id` across its events; which optional
/// fields must be present depends on the kind (see `validate`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppLaunchEvent {
    pub kind: AppLaunchKind,
    pub sequence_id: i64,
    #[serde(default)]
    pub package_name: Option<String>,
    #[serde(default)]
    pub activity_name: Option<String>,
    #[serde(default)]
    pub temperature: Option<Temperature>,
    #[serde(default)]
    pub timestamp_ns: Option<u64>,
}

impl AppLaunchEvent {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.sequence_id < 0 {
            return Err(ErrorInfo::new(
                "invalid_sequence_id",
                "sequence_id must be non-negative",
            ));
        }

        match self.kind {
            AppLaunchKind::IntentStarted => {
                require_u64(&self.timestamp_ns, "timestamp_ns")?;
            }
            AppLaunchKind::ActivityLaunched => {
                require_string(&self.package_name, "package_name")?;
                require_string(&self.activity_name, "activity_name")?;
                if self.temperature.is_none() {
                    return Err(ErrorInfo::new("missing_field", "temperature is required"));
                }
            }
            AppLaunchKind::ActivityLaunchFinished | AppLaunchKind::ReportFullyDrawn => {
                require_u64(&self.timestamp_ns, "timestamp_ns")?;
            }
            // Failure and cancellation carry only the sequence id.
            AppLaunchKind::IntentFailed | AppLaunchKind::ActivityLaunchCancelled => {}
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum JobKind {
    StartJob,
    StopJob,
}

/// Maintenance-window notification from the platform job scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobScheduledEvent {
    pub kind: JobKind,
    pub job_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppLaunchParams {
    pub request_id: i64,
    pub event: AppLaunchEvent,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobScheduledParams {
    pub request_id: i64,
    pub event: JobScheduledEvent,
}

pub fn parse_app_launch(params: Value) -> Result<(RequestId, AppLaunchEvent), ErrorInfo> {
    let parsed: AppLaunchParams = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("app launch payload is invalid JSON: {}", err),
        )
    })?;
    parsed.event.validate()?;
    Ok((RequestId::new(parsed.request_id), parsed.event))
}

pub fn parse_job_scheduled(params: Value) -> Result<(RequestId, JobScheduledEvent), ErrorInfo> {
    let parsed: JobScheduledParams = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("job scheduled payload is invalid JSON: {}", err),
        )
    })?;
    Ok((RequestId::new(parsed.request_id), parsed.event))
}

fn require_string(value: &Option<String>, field: &str) -> Result<(), ErrorInfo> {
    if let Some(candidate) = value {
        if !candidate.trim().is_empty() {
            return Ok(());
        }
    }
    Err(ErrorInfo::new(
        "missing_field",
        format!("{} is required", field),
    ))
}

fn require_u64(value: &Option<u64>, field: &str) -> Result<(), ErrorInfo> {
    match value {
        Some(_) => Ok(()),
        None => Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_event(kind: AppLaunchKind) -> AppLaunchEvent {
        AppLaunchEvent {
            kind,
            sequence_id: 7,
            package_name: Some("com.example.mail".to_string()),
            activity_name: Some("com.example.mail.Inbox".to_string()),
            temperature: Some(Temperature::Cold),
            timestamp_ns: Some(1_000_000),
        }
    }

    #[test]
    fn validates_intent_started() {
        let event = base_event(AppLaunchKind::IntentStarted);
        assert!(event.validate().is_ok());
    }

    #[test]
    fn intent_started_requires_timestamp() {
        let mut event = base_event(AppLaunchKind::IntentStarted);
        event.timestamp_ns = None;
        assert!(event.validate().is_err());
    }

    #[test]
    fn activity_launched_requires_component() {
        let mut event = base_event(AppLaunchKind::ActivityLaunched);
        event.activity_name = None;
        assert!(event.validate().is_err());

        let mut event = base_event(AppLaunchKind::ActivityLaunched);
        event.package_name = Some("  ".to_string());
        assert!(event.validate().is_err());
    }

    #[test]
    fn activity_launched_requires_temperature() {
        let mut event = base_event(AppLaunchKind::ActivityLaunched);
        event.temperature = None;
        assert!(event.validate().is_err());
    }

    #[test]
    fn cancellation_carries_only_sequence_id() {
        let event = AppLaunchEvent {
            kind: AppLaunchKind::ActivityLaunchCancelled,
            sequence_id: 3,
            package_name: None,
            activity_name: None,
            temperature: None,
            timestamp_ns: None,
        };
        assert!(event.validate().is_ok());
    }

    #[test]
    fn rejects_negative_sequence_id() {
        let mut event = base_event(AppLaunchKind::IntentStarted);
        event.sequence_id = -1;
        assert!(event.validate().is_err());
    }

    #[test]
    fn parse_app_launch_extracts_request_id() {
        let params = serde_json::json!({
            "request_id": 42,
            "event": {
                "kind": "intent_started",
                "sequence_id": 7,
                "timestamp_ns": 100,
            },
        });

        let (request_id, event) = parse_app_launch(params).expect("parse app launch");
        assert_eq!(request_id, RequestId::new(42));
        assert_eq!(event.kind, AppLaunchKind::IntentStarted);
        assert_eq!(event.timestamp_ns, Some(100));
    }

    #[test]
    fn parse_app_launch_rejects_unknown_fields() {
        let params = serde_json::json!({
            "request_id": 42,
            "event": {
                "kind": "intent_started",
                "sequence_id": 7,
                "timestamp_ns": 100,
                "bogus": true,
            },
        });
        assert!(parse_app_launch(params).is_err());
    }

    #[test]
    fn parse_job_scheduled_round_trips() {
        let params = serde_json::json!({
            "request_id": 9,
            "event": {
                "kind": "start_job",
                "job_id": 1,
            },
        });

        let (request_id, event) = parse_job_scheduled(params).expect("parse job scheduled");
        assert_eq!(request_id, RequestId::new(9));
        assert_eq!(event.kind, JobKind::StartJob);
        assert_eq!(event.job_id, 1);
    }

    #[test]
    fn task_result_terminal_states() {
        assert!(TaskResult::new(TaskState::Completed).is_terminal());
        assert!(TaskResult::new(TaskState::Error).is_terminal());
        assert!(!TaskResult::new(TaskState::Began).is_terminal());
        assert!(!TaskResult::new(TaskState::Ongoing).is_terminal());
    }

    #[test]
    fn method_serializes_as_snake_case() {
        let method = serde_json::to_string(&Method::AppLaunchEvent).expect("serialize");
        assert_eq!(method, "\"app_launch_event\"");
    }
}
