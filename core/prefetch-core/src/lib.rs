//! Orchestration core for the prefetchd launch-prefetch service.
//!
//! Couples three subsystems around one persistent store: a tracing-session
//! tracker over the external tracing engine, an idle-time compilation
//! controller that fork/execs the external compiler, and a package-version
//! cache over the remote package manager. The daemon crate wires these to
//! its event router; everything here is transport-agnostic.

pub mod db;
pub mod dump;
pub mod error;
pub mod maintenance;
pub mod paths;
pub mod session_tracker;
pub mod version_map;

pub use error::{CoreError, Result};
