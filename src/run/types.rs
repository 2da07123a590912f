//! The Run record.
//!
//! Every sandbox invocation and every image build is audited as one Run:
//! what was asked for, the exact command, four timestamps, and the outcome.
//! The status machine is `starting → running → completed` with no reverts;
//! `completed` is terminal and reached exactly once (see `guard`).

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Starting,
    Running,
    Completed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Starting => "starting",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<RunStatus> {
        match s {
            "starting" => Some(RunStatus::Starting),
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audited run. Timestamps are epoch milliseconds.
///
/// A dispatch run carries the function path and request URI; an image build
/// run carries only the runtime path. A dispatch that triggered a build
/// references it through `build_id`.
#[derive(Debug, Clone)]
pub struct Run {
    pub id: String,
    pub function_path: Option<String>,
    pub runtime_path: Option<String>,
    /// Id of the build run that produced the image for this dispatch.
    pub build_id: Option<String>,
    pub uri: Option<String>,
    /// Request received.
    pub requested_at: Option<i64>,
    /// Subprocess spawned.
    pub started_at: Option<i64>,
    /// Subprocess exited.
    pub stopped_at: Option<i64>,
    /// Record closed, response on its way.
    pub responded_at: Option<i64>,
    /// Display form of the executed command, for the audit trail only.
    pub command: Option<String>,
    pub response_code: Option<u16>,
    pub is_success: Option<bool>,
    pub status: RunStatus,
}

impl Run {
    /// A fresh run: new UUID, status `starting`, everything else unset.
    pub fn new() -> Self {
        Run {
            id: Uuid::new_v4().to_string(),
            function_path: None,
            runtime_path: None,
            build_id: None,
            uri: None,
            requested_at: None,
            started_at: None,
            stopped_at: None,
            responded_at: None,
            command: None,
            response_code: None,
            is_success: None,
            status: RunStatus::Starting,
        }
    }
}

impl Default for Run {
    fn default() -> Self {
        Run::new()
    }
}

/// Current time as epoch milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [RunStatus::Starting, RunStatus::Running, RunStatus::Completed] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("queued"), None);
    }

    #[test]
    fn new_runs_start_fresh_with_unique_ids() {
        let a = Run::new();
        let b = Run::new();
        assert_ne!(a.id, b.id);
        assert_eq!(a.status, RunStatus::Starting);
        assert!(a.requested_at.is_none());
        assert!(a.is_success.is_none());
        assert!(Uuid::parse_str(&a.id).is_ok());
    }

    #[test]
    fn now_ms_is_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(a > 1_500_000_000_000); // sanity: after 2017
        assert!(b >= a);
    }
}
