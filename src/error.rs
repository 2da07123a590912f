//! Error types for the dispatch pipeline.
//!
//! Definition validation problems are not errors: they are recorded as data
//! on the definition itself (see `config::types::ValidationError`) so one bad
//! declaration never aborts a scan. Everything that can fail a dispatch after
//! that point is a `DispatchError`, carrying enough context (paths, run ids,
//! captured output) to correlate with the run record.

use thiserror::Error;

/// Result type alias for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors surfaced by the dispatch pipeline.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No function definition matches the request method and path.
    #[error("no function matches {method} /{path}")]
    RouteUnmatched { method: String, path: String },

    /// A matched function cannot run: missing runtime, entrypoint, or
    /// unreadable declaration document.
    #[error("runtime misconfigured: {0}")]
    RuntimeMisconfigured(String),

    /// The sandbox image build exited non-zero.
    #[error("image build failed for {tag} (run {run_id}, exit {exit_code})")]
    BuildFailed {
        tag: String,
        run_id: String,
        exit_code: i32,
        stderr: String,
    },

    /// The sandbox invocation exited non-zero or timed out.
    #[error("invocation failed (run {run_id}, exit {exit_code}, timed out: {timed_out})")]
    InvocationFailed {
        run_id: String,
        exit_code: i32,
        timed_out: bool,
        stderr: String,
    },

    /// A run or variable store operation failed.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// An I/O error occurred.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Secret material could not be decrypted or the key is unusable.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// The container tool could not be spawned.
    #[error("cannot spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
}

impl DispatchError {
    /// HTTP status class for the boundary: unmatched routes are the caller's
    /// problem, everything else is ours.
    pub fn status_code(&self) -> u16 {
        match self {
            DispatchError::RouteUnmatched { .. } => 404,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmatched_route_is_client_error() {
        let err = DispatchError::RouteUnmatched {
            method: "GET".to_string(),
            path: "nope".to_string(),
        };
        assert_eq!(err.status_code(), 404);
        assert_eq!(err.to_string(), "no function matches GET /nope");
    }

    #[test]
    fn pipeline_failures_are_server_errors() {
        let build = DispatchError::BuildFailed {
            tag: "despacho-linux-php-8-4:latest".to_string(),
            run_id: "r1".to_string(),
            exit_code: 1,
            stderr: String::new(),
        };
        assert_eq!(build.status_code(), 500);

        let timeout = DispatchError::InvocationFailed {
            run_id: "r2".to_string(),
            exit_code: -1,
            timed_out: true,
            stderr: String::new(),
        };
        assert_eq!(timeout.status_code(), 500);
        assert!(timeout.to_string().contains("timed out: true"));
    }
}
