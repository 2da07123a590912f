//! RAII finalization for run records.
//!
//! A `RunGuard` pairs a run with its store for the duration of one build or
//! dispatch. The happy path calls `finalize`; every other exit path — early
//! return, error, panic — reaches `Drop`, which closes the record as failed.
//! Either way the run ends `completed` exactly once. Store write failures
//! during `Drop` are logged, never panicked.

use super::store::RunStore;
use super::types::{now_ms, Run, RunStatus};
use crate::error::Result;
use std::sync::Arc;
use tracing::warn;

pub struct RunGuard {
    store: Arc<dyn RunStore>,
    run: Run,
    finalized: bool,
}

impl RunGuard {
    /// Persist the run and take responsibility for completing it.
    pub fn create(store: Arc<dyn RunStore>, run: Run) -> Result<Self> {
        store.create(&run)?;
        Ok(RunGuard {
            store,
            run,
            finalized: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.run.id
    }

    pub fn run(&self) -> &Run {
        &self.run
    }

    pub fn run_mut(&mut self) -> &mut Run {
        &mut self.run
    }

    /// Write the run's current fields through to the store.
    pub fn save(&self) -> Result<()> {
        self.store.update(&self.run)
    }

    /// Close the record: outcome, response code, `responded_at`, status
    /// `completed`. Consumes the guard; the returned run is the final record.
    pub fn finalize(mut self, success: bool, response_code: Option<u16>) -> Result<Run> {
        self.complete(success, response_code)?;
        Ok(self.run.clone())
    }

    fn complete(&mut self, success: bool, response_code: Option<u16>) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;

        let now = now_ms();
        // A run that started but never recorded its stop gets one here, so
        // started_at <= stopped_at holds on crash paths too.
        if self.run.started_at.is_some() && self.run.stopped_at.is_none() {
            self.run.stopped_at = Some(now);
        }
        self.run.responded_at = Some(now);
        if response_code.is_some() {
            self.run.response_code = response_code;
        }
        self.run.is_success = Some(success);
        self.run.status = RunStatus::Completed;
        self.store.update(&self.run)
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.finalized {
            return;
        }
        if let Err(e) = self.complete(false, None) {
            warn!(run_id = %self.run.id, error = %e, "could not finalize abandoned run");
        }
    }
}
