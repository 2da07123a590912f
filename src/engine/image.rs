//! Sandbox image resolution with single-flight builds.
//!
//! An image is looked up by its deterministic tag and built on demand. At
//! most one build per tag is ever in flight: the first caller becomes the
//! leader and runs the build, concurrent callers for the same tag block on
//! a shared handle and take over the leader's outcome. A forced rebuild
//! joins an in-flight build rather than stacking a second one. Every build
//! is audited as its own Run.

use crate::config::types::RuntimeDefinition;
use crate::docker::DockerClient;
use crate::error::{DispatchError, Result};
use crate::run::guard::RunGuard;
use crate::run::store::RunStore;
use crate::run::types::{now_ms, Run, RunStatus};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use tracing::{info, warn};

/// Shared outcome of one build, cloneable to every waiter.
#[derive(Debug, Clone)]
enum BuildOutcome {
    /// The image turned out to be present after all; nothing was built.
    Present,
    Built {
        run_id: String,
    },
    Failed {
        run_id: String,
        exit_code: i32,
        stderr: String,
    },
}

enum BuildState {
    Pending,
    Done(BuildOutcome),
}

/// One in-flight build. The leader completes it; joiners wait on the
/// condvar until it does.
struct BuildHandle {
    state: Mutex<BuildState>,
    done: Condvar,
}

impl BuildHandle {
    fn new() -> Self {
        BuildHandle {
            state: Mutex::new(BuildState::Pending),
            done: Condvar::new(),
        }
    }

    fn complete(&self, outcome: BuildOutcome) {
        let mut state = self.state.lock().unwrap();
        *state = BuildState::Done(outcome);
        self.done.notify_all();
    }

    fn wait(&self) -> BuildOutcome {
        let mut state = self.state.lock().unwrap();
        loop {
            match &*state {
                BuildState::Done(outcome) => return outcome.clone(),
                BuildState::Pending => state = self.done.wait(state).unwrap(),
            }
        }
    }
}

/// Resolves runtime definitions to present sandbox images.
pub struct ImageResolver {
    docker: DockerClient,
    runs: Arc<dyn RunStore>,
    builds: Mutex<HashMap<String, Arc<BuildHandle>>>,
}

impl ImageResolver {
    pub fn new(docker: DockerClient, runs: Arc<dyn RunStore>) -> Self {
        ImageResolver {
            docker,
            runs,
            builds: Mutex::new(HashMap::new()),
        }
    }

    /// Make sure the runtime's image exists, building it when absent or
    /// when `force` is set. Returns the id of the build run when one
    /// happened (or was joined), `None` when the image was already there.
    pub fn ensure(&self, runtime: &RuntimeDefinition, force: bool) -> Result<Option<String>> {
        let tag = runtime.image_tag();

        if let Some(handle) = self.in_flight(&tag) {
            return outcome_to_result(handle.wait(), &tag);
        }

        if !force && self.docker.image_exists(&tag)? {
            return Ok(None);
        }

        let (handle, leader) = self.claim(&tag);
        if !leader {
            return outcome_to_result(handle.wait(), &tag);
        }

        // Another leader may have finished this tag between the look above
        // and winning the claim, so look again before building.
        let outcome = if !force && matches!(self.docker.image_exists(&tag), Ok(true)) {
            BuildOutcome::Present
        } else {
            self.build(runtime, &tag)
        };
        handle.complete(outcome.clone());
        self.builds.lock().unwrap().remove(&tag);

        outcome_to_result(outcome, &tag)
    }

    fn in_flight(&self, tag: &str) -> Option<Arc<BuildHandle>> {
        self.builds.lock().unwrap().get(tag).cloned()
    }

    /// Install a fresh handle for this tag, or pick up one that beat us to
    /// it. The bool is true for the leader.
    fn claim(&self, tag: &str) -> (Arc<BuildHandle>, bool) {
        let mut builds = self.builds.lock().unwrap();
        if let Some(existing) = builds.get(tag) {
            return (Arc::clone(existing), false);
        }
        let handle = Arc::new(BuildHandle::new());
        builds.insert(tag.to_string(), Arc::clone(&handle));
        (handle, true)
    }

    /// Run one audited build. Every failure becomes a `Failed` outcome
    /// rather than an error so waiters always wake up with a verdict.
    fn build(&self, runtime: &RuntimeDefinition, tag: &str) -> BuildOutcome {
        let mut run = Run::new();
        run.runtime_path = Some(runtime.path.clone());
        run.requested_at = Some(now_ms());
        let run_id = run.id.clone();

        let mut guard = match RunGuard::create(Arc::clone(&self.runs), run) {
            Ok(guard) => guard,
            Err(e) => {
                warn!(%tag, error = %e, "could not record build run");
                return BuildOutcome::Failed {
                    run_id,
                    exit_code: -1,
                    stderr: e.to_string(),
                };
            }
        };

        let args = DockerClient::build_args(tag, &runtime.build_args, &runtime.dir);
        let command_line = self.docker.display_command(&args);
        info!(%tag, run_id = %run_id, command = %command_line, "building sandbox image");

        {
            let run = guard.run_mut();
            run.command = Some(command_line);
            run.started_at = Some(now_ms());
            run.status = RunStatus::Running;
        }
        if let Err(e) = guard.save() {
            warn!(run_id = %run_id, error = %e, "could not record build start");
        }

        let output = match self.docker.execute(&args, None) {
            Ok(output) => output,
            Err(e) => {
                let stderr = e.to_string();
                finalize_quietly(guard, false);
                warn!(%tag, run_id = %run_id, error = %stderr, "build could not start");
                return BuildOutcome::Failed {
                    run_id,
                    exit_code: -1,
                    stderr,
                };
            }
        };

        guard.run_mut().stopped_at = Some(now_ms());
        let success = output.success();
        finalize_quietly(guard, success);

        if success {
            info!(%tag, run_id = %run_id, "sandbox image built");
            BuildOutcome::Built { run_id }
        } else {
            warn!(%tag, run_id = %run_id, exit_code = output.exit_code, "sandbox image build failed");
            BuildOutcome::Failed {
                run_id,
                exit_code: output.exit_code,
                stderr: output.stderr,
            }
        }
    }
}

fn finalize_quietly(guard: RunGuard, success: bool) {
    let run_id = guard.id().to_string();
    if let Err(e) = guard.finalize(success, None) {
        warn!(run_id = %run_id, error = %e, "could not finalize build run");
    }
}

fn outcome_to_result(outcome: BuildOutcome, tag: &str) -> Result<Option<String>> {
    match outcome {
        BuildOutcome::Present => Ok(None),
        BuildOutcome::Built { run_id } => Ok(Some(run_id)),
        BuildOutcome::Failed {
            run_id,
            exit_code,
            stderr,
        } => Err(DispatchError::BuildFailed {
            tag: tag.to_string(),
            run_id,
            exit_code,
            stderr,
        }),
    }
}
