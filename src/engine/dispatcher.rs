//! One request in, one audited sandbox execution out.
//!
//! A dispatch owns exactly one Run from entry to exit: created with the
//! request URI, advanced as the pipeline progresses, and finalized on every
//! exit path by the guard. The stages are fixed: match the route, resolve
//! the runtime, ensure its image, resolve the environment against the
//! on-disk declaration, then execute the sandbox under a wall-clock limit.
//! There is no retry anywhere: at most one build and one invocation per
//! request.

use crate::config::store::DefinitionStore;
use crate::docker::DockerClient;
use crate::error::{DispatchError, Result};
use crate::route;
use crate::run::guard::RunGuard;
use crate::run::store::RunStore;
use crate::run::types::{now_ms, Run, RunStatus};
use crate::vars::crypto::SecretBox;
use crate::vars::resolver::{self, RequestContext};
use crate::vars::store::VariableStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Request header that forces a rebuild of the sandbox image.
pub const FORCE_BUILD_HEADER: &str = "X-Despacho-Force-Build";

/// Wall-clock limit for one invocation when the declaration sets none.
pub const DEFAULT_INVOCATION_TIMEOUT: Duration = Duration::from_secs(300);

/// One inbound request, as the engine sees it.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub method: String,
    /// Path to match against declared routes (dispatch prefix stripped).
    pub path: String,
    /// Full request URI, recorded on the run.
    pub uri: String,
    pub context: RequestContext,
    pub force_build: bool,
}

impl DispatchRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        let path = path.into();
        DispatchRequest {
            method: method.into(),
            uri: path.clone(),
            path,
            context: RequestContext::default(),
            force_build: false,
        }
    }
}

/// What a dispatch produced. The run id is always present, even when the
/// pipeline failed before doing any work, so callers can correlate.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub run_id: String,
    pub result: Result<String>,
}

/// The execution engine: everything a dispatch needs, shared across worker
/// threads.
pub struct Dispatcher {
    definitions: Arc<DefinitionStore>,
    variables: VariableStore,
    secrets: Option<SecretBox>,
    runs: Arc<dyn RunStore>,
    docker: DockerClient,
    images: super::image::ImageResolver,
    default_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        definitions: Arc<DefinitionStore>,
        variables: VariableStore,
        secrets: Option<SecretBox>,
        runs: Arc<dyn RunStore>,
        docker: DockerClient,
        default_timeout: Duration,
    ) -> Self {
        let images = super::image::ImageResolver::new(docker.clone(), Arc::clone(&runs));
        Dispatcher {
            definitions,
            variables,
            secrets,
            runs,
            docker,
            images,
            default_timeout,
        }
    }

    /// Run the full pipeline for one request. The returned outcome carries
    /// the body (sandbox stdout, else stderr) or the first error hit; the
    /// run record is completed before this returns, whatever happened.
    pub fn dispatch(&self, request: &DispatchRequest) -> DispatchOutcome {
        let mut run = Run::new();
        run.uri = Some(request.uri.clone());
        run.requested_at = Some(now_ms());
        let run_id = run.id.clone();

        info!(%run_id, method = %request.method, uri = %request.uri, "dispatch requested");

        let mut guard = match RunGuard::create(Arc::clone(&self.runs), run) {
            Ok(guard) => guard,
            Err(e) => {
                warn!(%run_id, error = %e, "could not record dispatch run");
                return DispatchOutcome {
                    run_id,
                    result: Err(e),
                };
            }
        };

        let result = self.run_pipeline(request, &mut guard);

        let (success, code) = match &result {
            Ok(_) => (true, 200),
            Err(e) => (false, e.status_code()),
        };
        if let Err(e) = guard.finalize(success, Some(code)) {
            warn!(%run_id, error = %e, "could not finalize dispatch run");
        }

        match &result {
            Ok(_) => info!(%run_id, "dispatch completed"),
            Err(e) => warn!(%run_id, error = %e, "dispatch failed"),
        }

        DispatchOutcome { run_id, result }
    }

    fn run_pipeline(&self, request: &DispatchRequest, guard: &mut RunGuard) -> Result<String> {
        let functions = self.definitions.functions();
        let function = route::find_match(&request.method, &request.path, &functions).ok_or_else(
            || DispatchError::RouteUnmatched {
                method: request.method.clone(),
                path: request.path.trim_start_matches('/').to_string(),
            },
        )?;
        debug!(run_id = %guard.id(), function = %function.path, "route matched");

        {
            let run = guard.run_mut();
            run.function_path = Some(function.path.clone());
            run.runtime_path = Some(function.runtime.clone());
        }
        guard.save()?;

        let runtime = self.definitions.runtime(&function.runtime).ok_or_else(|| {
            DispatchError::RuntimeMisconfigured(format!(
                "function '{}' wants runtime '{}' which is not declared",
                function.path, function.runtime
            ))
        })?;
        if !runtime.is_valid() {
            let problems: Vec<String> = runtime
                .validation_errors
                .iter()
                .map(ToString::to_string)
                .collect();
            return Err(DispatchError::RuntimeMisconfigured(format!(
                "runtime '{}' failed validation: {}",
                runtime.path,
                problems.join("; ")
            )));
        }

        let entrypoint = function.entrypoint_path();
        if !entrypoint.is_file() {
            return Err(DispatchError::RuntimeMisconfigured(format!(
                "entrypoint '{}' does not exist",
                entrypoint.display()
            )));
        }

        let build_id = self.images.ensure(&runtime, request.force_build)?;
        if let Some(id) = &build_id {
            guard.run_mut().build_id = Some(id.clone());
        }

        // The declaration document is re-read per dispatch so secret and
        // variable changes apply without waiting out the definition TTL.
        let document_path = function.document_path();
        let document = std::fs::read_to_string(&document_path).map_err(|e| {
            DispatchError::RuntimeMisconfigured(format!(
                "cannot read declaration '{}': {}",
                document_path.display(),
                e
            ))
        })?;
        let scoped = self
            .variables
            .for_path(&function.path, self.secrets.as_ref())?;
        let env = resolver::build_environment(&document, &scoped, &request.context)
            .map_err(DispatchError::RuntimeMisconfigured)?;

        let cidfile = std::env::temp_dir().join(format!("despacho-{}.cid", guard.id()));
        let args = DockerClient::run_args(
            &function.dir,
            &runtime.image_tag(),
            &function.docker,
            &env,
            Some(&cidfile),
        );
        let command_line = self.docker.display_command(&args);
        info!(run_id = %guard.id(), function = %function.path, command = %command_line, "invoking sandbox");

        {
            let run = guard.run_mut();
            run.command = Some(command_line);
            run.started_at = Some(now_ms());
            run.status = RunStatus::Running;
        }
        guard.save()?;

        let timeout = function
            .docker
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);
        let output = self.docker.execute(&args, Some(timeout))?;
        guard.run_mut().stopped_at = Some(now_ms());

        if output.timed_out {
            // Killing the client process does not stop the container it
            // started; remove it by the id it wrote to the cidfile.
            self.docker.remove_container(&cidfile);
            return Err(DispatchError::InvocationFailed {
                run_id: guard.id().to_string(),
                exit_code: output.exit_code,
                timed_out: true,
                stderr: output.stderr,
            });
        }
        let _ = std::fs::remove_file(&cidfile);
        if !output.success() {
            return Err(DispatchError::InvocationFailed {
                run_id: guard.id().to_string(),
                exit_code: output.exit_code,
                timed_out: false,
                stderr: output.stderr,
            });
        }

        Ok(if output.stdout.is_empty() {
            output.stderr
        } else {
            output.stdout
        })
    }
}
