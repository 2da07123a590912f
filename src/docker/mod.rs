//! Typed container tool invocation.
//!
//! Every call to the container tool is built as a discrete argument list and
//! handed straight to the OS, never through a shell. The tool itself is an
//! external binary (`docker` by default) and its program name is
//! configurable so tests can substitute a stub executable. Exit code and
//! captured stdout/stderr are the only contract with the tool.

use crate::config::types::DockerOptions;
use crate::error::{DispatchError, Result};
use indexmap::IndexMap;
use std::io::Read;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;
use tracing::debug;
use wait_timeout::ChildExt;

/// Default container tool binary.
pub const DEFAULT_PROGRAM: &str = "docker";

/// Directory inside the sandbox where the function directory is mounted.
pub const SANDBOX_MOUNT: &str = "/app";

/// Wall-clock limit for the cleanup `rm --force` after a timed-out run.
const REMOVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Captured result of one container tool invocation.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// The wall-clock limit expired and the process was killed.
    pub timed_out: bool,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Handle on the external container tool.
#[derive(Debug, Clone)]
pub struct DockerClient {
    program: String,
}

impl Default for DockerClient {
    fn default() -> Self {
        DockerClient::new(DEFAULT_PROGRAM)
    }
}

impl DockerClient {
    pub fn new(program: impl Into<String>) -> Self {
        DockerClient {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments for an image existence query.
    pub fn inspect_args(tag: &str) -> Vec<String> {
        vec!["image".to_string(), "inspect".to_string(), tag.to_string()]
    }

    /// Arguments for an image build: tag, build args in declaration order,
    /// then the build context directory.
    pub fn build_args(
        tag: &str,
        build_args: &IndexMap<String, String>,
        context: &Path,
    ) -> Vec<String> {
        let mut args = vec!["build".to_string(), "-t".to_string(), tag.to_string()];
        for (key, value) in build_args {
            args.push("--build-arg".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(context.display().to_string());
        args
    }

    /// Arguments for a sandbox invocation: the function directory bind-mounted
    /// at `/app`, resource limits when declared, environment as `-e` pairs in
    /// map order, image tag last. A cidfile records the container id so a
    /// timed-out container can be removed after its client is gone.
    pub fn run_args(
        function_dir: &Path,
        tag: &str,
        options: &DockerOptions,
        env: &IndexMap<String, String>,
        cidfile: Option<&Path>,
    ) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--rm".to_string()];
        if let Some(cidfile) = cidfile {
            args.push("--cidfile".to_string());
            args.push(cidfile.display().to_string());
        }
        args.push("-v".to_string());
        args.push(format!("{}:{}", function_dir.display(), SANDBOX_MOUNT));
        if let Some(cpus) = options.cpus {
            args.push("--cpus".to_string());
            args.push(cpus.to_string());
        }
        if let Some(memory) = &options.memory {
            args.push("--memory".to_string());
            args.push(memory.clone());
        }
        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(tag.to_string());
        args
    }

    /// The invocation as one shell-style line, for audit records and logs.
    /// Display only; execution always goes through the argument list.
    pub fn display_command(&self, args: &[String]) -> String {
        let mut line = self.program.clone();
        for arg in args {
            line.push(' ');
            if arg.is_empty() || arg.contains(' ') || arg.contains('"') || arg.contains('\'') {
                line.push('\'');
                line.push_str(&arg.replace('\'', "'\\''"));
                line.push('\'');
            } else {
                line.push_str(arg);
            }
        }
        line
    }

    /// Whether an image with this tag is present: inspect exits zero and
    /// prints a non-empty JSON array.
    pub fn image_exists(&self, tag: &str) -> Result<bool> {
        let output = self.execute(&Self::inspect_args(tag), None)?;
        if !output.success() {
            return Ok(false);
        }
        let parsed: std::result::Result<serde_json::Value, _> =
            serde_json::from_str(output.stdout.trim());
        Ok(match parsed {
            Ok(serde_json::Value::Array(items)) => !items.is_empty(),
            _ => false,
        })
    }

    /// Run the tool to completion, capturing both pipes. With a timeout the
    /// child's process group is killed once the limit expires and the output
    /// carries `timed_out`; partial pipe contents are still collected.
    pub fn execute(&self, args: &[String], timeout: Option<Duration>) -> Result<ExecOutput> {
        debug!(program = %self.program, ?args, "spawning container tool");

        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|source| DispatchError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // Drain both pipes on their own threads so a chatty child cannot
        // deadlock against a full pipe buffer while we wait on it.
        let stdout_handle = spawn_pipe_reader(child.stdout.take());
        let stderr_handle = spawn_pipe_reader(child.stderr.take());

        let (status, timed_out) = match timeout {
            Some(limit) => match child.wait_timeout(limit)? {
                Some(status) => (status, false),
                None => {
                    kill_group(&child);
                    let status = child.wait()?;
                    (status, true)
                }
            },
            None => (child.wait()?, false),
        };

        let stdout = collect_pipe(stdout_handle)?;
        let stderr = collect_pipe(stderr_handle)?;

        Ok(ExecOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout,
            stderr,
            timed_out,
        })
    }

    /// Force-remove the container recorded in a cidfile. Best effort on
    /// every step: the container may never have started, or be gone already.
    /// The cidfile itself is always deleted.
    pub fn remove_container(&self, cidfile: &Path) {
        let id = std::fs::read_to_string(cidfile)
            .ok()
            .and_then(|contents| contents.split_whitespace().next().map(str::to_string));
        if let Some(id) = id {
            debug!(container = %id, "removing timed-out container");
            let args = vec!["rm".to_string(), "--force".to_string(), id];
            let _ = self.execute(&args, Some(REMOVE_TIMEOUT));
        }
        let _ = std::fs::remove_file(cidfile);
    }
}

/// SIGKILL the child's whole process group. The child was spawned as its
/// group leader, so this also reaches any children of its own that would
/// keep the captured pipes open past the timeout.
#[allow(unsafe_code)]
fn kill_group(child: &Child) {
    unsafe {
        libc::killpg(child.id() as libc::pid_t, libc::SIGKILL);
    }
}

fn spawn_pipe_reader<R>(pipe: Option<R>) -> Option<thread::JoinHandle<std::io::Result<Vec<u8>>>>
where
    R: Read + Send + 'static,
{
    pipe.map(|mut stream| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf)?;
            Ok(buf)
        })
    })
}

fn collect_pipe(handle: Option<thread::JoinHandle<std::io::Result<Vec<u8>>>>) -> Result<String> {
    match handle {
        Some(handle) => {
            let bytes = handle
                .join()
                .map_err(|_| {
                    DispatchError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "pipe reader thread panicked",
                    ))
                })?
                .map_err(DispatchError::Io)?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
        None => Ok(String::new()),
    }
}
