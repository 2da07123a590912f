//! HTTP boundary: a blocking tiny_http server over the dispatch engine.
//!
//! Endpoints:
//! - `GET /health` — liveness check
//! - any method under `/run/...` — dispatch: the `/run` prefix is stripped
//!   and the remainder matched against declared function routes
//!
//! N worker threads share one listener; each dispatch blocks its thread for
//! the life of the sandbox. Success responses carry the sandbox output as
//! text, failures map through `DispatchError::status_code` to a JSON error
//! body, and every dispatch response names its run in `X-Despacho-Run-Id`.
//! SIGINT/SIGTERM set a flag; workers finish their current request and exit.

use crate::engine::dispatcher::{DispatchRequest, Dispatcher, FORCE_BUILD_HEADER};
use crate::error::{DispatchError, Result};
use crate::vars::resolver::RequestContext;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Maximum request body size: 10 MB.
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Path prefix that makes a request dispatch-eligible.
pub const DISPATCH_PREFIX: &str = "/run";

/// Response header carrying the dispatch run id.
pub const RUN_ID_HEADER: &str = "X-Despacho-Run-Id";

static SHUTDOWN_FLAG: AtomicBool = AtomicBool::new(false);

/// Ask every worker to stop once its current request is finished.
pub fn request_shutdown() {
    SHUTDOWN_FLAG.store(true, Ordering::SeqCst);
}

/// Install SIGINT and SIGTERM handlers that set the shutdown flag.
#[allow(unsafe_code)]
fn install_signal_handlers() {
    unsafe {
        libc::signal(
            libc::SIGINT,
            signal_handler as *const () as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGTERM,
            signal_handler as *const () as libc::sighandler_t,
        );
    }
}

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN_FLAG.store(true, Ordering::SeqCst);
}

/// Bind the listener and serve until a shutdown signal arrives. Blocks the
/// calling thread for the life of the server.
pub fn serve(addr: &str, workers: usize, dispatcher: Arc<Dispatcher>) -> Result<()> {
    let server = tiny_http::Server::http(addr).map_err(|e| {
        DispatchError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("cannot bind {}: {}", addr, e),
        ))
    })?;
    let server = Arc::new(server);

    SHUTDOWN_FLAG.store(false, Ordering::SeqCst);
    install_signal_handlers();

    let workers = workers.max(1);
    info!(%addr, workers, "dispatcher listening");

    let mut handles = Vec::with_capacity(workers);
    for n in 0..workers {
        let server = Arc::clone(&server);
        let dispatcher = Arc::clone(&dispatcher);
        let handle = thread::Builder::new()
            .name(format!("despacho-worker-{}", n))
            .spawn(move || worker_loop(&server, &dispatcher))
            .map_err(DispatchError::Io)?;
        handles.push(handle);
    }
    for handle in handles {
        let _ = handle.join();
    }

    info!("dispatcher shut down");
    Ok(())
}

/// One worker: take requests off the shared listener until shutdown. The
/// receive timeout bounds how long a signal waits for an idle worker.
fn worker_loop(server: &tiny_http::Server, dispatcher: &Dispatcher) {
    loop {
        if SHUTDOWN_FLAG.load(Ordering::SeqCst) {
            break;
        }
        let request = match server.recv_timeout(Duration::from_secs(1)) {
            Ok(Some(request)) => request,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "listener failed, worker stopping");
                break;
            }
        };
        handle_request(request, dispatcher);
    }
}

fn handle_request(mut request: tiny_http::Request, dispatcher: &Dispatcher) {
    let method = request.method().to_string();
    let url = request.url().to_string();
    let path = url.split('?').next().unwrap_or(&url).to_string();

    let response = if method == "GET" && path == "/health" {
        json_response(200, &serde_json::json!({"status": "ok"}).to_string())
    } else if let Some(route_path) = dispatch_path(&path) {
        let route_path = route_path.to_string();
        dispatch_response(&mut request, &method, &url, &route_path, dispatcher)
    } else {
        json_response(404, &json_error("not found"))
    };

    if let Err(e) = request.respond(response) {
        debug!(error = %e, "client went away before the response");
    }
}

/// The route path of a dispatch-eligible request: what follows the `/run`
/// prefix at a path boundary. `/runx` is not under the prefix.
fn dispatch_path(path: &str) -> Option<&str> {
    let rest = path.strip_prefix(DISPATCH_PREFIX)?;
    if rest.is_empty() {
        Some("/")
    } else if rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

fn dispatch_response(
    request: &mut tiny_http::Request,
    method: &str,
    url: &str,
    route_path: &str,
    dispatcher: &Dispatcher,
) -> tiny_http::Response<std::io::Cursor<Vec<u8>>> {
    let mut context = RequestContext::default();
    let mut force_build = false;
    for header in request.headers() {
        if header.field.equiv(FORCE_BUILD_HEADER) {
            force_build = true;
        }
        context
            .headers
            .insert(header.field.to_string(), header.value.to_string());
    }
    context.body = match read_body(request) {
        Ok(body) => body,
        Err(e) => return json_response(400, &json_error(&e)),
    };

    let mut dispatch = DispatchRequest::new(method, route_path);
    dispatch.uri = url.to_string();
    dispatch.context = context;
    dispatch.force_build = force_build;

    let outcome = dispatcher.dispatch(&dispatch);
    let response = match &outcome.result {
        Ok(body) => with_header(
            tiny_http::Response::from_string(body.as_str()).with_status_code(200),
            "Content-Type",
            "text/plain; charset=utf-8",
        ),
        Err(e) => json_response(e.status_code(), &json_error(&e.to_string())),
    };
    with_header(response, RUN_ID_HEADER, &outcome.run_id)
}

/// Read the request body up to `MAX_BODY_SIZE`.
fn read_body(request: &mut tiny_http::Request) -> std::result::Result<String, String> {
    let content_length = request.body_length().unwrap_or(0);
    if content_length > MAX_BODY_SIZE {
        return Err(format!(
            "request body too large: {} bytes (max {})",
            content_length, MAX_BODY_SIZE
        ));
    }

    let mut body = Vec::with_capacity(content_length.min(65536));
    request
        .as_reader()
        .take(MAX_BODY_SIZE as u64)
        .read_to_end(&mut body)
        .map_err(|e| format!("cannot read request body: {}", e))?;

    String::from_utf8(body).map_err(|e| format!("request body is not UTF-8: {}", e))
}

fn json_error(message: &str) -> String {
    serde_json::json!({ "error": message }).to_string()
}

fn json_response(status: u16, body: &str) -> tiny_http::Response<std::io::Cursor<Vec<u8>>> {
    with_header(
        tiny_http::Response::from_string(body).with_status_code(status),
        "Content-Type",
        "application/json",
    )
}

fn with_header(
    response: tiny_http::Response<std::io::Cursor<Vec<u8>>>,
    name: &str,
    value: &str,
) -> tiny_http::Response<std::io::Cursor<Vec<u8>>> {
    match tiny_http::Header::from_bytes(name.as_bytes(), value.as_bytes()) {
        Ok(header) => response.with_header(header),
        Err(()) => response,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::store::DefinitionStore;
    use crate::docker::DockerClient;
    use crate::run::store::{MemoryRunStore, RunStore};
    use crate::vars::store::VariableStore;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    #[test]
    fn dispatch_path_requires_the_prefix_at_a_boundary() {
        assert_eq!(dispatch_path("/run"), Some("/"));
        assert_eq!(dispatch_path("/run/widgets/5"), Some("/widgets/5"));
        assert_eq!(dispatch_path("/runx"), None);
        assert_eq!(dispatch_path("/health"), None);
        assert_eq!(dispatch_path("/"), None);
    }

    fn write_function(root: &Path, rel: &str, yaml: &str) {
        let dir = root.join(rel);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("function.yml"), yaml).unwrap();
        std::fs::write(dir.join("entrypoint.php"), "<?php\n").unwrap();
    }

    fn write_runtime(root: &Path, rel: &str) {
        let dir = root.join(rel);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("runtime.yml"),
            "language: php\nversion: '8.4'\nplatform: linux\n",
        )
        .unwrap();
        std::fs::write(dir.join("Dockerfile"), "FROM scratch\n").unwrap();
    }

    fn stub_docker(dir: &Path, run_body: &str) -> String {
        let marker = dir.join("image-present");
        let log = dir.join("builds.log");
        let script = format!(
            "#!/bin/sh\ncase \"$1\" in\n  image)\n    if [ -f '{marker}' ]; then echo '[{{\"Id\":\"sha256:x\"}}]'; exit 0; else exit 1; fi ;;\n  build)\n    echo build >> '{log}'\n    touch '{marker}'\n    exit 0 ;;\n  run)\n    {body} ;;\n  *) exit 0 ;;\nesac\n",
            marker = marker.display(),
            log = log.display(),
            body = run_body,
        );
        let path = dir.join("docker-stub");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    /// One test drives the full boundary so the shared shutdown flag is
    /// stored and raised exactly once.
    #[test]
    fn serves_health_dispatch_and_not_found() {
        let work = tempfile::tempdir().unwrap();
        let functions = tempfile::tempdir().unwrap();
        let runtimes = tempfile::tempdir().unwrap();
        write_function(
            functions.path(),
            "widgets/store",
            "function:\n  name: store\n  description: d\n  route: /widgets/{id}\n  method: POST\n  runtime: php/8.4\n  entrypoint: entrypoint.php\n",
        );
        write_runtime(runtimes.path(), "php/8.4");

        let program = stub_docker(work.path(), "echo 'hello from sandbox'");
        let runs = Arc::new(MemoryRunStore::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(DefinitionStore::with_ttl(
                functions.path(),
                runtimes.path(),
                Duration::ZERO,
            )),
            VariableStore::open_in_memory().unwrap(),
            None,
            Arc::clone(&runs) as Arc<dyn RunStore>,
            DockerClient::new(program),
            Duration::from_secs(30),
        ));

        let server = Arc::new(tiny_http::Server::http("127.0.0.1:0").unwrap());
        let port = server.server_addr().to_ip().unwrap().port();
        let base = format!("http://127.0.0.1:{}", port);

        SHUTDOWN_FLAG.store(false, Ordering::SeqCst);
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let server = Arc::clone(&server);
                let dispatcher = Arc::clone(&dispatcher);
                thread::spawn(move || worker_loop(&server, &dispatcher))
            })
            .collect();

        let agent: ureq::Agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .build()
            .new_agent();

        // Liveness check.
        let mut res = agent.get(format!("{}/health", base)).call().unwrap();
        assert_eq!(res.status().as_u16(), 200);
        assert_eq!(
            res.body_mut().read_to_string().unwrap(),
            "{\"status\":\"ok\"}"
        );

        // Dispatch: builds, runs, answers with the sandbox output and run id.
        let mut res = agent
            .post(format!("{}/run/widgets/7?verbose=1", base))
            .send("{\"a\":1}")
            .unwrap();
        assert_eq!(res.status().as_u16(), 200);
        let run_id = res
            .headers()
            .get(RUN_ID_HEADER)
            .expect("dispatch responses carry the run id")
            .to_str()
            .unwrap()
            .to_string();
        assert_eq!(
            res.body_mut().read_to_string().unwrap().trim(),
            "hello from sandbox"
        );

        let run = runs.get(&run_id).unwrap().unwrap();
        assert_eq!(run.uri.as_deref(), Some("/run/widgets/7?verbose=1"));
        assert_eq!(run.function_path.as_deref(), Some("widgets/store"));
        assert_eq!(run.response_code, Some(200));
        // The request body crossed the boundary into the sandbox command.
        assert!(run
            .command
            .as_deref()
            .unwrap()
            .contains("HTTP_REQUEST_INPUT={\"a\":1}"));
        let builds = std::fs::read_to_string(work.path().join("builds.log")).unwrap();
        assert_eq!(builds.lines().count(), 1);

        // The force-build header rebuilds a present image.
        let res = agent
            .post(format!("{}/run/widgets/7", base))
            .header(FORCE_BUILD_HEADER, "1")
            .send("")
            .unwrap();
        assert_eq!(res.status().as_u16(), 200);
        let builds = std::fs::read_to_string(work.path().join("builds.log")).unwrap();
        assert_eq!(builds.lines().count(), 2);

        // Unmatched dispatch: 404 with a JSON error and a run id.
        let mut res = agent.get(format!("{}/run/gadgets/9", base)).call().unwrap();
        assert_eq!(res.status().as_u16(), 404);
        assert!(res.headers().get(RUN_ID_HEADER).is_some());
        let body: serde_json::Value =
            serde_json::from_str(&res.body_mut().read_to_string().unwrap()).unwrap();
        assert!(body["error"]
            .as_str()
            .unwrap()
            .contains("no function matches"));

        // A body that is not UTF-8 never reaches the engine.
        let mut res = agent
            .post(format!("{}/run/widgets/7", base))
            .send(&[0xffu8, 0xfe, 0xfd][..])
            .unwrap();
        assert_eq!(res.status().as_u16(), 400);
        assert!(res.headers().get(RUN_ID_HEADER).is_none());
        let body: serde_json::Value =
            serde_json::from_str(&res.body_mut().read_to_string().unwrap()).unwrap();
        assert!(body["error"].as_str().unwrap().contains("not UTF-8"));

        // Outside the dispatch prefix: 404, no run recorded.
        let recorded = runs.writes().len();
        let res = agent.get(format!("{}/runx", base)).call().unwrap();
        assert_eq!(res.status().as_u16(), 404);
        assert!(res.headers().get(RUN_ID_HEADER).is_none());
        assert_eq!(runs.writes().len(), recorded);

        request_shutdown();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
