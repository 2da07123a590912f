//! CLI subcommands — serve, scan, invoke, var.

use crate::config::store::DefinitionStore;
use crate::config::{scanner, types};
use crate::docker::DockerClient;
use crate::engine::dispatcher::{DispatchRequest, Dispatcher};
use crate::run::store::{RunStore, SqliteRunStore};
use crate::vars::crypto::{self, SecretBox, KEY_ENV_VAR};
use crate::vars::store::VariableStore;
use clap::{Args, Subcommand};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP dispatcher
    Serve {
        /// Listen address
        #[arg(long, default_value = "0.0.0.0:8080")]
        addr: String,

        /// Worker threads taking requests off the listener
        #[arg(long, default_value_t = 4)]
        workers: usize,

        #[command(flatten)]
        stack: StackArgs,
    },

    /// Scan a declaration root and print what it declares
    Scan {
        #[command(subcommand)]
        target: ScanTarget,
    },

    /// Dispatch one request without the HTTP server
    Invoke {
        /// Request method (GET, POST, ...)
        method: String,

        /// Request path to match against declared routes
        path: String,

        /// Request body handed to the sandbox
        #[arg(long)]
        body: Option<String>,

        /// Rebuild the sandbox image even when it is present
        #[arg(long)]
        force_build: bool,

        #[command(flatten)]
        stack: StackArgs,
    },

    /// Manage stored variables and secrets
    Var {
        #[command(subcommand)]
        action: VarAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ScanTarget {
    /// Function declarations
    Functions {
        /// Directory to scan
        #[arg(short, long, default_value = "functions")]
        path: PathBuf,

        /// Print the scan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Runtime declarations
    Runtimes {
        /// Directory to scan
        #[arg(short, long, default_value = "runtimes")]
        path: PathBuf,

        /// Print the scan as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum VarAction {
    /// Store a variable for a function path
    Set {
        /// Function path the variable is scoped to
        path: String,

        /// Variable name
        name: String,

        /// Value to store
        value: String,

        /// Encrypt the value at rest
        #[arg(long)]
        secret: bool,

        /// Sqlite database holding variables and run records
        #[arg(long, default_value = "despacho.sqlite")]
        db: PathBuf,

        /// 32-byte key file (raw or hex); DESPACHO_SECRET_KEY otherwise
        #[arg(long)]
        key_file: Option<PathBuf>,
    },

    /// List stored variables (secret values are masked)
    List {
        /// Only variables scoped to this function path
        path: Option<String>,

        /// Sqlite database holding variables and run records
        #[arg(long, default_value = "despacho.sqlite")]
        db: PathBuf,
    },

    /// Remove a variable
    Unset {
        /// Function path the variable is scoped to
        path: String,

        /// Variable name
        name: String,

        /// Sqlite database holding variables and run records
        #[arg(long, default_value = "despacho.sqlite")]
        db: PathBuf,
    },

    /// Print a fresh encryption key in the accepted hex form
    Keygen,
}

/// Options shared by every command that builds the full dispatch stack.
#[derive(Args, Debug)]
pub struct StackArgs {
    /// Directory scanned for function declarations
    #[arg(long, default_value = "functions")]
    functions_dir: PathBuf,

    /// Directory scanned for runtime declarations
    #[arg(long, default_value = "runtimes")]
    runtimes_dir: PathBuf,

    /// Sqlite database holding variables and run records
    #[arg(long, default_value = "despacho.sqlite")]
    db: PathBuf,

    /// Container tool binary
    #[arg(long, default_value = "docker")]
    docker_bin: String,

    /// Default invocation timeout in seconds (declarations may override)
    #[arg(long, default_value_t = 300)]
    timeout: u64,

    /// Definition cache lifetime in seconds
    #[arg(long, default_value_t = 3600)]
    cache_ttl: u64,

    /// 32-byte key file (raw or hex); DESPACHO_SECRET_KEY otherwise
    #[arg(long)]
    key_file: Option<PathBuf>,
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Serve {
            addr,
            workers,
            stack,
        } => cmd_serve(&addr, workers, &stack),
        Commands::Scan { target } => match target {
            ScanTarget::Functions { path, json } => cmd_scan_functions(&path, json),
            ScanTarget::Runtimes { path, json } => cmd_scan_runtimes(&path, json),
        },
        Commands::Invoke {
            method,
            path,
            body,
            force_build,
            stack,
        } => cmd_invoke(&method, &path, body.as_deref(), force_build, &stack),
        Commands::Var { action } => match action {
            VarAction::Set {
                path,
                name,
                value,
                secret,
                db,
                key_file,
            } => cmd_var_set(&db, key_file.as_deref(), &path, &name, &value, secret),
            VarAction::List { path, db } => cmd_var_list(&db, path.as_deref()),
            VarAction::Unset { path, name, db } => cmd_var_unset(&db, &path, &name),
            VarAction::Keygen => cmd_var_keygen(),
        },
    }
}

fn cmd_serve(addr: &str, workers: usize, stack: &StackArgs) -> Result<(), String> {
    let dispatcher = build_dispatcher(stack)?;
    crate::server::serve(addr, workers, Arc::new(dispatcher)).map_err(|e| e.to_string())
}

fn cmd_scan_functions(path: &Path, json: bool) -> Result<(), String> {
    let definitions = scanner::scan_functions(path);
    if json {
        return print_json(&definitions);
    }

    println!(
        "Scanned {} function(s) from {}",
        definitions.len(),
        path.display()
    );
    for def in &definitions {
        if def.is_valid() {
            println!(
                "  {} {} -> {} ({})",
                def.method, def.route, def.path, def.runtime
            );
        } else {
            println!("  {} INVALID", def.path);
            for e in &def.validation_errors {
                eprintln!("    ERROR: {}", e);
            }
        }
    }
    Ok(())
}

fn cmd_scan_runtimes(path: &Path, json: bool) -> Result<(), String> {
    let definitions = scanner::scan_runtimes(path);
    if json {
        return print_json(&definitions);
    }

    println!(
        "Scanned {} runtime(s) from {}",
        definitions.len(),
        path.display()
    );
    for def in &definitions {
        if def.is_valid() {
            println!("  {} -> {}", def.path, def.image_tag());
        } else {
            println!("  {} INVALID", def.path);
            for e in &def.validation_errors {
                eprintln!("    ERROR: {}", e);
            }
        }
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(definitions: &[T]) -> Result<(), String> {
    let rendered = serde_json::to_string_pretty(definitions)
        .map_err(|e| format!("cannot render scan as JSON: {}", e))?;
    println!("{}", rendered);
    Ok(())
}

fn cmd_invoke(
    method: &str,
    path: &str,
    body: Option<&str>,
    force_build: bool,
    stack: &StackArgs,
) -> Result<(), String> {
    let dispatcher = build_dispatcher(stack)?;

    let mut request = DispatchRequest::new(method, path);
    if let Some(body) = body {
        request.context.body = body.to_string();
    }
    request.force_build = force_build;

    let outcome = dispatcher.dispatch(&request);
    eprintln!("run {}", outcome.run_id);
    match outcome.result {
        Ok(body) => {
            print!("{}", body);
            if !body.ends_with('\n') {
                println!();
            }
            Ok(())
        }
        Err(e) => Err(e.to_string()),
    }
}

fn cmd_var_set(
    db: &Path,
    key_file: Option<&Path>,
    path: &str,
    name: &str,
    value: &str,
    secret: bool,
) -> Result<(), String> {
    let store = open_variables(db)?;
    let secret_box = load_secret_box(key_file)?;
    store
        .set(secret_box.as_ref(), path, name, value, secret)
        .map_err(|e| e.to_string())?;

    println!(
        "Set {}:{}{}",
        path,
        name,
        if secret { " (secret)" } else { "" }
    );
    Ok(())
}

fn cmd_var_list(db: &Path, path: Option<&str>) -> Result<(), String> {
    let store = open_variables(db)?;
    let variables = store.list(path).map_err(|e| e.to_string())?;

    if variables.is_empty() {
        println!("No variables stored.");
        return Ok(());
    }
    for var in &variables {
        if var.is_secret {
            println!("{}:{} = <secret>", var.path, var.name);
        } else {
            println!("{}:{} = {}", var.path, var.name, var.value);
        }
    }
    Ok(())
}

fn cmd_var_unset(db: &Path, path: &str, name: &str) -> Result<(), String> {
    let store = open_variables(db)?;
    let removed = store.unset(path, name).map_err(|e| e.to_string())?;
    if !removed {
        return Err(format!("no variable {}:{}", path, name));
    }
    println!("Removed {}:{}", path, name);
    Ok(())
}

fn cmd_var_keygen() -> Result<(), String> {
    println!("{}", crypto::generate_key_hex());
    Ok(())
}

fn open_variables(db: &Path) -> Result<VariableStore, String> {
    VariableStore::open(db).map_err(|e| format!("cannot open database {}: {}", db.display(), e))
}

/// Wire the full dispatch stack from CLI options. The variable and run
/// stores share one sqlite connection so a single database file carries
/// both tables.
fn build_dispatcher(stack: &StackArgs) -> Result<Dispatcher, String> {
    let secrets = load_secret_box(stack.key_file.as_deref())?;

    let conn = Connection::open(&stack.db)
        .map_err(|e| format!("cannot open database {}: {}", stack.db.display(), e))?;
    let conn = Arc::new(Mutex::new(conn));
    let variables = VariableStore::with_connection(Arc::clone(&conn)).map_err(|e| e.to_string())?;
    let runs = SqliteRunStore::with_connection(conn).map_err(|e| e.to_string())?;

    let definitions = Arc::new(DefinitionStore::with_ttl(
        &stack.functions_dir,
        &stack.runtimes_dir,
        Duration::from_secs(stack.cache_ttl),
    ));

    Ok(Dispatcher::new(
        definitions,
        variables,
        secrets,
        Arc::new(runs) as Arc<dyn RunStore>,
        DockerClient::new(stack.docker_bin.clone()),
        Duration::from_secs(stack.timeout),
    ))
}

/// Resolve the secret key if one is configured anywhere. No key is not an
/// error: dispatch and plain variables work without one, and the store
/// refuses secret writes on its own.
fn load_secret_box(key_file: Option<&Path>) -> Result<Option<SecretBox>, String> {
    if key_file.is_none() && std::env::var(KEY_ENV_VAR).is_err() {
        return Ok(None);
    }
    SecretBox::load(key_file)
        .map(Some)
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn write_function(root: &Path, rel: &str, yaml: &str) {
        let dir = root.join(rel);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(types::FUNCTION_MARKER), yaml).unwrap();
        std::fs::write(dir.join("entrypoint.php"), "<?php\n").unwrap();
    }

    fn write_runtime(root: &Path, rel: &str, yaml: &str) {
        let dir = root.join(rel);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(types::RUNTIME_MARKER), yaml).unwrap();
        std::fs::write(dir.join("Dockerfile"), "FROM scratch\n").unwrap();
    }

    fn stub_docker(dir: &Path, run_body: &str) -> String {
        let marker = dir.join("image-present");
        let script = format!(
            "#!/bin/sh\ncase \"$1\" in\n  image)\n    if [ -f '{marker}' ]; then echo '[{{\"Id\":\"sha256:x\"}}]'; exit 0; else exit 1; fi ;;\n  build)\n    touch '{marker}'\n    exit 0 ;;\n  run)\n    {body} ;;\n  *) exit 0 ;;\nesac\n",
            marker = marker.display(),
            body = run_body,
        );
        let path = dir.join("docker-stub");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    fn stack_args(work: &Path, run_body: &str) -> StackArgs {
        let functions = work.join("functions");
        let runtimes = work.join("runtimes");
        write_function(
            &functions,
            "widgets/show",
            "function:\n  name: widget\n  description: d\n  route: /widgets/{id}\n  method: GET\n  runtime: php/8.4\n  entrypoint: entrypoint.php\n",
        );
        write_runtime(
            &runtimes,
            "php/8.4",
            "language: php\nversion: '8.4'\nplatform: linux\n",
        );
        StackArgs {
            functions_dir: functions,
            runtimes_dir: runtimes,
            db: work.join("despacho.sqlite"),
            docker_bin: stub_docker(work, run_body),
            timeout: 30,
            cache_ttl: 0,
            key_file: None,
        }
    }

    #[test]
    fn scan_functions_reports_and_succeeds_despite_invalid_declarations() {
        let dir = tempfile::tempdir().unwrap();
        write_function(
            dir.path(),
            "good",
            "function:\n  name: g\n  description: d\n  route: /g\n  method: GET\n  runtime: php/8.4\n  entrypoint: entrypoint.php\n",
        );
        write_function(dir.path(), "bad", "function:\n  name: only-a-name\n");

        cmd_scan_functions(dir.path(), false).unwrap();
        cmd_scan_functions(dir.path(), true).unwrap();
    }

    #[test]
    fn scan_runtimes_handles_empty_root() {
        let dir = tempfile::tempdir().unwrap();
        cmd_scan_runtimes(&dir.path().join("missing"), false).unwrap();
    }

    #[test]
    fn invoke_prints_the_sandbox_body() {
        let dir = tempfile::tempdir().unwrap();
        let stack = stack_args(dir.path(), "echo from-cli");
        cmd_invoke("GET", "/widgets/5", None, false, &stack).unwrap();

        // The configured database now holds the run tables.
        let runs = SqliteRunStore::open(&stack.db).unwrap();
        assert!(runs.get("missing-id").unwrap().is_none());
    }

    #[test]
    fn invoke_fails_for_an_unmatched_route() {
        let dir = tempfile::tempdir().unwrap();
        let stack = stack_args(dir.path(), "echo ok");
        let err = cmd_invoke("GET", "/gadgets/5", None, false, &stack).unwrap_err();
        assert!(err.contains("no function matches"));
    }

    #[test]
    fn invoke_passes_the_body_through() {
        let dir = tempfile::tempdir().unwrap();
        let stack = stack_args(dir.path(), "printf '%s\\n' \"$@\"");
        cmd_invoke("GET", "/widgets/5", Some("{\"a\":1}"), false, &stack).unwrap();
    }

    #[test]
    fn var_set_list_unset_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("vars.sqlite");

        cmd_var_set(&db, None, "widgets/show", "REGION", "eu", false).unwrap();
        cmd_var_list(&db, Some("widgets/show")).unwrap();
        cmd_var_unset(&db, "widgets/show", "REGION").unwrap();

        let err = cmd_var_unset(&db, "widgets/show", "REGION").unwrap_err();
        assert!(err.contains("no variable"));
    }

    #[test]
    fn var_set_secret_without_a_key_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("vars.sqlite");

        let err = cmd_var_set(&db, None, "widgets/show", "TOKEN", "hunter2", true).unwrap_err();
        assert!(err.contains("without an encryption key"));
    }

    #[test]
    fn var_set_secret_encrypts_at_rest() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("vars.sqlite");
        let key_file = dir.path().join("despacho.key");
        std::fs::write(&key_file, crypto::generate_key_hex()).unwrap();

        cmd_var_set(
            &db,
            Some(&key_file),
            "widgets/show",
            "TOKEN",
            "hunter2",
            true,
        )
        .unwrap();

        let store = VariableStore::open(&db).unwrap();
        let stored = &store.list(Some("widgets/show")).unwrap()[0];
        assert!(stored.is_secret);
        assert_ne!(stored.value, "hunter2");

        let secret_box = SecretBox::from_key_file(&key_file).unwrap();
        assert_eq!(secret_box.reveal(&stored.value), "hunter2");
    }

    #[test]
    fn keygen_emits_a_loadable_key() {
        cmd_var_keygen().unwrap();
    }

    #[test]
    fn dispatch_routes_to_the_var_commands() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("vars.sqlite");
        dispatch(Commands::Var {
            action: VarAction::Set {
                path: "a/b".to_string(),
                name: "N".to_string(),
                value: "v".to_string(),
                secret: false,
                db: db.clone(),
                key_file: None,
            },
        })
        .unwrap();
        dispatch(Commands::Var {
            action: VarAction::List { path: None, db },
        })
        .unwrap();
    }

    #[test]
    fn missing_key_file_is_an_error_even_without_env() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("missing.key");
        let err = load_secret_box(Some(&gone)).unwrap_err();
        assert!(err.contains("cannot read key file"));
    }
}
