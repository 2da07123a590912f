//! Run record persistence.
//!
//! The dispatch core only ever creates, updates, and fetches single runs;
//! listing and pruning are reporting concerns outside this crate. The
//! sqlite store shares its connection with the variable store so one
//! database file carries both tables.

use super::types::{Run, RunStatus};
use crate::error::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Persistence seam for run records.
pub trait RunStore: Send + Sync {
    fn create(&self, run: &Run) -> Result<()>;
    fn update(&self, run: &Run) -> Result<()>;
    fn get(&self, id: &str) -> Result<Option<Run>>;
}

/// Sqlite-backed run store.
#[derive(Clone)]
pub struct SqliteRunStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRunStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = SqliteRunStore {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = SqliteRunStore {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Share an existing connection (the variable store uses the same
    /// database file).
    pub fn with_connection(conn: Arc<Mutex<Connection>>) -> Result<Self> {
        let store = SqliteRunStore { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
              id TEXT PRIMARY KEY,
              function_path TEXT,
              runtime_path TEXT,
              build_id TEXT,
              uri TEXT,
              requested_at INTEGER,
              started_at INTEGER,
              stopped_at INTEGER,
              responded_at INTEGER,
              command TEXT,
              response_code INTEGER,
              is_success INTEGER,
              status TEXT NOT NULL DEFAULT 'starting'
            );
            CREATE INDEX IF NOT EXISTS idx_runs_function_path ON runs(function_path);
            CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
            "#,
        )?;
        Ok(())
    }
}

impl RunStore for SqliteRunStore {
    fn create(&self, run: &Run) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO runs (id, function_path, runtime_path, build_id, uri, requested_at, \
             started_at, stopped_at, responded_at, command, response_code, is_success, status) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                run.id,
                run.function_path,
                run.runtime_path,
                run.build_id,
                run.uri,
                run.requested_at,
                run.started_at,
                run.stopped_at,
                run.responded_at,
                run.command,
                run.response_code,
                run.is_success,
                run.status.as_str(),
            ],
        )?;
        Ok(())
    }

    fn update(&self, run: &Run) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE runs SET function_path = ?2, runtime_path = ?3, build_id = ?4, uri = ?5, \
             requested_at = ?6, started_at = ?7, stopped_at = ?8, responded_at = ?9, \
             command = ?10, response_code = ?11, is_success = ?12, status = ?13 WHERE id = ?1",
            params![
                run.id,
                run.function_path,
                run.runtime_path,
                run.build_id,
                run.uri,
                run.requested_at,
                run.started_at,
                run.stopped_at,
                run.responded_at,
                run.command,
                run.response_code,
                run.is_success,
                run.status.as_str(),
            ],
        )?;
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Run>> {
        let conn = self.conn.lock().unwrap();
        let run = conn
            .query_row(
                "SELECT id, function_path, runtime_path, build_id, uri, requested_at, \
                 started_at, stopped_at, responded_at, command, response_code, is_success, \
                 status FROM runs WHERE id = ?1",
                params![id],
                row_to_run,
            )
            .optional()?;
        Ok(run)
    }
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    let status_str: String = row.get(12)?;
    let status = RunStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            12,
            rusqlite::types::Type::Text,
            format!("unknown run status '{}'", status_str).into(),
        )
    })?;
    Ok(Run {
        id: row.get(0)?,
        function_path: row.get(1)?,
        runtime_path: row.get(2)?,
        build_id: row.get(3)?,
        uri: row.get(4)?,
        requested_at: row.get(5)?,
        started_at: row.get(6)?,
        stopped_at: row.get(7)?,
        responded_at: row.get(8)?,
        command: row.get(9)?,
        response_code: row.get(10)?,
        is_success: row.get(11)?,
        status,
    })
}

/// In-memory run store: an append-only log of every write, so tests can
/// assert not just the final record but how it got there.
#[derive(Default)]
pub struct MemoryRunStore {
    writes: Mutex<Vec<Run>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        MemoryRunStore::default()
    }

    /// Every create and update, in order.
    pub fn writes(&self) -> Vec<Run> {
        self.writes.lock().unwrap().clone()
    }

    /// How many writes moved this run to `completed`.
    pub fn completion_count(&self, id: &str) -> usize {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.id == id && r.status == RunStatus::Completed)
            .count()
    }
}

impl RunStore for MemoryRunStore {
    fn create(&self, run: &Run) -> Result<()> {
        self.writes.lock().unwrap().push(run.clone());
        Ok(())
    }

    fn update(&self, run: &Run) -> Result<()> {
        self.writes.lock().unwrap().push(run.clone());
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Run>> {
        Ok(self
            .writes
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| r.id == id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::types::now_ms;

    fn full_run() -> Run {
        let mut run = Run::new();
        run.function_path = Some("plex/fix-titles".to_string());
        run.runtime_path = Some("php/8.4".to_string());
        run.build_id = Some("b-123".to_string());
        run.uri = Some("/run/fix-titles".to_string());
        run.requested_at = Some(now_ms());
        run.started_at = Some(now_ms());
        run.stopped_at = Some(now_ms() + 40);
        run.responded_at = Some(now_ms() + 41);
        run.command = Some("docker run --rm -v /srv:/app tag:latest".to_string());
        run.response_code = Some(200);
        run.is_success = Some(true);
        run.status = RunStatus::Completed;
        run
    }

    #[test]
    fn sqlite_round_trips_every_field() {
        let store = SqliteRunStore::open_in_memory().unwrap();
        let run = full_run();
        store.create(&run).unwrap();

        let loaded = store.get(&run.id).unwrap().unwrap();
        assert_eq!(loaded.id, run.id);
        assert_eq!(loaded.function_path, run.function_path);
        assert_eq!(loaded.runtime_path, run.runtime_path);
        assert_eq!(loaded.build_id, run.build_id);
        assert_eq!(loaded.uri, run.uri);
        assert_eq!(loaded.requested_at, run.requested_at);
        assert_eq!(loaded.started_at, run.started_at);
        assert_eq!(loaded.stopped_at, run.stopped_at);
        assert_eq!(loaded.responded_at, run.responded_at);
        assert_eq!(loaded.command, run.command);
        assert_eq!(loaded.response_code, run.response_code);
        assert_eq!(loaded.is_success, run.is_success);
        assert_eq!(loaded.status, RunStatus::Completed);
    }

    #[test]
    fn sqlite_update_replaces_fields() {
        let store = SqliteRunStore::open_in_memory().unwrap();
        let mut run = Run::new();
        run.requested_at = Some(1_000);
        store.create(&run).unwrap();

        run.status = RunStatus::Running;
        run.started_at = Some(1_050);
        store.update(&run).unwrap();

        let loaded = store.get(&run.id).unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Running);
        assert_eq!(loaded.started_at, Some(1_050));
        assert_eq!(loaded.requested_at, Some(1_000));
    }

    #[test]
    fn sqlite_get_missing_is_none() {
        let store = SqliteRunStore::open_in_memory().unwrap();
        assert!(store.get("no-such-run").unwrap().is_none());
    }

    #[test]
    fn sqlite_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("runs.sqlite");
        let run = full_run();

        {
            let store = SqliteRunStore::open(&db).unwrap();
            store.create(&run).unwrap();
        }
        let store = SqliteRunStore::open(&db).unwrap();
        assert_eq!(store.get(&run.id).unwrap().unwrap().build_id, run.build_id);
    }

    #[test]
    fn shares_a_database_with_the_variable_store() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("despacho.sqlite");
        let conn = Arc::new(Mutex::new(Connection::open(&db).unwrap()));

        let runs = SqliteRunStore::with_connection(Arc::clone(&conn)).unwrap();
        let vars = crate::vars::store::VariableStore::with_connection(conn).unwrap();

        let run = Run::new();
        runs.create(&run).unwrap();
        vars.set(None, "plex/fix-titles", "REGION", "eu", false)
            .unwrap();

        assert!(runs.get(&run.id).unwrap().is_some());
        assert_eq!(vars.list(None).unwrap().len(), 1);
    }

    #[test]
    fn memory_store_logs_every_write() {
        let store = MemoryRunStore::new();
        let mut run = Run::new();
        store.create(&run).unwrap();

        run.status = RunStatus::Running;
        store.update(&run).unwrap();
        run.status = RunStatus::Completed;
        store.update(&run).unwrap();

        assert_eq!(store.writes().len(), 3);
        assert_eq!(store.completion_count(&run.id), 1);
        assert_eq!(
            store.get(&run.id).unwrap().unwrap().status,
            RunStatus::Completed
        );
    }
}
