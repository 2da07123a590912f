//! Variable storage, scoped by function declaration path.
//!
//! Rows live in sqlite. Secret values are encrypted before they reach the
//! table and decrypted only when a dispatch injects them. Duplicate names
//! within a scope are tolerated on read: rows are ordered by id (insertion
//! order) and the first occurrence of a name wins, across both partitions.

use super::crypto::SecretBox;
use crate::error::{DispatchError, Result};
use indexmap::IndexMap;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// One stored variable row, value as persisted (ciphertext for secrets).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub path: String,
    pub name: String,
    pub value: String,
    pub is_secret: bool,
}

/// Variables for one scope, partitioned and decrypted, in precedence order.
#[derive(Debug, Clone, Default)]
pub struct ScopedVariables {
    pub secrets: IndexMap<String, String>,
    pub variables: IndexMap<String, String>,
}

/// Sqlite-backed variable store.
#[derive(Clone)]
pub struct VariableStore {
    conn: Arc<Mutex<Connection>>,
}

impl VariableStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = VariableStore {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = VariableStore {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Share an existing connection (the run store uses the same database
    /// file).
    pub fn with_connection(conn: Arc<Mutex<Connection>>) -> Result<Self> {
        let store = VariableStore { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS variables (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              path TEXT NOT NULL,
              name TEXT NOT NULL,
              value TEXT NOT NULL,
              is_secret INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_variables_path ON variables(path);
            "#,
        )?;
        Ok(())
    }

    /// Create or update a variable. Secret values are encrypted before they
    /// are persisted; a value that is already our ciphertext is stored as-is
    /// so an update cannot double-encrypt.
    pub fn set(
        &self,
        secret_box: Option<&SecretBox>,
        path: &str,
        name: &str,
        value: &str,
        is_secret: bool,
    ) -> Result<()> {
        let stored = if is_secret && !value.is_empty() {
            let secret_box = secret_box.ok_or_else(|| {
                DispatchError::Crypto("cannot store a secret without an encryption key".to_string())
            })?;
            if secret_box.is_encrypted(value) {
                value.to_string()
            } else {
                secret_box.encrypt(value)?
            }
        } else {
            value.to_string()
        };

        let conn = self.conn.lock().unwrap();
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM variables WHERE path = ?1 AND name = ?2 ORDER BY id LIMIT 1",
                params![path, name],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE variables SET value = ?1, is_secret = ?2 WHERE id = ?3",
                    params![stored, is_secret, id],
                )?;
            }
            None => {
                conn.execute(
                    "INSERT INTO variables (path, name, value, is_secret) VALUES (?1, ?2, ?3, ?4)",
                    params![path, name, stored, is_secret],
                )?;
            }
        }
        Ok(())
    }

    /// Remove a variable. Returns whether any row was deleted.
    pub fn unset(&self, path: &str, name: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM variables WHERE path = ?1 AND name = ?2",
            params![path, name],
        )?;
        Ok(deleted > 0)
    }

    /// All rows, optionally filtered by scope path, values as stored.
    pub fn list(&self, path: Option<&str>) -> Result<Vec<Variable>> {
        let conn = self.conn.lock().unwrap();
        let mut out = Vec::new();
        match path {
            Some(p) => {
                let mut stmt = conn.prepare(
                    "SELECT path, name, value, is_secret FROM variables WHERE path = ?1 ORDER BY id",
                )?;
                for row in stmt.query_map(params![p], row_to_variable)? {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = conn
                    .prepare("SELECT path, name, value, is_secret FROM variables ORDER BY id")?;
                for row in stmt.query_map([], row_to_variable)? {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    /// Variables scoped to one path, partitioned into secrets and plain
    /// variables with secrets decrypted. The first row for a given name wins
    /// regardless of partition; later duplicates are ignored.
    ///
    /// Without a key configured, secret values come back in their stored
    /// form (the decrypt tolerance working in reverse).
    pub fn for_path(&self, path: &str, secret_box: Option<&SecretBox>) -> Result<ScopedVariables> {
        let rows = self.list(Some(path))?;

        let mut scoped = ScopedVariables::default();
        for row in rows {
            if scoped.secrets.contains_key(&row.name) || scoped.variables.contains_key(&row.name) {
                continue;
            }
            if row.is_secret {
                let value = match secret_box {
                    Some(b) => b.reveal(&row.value),
                    None => row.value,
                };
                scoped.secrets.insert(row.name, value);
            } else {
                scoped.variables.insert(row.name, row.value);
            }
        }
        Ok(scoped)
    }

    /// Insert a row exactly as given. Reads must tolerate whatever is in the
    /// table, including duplicates, so tests fabricate them through this.
    #[cfg(test)]
    fn insert_raw(&self, path: &str, name: &str, value: &str, is_secret: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO variables (path, name, value, is_secret) VALUES (?1, ?2, ?3, ?4)",
            params![path, name, value, is_secret],
        )?;
        Ok(())
    }
}

fn row_to_variable(row: &rusqlite::Row<'_>) -> rusqlite::Result<Variable> {
    Ok(Variable {
        path: row.get(0)?,
        name: row.get(1)?,
        value: row.get(2)?,
        is_secret: row.get(3)?,
    })
}
