//! Cached definition store.
//!
//! Scans are expensive relative to dispatch, so results are cached behind a
//! TTL. Readers get an `Arc` snapshot: a refresh builds the complete new
//! vector before swapping it in, so a concurrent reader sees either the old
//! batch or the new one, never a partial scan.

use super::scanner;
use super::types::{FunctionDefinition, RuntimeDefinition};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;

/// How long a scan result is served before the tree is walked again.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

struct Snapshot<T> {
    items: Arc<Vec<T>>,
    loaded_at: Instant,
}

/// Definition cache over the function and runtime declaration roots.
pub struct DefinitionStore {
    functions_dir: PathBuf,
    runtimes_dir: PathBuf,
    ttl: Duration,
    functions: RwLock<Option<Snapshot<FunctionDefinition>>>,
    runtimes: RwLock<Option<Snapshot<RuntimeDefinition>>>,
}

impl DefinitionStore {
    pub fn new(functions_dir: impl Into<PathBuf>, runtimes_dir: impl Into<PathBuf>) -> Self {
        Self::with_ttl(functions_dir, runtimes_dir, DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(
        functions_dir: impl Into<PathBuf>,
        runtimes_dir: impl Into<PathBuf>,
        ttl: Duration,
    ) -> Self {
        DefinitionStore {
            functions_dir: functions_dir.into(),
            runtimes_dir: runtimes_dir.into(),
            ttl,
            functions: RwLock::new(None),
            runtimes: RwLock::new(None),
        }
    }

    pub fn functions_dir(&self) -> &Path {
        &self.functions_dir
    }

    pub fn runtimes_dir(&self) -> &Path {
        &self.runtimes_dir
    }

    /// All function definitions, scanning if the cache is cold or expired.
    pub fn functions(&self) -> Arc<Vec<FunctionDefinition>> {
        let dir = self.functions_dir.clone();
        read_through(&self.functions, self.ttl, move || {
            debug!(dir = %dir.display(), "scanning function declarations");
            scanner::scan_functions(&dir)
        })
    }

    /// All runtime definitions, scanning if the cache is cold or expired.
    pub fn runtimes(&self) -> Arc<Vec<RuntimeDefinition>> {
        let dir = self.runtimes_dir.clone();
        read_through(&self.runtimes, self.ttl, move || {
            debug!(dir = %dir.display(), "scanning runtime declarations");
            scanner::scan_runtimes(&dir)
        })
    }

    /// Look up a function by its declaration path.
    pub fn function(&self, path: &str) -> Option<FunctionDefinition> {
        self.functions().iter().find(|f| f.path == path).cloned()
    }

    /// Look up a runtime by its declaration path.
    pub fn runtime(&self, path: &str) -> Option<RuntimeDefinition> {
        self.runtimes().iter().find(|r| r.path == path).cloned()
    }

    /// Drop both snapshots; the next read rescans.
    pub fn flush(&self) {
        *self.functions.write().unwrap() = None;
        *self.runtimes.write().unwrap() = None;
    }
}

/// Serve the cached snapshot while it is fresh, otherwise rebuild and swap.
/// The double check after taking the write lock keeps concurrent stale
/// readers from each rescanning.
fn read_through<T>(
    slot: &RwLock<Option<Snapshot<T>>>,
    ttl: Duration,
    scan: impl Fn() -> Vec<T>,
) -> Arc<Vec<T>> {
    {
        let guard = slot.read().unwrap();
        if let Some(snapshot) = guard.as_ref() {
            if snapshot.loaded_at.elapsed() < ttl {
                return Arc::clone(&snapshot.items);
            }
        }
    }

    let mut guard = slot.write().unwrap();
    if let Some(snapshot) = guard.as_ref() {
        if snapshot.loaded_at.elapsed() < ttl {
            return Arc::clone(&snapshot.items);
        }
    }

    let items = Arc::new(scan());
    *guard = Some(Snapshot {
        items: Arc::clone(&items),
        loaded_at: Instant::now(),
    });
    items
}
