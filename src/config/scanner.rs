//! Declaration scanning: recursive marker-file discovery and parsing.
//!
//! Each `function.yml` / `runtime.yml` under the scan root yields exactly one
//! definition whose identity is the marker's directory relative to the root.
//! Parse and validation failures populate `validation_errors` on the
//! definition; a bad declaration never aborts the rest of the scan. The walk
//! is sorted by file name at every level, which fixes the scan order that
//! route matching ties break on.

use super::types::{
    FunctionDefinition, FunctionDocument, RuntimeDefinition, RuntimeDocument, ValidationError,
    FUNCTION_MARKER, HTTP_METHODS, RUNTIME_MARKER,
};
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Scan a directory tree for function declarations.
///
/// A missing or unreadable root yields an empty list so the dispatcher stays
/// alive in a degraded state.
pub fn scan_functions(base: &Path) -> Vec<FunctionDefinition> {
    collect_marker_files(base, FUNCTION_MARKER)
        .into_iter()
        .map(|marker| load_function(base, &marker))
        .collect()
}

/// Scan a directory tree for runtime declarations.
pub fn scan_runtimes(base: &Path) -> Vec<RuntimeDefinition> {
    collect_marker_files(base, RUNTIME_MARKER)
        .into_iter()
        .map(|marker| load_runtime(base, &marker))
        .collect()
}

/// Recursively collect marker files, sorted by file name at every level.
/// Symlinks are skipped; unreadable subtrees are logged and skipped.
fn collect_marker_files(base: &Path, marker: &str) -> Vec<PathBuf> {
    fn walk(current: &Path, marker: &str, found: &mut Vec<PathBuf>) {
        let read_dir = match std::fs::read_dir(current) {
            Ok(rd) => rd,
            Err(e) => {
                warn!(dir = %current.display(), error = %e, "cannot read directory, skipping");
                return;
            }
        };

        let mut children: Vec<std::fs::DirEntry> = read_dir.filter_map(|e| e.ok()).collect();
        children.sort_by_key(|e| e.file_name());

        for entry in children {
            let ft = match entry.file_type() {
                Ok(ft) => ft,
                Err(_stat_failed) => continue,
            };
            if ft.is_symlink() {
                continue;
            }
            let path = entry.path();
            if ft.is_file() && entry.file_name() == marker {
                found.push(path);
            } else if ft.is_dir() {
                walk(&path, marker, found);
            }
        }
    }

    if !base.is_dir() {
        warn!(dir = %base.display(), "scan root is not a directory");
        return Vec::new();
    }

    let mut found = Vec::new();
    walk(base, marker, &mut found);
    found
}

/// Declaration directory relative to the scan root, with `/` separators.
fn relative_dir(base: &Path, marker: &Path) -> String {
    let dir = marker.parent().unwrap_or(base);
    dir.strip_prefix(base)
        .unwrap_or(dir)
        .to_string_lossy()
        .replace(std::path::MAIN_SEPARATOR, "/")
}

fn load_function(base: &Path, marker: &Path) -> FunctionDefinition {
    let path = relative_dir(base, marker);
    let dir = marker.parent().unwrap_or(base).to_path_buf();

    let (doc, mut errors) = match read_document::<FunctionDocument>(marker) {
        Ok(doc) => (doc, Vec::new()),
        Err(e) => (FunctionDocument::default(), vec![ValidationError::new(e)]),
    };
    errors.extend(validate_function(&doc));

    let section = doc.function.unwrap_or_default();
    FunctionDefinition {
        path,
        dir,
        name: section.name.unwrap_or_default(),
        description: section.description.unwrap_or_default(),
        method: section.method.unwrap_or_default(),
        route: section.route.unwrap_or_default(),
        runtime: section.runtime.unwrap_or_default(),
        entrypoint: section.entrypoint.unwrap_or_default(),
        environment: section.environment,
        docker: section.docker.unwrap_or_default(),
        schedule: section.schedule,
        validation_errors: errors,
    }
}

fn load_runtime(base: &Path, marker: &Path) -> RuntimeDefinition {
    let path = relative_dir(base, marker);
    let dir = marker.parent().unwrap_or(base).to_path_buf();

    let (doc, mut errors) = match read_document::<RuntimeDocument>(marker) {
        Ok(doc) => (doc, Vec::new()),
        Err(e) => (RuntimeDocument::default(), vec![ValidationError::new(e)]),
    };
    errors.extend(validate_runtime(&doc));

    let build_args: IndexMap<String, String> = doc
        .build
        .map(|b| {
            b.args
                .iter()
                .map(|(k, v)| (k.clone(), super::types::scalar_to_string(v)))
                .collect()
        })
        .unwrap_or_default();

    RuntimeDefinition {
        path,
        dir,
        language: doc.language.unwrap_or_default(),
        version: doc.version.unwrap_or_default(),
        platform: doc.platform.unwrap_or_default(),
        build_args,
        validation_errors: errors,
    }
}

fn read_document<T: serde::de::DeserializeOwned>(marker: &Path) -> Result<T, String> {
    let content = std::fs::read_to_string(marker)
        .map_err(|e| format!("cannot read {}: {}", marker.display(), e))?;
    serde_yaml_ng::from_str(&content).map_err(|e| format!("cannot parse {}: {}", marker.display(), e))
}

/// A required field counts as missing when it is absent, empty, or
/// whitespace-only; a blank value declares nothing.
fn blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

/// Validate a function document. Presence rules mirror the declaration
/// schema: every core field present and non-blank, route anchored at `/`,
/// method from the recognized verb set.
fn validate_function(doc: &FunctionDocument) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    let Some(section) = &doc.function else {
        errors.push(ValidationError::new("Missing 'function' section"));
        return errors;
    };

    let required: [(&str, &Option<String>); 6] = [
        ("name", &section.name),
        ("description", &section.description),
        ("route", &section.route),
        ("method", &section.method),
        ("runtime", &section.runtime),
        ("entrypoint", &section.entrypoint),
    ];
    for (field, value) in required {
        if blank(value) {
            errors.push(ValidationError::new(format!(
                "Missing required field: function.{}",
                field
            )));
        }
    }

    if let Some(route) = &section.route {
        if !route.trim().is_empty() && !route.starts_with('/') {
            errors.push(ValidationError::new("Route must start with '/'"));
        }
    }

    if let Some(method) = &section.method {
        if !method.trim().is_empty() && !HTTP_METHODS.contains(&method.as_str()) {
            errors.push(ValidationError::new(format!(
                "Invalid HTTP method: {}",
                method
            )));
        }
    }

    errors
}

/// Validate a runtime document: language and platform are required and
/// non-blank.
fn validate_runtime(doc: &RuntimeDocument) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    if blank(&doc.language) {
        errors.push(ValidationError::new("Missing required field: language"));
    }
    if blank(&doc.platform) {
        errors.push(ValidationError::new("Missing required field: platform"));
    }
    errors
}
