//! Definition value types for functions and runtimes.
//!
//! Definitions are immutable once scanned: a scan parses every marker file
//! into one definition, attaching validation problems as data instead of
//! failing, and the whole batch is swapped into the cache at once.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Marker file name for function declarations.
pub const FUNCTION_MARKER: &str = "function.yml";

/// Marker file name for runtime declarations.
pub const RUNTIME_MARKER: &str = "runtime.yml";

/// Prefix for every sandbox image tag built by this dispatcher.
pub const IMAGE_TAG_PREFIX: &str = "despacho";

/// HTTP methods accepted in a function declaration.
pub const HTTP_METHODS: [&str; 7] = ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

// ============================================================================
// Validation
// ============================================================================

/// A single problem found while loading a declaration document.
///
/// Validation problems are data on the definition, not errors: one bad
/// declaration never aborts a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        ValidationError {
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

// ============================================================================
// Raw document shapes (as parsed from YAML, everything optional)
// ============================================================================

/// Top level of a `function.yml` document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FunctionDocument {
    pub function: Option<FunctionSection>,
}

/// The `function:` section of a declaration document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FunctionSection {
    pub name: Option<String>,
    pub description: Option<String>,
    pub route: Option<String>,
    pub method: Option<String>,
    pub runtime: Option<String>,
    pub entrypoint: Option<String>,
    pub environment: IndexMap<String, serde_yaml_ng::Value>,
    pub docker: Option<DockerOptions>,
    pub schedule: Option<ScheduleOptions>,
}

/// Top level of a `runtime.yml` document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuntimeDocument {
    pub language: Option<String>,
    pub version: Option<String>,
    pub platform: Option<String>,
    pub build: Option<BuildSection>,
}

/// The `build:` section of a runtime document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BuildSection {
    pub args: IndexMap<String, serde_yaml_ng::Value>,
}

/// Per-function container options.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DockerOptions {
    /// CPU limit passed to the container tool (e.g. `1.5`).
    pub cpus: Option<f64>,
    /// Memory limit passed to the container tool (e.g. `512m`).
    pub memory: Option<String>,
    /// Wall-clock timeout for one invocation, in seconds.
    pub timeout: Option<u64>,
}

/// Schedule metadata. Parsed and carried for external schedulers; the
/// dispatcher itself never acts on it.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ScheduleOptions {
    pub cron: Option<String>,
}

// ============================================================================
// Function definitions
// ============================================================================

/// One scanned function declaration.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionDefinition {
    /// Declaration directory relative to the scan root (unique identity).
    pub path: String,
    /// Absolute declaration directory.
    pub dir: PathBuf,
    pub name: String,
    pub description: String,
    pub method: String,
    pub route: String,
    /// Path of the runtime declaration this function executes on.
    pub runtime: String,
    /// Entrypoint file relative to the declaration directory.
    pub entrypoint: String,
    /// Declared environment block, raw and unresolved. Placeholder
    /// substitution happens per dispatch against the on-disk document.
    pub environment: IndexMap<String, serde_yaml_ng::Value>,
    pub docker: DockerOptions,
    pub schedule: Option<ScheduleOptions>,
    pub validation_errors: Vec<ValidationError>,
}

impl FunctionDefinition {
    pub fn is_valid(&self) -> bool {
        self.validation_errors.is_empty()
    }

    /// Absolute path of the entrypoint file.
    pub fn entrypoint_path(&self) -> PathBuf {
        self.dir.join(&self.entrypoint)
    }

    /// Absolute path of the declaration document.
    pub fn document_path(&self) -> PathBuf {
        self.dir.join(FUNCTION_MARKER)
    }
}

// ============================================================================
// Runtime definitions
// ============================================================================

/// One scanned runtime declaration.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeDefinition {
    /// Declaration directory relative to the scan root (unique identity).
    pub path: String,
    /// Absolute declaration directory (the image build context).
    pub dir: PathBuf,
    pub language: String,
    pub version: String,
    pub platform: String,
    /// Build arguments in declaration order, values already stringified.
    pub build_args: IndexMap<String, String>,
    pub validation_errors: Vec<ValidationError>,
}

impl RuntimeDefinition {
    pub fn is_valid(&self) -> bool {
        self.validation_errors.is_empty()
    }

    /// Deterministic image tag: same (platform, language, version) triple,
    /// same tag, always.
    pub fn image_tag(&self) -> String {
        format!(
            "{}-{}-{}-{}:latest",
            IMAGE_TAG_PREFIX,
            slug(&self.platform),
            slug(&self.language),
            slug(&self.version)
        )
    }
}

/// Lower-case a string and reduce every non-alphanumeric run to a single
/// hyphen, trimming hyphens at both ends.
pub fn slug(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_sep = false;

    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('-');
            }
            pending_sep = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }

    out
}

/// Render a YAML scalar the way it is handed to the sandbox: booleans as
/// `true`/`false`, numbers and strings verbatim, null empty. Collections
/// fall back to their JSON form.
pub fn scalar_to_string(value: &serde_yaml_ng::Value) -> String {
    match value {
        serde_yaml_ng::Value::Null => String::new(),
        serde_yaml_ng::Value::Bool(b) => {
            if *b {
                "true".to_string()
            } else {
                "false".to_string()
            }
        }
        serde_yaml_ng::Value::Number(n) => n.to_string(),
        serde_yaml_ng::Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime(platform: &str, language: &str, version: &str) -> RuntimeDefinition {
        RuntimeDefinition {
            path: "test".to_string(),
            dir: PathBuf::from("/tmp/runtimes/test"),
            language: language.to_string(),
            version: version.to_string(),
            platform: platform.to_string(),
            build_args: IndexMap::new(),
            validation_errors: Vec::new(),
        }
    }

    #[test]
    fn image_tag_is_deterministic() {
        let a = runtime("linux/amd64", "PHP", "8.4");
        let b = runtime("linux/amd64", "PHP", "8.4");
        assert_eq!(a.image_tag(), b.image_tag());
        assert_eq!(a.image_tag(), "despacho-linux-amd64-php-8-4:latest");
    }

    #[test]
    fn image_tag_distinguishes_versions() {
        let a = runtime("linux", "php", "8.4");
        let b = runtime("linux", "php", "8.3");
        assert_ne!(a.image_tag(), b.image_tag());
    }

    #[test]
    fn slug_lowercases_and_collapses() {
        assert_eq!(slug("Linux/AMD64"), "linux-amd64");
        assert_eq!(slug("php"), "php");
        assert_eq!(slug("8.4"), "8-4");
        assert_eq!(slug("  spaced  out  "), "spaced-out");
        assert_eq!(slug("--already--slugged--"), "already-slugged");
        assert_eq!(slug(""), "");
        assert_eq!(slug("!!!"), "");
    }

    #[test]
    fn scalar_rendering() {
        use serde_yaml_ng::Value;
        assert_eq!(scalar_to_string(&Value::Bool(true)), "true");
        assert_eq!(scalar_to_string(&Value::Bool(false)), "false");
        assert_eq!(scalar_to_string(&Value::String("x".into())), "x");
        assert_eq!(scalar_to_string(&Value::Number(8.into())), "8");
        assert_eq!(scalar_to_string(&Value::Null), "");
    }

    #[test]
    fn entrypoint_path_joins_declaration_dir() {
        let def = FunctionDefinition {
            path: "plex/fix-titles".to_string(),
            dir: PathBuf::from("/srv/functions/plex/fix-titles"),
            name: "fix".to_string(),
            description: "d".to_string(),
            method: "GET".to_string(),
            route: "/fix".to_string(),
            runtime: "php/8.4".to_string(),
            entrypoint: "entrypoint.php".to_string(),
            environment: IndexMap::new(),
            docker: DockerOptions::default(),
            schedule: None,
            validation_errors: Vec::new(),
        };
        assert_eq!(
            def.entrypoint_path(),
            PathBuf::from("/srv/functions/plex/fix-titles/entrypoint.php")
        );
        assert_eq!(
            def.document_path(),
            PathBuf::from("/srv/functions/plex/fix-titles/function.yml")
        );
        assert!(def.is_valid());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn slug_output_is_always_clean(input in ".*") {
                let s = slug(&input);
                prop_assert!(s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
                prop_assert!(!s.starts_with('-'));
                prop_assert!(!s.ends_with('-'));
                prop_assert!(!s.contains("--"));
            }

            #[test]
            fn slug_is_idempotent(input in ".*") {
                let once = slug(&input);
                prop_assert_eq!(slug(&once), once);
            }
        }
    }
}
