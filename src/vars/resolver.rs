//! Placeholder substitution and sandbox environment construction.
//!
//! A dispatch re-reads the function's declaration document, substitutes
//! `$(secret.NAME:-default}` / `$(variable.NAME:-default}` placeholders from
//! the scoped variable store, parses the result, and flattens the declared
//! environment block into the map handed to the sandbox. Two keys carrying
//! the inbound request are always injected first; declared entries override
//! them on collision.

use super::store::ScopedVariables;
use crate::config::types::{scalar_to_string, FunctionDocument};
use indexmap::IndexMap;
use regex::{Captures, Regex};
use std::sync::OnceLock;

/// Injected key holding the inbound headers as a JSON object.
pub const HEADERS_KEY: &str = "HTTP_REQUEST_HEADERS";

/// Injected key holding the inbound body as a JSON value.
pub const INPUT_KEY: &str = "HTTP_REQUEST_INPUT";

/// The inbound request as seen by the sandbox.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub headers: IndexMap<String, String>,
    pub body: String,
}

impl RequestContext {
    /// Headers as a JSON object, in arrival order.
    pub fn headers_json(&self) -> String {
        serde_json::to_string(&self.headers).unwrap_or_else(|_| "{}".to_string())
    }

    /// Body as a JSON value: passed through when it already is valid JSON,
    /// otherwise encoded as a JSON string.
    pub fn input_json(&self) -> String {
        if serde_json::from_str::<serde_json::Value>(&self.body).is_ok() {
            self.body.clone()
        } else {
            serde_json::to_string(&self.body).unwrap_or_else(|_| "\"\"".to_string())
        }
    }
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\((secret|variable)\.([A-Z_]+):-([^}]+)\}").expect("placeholder pattern")
    })
}

/// Replace every placeholder with its looked-up value, or the literal
/// default when nothing is stored under that name. `secret.` placeholders
/// only consult the secrets partition, `variable.` only the plain one. The
/// replacement is wrapped in double quotes so the document stays parseable
/// whatever the value looks like.
pub fn substitute(document: &str, vars: &ScopedVariables) -> String {
    placeholder_regex()
        .replace_all(document, |caps: &Captures| {
            let source = if &caps[1] == "secret" {
                &vars.secrets
            } else {
                &vars.variables
            };
            let value = source
                .get(&caps[2])
                .map(String::as_str)
                .unwrap_or(&caps[3]);
            format!("\"{}\"", value)
        })
        .into_owned()
}

/// Build the final environment for one dispatch from the raw declaration
/// document. Fails only when the substituted document no longer parses.
pub fn build_environment(
    document: &str,
    vars: &ScopedVariables,
    ctx: &RequestContext,
) -> Result<IndexMap<String, String>, String> {
    let substituted = substitute(document, vars);
    let doc: FunctionDocument = serde_yaml_ng::from_str(&substituted)
        .map_err(|e| format!("declaration no longer parses after substitution: {}", e))?;

    let mut env = IndexMap::new();
    env.insert(HEADERS_KEY.to_string(), ctx.headers_json());
    env.insert(INPUT_KEY.to_string(), ctx.input_json());

    if let Some(section) = doc.function {
        for (key, value) in &section.environment {
            env.insert(key.clone(), scalar_to_string(value));
        }
    }
    Ok(env)
}
