//! Despacho — self-hosted function dispatch with container sandboxes.
//!
//! Functions are YAML declarations on disk. A dispatch matches the request
//! against declared routes, ensures the runtime's sandbox image (built at
//! most once per tag), resolves the environment through the secret store,
//! executes the entrypoint in a container, and audits the whole thing as a
//! run record.

pub mod cli;
pub mod config;
pub mod docker;
pub mod engine;
pub mod error;
pub mod route;
pub mod run;
pub mod server;
pub mod vars;
