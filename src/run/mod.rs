//! Run lifecycle: the audit record for every build and dispatch.

pub mod guard;
pub mod store;
pub mod types;
