//! The dispatch pipeline: image resolution and sandbox execution.

pub mod dispatcher;
pub mod image;
