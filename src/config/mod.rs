//! Function and runtime declarations — value types, scanning, caching.

pub mod scanner;
pub mod store;
pub mod types;
