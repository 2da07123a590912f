//! Variables, secrets, and environment resolution.

pub mod crypto;
pub mod resolver;
pub mod store;
