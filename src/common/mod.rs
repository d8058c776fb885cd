//! Shared value types and pod helpers used across the shim.

pub mod resource;
pub mod utils;

pub use resource::{Resource, ResourceBuilder};
