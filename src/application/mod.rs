//! Application layer: services and use cases
//!
//! This layer orchestrates domain logic and owns configuration-driven entry points.

pub mod error;
pub mod services;

pub use error::{ApplicationError, ApplicationResult};
