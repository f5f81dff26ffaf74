//! # warden-common
//!
//! Shared foundation for all warden crates: domain models, the JSON wire
//! contract, the error taxonomy, configuration loading, and input
//! validation.

pub mod any_row;
pub mod config;
pub mod error;
pub mod models;
pub mod validation;

pub use error::{WardenError, WardenResult};
