//! Core types and utilities for the chest X-ray experiment harness.
//!
//! This crate provides the error taxonomy, the immutable run configuration,
//! the disease vocabulary and the metric math shared by the dataset and
//! training crates.

pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod types;

pub use backend::*;
pub use cli::*;
pub use config::*;
pub use error::{Error, Result};
pub use metrics::*;
pub use types::*;

/// Re-export commonly used burn types
pub mod prelude {
    pub use burn::prelude::*;
    pub use crate::config::*;
    pub use crate::error::{Error, Result};
    pub use crate::metrics::*;
    pub use crate::types::*;
}
