//! kiln core
//!
//! Domain types, traits, and error handling for the kiln pipeline engine.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used by the scheduler, the runner, and the CLI.

pub mod error;
pub mod event;
pub mod ids;
pub mod interpolation;
pub mod job;
pub mod pipeline;
pub mod ports;
pub mod run;

pub use error::{Error, Result};
pub use ids::*;
