//! Ferrite CI Core
//!
//! Core domain types, traits, and error handling for Ferrite CI.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used across all other crates.

pub mod error;
pub mod events;
pub mod ids;
pub mod job;
pub mod permission;
pub mod ports;
pub mod run;
pub mod runner;
pub mod status;
pub mod task;
pub mod workflow;

pub use error::{Error, Result};
pub use ids::*;
pub use status::Status;
