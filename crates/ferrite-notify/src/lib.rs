//! Commit-status delivery for Ferrite CI.
//!
//! Implements the scheduler's `StatusReporter` port. Delivery is
//! fire-and-forget from the scheduler's point of view: callers log failures
//! and never let them influence scheduling decisions.

pub mod commit_status;

pub use commit_status::{CommitStatusReporter, LogReporter, commit_state};
