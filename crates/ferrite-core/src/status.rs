//! The shared status enum for runs, jobs, and tasks.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status shared by runs, jobs, and tasks.
///
/// The discriminants are part of the wire protocol between the server and
/// runners and must never be reordered.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum Status {
    #[default]
    Unknown = 0,
    Success = 1,
    Failure = 2,
    Cancelled = 3,
    Skipped = 4,
    Waiting = 5,
    Running = 6,
    Blocked = 7,
}

impl Status {
    /// Whether this status is terminal.
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            Status::Success | Status::Failure | Status::Cancelled | Status::Skipped
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Status::Blocked)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Unknown => "unknown",
            Status::Success => "success",
            Status::Failure => "failure",
            Status::Cancelled => "cancelled",
            Status::Skipped => "skipped",
            Status::Waiting => "waiting",
            Status::Running => "running",
            Status::Blocked => "blocked",
        }
    }

    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => Status::Success,
            2 => Status::Failure,
            3 => Status::Cancelled,
            4 => Status::Skipped,
            5 => Status::Waiting,
            6 => Status::Running,
            7 => Status::Blocked,
            _ => Status::Unknown,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive a run's status from the statuses of its jobs.
///
/// Pure over the multiset of statuses: order-independent and stable under
/// re-evaluation. Failure takes precedence over still-running jobs, so a run
/// reports `Failure` as soon as any job has failed (fail-fast).
pub fn aggregate_job_status(statuses: &[Status]) -> Status {
    if statuses.is_empty() {
        return Status::Unknown;
    }

    let all_skipped = statuses.iter().all(|s| *s == Status::Skipped);
    if all_skipped {
        return Status::Skipped;
    }
    let all_success = statuses
        .iter()
        .all(|s| matches!(s, Status::Success | Status::Skipped));
    if all_success {
        return Status::Success;
    }
    if statuses.iter().any(|s| *s == Status::Cancelled) {
        return Status::Cancelled;
    }
    if statuses.iter().any(|s| *s == Status::Failure) {
        return Status::Failure;
    }
    if statuses.iter().any(|s| *s == Status::Running) {
        return Status::Running;
    }
    if statuses.iter().any(|s| *s == Status::Waiting) {
        return Status::Waiting;
    }
    if statuses.iter().any(|s| *s == Status::Blocked) {
        return Status::Blocked;
    }
    Status::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_terminal_set() {
        assert!(Status::Success.is_done());
        assert!(Status::Failure.is_done());
        assert!(Status::Cancelled.is_done());
        assert!(Status::Skipped.is_done());
        assert!(!Status::Waiting.is_done());
        assert!(!Status::Running.is_done());
        assert!(!Status::Blocked.is_done());
        assert!(!Status::Unknown.is_done());
    }

    #[test]
    fn test_wire_roundtrip() {
        for s in [
            Status::Unknown,
            Status::Success,
            Status::Failure,
            Status::Cancelled,
            Status::Skipped,
            Status::Waiting,
            Status::Running,
            Status::Blocked,
        ] {
            assert_eq!(Status::from_i32(s as i32), s);
        }
    }

    #[test]
    fn test_aggregate_precedence() {
        use Status::*;

        assert_eq!(aggregate_job_status(&[Skipped, Skipped]), Skipped);
        assert_eq!(aggregate_job_status(&[Success, Skipped]), Success);
        assert_eq!(aggregate_job_status(&[Success, Success]), Success);
        assert_eq!(aggregate_job_status(&[Success, Cancelled, Failure]), Cancelled);
        // Fail-fast: a failed job wins over jobs still in flight.
        assert_eq!(aggregate_job_status(&[Failure, Running]), Failure);
        assert_eq!(aggregate_job_status(&[Failure, Waiting, Success]), Failure);
        assert_eq!(aggregate_job_status(&[Running, Waiting, Success]), Running);
        assert_eq!(aggregate_job_status(&[Waiting, Success]), Waiting);
        assert_eq!(aggregate_job_status(&[Blocked, Success]), Blocked);
        assert_eq!(aggregate_job_status(&[]), Unknown);
    }

    #[test]
    fn test_aggregate_order_independent() {
        use Status::*;

        let mut statuses = vec![Failure, Running, Waiting, Success, Blocked, Skipped];
        let expected = aggregate_job_status(&statuses);
        // Rotate through every cyclic permutation; the result must not move.
        for _ in 0..statuses.len() {
            statuses.rotate_left(1);
            assert_eq!(aggregate_job_status(&statuses), expected);
        }
    }

    #[test]
    fn test_aggregate_idempotent() {
        use Status::*;

        let statuses = [Success, Failure, Waiting];
        let first = aggregate_job_status(&statuses);
        let second = aggregate_job_status(&statuses);
        assert_eq!(first, second);
    }
}
