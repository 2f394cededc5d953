//! Job records and their lifecycle.

use serde::{Deserialize, Serialize};

/// Lifecycle state of one experiment row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Candidate,
    Submitted,
    Running,
    Complete,
    Broken,
}

impl JobStatus {
    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Running -> Candidate is the reset applied when the owning process is
    /// found dead; Submitted -> Candidate covers a dispatch that never started.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Candidate, Submitted)
                | (Submitted, Running)
                | (Running, Complete)
                | (Candidate | Submitted | Running, Broken)
                | (Submitted | Running, Candidate)
        )
    }

    /// Submitted or running: in flight, outcome unknown.
    pub fn is_pending(self) -> bool {
        matches!(self, JobStatus::Submitted | JobStatus::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Candidate => "candidate",
            Self::Submitted => "submitted",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Broken => "broken",
        };
        f.write_str(s)
    }
}

/// A single row of the experiment table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: usize,
    /// Genotype in [0,1]^D.
    pub point: Vec<f64>,
    pub status: JobStatus,
    /// Objective value; set only on the Complete transition. May be NaN or
    /// infinite to signal a constraint violation.
    pub value: Option<f64>,
    /// Wall-clock seconds; set only on the Complete transition.
    pub duration: Option<f64>,
    /// Opaque identifier assigned by the dispatcher.
    pub handle: Option<String>,
}

impl JobRecord {
    pub fn candidate(id: usize, point: Vec<f64>) -> Self {
        Self {
            id,
            point,
            status: JobStatus::Candidate,
            value: None,
            duration: None,
            handle: None,
        }
    }

    /// True when the row completed with a value that signals a constraint
    /// violation: non-finite, or equal to the configured sentinel.
    pub fn violates_constraint(&self, sentinel: Option<f64>) -> bool {
        match self.value {
            Some(v) if self.status == JobStatus::Complete => is_violation(v, sentinel),
            _ => false,
        }
    }
}

/// Non-finite values and the sentinel mark infeasible observations.
pub fn is_violation(value: f64, sentinel: Option<f64>) -> bool {
    !value.is_finite() || sentinel.is_some_and(|s| value == s)
}
