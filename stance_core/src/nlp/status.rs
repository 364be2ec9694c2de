// stance_core/src/nlp/status.rs

use std::fmt;
use std::time::Duration;

/// Engine return status. The numeric codes follow IPOPT's `ApplicationReturnStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SolverStatus {
    SolveSucceeded = 0,
    SolvedToAcceptableLevel = 1,
    MaximumIterationsExceeded = -1,
    SearchDirectionTooSmall = -2,
    MaximumCpuTimeExceeded = -4,
    InvalidNumberDetected = -13,
}

impl SolverStatus {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Whether the returned point can be used as an identification result.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            SolverStatus::SolveSucceeded | SolverStatus::SolvedToAcceptableLevel
        )
    }

    pub fn message(self) -> &'static str {
        match self {
            SolverStatus::SolveSucceeded => "Algorithm terminated successfully at a locally optimal point, satisfying the convergence tolerances.",
            SolverStatus::SolvedToAcceptableLevel => "Algorithm stopped at a point that was converged, not to \"desired\" tolerances, but to \"acceptable\" tolerances.",
            SolverStatus::MaximumIterationsExceeded => "Maximum number of iterations exceeded.",
            SolverStatus::SearchDirectionTooSmall => "Search direction is becoming too small.",
            SolverStatus::MaximumCpuTimeExceeded => "Maximum CPU time exceeded.",
            SolverStatus::InvalidNumberDetected => "Invalid number in NLP function or derivative detected.",
        }
    }
}

impl fmt::Display for SolverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}

/// What a solve reports alongside the solution vector.
#[derive(Debug, Clone, PartialEq)]
pub struct SolveInfo {
    pub status: SolverStatus,
    pub message: String,
    pub elapsed: Duration,
    pub iterations: usize,
    /// Objective value at the returned point.
    pub objective: f64,
    /// Infinity norm of the constraints at the returned point.
    pub constraint_violation: f64,
    /// Decision-vector indices that sit on one of their bounds.
    pub active_bounds: Vec<usize>,
}

impl SolveInfo {
    pub fn status_code(&self) -> i32 {
        self.status.code()
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}
