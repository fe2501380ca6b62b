//! Analysis status machine
//!
//! Every status change goes through [`validate_transition`]. The table
//! below is the whole machine; anything it does not list is illegal.
//!
//! User-requested states (`stop`, `restart`, `cancelled`, `manual`) can be
//! entered from any non-terminal state. `cancelled` and `manual` are never
//! left by the monitor, only by an explicit status change.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StateMachineError;

/// Lifecycle status of an analysis, project analysis or post-process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    /// Waiting for dependencies
    Wait,
    /// Eligible for build and submit
    Ready,
    /// Job submitted and live
    Running,
    /// Primary job done, results present
    Finished,
    /// Post-processing job live
    Processing,
    /// Results archived
    Uploaded,
    /// Needs attention
    Stuck,
    /// Stop requested
    Stop,
    /// Stopped; terminal
    Stopped,
    /// Restart requested
    Restart,
    /// Withdrawn by a user
    Cancelled,
    /// Under manual control
    Manual,
}

impl AnalysisStatus {
    /// Every status, in lifecycle order
    pub const ALL: [Self; 12] = [
        Self::Wait,
        Self::Ready,
        Self::Running,
        Self::Finished,
        Self::Processing,
        Self::Uploaded,
        Self::Stuck,
        Self::Stop,
        Self::Stopped,
        Self::Restart,
        Self::Cancelled,
        Self::Manual,
    ];

    /// Lowercase name as stored in the ledger
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Wait => "wait",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Processing => "processing",
            Self::Uploaded => "uploaded",
            Self::Stuck => "stuck",
            Self::Stop => "stop",
            Self::Stopped => "stopped",
            Self::Restart => "restart",
            Self::Cancelled => "cancelled",
            Self::Manual => "manual",
        }
    }

    /// Visited by the monitor
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::Ready
                | Self::Running
                | Self::Stuck
                | Self::Finished
                | Self::Processing
                | Self::Stop
                | Self::Restart
        )
    }

    /// Satisfies a dependency
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Finished | Self::Uploaded)
    }

    /// No automatic transition leaves this state
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Stopped | Self::Uploaded | Self::Cancelled | Self::Manual
        )
    }

    /// May be requested by a user
    #[must_use]
    pub const fn is_user_requestable(self) -> bool {
        matches!(
            self,
            Self::Ready | Self::Stop | Self::Restart | Self::Cancelled | Self::Manual
        )
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisStatus {
    type Err = StateMachineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == wanted)
            .ok_or_else(|| StateMachineError::UnknownStatus(s.to_string()))
    }
}

/// Validates a status transition.
///
/// Re-entering the current status is always allowed and is a no-op.
///
/// # Errors
/// [`StateMachineError::IllegalTransition`] when `to` is not reachable from `from`
pub fn validate_transition(
    from: AnalysisStatus,
    to: AnalysisStatus,
) -> Result<(), StateMachineError> {
    if from == to || allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(StateMachineError::IllegalTransition { from, to })
    }
}

/// Statuses reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: AnalysisStatus) -> Vec<AnalysisStatus> {
    use AnalysisStatus::*;
    match from {
        Wait => vec![Ready, Stop, Restart, Cancelled, Manual],
        Ready => vec![Wait, Running, Stuck, Stop, Restart, Cancelled, Manual],
        Running => vec![Finished, Stuck, Stop, Restart, Cancelled, Manual],
        Stuck => vec![Ready, Running, Finished, Stop, Restart, Cancelled, Manual],
        Finished => vec![Processing, Uploaded, Stuck, Stop, Restart, Cancelled, Manual],
        Processing => vec![Uploaded, Stuck, Stop, Restart, Cancelled, Manual],
        Stop => vec![Stopped, Stuck, Cancelled, Manual],
        Restart => vec![Running, Stuck, Stop, Cancelled, Manual],
        Stopped => vec![Ready, Restart, Cancelled, Manual],
        Uploaded => vec![Restart, Cancelled, Manual],
        Cancelled => vec![Ready, Restart, Manual],
        Manual => vec![Ready, Restart, Cancelled, Finished, Uploaded],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!("Running".parse::<AnalysisStatus>(), Ok(AnalysisStatus::Running));
        assert_eq!(" stuck ".parse::<AnalysisStatus>(), Ok(AnalysisStatus::Stuck));
        assert!(matches!(
            "exploded".parse::<AnalysisStatus>(),
            Err(StateMachineError::UnknownStatus(_))
        ));
    }

    #[test]
    fn test_serde_lowercase() {
        let yaml = serde_yaml::to_string(&AnalysisStatus::Processing).unwrap();
        assert_eq!(yaml.trim(), "processing");
        let back: AnalysisStatus = serde_yaml::from_str("uploaded").unwrap();
        assert_eq!(back, AnalysisStatus::Uploaded);
    }

    #[test]
    fn test_user_states_reachable_from_non_terminal() {
        for from in AnalysisStatus::ALL.into_iter().filter(|s| !s.is_terminal()) {
            for to in [
                AnalysisStatus::Stop,
                AnalysisStatus::Cancelled,
                AnalysisStatus::Manual,
            ] {
                assert!(validate_transition(from, to).is_ok(), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_monitor_never_leaves_manual_or_cancelled_automatically() {
        for from in [AnalysisStatus::Manual, AnalysisStatus::Cancelled] {
            assert!(validate_transition(from, AnalysisStatus::Running).is_err());
            assert!(validate_transition(from, AnalysisStatus::Stuck).is_err());
            assert!(validate_transition(from, AnalysisStatus::Processing).is_err());
        }
    }
}
