//! Kernel error types

use std::path::PathBuf;

use crate::state_machine::AnalysisStatus;

/// Dependency graph errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// A node may not depend on itself
    #[error("{0} cannot depend on itself")]
    SelfLoop(String),

    /// The edge would close a cycle
    #[error("dependency {from} -> {to} would create a cycle")]
    CycleDetected {
        /// Dependent node
        from: String,
        /// Dependency node
        to: String,
    },

    /// Unknown node
    #[error("no node named {0}")]
    NodeNotFound(String),
}

/// Status machine errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateMachineError {
    /// Transition not in the table
    #[error("illegal status transition {from} -> {to}")]
    IllegalTransition {
        /// Current status
        from: AnalysisStatus,
        /// Requested status
        to: AnalysisStatus,
    },

    /// Status name outside the closed set
    #[error("unknown status '{0}'")]
    UnknownStatus(String),
}

/// Subprocess errors
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The program could not be started
    #[error("failed to run {program}: {source}")]
    Spawn {
        /// Program name
        program: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The program ran past its deadline and was killed
    #[error("{program} timed out after {seconds}s")]
    Timeout {
        /// Program name
        program: String,
        /// Deadline in seconds
        seconds: u64,
    },

    /// The program exited unsuccessfully
    #[error("{program} exited with status {code:?}: {stderr}")]
    Failed {
        /// Program name
        program: String,
        /// Exit code, if the process was not killed by a signal
        code: Option<i32>,
        /// Captured standard error
        stderr: String,
    },
}

/// Scheduler adapter errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// A scheduler command failed
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// Scheduler output could not be understood
    #[error("unexpected scheduler output: {0}")]
    Parse(String),

    /// The scheduler cannot be reached or refused the request
    #[error("scheduler unavailable: {0}")]
    Unavailable(String),

    /// Submit file could not be written
    #[error("io error on {path}: {source}")]
    Io {
        /// Path being written
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

impl SchedulerError {
    /// True for deadline overruns
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Exec(ExecError::Timeout { .. }))
    }
}
