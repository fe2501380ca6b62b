//! Error types for Asimov Core
//!
//! One enum per concern, folded into [`AsimovError`]:
//! - [`DescriptionError`]: a description document or ledger node is invalid
//! - [`PipelineError`]: a plugin operation failed for one production
//! - [`PersistenceError`]: the ledger could not be written
//! - [`LedgerError`]: the ledger could not be read

use std::io;
use std::path::PathBuf;

use asimov_artifact::StoreError;
use asimov_config::{ConfigError, DocumentError, TemplateError};
use asimov_kernel::scheduler::ClusterId;
use asimov_kernel::{ExecError, GraphError, SchedulerError, StateMachineError};

/// Main Asimov error type
#[derive(Debug, thiserror::Error)]
pub enum AsimovError {
    /// Invalid description or ledger content
    #[error("description error: {0}")]
    Description(#[from] DescriptionError),

    /// Plugin failure
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Scheduler failure outside a plugin
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Results store failure
    #[error("results store error: {0}")]
    Store(#[from] StoreError),

    /// Ledger write failure
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Ledger read failure
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Process configuration failure
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Dependency graph failure
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    /// Illegal status change
    #[error("status error: {0}")]
    State(#[from] StateMachineError),

    /// The directory holds no project
    #[error("{0} is not an asimov project (no asimov.conf)")]
    NotAProject(PathBuf),

    /// No such analysis or project analysis
    #[error("no production {0}")]
    UnknownProduction(String),

    /// `start` while a monitor job is recorded
    #[error("a monitor cron job is already recorded as cluster {0}")]
    CronAlreadyRunning(ClusterId),

    /// Filesystem failure
    #[error("io error on {path}: {source}")]
    Io {
        /// Path being accessed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },
}

impl AsimovError {
    /// Create an I/O error for a path
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Errors that abort a whole build, submit or monitor pass
    #[inline]
    #[must_use]
    pub fn is_fatal_for_pass(&self) -> bool {
        matches!(
            self,
            Self::Persistence(_) | Self::Scheduler(_) | Self::Config(_) | Self::Ledger(_)
        )
    }

    /// Errors caused by what the user asked for rather than the environment
    #[inline]
    #[must_use]
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::Description(_) | Self::UnknownProduction(_) | Self::State(_) | Self::Graph(_)
        )
    }
}

/// Invalid description documents and ledger nodes
#[derive(Debug, thiserror::Error)]
pub enum DescriptionError {
    /// Required field absent
    #[error("{context}: missing required field '{field}'")]
    MissingField {
        /// Where the field was expected
        context: String,
        /// Field name
        field: String,
    },

    /// Field present with the wrong shape
    #[error("{context}: field '{field}' {problem}")]
    InvalidField {
        /// Where the field was found
        context: String,
        /// Field name
        field: String,
        /// What is wrong with it
        problem: String,
    },

    /// `kind:` not recognised
    #[error("unknown document kind '{0}'")]
    UnknownKind(String),

    /// Selector syntax error
    #[error("invalid selector '{0}'")]
    InvalidSelector(String),

    /// Status outside the closed set
    #[error(transparent)]
    Status(#[from] StateMachineError),

    /// Review status outside the closed set
    #[error("unknown review status '{0}'")]
    UnknownReviewStatus(String),

    /// Subject referenced but not in the ledger
    #[error("subject '{0}' is not in the ledger")]
    UnknownSubject(String),

    /// Analysis name reused within a subject
    #[error("analysis '{analysis}' already exists for subject '{subject}'")]
    DuplicateAnalysis {
        /// Subject name
        subject: String,
        /// Analysis name
        analysis: String,
    },

    /// `needs` would close a cycle
    #[error("dependencies of {subject}/{analysis} are cyclic: {source}")]
    DependencyCycle {
        /// Subject name
        subject: String,
        /// Analysis name
        analysis: String,
        /// Graph diagnostic
        #[source]
        source: GraphError,
    },

    /// Document stream could not be read
    #[error(transparent)]
    Document(#[from] DocumentError),
}

impl DescriptionError {
    /// Create a missing-field error
    pub fn missing(context: impl Into<String>, field: impl Into<String>) -> Self {
        Self::MissingField {
            context: context.into(),
            field: field.into(),
        }
    }

    /// Create an invalid-field error
    pub fn invalid(
        context: impl Into<String>,
        field: impl Into<String>,
        problem: impl Into<String>,
    ) -> Self {
        Self::InvalidField {
            context: context.into(),
            field: field.into(),
            problem: problem.into(),
        }
    }
}

/// Plugin operation failures, captured per production
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// No plugin registered for the tag
    #[error("no pipeline registered for '{0}'")]
    UnknownPipeline(String),

    /// Job graph could not be built
    #[error("build failed: {0}")]
    BuildFailed(String),

    /// Job graph could not be submitted
    #[error("submit failed: {0}")]
    SubmitFailed(String),

    /// Post-processing could not be started or finished
    #[error("post-processing failed: {0}")]
    PostprocessFailed(String),

    /// Results could not be archived
    #[error("archiving results failed: {0}")]
    ArchiveFailed(#[source] StoreError),

    /// Resubmission budget used up
    #[error("resurrection budget exhausted after {count} attempts (cap {cap})")]
    ResurrectionExhausted {
        /// Attempts made
        count: u32,
        /// Allowed attempts
        cap: u32,
    },

    /// Plugin operation overran its deadline
    #[error("pipeline operation timed out after {seconds}s")]
    Timeout {
        /// Deadline in seconds
        seconds: u64,
    },

    /// Scheduler call made by the plugin failed
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// Helper command failed
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// Configuration template failed
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// Illegal status change
    #[error(transparent)]
    State(#[from] StateMachineError),

    /// Filesystem failure
    #[error("io error on {path}: {source}")]
    Io {
        /// Path being accessed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },
}

impl PipelineError {
    /// Create an I/O error for a path
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Ledger write failures
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Write or rename failed
    #[error("failed to write {path}: {source}")]
    Write {
        /// Ledger path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Document could not be encoded
    #[error("failed to serialize ledger: {0}")]
    Serialize(String),
}

/// Ledger read failures
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// No ledger file
    #[error("no ledger at {0}")]
    NotFound(PathBuf),

    /// `init` over an existing ledger
    #[error("a ledger already exists at {0}")]
    AlreadyExists(PathBuf),

    /// Read failed
    #[error("io error reading {path}: {source}")]
    Read {
        /// Ledger path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Content is not a valid ledger
    #[error("malformed ledger {path}: {message}")]
    Malformed {
        /// Ledger path
        path: PathBuf,
        /// What is wrong
        message: String,
    },
}

/// Post-monitor hook failures
#[derive(Debug, thiserror::Error)]
#[error("hook '{tag}' failed: {message}")]
pub struct HookError {
    /// Hook tag
    pub tag: String,
    /// What went wrong
    pub message: String,
}
