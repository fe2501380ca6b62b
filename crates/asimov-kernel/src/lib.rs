//! Asimov Kernel
//!
//! The pieces of the supervisor that know nothing about subjects or
//! pipelines:
//!
//! - [`state_machine`]: the closed analysis status set and its transition table
//! - [`dag`]: per-subject dependency graphs and the "latest" frontier
//! - [`scheduler`]: the batch scheduler adapter trait, the HTCondor adapter
//!   and the job-table cache
//! - [`executor`]: time-bounded subprocess execution
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use asimov_kernel::prelude::*;
//!
//! let mut graph = DependencyGraph::new();
//! graph.add_dependency("A1", "A0")?;
//! let frontier = graph.latest(|name| name == "A0");
//! assert_eq!(frontier, vec!["A1".to_string()]);
//! ```

pub mod dag;
pub mod error;
pub mod executor;
pub mod scheduler;
pub mod state_machine;

pub use error::*;

/// Common imports
pub mod prelude {
    pub use crate::dag::DependencyGraph;
    pub use crate::error::{ExecError, GraphError, SchedulerError, StateMachineError};
    pub use crate::scheduler::{
        CachedScheduler, ClusterId, CondorScheduler, JobDescription, JobInfo, JobStatus,
        JobTable, Scheduler,
    };
    pub use crate::state_machine::{allowed_transitions, validate_transition, AnalysisStatus};
}
