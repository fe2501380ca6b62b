//! Asimov Core
//!
//! The project model and the supervisor that drives it:
//! - Parses description documents into subjects, analyses, project
//!   analyses and post-processing definitions
//! - Keeps them in a single-file ledger with inherited defaults
//! - Materialises productions and hands them to pipeline plugins
//! - Reconciles productions with the batch scheduler, pass by pass
//!
//! # Example
//!
//! ```rust,ignore
//! use asimov_core::prelude::*;
//!
//! # async fn example() -> Result<(), AsimovError> {
//! let workspace = Workspace::open(std::path::Path::new("."))?;
//! let scheduler = Arc::new(CondorScheduler::new(workspace.state_dir()));
//! let supervisor = Supervisor::new(workspace, scheduler, PipelineRegistry::new());
//!
//! supervisor.apply_text(&std::fs::read_to_string("events.yaml")?, None)?;
//! let report = supervisor.chain(false).await?;
//! println!("{report}");
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod apply;
pub mod error;
pub mod hooks;
pub mod ledger;
pub mod model;
pub mod pipeline;
pub mod render;
pub mod resolve;
pub mod supervisor;
pub mod workspace;

// Re-exports for convenience
pub use apply::{ApplyDocument, ApplyOutcome, ConfigurationDocument};
pub use error::{
    AsimovError, DescriptionError, HookError, LedgerError, PersistenceError, PipelineError,
};
pub use hooks::{HookRegistry, PostMonitorHook, SummaryHook};
pub use ledger::{AnalysisView, Ledger, LedgerDocument};
pub use model::{
    Analysis, InputAnalysis, Owner, PostProcessDefinition, ProcessState, Production, ProductionId,
    ProjectAnalysis, Review, ReviewMessage, ReviewStatus, Selectable, Selector, Subject,
};
pub use pipeline::{archive_assets, Pipeline, PipelineContext, PipelineRegistry, Progress};
pub use render::render_configuration;
pub use supervisor::{
    Failure, MonitorReport, PassReport, PlannedAction, StatusLine, Supervisor, Transition,
};
pub use workspace::Workspace;

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with Asimov Core
    pub use crate::{
        Analysis, ApplyDocument, AsimovError, Ledger, PassReport, Pipeline, PipelineContext,
        PipelineError, PipelineRegistry, Production, ProductionId, Subject, Supervisor, Workspace,
    };
    pub use asimov_kernel::prelude::*;
    pub use std::sync::Arc;
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
