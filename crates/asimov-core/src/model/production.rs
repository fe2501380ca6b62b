//! The unit the supervisor drives through the state machine
//!
//! A [`Production`] is materialised from the ledger at the start of a pass:
//! an analysis, a project analysis or a post-processing instance together
//! with its resolved metadata, run directory and input analyses. Plugins see
//! only productions; the supervisor writes status and bookkeeping back to the
//! owning ledger node after every mutation.

use std::fmt;
use std::path::PathBuf;

use asimov_kernel::scheduler::ClusterId;
use asimov_kernel::state_machine::{validate_transition, AnalysisStatus};
use asimov_kernel::StateMachineError;
use asimov_merge::{get_path_mapping, scalar_string, set_path_mapping, Mapping, Value};

use super::postprocess::Owner;
use super::review::ReviewStatus;
use super::selector::Selectable;
use super::{clear_job_id_in, job_id_in, key, set_job_id_in};

/// Metadata paths written back to the ledger after a transition
pub const BOOKKEEPING_PATHS: [&str; 4] = [
    "scheduler.job id",
    "resurrections",
    "profiling",
    "postprocessing",
];

/// Identity of a production within the project
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProductionId {
    /// `<subject>/<name>`
    Analysis { subject: String, name: String },
    /// `project/<name>`
    Project { name: String },
    /// Post-processing instance attached to a subject or project analysis
    PostProcess { owner: Owner, name: String },
}

impl ProductionId {
    /// Id of an analysis of `subject`
    pub fn analysis(subject: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Analysis {
            subject: subject.into(),
            name: name.into(),
        }
    }

    /// Subject owning the production, if any
    pub fn subject(&self) -> Option<&str> {
        match self {
            Self::Analysis { subject, .. }
            | Self::PostProcess {
                owner: Owner::Subject(subject),
                ..
            } => Some(subject),
            _ => None,
        }
    }

    /// Analysis or project analysis name
    pub fn name(&self) -> &str {
        match self {
            Self::Analysis { name, .. }
            | Self::Project { name }
            | Self::PostProcess { name, .. } => name,
        }
    }

    /// Path segments below the per-project roots (run, log, checkout)
    pub fn segments(&self) -> Vec<&str> {
        match self {
            Self::Analysis { subject, name } => vec![subject.as_str(), name.as_str()],
            Self::Project { name } => vec!["project", name.as_str()],
            Self::PostProcess {
                owner: Owner::Subject(subject),
                name,
            } => vec![subject.as_str(), "postprocessing", name.as_str()],
            Self::PostProcess {
                owner: Owner::Project(project),
                name,
            } => vec!["project", project.as_str(), "postprocessing", name.as_str()],
        }
    }
}

impl fmt::Display for ProductionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments().join("/"))
    }
}

/// An analysis feeding a project analysis or post-processing instance
#[derive(Debug, Clone, PartialEq)]
pub struct InputAnalysis {
    pub subject: String,
    pub name: String,
    pub pipeline: String,
    pub status: AnalysisStatus,
    pub rundir: PathBuf,
    /// Resolved metadata
    pub meta: Mapping,
}

/// One analysis as the supervisor drives it, with resolved metadata
#[derive(Debug, Clone, PartialEq)]
pub struct Production {
    pub id: ProductionId,
    pub pipeline: String,
    pub status: AnalysisStatus,
    pub comment: Option<String>,
    pub review: Option<ReviewStatus>,
    /// Resolved metadata
    pub meta: Mapping,
    pub rundir: PathBuf,
    /// Rendered configuration; set by the supervisor before `build_dag`
    pub config_file: PathBuf,
    /// Dependencies, or the selected inputs of project-level productions
    pub inputs: Vec<InputAnalysis>,
}

impl Production {
    /// Production in `ready` with empty metadata
    pub fn new(id: ProductionId, pipeline: impl Into<String>, rundir: impl Into<PathBuf>) -> Self {
        Self {
            id,
            pipeline: pipeline.into(),
            status: AnalysisStatus::Ready,
            comment: None,
            review: None,
            meta: Mapping::new(),
            rundir: rundir.into(),
            config_file: PathBuf::new(),
            inputs: Vec::new(),
        }
    }

    /// Cluster id at `scheduler.job id`
    pub fn job_id(&self) -> Option<ClusterId> {
        job_id_in(&self.meta)
    }

    /// Record the current scheduler job
    pub fn set_job_id(&mut self, id: ClusterId) {
        set_job_id_in(&mut self.meta, id);
    }

    /// Forget the scheduler job
    pub fn clear_job_id(&mut self) {
        clear_job_id_in(&mut self.meta);
    }

    /// Resubmissions since the last explicit restart
    pub fn resurrections(&self) -> u32 {
        self.meta
            .get(key("resurrections"))
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0)
    }

    /// Overwrite the resurrection counter
    pub fn set_resurrections(&mut self, count: u32) {
        self.meta
            .insert(key("resurrections"), Value::Number(count.into()));
    }

    /// Scheduler accounting for the primary job
    pub fn set_profiling(&mut self, profiling: Mapping) {
        self.meta.insert(key("profiling"), Value::Mapping(profiling));
    }

    /// Value of `postprocessing.status`
    pub fn postprocessing_status(&self) -> Option<String> {
        get_path_mapping(&self.meta, "postprocessing.status").and_then(scalar_string)
    }

    /// Set `postprocessing.status`
    pub fn set_postprocessing_status(&mut self, status: &str) {
        set_path_mapping(
            &mut self.meta,
            "postprocessing.status",
            Value::String(status.to_string()),
        );
    }

    /// Scalar at a dotted metadata path
    pub fn meta_str(&self, path: &str) -> Option<String> {
        get_path_mapping(&self.meta, path).and_then(scalar_string)
    }

    /// Change status through the transition table
    ///
    /// # Errors
    /// [`StateMachineError::IllegalTransition`] when the table forbids it
    pub fn transition(&mut self, to: AnalysisStatus) -> Result<(), StateMachineError> {
        validate_transition(self.status, to)?;
        self.status = to;
        Ok(())
    }

    /// Change status without consulting the table; failure handling only
    pub fn force_status(&mut self, to: AnalysisStatus) {
        self.status = to;
    }

    /// `(subject, analysis)` key in the results store
    pub fn store_location(&self) -> (String, String) {
        match &self.id {
            ProductionId::Analysis { subject, name } => (subject.clone(), name.clone()),
            ProductionId::Project { name } => ("project".to_string(), name.clone()),
            ProductionId::PostProcess {
                owner: Owner::Subject(subject),
                name,
            } => (subject.clone(), format!("postprocessing-{name}")),
            ProductionId::PostProcess {
                owner: Owner::Project(project),
                name,
            } => ("project".to_string(), format!("{project}-{name}")),
        }
    }
}

impl Selectable for Production {
    fn attribute(&self, key: &str) -> Option<String> {
        match key {
            "name" => Some(self.id.name().to_string()),
            "subject" | "event" => self.id.subject().map(str::to_string),
            "pipeline" => Some(self.pipeline.clone()),
            "status" => Some(self.status.as_str().to_string()),
            "comment" => self.comment.clone(),
            "review" | "review.status" => self.review.map(|r| r.as_str().to_string()),
            path => self.meta_str(path),
        }
    }
}
