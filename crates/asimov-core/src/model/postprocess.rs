//! Post-processing definitions and per-instance state

use asimov_kernel::state_machine::AnalysisStatus;
use asimov_merge::{Mapping, Value};

use super::selector::Selector;
use super::{
    key, remainder, required_string, selector_list, sequence_value, status_field, string_field,
};
use crate::error::DescriptionError;

const DEFINITION_KEYS: &[&str] = &["name", "kind", "pipeline", "analyses", "project analysis"];

/// `postprocessing.<name>` in the ledger
#[derive(Debug, Clone, PartialEq)]
pub struct PostProcessDefinition {
    pub name: String,
    pub pipeline: String,
    /// Inputs within each subject; ignored when `project_analysis` is set
    pub analyses: Vec<Selector>,
    /// Attach a single instance to this project analysis
    pub project_analysis: Option<String>,
    pub meta: Mapping,
}

impl PostProcessDefinition {
    /// Definition with no selectors
    pub fn new(name: impl Into<String>, pipeline: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pipeline: pipeline.into(),
            analyses: Vec::new(),
            project_analysis: None,
            meta: Mapping::new(),
        }
    }

    /// # Errors
    /// [`DescriptionError`] when `pipeline` is missing or a selector is invalid
    pub fn from_node(name: &str, node: &Mapping) -> Result<Self, DescriptionError> {
        let context = format!("postprocessing {name}");
        Ok(Self {
            name: name.to_string(),
            pipeline: required_string(node, "pipeline", &context)?,
            analyses: selector_list(node, "analyses", &context)?,
            project_analysis: string_field(node, "project analysis", &context)?,
            meta: remainder(node, DEFINITION_KEYS),
        })
    }

    /// # Errors
    /// As [`PostProcessDefinition::from_node`], plus a missing `name`
    pub fn from_document(doc: &Mapping) -> Result<Self, DescriptionError> {
        let name = required_string(doc, "name", "postprocessing")?;
        Self::from_node(&name, doc)
    }

    /// Ledger node for this definition
    pub fn to_node(&self) -> Mapping {
        let mut node = Mapping::new();
        node.insert(key("pipeline"), Value::String(self.pipeline.clone()));
        if !self.analyses.is_empty() {
            let analyses: Vec<String> = self.analyses.iter().map(ToString::to_string).collect();
            node.insert(key("analyses"), sequence_value(&analyses));
        }
        if let Some(project) = &self.project_analysis {
            node.insert(key("project analysis"), Value::String(project.clone()));
        }
        for (k, v) in &self.meta {
            node.insert(k.clone(), v.clone());
        }
        node
    }
}

/// Runtime state of one post-processing instance
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessState {
    pub status: AnalysisStatus,
    /// Bookkeeping such as `scheduler.job id`
    pub meta: Mapping,
}

impl Default for ProcessState {
    fn default() -> Self {
        Self {
            status: AnalysisStatus::Wait,
            meta: Mapping::new(),
        }
    }
}

impl ProcessState {
    pub(crate) fn from_node(name: &str, node: &Mapping) -> Result<Self, DescriptionError> {
        let context = format!("postprocess state {name}");
        Ok(Self {
            status: status_field(node, &context)?.unwrap_or(AnalysisStatus::Wait),
            meta: remainder(node, &["status"]),
        })
    }

    pub(crate) fn to_node(&self) -> Mapping {
        let mut node = Mapping::new();
        node.insert(key("status"), Value::String(self.status.as_str().to_string()));
        for (k, v) in &self.meta {
            node.insert(k.clone(), v.clone());
        }
        node
    }
}

/// Who a post-processing instance hangs off
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Owner {
    Subject(String),
    Project(String),
}
