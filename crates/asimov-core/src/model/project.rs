//! Analyses whose inputs are analyses of other subjects

use asimov_kernel::scheduler::ClusterId;
use asimov_kernel::state_machine::AnalysisStatus;
use asimov_merge::{Mapping, Value};
use indexmap::IndexMap;

use super::postprocess::ProcessState;
use super::review::Review;
use super::selector::Selector;
use super::{
    job_id_in, key, mapping_field, migrate_legacy_job_id, remainder, required_string,
    selector_list, sequence_value, status_field, string_field, string_list,
};
use crate::error::DescriptionError;

const STRUCTURAL: &[&str] = &[
    "name",
    "kind",
    "pipeline",
    "status",
    "comment",
    "subjects",
    "events",
    "analyses",
    "review",
    "postprocesses",
];

/// A project-wide analysis
///
/// Subjects and their analyses are referenced by name and resolved afresh
/// on every pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectAnalysis {
    pub name: String,
    pub pipeline: String,
    pub status: AnalysisStatus,
    pub comment: Option<String>,
    /// Subjects to draw inputs from; empty means every subject
    pub subjects: Vec<String>,
    /// Conjunctive selectors over each subject's analyses
    pub analyses: Vec<Selector>,
    pub review: Review,
    pub meta: Mapping,
    pub postprocesses: IndexMap<String, ProcessState>,
}

impl ProjectAnalysis {
    /// Project analysis over no subjects
    pub fn new(name: impl Into<String>, pipeline: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pipeline: pipeline.into(),
            status: AnalysisStatus::Wait,
            comment: None,
            subjects: Vec::new(),
            analyses: Vec::new(),
            review: Review::new(),
            meta: Mapping::new(),
            postprocesses: IndexMap::new(),
        }
    }

    /// Set the subjects searched for inputs
    #[inline]
    #[must_use]
    pub fn with_subjects<I, S>(mut self, subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subjects = subjects.into_iter().map(Into::into).collect();
        self
    }

    /// Set the input selectors
    #[inline]
    #[must_use]
    pub fn with_selectors(mut self, selectors: Vec<Selector>) -> Self {
        self.analyses = selectors;
        self
    }

    /// # Errors
    /// [`DescriptionError`] on a missing name or pipeline, or a malformed field
    pub fn from_document(doc: &Mapping) -> Result<Self, DescriptionError> {
        let name = required_string(doc, "name", "project analysis")?;
        let context = format!("project analysis {name}");
        let subjects = if doc.contains_key(key("subjects")) {
            string_list(doc, "subjects", &context)?
        } else {
            string_list(doc, "events", &context)?
        };
        let review_node = doc.get(key("review")).filter(|v| !v.is_mapping());
        let mut meta = remainder(doc, STRUCTURAL);
        migrate_legacy_job_id(&mut meta);
        let mut analysis = Self {
            pipeline: required_string(doc, "pipeline", &context)?,
            status: status_field(doc, &context)?.unwrap_or(AnalysisStatus::Wait),
            comment: string_field(doc, "comment", &context)?,
            subjects,
            analyses: selector_list(doc, "analyses", &context)?,
            review: Review::from_value(review_node, &context)?,
            meta,
            postprocesses: IndexMap::new(),
            name,
        };
        for (pp_name, state) in mapping_field(doc, "postprocesses", &context)? {
            let (Some(pp_name), Value::Mapping(state)) = (pp_name.as_str(), &state) else {
                return Err(DescriptionError::invalid(
                    &context,
                    "postprocesses",
                    "must map names to mappings",
                ));
            };
            analysis
                .postprocesses
                .insert(pp_name.to_string(), ProcessState::from_node(pp_name, state)?);
        }
        Ok(analysis)
    }

    /// Ledger node for this project analysis
    pub fn to_document(&self) -> Mapping {
        let mut node = Mapping::new();
        node.insert(key("name"), Value::String(self.name.clone()));
        node.insert(key("pipeline"), Value::String(self.pipeline.clone()));
        node.insert(key("status"), Value::String(self.status.as_str().to_string()));
        if let Some(comment) = &self.comment {
            node.insert(key("comment"), Value::String(comment.clone()));
        }
        node.insert(key("subjects"), sequence_value(&self.subjects));
        let selectors: Vec<String> = self.analyses.iter().map(ToString::to_string).collect();
        node.insert(key("analyses"), sequence_value(&selectors));
        if !self.review.is_empty() {
            node.insert(key("review"), self.review.to_value());
        }
        for (k, v) in &self.meta {
            node.insert(k.clone(), v.clone());
        }
        if !self.postprocesses.is_empty() {
            let states: Mapping = self
                .postprocesses
                .iter()
                .map(|(name, state)| (key(name), Value::Mapping(state.to_node())))
                .collect();
            node.insert(key("postprocesses"), Value::Mapping(states));
        }
        node
    }

    /// Cluster id at `scheduler.job id`
    pub fn job_id(&self) -> Option<ClusterId> {
        job_id_in(&self.meta)
    }
}
