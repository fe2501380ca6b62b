//! A single computation attached to a subject

use asimov_kernel::scheduler::ClusterId;
use asimov_kernel::state_machine::AnalysisStatus;
use asimov_merge::{set_path_mapping, Mapping, Value};

use super::review::Review;
use super::selector::Selector;
use super::{
    job_id_in, key, mapping_field, migrate_legacy_job_id, remainder, required_string,
    selector_list, sequence_value, status_field, string_field,
};
use crate::error::DescriptionError;

const STRUCTURAL: &[&str] = &[
    "name", "pipeline", "status", "comment", "needs", "review", "kind", "event", "subject",
];

/// Analysis as stored under a subject
///
/// `meta` holds the analysis's own metadata, not the resolved view.
#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    pub name: String,
    pub pipeline: String,
    pub status: AnalysisStatus,
    pub comment: Option<String>,
    pub needs: Vec<Selector>,
    pub review: Review,
    pub meta: Mapping,
}

impl Analysis {
    /// New `ready` analysis with no metadata
    pub fn new(name: impl Into<String>, pipeline: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pipeline: pipeline.into(),
            status: AnalysisStatus::Ready,
            comment: None,
            needs: Vec::new(),
            review: Review::new(),
            meta: Mapping::new(),
        }
    }

    /// Set an explicit status
    #[inline]
    #[must_use]
    pub fn with_status(mut self, status: AnalysisStatus) -> Self {
        self.status = status;
        self
    }

    /// Set the dependency selectors
    #[inline]
    #[must_use]
    pub fn with_needs(mut self, needs: Vec<Selector>) -> Self {
        self.needs = needs;
        self
    }

    /// Attach a free-form comment
    #[inline]
    #[must_use]
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Set a dotted metadata path
    #[inline]
    #[must_use]
    pub fn with_meta(mut self, path: &str, value: Value) -> Self {
        set_path_mapping(&mut self.meta, path, value);
        self
    }

    /// Read an analysis node stored under `name`
    ///
    /// # Errors
    /// [`DescriptionError`] when `pipeline` is missing or a field is malformed
    pub fn from_node(name: &str, node: &Mapping) -> Result<Self, DescriptionError> {
        let context = format!("analysis {name}");
        let pipeline = required_string(node, "pipeline", &context)?;
        let status = status_field(node, &context)?.unwrap_or(AnalysisStatus::Ready);
        let comment = string_field(node, "comment", &context)?;
        let needs = selector_list(node, "needs", &context)?;
        // Older ledgers keep a bare `review: {status}` mapping; it is derived, so drop it
        let review_node = node.get(key("review")).filter(|v| !v.is_mapping());
        let review = Review::from_value(review_node, &context)?;
        let mut meta = remainder(node, STRUCTURAL);
        migrate_legacy_job_id(&mut meta);
        for section in ["scheduler", "priors", "sampler", "likelihood", "quality", "data"] {
            if meta.contains_key(key(section)) {
                mapping_field(&meta, section, &context)?;
            }
        }
        Ok(Self {
            name: name.to_string(),
            pipeline,
            status,
            comment,
            needs,
            review,
            meta,
        })
    }

    /// Read a standalone document carrying its own `name`
    ///
    /// # Errors
    /// [`DescriptionError`] when `name` or `pipeline` is missing
    pub fn from_document(doc: &Mapping) -> Result<Self, DescriptionError> {
        let name = required_string(doc, "name", "analysis")?;
        Self::from_node(&name, doc)
    }

    /// Node stored under the analysis name
    pub fn to_node(&self) -> Mapping {
        let mut node = Mapping::new();
        node.insert(key("pipeline"), Value::String(self.pipeline.clone()));
        node.insert(key("status"), Value::String(self.status.as_str().to_string()));
        if let Some(comment) = &self.comment {
            node.insert(key("comment"), Value::String(comment.clone()));
        }
        if !self.needs.is_empty() {
            let needs: Vec<String> = self.needs.iter().map(ToString::to_string).collect();
            node.insert(key("needs"), sequence_value(&needs));
        }
        if !self.review.is_empty() {
            node.insert(key("review"), self.review.to_value());
        }
        for (k, v) in &self.meta {
            node.insert(k.clone(), v.clone());
        }
        node
    }

    /// Recorded scheduler cluster id
    pub fn job_id(&self) -> Option<ClusterId> {
        job_id_in(&self.meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn mapping(text: &str) -> Mapping {
        serde_yaml::from_str(text).unwrap()
    }

    #[test]
    fn test_from_node() {
        let node = mapping(
            "pipeline: bilby\nstatus: wait\nneeds: [A0, 'pipeline:bayeswave']\n\
             comment: second run\npriors: {q: [0, 1]}\n",
        );
        let analysis = Analysis::from_node("A1", &node).unwrap();
        assert_eq!(analysis.pipeline, "bilby");
        assert_eq!(analysis.status, AnalysisStatus::Wait);
        assert_eq!(analysis.needs.len(), 2);
        assert_eq!(analysis.comment.as_deref(), Some("second run"));
        assert!(analysis.meta.contains_key(key("priors")));
        assert!(!analysis.meta.contains_key(key("needs")));
    }

    #[test]
    fn test_missing_pipeline() {
        let err = Analysis::from_node("A0", &mapping("status: ready")).unwrap_err();
        assert!(matches!(
            err,
            DescriptionError::MissingField { ref field, .. } if field == "pipeline"
        ));
    }

    #[test]
    fn test_unknown_status() {
        let err = Analysis::from_node("A0", &mapping("pipeline: x\nstatus: sleeping")).unwrap_err();
        assert!(matches!(err, DescriptionError::Status(_)));
    }

    #[test]
    fn test_node_round_trip() {
        let analysis = Analysis::new("A0", "bayeswave")
            .with_status(AnalysisStatus::Running)
            .with_needs(vec![Selector::name("Prod0")])
            .with_comment("calibration check")
            .with_meta("scheduler.job id", Value::Number(42.into()));
        let parsed = Analysis::from_node("A0", &analysis.to_node()).unwrap();
        assert_eq!(parsed, analysis);
        assert_eq!(parsed.job_id(), Some(ClusterId(42)));
    }

    #[test]
    fn test_legacy_job_id_read() {
        let analysis = Analysis::from_node("A0", &mapping("pipeline: x\njob id: 12")).unwrap();
        assert_eq!(analysis.job_id(), Some(ClusterId(12)));
        assert!(!analysis.to_node().contains_key(key("job id")));
    }

    #[test]
    fn test_from_document_requires_name() {
        assert!(Analysis::from_document(&mapping("pipeline: x")).is_err());
        let analysis =
            Analysis::from_document(&mapping("name: A0\npipeline: x\nevent: S0")).unwrap();
        assert_eq!(analysis.name, "A0");
        assert!(analysis.meta.is_empty());
    }
}
