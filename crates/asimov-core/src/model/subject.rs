//! Subjects: units of study owning an ordered set of analyses

use std::path::PathBuf;

use asimov_merge::{Mapping, Value};
use indexmap::IndexMap;

use super::analysis::Analysis;
use super::postprocess::ProcessState;
use super::{key, mapping_field, remainder, required_string, string_field};
use crate::error::DescriptionError;

const STRUCTURAL: &[&str] = &[
    "name",
    "kind",
    "repository",
    "working directory",
    "inputs",
    "interferometers",
    "productions",
    "postprocesses",
];

/// A unit of study and its analyses
#[derive(Debug, Clone, PartialEq)]
pub struct Subject {
    pub name: String,
    pub repository: Option<String>,
    pub working_directory: Option<PathBuf>,
    /// Required inputs, e.g. channel to frame type
    pub inputs: Mapping,
    pub meta: Mapping,
    /// Analyses in ledger order
    pub analyses: IndexMap<String, Analysis>,
    pub postprocesses: IndexMap<String, ProcessState>,
}

impl Subject {
    /// Subject with no inputs or analyses
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            repository: None,
            working_directory: None,
            inputs: Mapping::new(),
            meta: Mapping::new(),
            analyses: IndexMap::new(),
            postprocesses: IndexMap::new(),
        }
    }

    /// Read a subject node
    ///
    /// `productions` may be a mapping of name to node or the older list of
    /// single-key mappings.
    ///
    /// # Errors
    /// [`DescriptionError`] on a missing name, a malformed production or a
    /// duplicated analysis name
    pub fn from_node(node: &Mapping) -> Result<Self, DescriptionError> {
        let name = required_string(node, "name", "subject")?;
        let context = format!("subject {name}");
        let inputs = if node.contains_key(key("inputs")) {
            mapping_field(node, "inputs", &context)?
        } else {
            mapping_field(node, "interferometers", &context)?
        };
        let mut subject = Self {
            repository: string_field(node, "repository", &context)?,
            working_directory: string_field(node, "working directory", &context)?
                .map(PathBuf::from),
            inputs,
            meta: remainder(node, STRUCTURAL),
            analyses: IndexMap::new(),
            postprocesses: IndexMap::new(),
            name,
        };

        let productions = production_nodes(node.get(key("productions")), &context)?;
        for (analysis_name, production) in productions {
            let analysis = Analysis::from_node(&analysis_name, production)?;
            subject.add_analysis(analysis)?;
        }

        for (pp_name, state) in mapping_field(node, "postprocesses", &context)? {
            let (Some(pp_name), Value::Mapping(state)) = (pp_name.as_str(), &state) else {
                return Err(DescriptionError::invalid(
                    &context,
                    "postprocesses",
                    "must map names to mappings",
                ));
            };
            subject
                .postprocesses
                .insert(pp_name.to_string(), ProcessState::from_node(pp_name, state)?);
        }
        Ok(subject)
    }

    /// Ledger node for this subject
    pub fn to_node(&self) -> Mapping {
        let mut node = Mapping::new();
        node.insert(key("name"), Value::String(self.name.clone()));
        if let Some(repository) = &self.repository {
            node.insert(key("repository"), Value::String(repository.clone()));
        }
        if let Some(dir) = &self.working_directory {
            node.insert(
                key("working directory"),
                Value::String(dir.to_string_lossy().into_owned()),
            );
        }
        if !self.inputs.is_empty() {
            node.insert(key("inputs"), Value::Mapping(self.inputs.clone()));
        }
        for (k, v) in &self.meta {
            node.insert(k.clone(), v.clone());
        }
        let productions: Mapping = self
            .analyses
            .values()
            .map(|a| (key(&a.name), Value::Mapping(a.to_node())))
            .collect();
        node.insert(key("productions"), Value::Mapping(productions));
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

    /// Add a new analysis
    ///
    /// # Errors
    /// [`DescriptionError::DuplicateAnalysis`] if the name is taken
    pub fn add_analysis(&mut self, analysis: Analysis) -> Result<(), DescriptionError> {
        if self.analyses.contains_key(&analysis.name) {
            return Err(DescriptionError::DuplicateAnalysis {
                subject: self.name.clone(),
                analysis: analysis.name,
            });
        }
        self.analyses.insert(analysis.name.clone(), analysis);
        Ok(())
    }

    /// Analysis by name
    pub fn analysis(&self, name: &str) -> Option<&Analysis> {
        self.analyses.get(name)
    }

    /// Analysis by name, for in-place edits
    pub fn analysis_mut(&mut self, name: &str) -> Option<&mut Analysis> {
        self.analyses.get_mut(name)
    }
}

/// Production nodes in either stored form, in order
pub(crate) fn production_nodes<'a>(
    value: Option<&'a Value>,
    context: &str,
) -> Result<Vec<(String, &'a Mapping)>, DescriptionError> {
    let invalid = || {
        DescriptionError::invalid(
            context,
            "productions",
            "must map analysis names to mappings",
        )
    };
    let mut nodes = Vec::new();
    match value {
        None | Some(Value::Null) => {}
        Some(Value::Mapping(map)) => {
            for (name, node) in map {
                match (name.as_str(), node) {
                    (Some(name), Value::Mapping(node)) => nodes.push((name.to_string(), node)),
                    _ => return Err(invalid()),
                }
            }
        }
        Some(Value::Sequence(items)) => {
            for item in items {
                let Value::Mapping(entry) = item else {
                    return Err(invalid());
                };
                if let Some(name) = string_field(entry, "name", context)? {
                    if entry.contains_key(key("pipeline")) {
                        nodes.push((name, entry));
                        continue;
                    }
                }
                if entry.len() != 1 {
                    return Err(invalid());
                }
                for (name, node) in entry {
                    match (name.as_str(), node) {
                        (Some(name), Value::Mapping(node)) => nodes.push((name.to_string(), node)),
                        _ => return Err(invalid()),
                    }
                }
            }
        }
        Some(_) => return Err(invalid()),
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use asimov_kernel::state_machine::AnalysisStatus;
    use pretty_assertions::assert_eq;

    fn mapping(text: &str) -> Mapping {
        serde_yaml::from_str(text).unwrap()
    }

    #[test]
    fn test_list_form_productions() {
        let node = mapping(
            r"
name: S0
interferometers: {H1: strain}
priors: {q: [0, 1]}
productions:
  - Prod0: {pipeline: bayeswave, status: finished}
  - Prod1: {pipeline: bilby, needs: [Prod0]}
",
        );
        let subject = Subject::from_node(&node).unwrap();
        assert_eq!(subject.analyses.len(), 2);
        assert_eq!(subject.analyses[0].status, AnalysisStatus::Finished);
        assert_eq!(subject.analyses[1].name, "Prod1");
        assert!(subject.inputs.contains_key(key("H1")));
        assert!(subject.meta.contains_key(key("priors")));
    }

    #[test]
    fn test_mapping_form_round_trip() {
        let node = mapping(
            r"
name: S0
working directory: /data/S0
inputs: {L1: frames}
data: {segment length: 4}
productions:
  A0: {pipeline: bayeswave, status: ready}
postprocesses:
  summary: {status: running, scheduler: {job id: 99}}
",
        );
        let subject = Subject::from_node(&node).unwrap();
        let again = Subject::from_node(&subject.to_node()).unwrap();
        assert_eq!(again, subject);
        assert_eq!(again.postprocesses["summary"].status, AnalysisStatus::Running);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let node =
            mapping("name: S0\nproductions:\n  - A0: {pipeline: x}\n  - A0: {pipeline: y}\n");
        assert!(matches!(
            Subject::from_node(&node),
            Err(DescriptionError::DuplicateAnalysis { .. })
        ));
    }

    #[test]
    fn test_name_required() {
        assert!(matches!(
            Subject::from_node(&mapping("productions: {}")),
            Err(DescriptionError::MissingField { .. })
        ));
    }
}
