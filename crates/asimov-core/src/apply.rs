//! Declarative description documents and their application to the ledger
//!
//! Each document carries a `kind` from a closed set and is parsed into an
//! [`ApplyDocument`] before anything is touched. Applying is idempotent on
//! `(kind, name)` and never discards runtime bookkeeping (status, job id,
//! resurrection count, profiling, review history) already in the ledger.

use std::collections::HashSet;
use std::fmt;

use asimov_config::parse_documents;
use asimov_kernel::state_machine::AnalysisStatus;
use asimov_merge::{get_path_mapping, merge_mapping, set_path_mapping, Mapping, Value};
use indexmap::IndexMap;

use crate::error::DescriptionError;
use crate::ledger::LedgerDocument;
use crate::model::production::BOOKKEEPING_PATHS;
use crate::model::subject::production_nodes;
use crate::model::{
    key, string_field, Analysis, PostProcessDefinition, ProjectAnalysis, Subject,
};
use crate::resolve::INHERITED_SECTIONS;

/// Project-wide settings carried by a `configuration` document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigurationDocument {
    pub pipelines: IndexMap<String, Mapping>,
    pub defaults: Mapping,
    pub hooks: Mapping,
    pub postprocessing: Vec<PostProcessDefinition>,
    pub extra: Mapping,
}

/// A parsed description document
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyDocument {
    /// `kind: event`
    Subject {
        subject: Subject,
        /// Analyses whose status was given explicitly
        explicit_status: HashSet<String>,
    },
    /// `kind: analysis`
    Analysis {
        subject: Option<String>,
        analysis: Analysis,
        explicit_status: bool,
    },
    /// `kind: configuration`
    Configuration(ConfigurationDocument),
    /// `kind: postprocessing`
    PostProcessing(PostProcessDefinition),
    /// `kind: projectanalysis`
    ProjectAnalysis {
        analysis: ProjectAnalysis,
        explicit_status: bool,
    },
}

impl ApplyDocument {
    /// Discriminate and parse one document
    ///
    /// # Errors
    /// [`DescriptionError`] for a missing or unknown kind or any invalid field
    pub fn from_mapping(doc: &Mapping) -> Result<Self, DescriptionError> {
        let kind = string_field(doc, "kind", "document")?
            .ok_or_else(|| DescriptionError::missing("document", "kind"))?;
        let normalised: String = kind
            .chars()
            .filter(|c| !matches!(c, ' ' | '_' | '-'))
            .collect::<String>()
            .to_ascii_lowercase();
        match normalised.as_str() {
            "event" | "subject" => {
                let subject = Subject::from_node(doc)?;
                require_subject_fields(doc, &subject.name)?;
                let explicit_status = production_nodes(doc.get(key("productions")), "subject")?
                    .into_iter()
                    .filter(|(_, node)| node.contains_key(key("status")))
                    .map(|(name, _)| name)
                    .collect();
                Ok(Self::Subject {
                    subject,
                    explicit_status,
                })
            }
            "analysis" | "production" => {
                let analysis = Analysis::from_document(doc)?;
                let context = format!("analysis {}", analysis.name);
                let subject = match string_field(doc, "event", &context)? {
                    Some(subject) => Some(subject),
                    None => string_field(doc, "subject", &context)?,
                };
                Ok(Self::Analysis {
                    subject,
                    explicit_status: doc.contains_key(key("status")),
                    analysis,
                })
            }
            "configuration" => Ok(Self::Configuration(configuration(doc)?)),
            "postprocessing" => Ok(Self::PostProcessing(
                PostProcessDefinition::from_document(doc)?,
            )),
            "projectanalysis" => Ok(Self::ProjectAnalysis {
                analysis: ProjectAnalysis::from_document(doc)?,
                explicit_status: doc.contains_key(key("status")),
            }),
            _ => Err(DescriptionError::UnknownKind(kind)),
        }
    }

    /// Parse a multi-document YAML stream
    ///
    /// # Errors
    /// [`DescriptionError`] for the first invalid document
    pub fn parse_all(text: &str) -> Result<Vec<Self>, DescriptionError> {
        parse_documents(text)?
            .iter()
            .map(Self::from_mapping)
            .collect()
    }
}

/// A described subject states where it runs and what it reads
///
/// Inherited sections (`priors`, `data`, ...) may come from project
/// defaults and are not required here.
fn require_subject_fields(doc: &Mapping, name: &str) -> Result<(), DescriptionError> {
    let context = format!("subject {name}");
    if !doc.contains_key(key("working directory")) {
        return Err(DescriptionError::missing(context, "working directory"));
    }
    if !doc.contains_key(key("inputs")) && !doc.contains_key(key("interferometers")) {
        return Err(DescriptionError::missing(context, "inputs"));
    }
    Ok(())
}

fn configuration(doc: &Mapping) -> Result<ConfigurationDocument, DescriptionError> {
    let context = "configuration";
    let mut config = ConfigurationDocument::default();
    for (k, v) in doc {
        let Some(name) = k.as_str() else {
            config.extra.insert(k.clone(), v.clone());
            continue;
        };
        match (name, v) {
            ("kind", _) => {}
            ("pipelines", Value::Mapping(pipelines)) => {
                for (tag, defaults) in pipelines {
                    let (Some(tag), Value::Mapping(defaults)) = (tag.as_str(), defaults) else {
                        return Err(DescriptionError::invalid(
                            context,
                            "pipelines",
                            "must map pipeline tags to mappings",
                        ));
                    };
                    config.pipelines.insert(tag.to_string(), defaults.clone());
                }
            }
            ("hooks", Value::Mapping(hooks)) => config.hooks = hooks.clone(),
            ("postprocessing", Value::Mapping(definitions)) => {
                for (pp_name, node) in definitions {
                    let (Some(pp_name), Value::Mapping(node)) = (pp_name.as_str(), node) else {
                        return Err(DescriptionError::invalid(
                            context,
                            "postprocessing",
                            "must map names to mappings",
                        ));
                    };
                    config
                        .postprocessing
                        .push(PostProcessDefinition::from_node(pp_name, node)?);
                }
            }
            ("pipelines" | "hooks" | "postprocessing", _) => {
                return Err(DescriptionError::invalid(context, name, "must be a mapping"));
            }
            (section, _) if INHERITED_SECTIONS.contains(&section) => {
                config.defaults.insert(k.clone(), v.clone());
            }
            _ => {
                config.extra.insert(k.clone(), v.clone());
            }
        }
    }
    Ok(config)
}

/// What applying one document changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Subject {
        name: String,
        created: bool,
    },
    Analysis {
        subject: String,
        name: String,
        status: AnalysisStatus,
        created: bool,
    },
    Configuration,
    PostProcessing {
        name: String,
        created: bool,
    },
    ProjectAnalysis {
        name: String,
        status: AnalysisStatus,
        created: bool,
    },
}

fn verb(created: bool) -> &'static str {
    if created {
        "added"
    } else {
        "updated"
    }
}

impl fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subject { name, created } => write!(f, "Subject {name} {}", verb(*created)),
            Self::Analysis {
                subject,
                name,
                status,
                created,
            } => write!(f, "Analysis {subject}/{name} {} ({status})", verb(*created)),
            Self::Configuration => f.write_str("Project configuration updated"),
            Self::PostProcessing { name, created } => {
                write!(f, "Post-processing {name} {}", verb(*created))
            }
            Self::ProjectAnalysis {
                name,
                status,
                created,
            } => write!(f, "Project analysis {name} {} ({status})", verb(*created)),
        }
    }
}

/// Carry runtime state from the stored analysis into its replacement
fn preserve_runtime(stored: &Analysis, mut incoming: Analysis, explicit_status: bool) -> Analysis {
    if !explicit_status {
        incoming.status = stored.status;
    }
    carry_bookkeeping(&stored.meta, &mut incoming.meta);
    let mut review = stored.review.clone();
    review.absorb(&incoming.review);
    incoming.review = review;
    incoming
}

fn carry_bookkeeping(stored: &Mapping, incoming: &mut Mapping) {
    for path in BOOKKEEPING_PATHS {
        if get_path_mapping(incoming, path).is_none() {
            if let Some(value) = get_path_mapping(stored, path) {
                set_path_mapping(incoming, path, value.clone());
            }
        }
    }
}

impl LedgerDocument {
    /// Apply one parsed document
    ///
    /// `subject` overrides the subject named inside analysis documents.
    ///
    /// # Errors
    /// [`DescriptionError`]; the document may be partly modified, so callers
    /// apply through [`crate::ledger::Ledger::update`]
    pub fn apply(
        &mut self,
        document: ApplyDocument,
        subject: Option<&str>,
    ) -> Result<Vec<ApplyOutcome>, DescriptionError> {
        match document {
            ApplyDocument::Subject {
                subject,
                explicit_status,
            } => self.apply_subject(subject, &explicit_status),
            ApplyDocument::Analysis {
                subject: named,
                analysis,
                explicit_status,
            } => {
                let subject_name = subject
                    .map(str::to_string)
                    .or(named)
                    .ok_or_else(|| {
                        DescriptionError::missing(format!("analysis {}", analysis.name), "event")
                    })?;
                self.apply_analysis(&subject_name, analysis, explicit_status)
                    .map(|outcome| vec![outcome])
            }
            ApplyDocument::Configuration(config) => {
                self.apply_configuration(config);
                Ok(vec![ApplyOutcome::Configuration])
            }
            ApplyDocument::PostProcessing(definition) => {
                let name = definition.name.clone();
                let created = self.postprocessing.insert(name.clone(), definition).is_none();
                tracing::info!("Post-processing {} {}", name, verb(created));
                Ok(vec![ApplyOutcome::PostProcessing { name, created }])
            }
            ApplyDocument::ProjectAnalysis {
                analysis,
                explicit_status,
            } => Ok(vec![self.apply_project_analysis(analysis, explicit_status)]),
        }
    }

    fn apply_subject(
        &mut self,
        mut incoming: Subject,
        explicit_status: &HashSet<String>,
    ) -> Result<Vec<ApplyOutcome>, DescriptionError> {
        let name = incoming.name.clone();
        let mut added = Vec::new();
        let created = match self.subjects.get(&name) {
            Some(stored) => {
                let mut analyses = stored.analyses.clone();
                for (analysis_name, analysis) in std::mem::take(&mut incoming.analyses) {
                    match analyses.get(&analysis_name) {
                        Some(old) => {
                            let explicit = explicit_status.contains(&analysis_name);
                            let merged = preserve_runtime(old, analysis, explicit);
                            analyses.insert(analysis_name, merged);
                        }
                        None => {
                            added.push(analysis_name.clone());
                            analyses.insert(analysis_name, analysis);
                        }
                    }
                }
                incoming.analyses = analyses;
                incoming.postprocesses = stored.postprocesses.clone();
                false
            }
            None => {
                added.extend(incoming.analyses.keys().cloned());
                true
            }
        };
        self.subjects.insert(name.clone(), incoming);
        tracing::info!("Subject {} {}", name, verb(created));

        let mut outcomes = vec![ApplyOutcome::Subject {
            name: name.clone(),
            created,
        }];
        for analysis_name in &added {
            if !explicit_status.contains(analysis_name) {
                self.settle_status(&name, analysis_name);
            }
        }
        self.dependency_graph(&name)?;
        if let Some(subject) = self.subjects.get(&name) {
            outcomes.extend(added.iter().filter_map(|n| subject.analysis(n)).map(|a| {
                ApplyOutcome::Analysis {
                    subject: name.clone(),
                    name: a.name.clone(),
                    status: a.status,
                    created: true,
                }
            }));
        }
        Ok(outcomes)
    }

    fn apply_analysis(
        &mut self,
        subject_name: &str,
        incoming: Analysis,
        explicit_status: bool,
    ) -> Result<ApplyOutcome, DescriptionError> {
        let subject = self
            .subjects
            .get_mut(subject_name)
            .ok_or_else(|| DescriptionError::UnknownSubject(subject_name.to_string()))?;
        let name = incoming.name.clone();
        let created = match subject.analyses.get(&name) {
            Some(stored) => {
                let merged = preserve_runtime(stored, incoming, explicit_status);
                subject.analyses.insert(name.clone(), merged);
                false
            }
            None => {
                subject.analyses.insert(name.clone(), incoming);
                true
            }
        };
        if created && !explicit_status {
            self.settle_status(subject_name, &name);
        }
        self.dependency_graph(subject_name)?;

        let status = self
            .subject(subject_name)
            .and_then(|s| s.analysis(&name))
            .map_or(AnalysisStatus::Ready, |a| a.status);
        tracing::info!(
            "Analysis {}/{} {} with status {}",
            subject_name,
            name,
            verb(created),
            status
        );
        Ok(ApplyOutcome::Analysis {
            subject: subject_name.to_string(),
            name,
            status,
            created,
        })
    }

    /// Set a freshly added analysis to `wait` or `ready` from its dependencies
    fn settle_status(&mut self, subject_name: &str, analysis_name: &str) {
        let Some(subject) = self.subjects.get(subject_name) else {
            return;
        };
        let Some(analysis) = subject.analysis(analysis_name) else {
            return;
        };
        let status = self.initial_status(subject, analysis);
        if let Some(analysis) = self
            .subjects
            .get_mut(subject_name)
            .and_then(|s| s.analysis_mut(analysis_name))
        {
            analysis.status = status;
        }
    }

    fn apply_configuration(&mut self, config: ConfigurationDocument) {
        for (tag, defaults) in config.pipelines {
            let merged = match self.pipelines.get(&tag) {
                Some(stored) => merge_mapping(stored, &defaults),
                None => defaults,
            };
            self.pipelines.insert(tag, merged);
        }
        self.defaults = merge_mapping(&self.defaults, &config.defaults);
        self.hooks = merge_mapping(&self.hooks, &config.hooks);
        self.extra = merge_mapping(&self.extra, &config.extra);
        for definition in config.postprocessing {
            self.postprocessing.insert(definition.name.clone(), definition);
        }
        tracing::info!("Project configuration updated");
    }

    fn apply_project_analysis(
        &mut self,
        mut incoming: ProjectAnalysis,
        explicit_status: bool,
    ) -> ApplyOutcome {
        for subject in &incoming.subjects {
            if !self.subjects.contains_key(subject) {
                tracing::warn!(
                    "Project analysis {} names subject {} which is not in the ledger",
                    incoming.name,
                    subject
                );
            }
        }
        let name = incoming.name.clone();
        let created = match self.project_analyses.get(&name) {
            Some(stored) => {
                if !explicit_status {
                    incoming.status = stored.status;
                }
                carry_bookkeeping(&stored.meta, &mut incoming.meta);
                let mut review = stored.review.clone();
                review.absorb(&incoming.review);
                incoming.review = review;
                incoming.postprocesses = stored.postprocesses.clone();
                false
            }
            None => true,
        };
        let status = incoming.status;
        self.project_analyses.insert(name.clone(), incoming);
        tracing::info!("Project analysis {} {} with status {}", name, verb(created), status);
        ApplyOutcome::ProjectAnalysis {
            name,
            status,
            created,
        }
    }
}
