//! The ledger: the single durable document holding all project state
//!
//! [`LedgerDocument`] is the parsed, in-memory form with every query the
//! supervisor needs. [`Ledger`] pairs it with its file and makes every
//! mutation transactional: the change is applied to a copy, the copy is
//! written (temp file then rename), and only then does it replace the
//! in-memory document.
//!
//! # Core Concepts
//!
//! - Subjects and project analyses keep ledger order
//! - Edges between analyses are derived from `needs` on demand, never stored
//! - On save, inherited values are stripped from subject and analysis nodes

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use asimov_artifact::write_atomic;
use asimov_kernel::dag::DependencyGraph;
use asimov_kernel::scheduler::ClusterId;
use asimov_kernel::state_machine::AnalysisStatus;
use asimov_merge::{
    get_path_mapping, merge_all, merge_mapping, remove_path, scalar_string, set_path_mapping,
    Mapping, Value,
};
use indexmap::IndexMap;

use crate::error::{AsimovError, DescriptionError, LedgerError, PersistenceError};
use crate::model::production::BOOKKEEPING_PATHS;
use crate::model::{
    key, Analysis, InputAnalysis, Owner, PostProcessDefinition, ProcessState, Production,
    ProductionId, ProjectAnalysis, Selectable, Selector, Subject,
};
use crate::resolve::{compress, resolve, set_review_status, INHERITED_SECTIONS};
use crate::workspace::Workspace;

const KNOWN_KEYS: &[&str] = &[
    "project",
    "pipelines",
    "events",
    "project_analyses",
    "project analyses",
    "postprocessing",
    "hooks",
    "cronjob",
];

/// An analysis together with its subject and resolved metadata
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisView {
    pub subject: String,
    pub analysis: Analysis,
    pub resolved: Mapping,
}

impl AnalysisView {
    /// `finished` or `uploaded`
    pub fn is_finished(&self) -> bool {
        self.analysis.status.is_finished()
    }
}

impl Selectable for AnalysisView {
    fn attribute(&self, key: &str) -> Option<String> {
        match key {
            "name" => Some(self.analysis.name.clone()),
            "subject" | "event" => Some(self.subject.clone()),
            "pipeline" => Some(self.analysis.pipeline.clone()),
            "status" => Some(self.analysis.status.as_str().to_string()),
            "comment" => self.analysis.comment.clone(),
            "review" | "review.status" => {
                self.analysis.review.status().map(|s| s.as_str().to_string())
            }
            path => get_path_mapping(&self.resolved, path).and_then(scalar_string),
        }
    }
}

/// Parsed ledger content
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerDocument {
    /// `project: {name, ...}`
    pub project: Mapping,
    /// Per-pipeline defaults, `pipelines.<tag>`
    pub pipelines: IndexMap<String, Mapping>,
    /// Project-level defaults: the top-level inherited sections
    pub defaults: Mapping,
    pub subjects: IndexMap<String, Subject>,
    pub project_analyses: IndexMap<String, ProjectAnalysis>,
    pub postprocessing: IndexMap<String, PostProcessDefinition>,
    pub hooks: Mapping,
    /// Cluster id of the periodic monitor job
    pub cronjob: Option<ClusterId>,
    /// Top-level keys the supervisor does not interpret
    pub extra: Mapping,
}

impl LedgerDocument {
    /// Empty ledger for a new project
    pub fn new(project_name: &str) -> Self {
        let mut project = Mapping::new();
        project.insert(key("name"), Value::String(project_name.to_string()));
        Self {
            project,
            ..Self::default()
        }
    }

    /// Parse a ledger document
    ///
    /// # Errors
    /// [`DescriptionError`] when any node is malformed
    pub fn from_value(value: &Value) -> Result<Self, DescriptionError> {
        let root = match value {
            Value::Null => return Ok(Self::default()),
            Value::Mapping(root) => root,
            _ => return Err(DescriptionError::invalid("ledger", "<root>", "must be a mapping")),
        };
        let mut doc = Self::default();

        for (k, v) in root {
            let Some(name) = k.as_str() else {
                doc.extra.insert(k.clone(), v.clone());
                continue;
            };
            if INHERITED_SECTIONS.contains(&name) {
                doc.defaults.insert(k.clone(), v.clone());
            } else if !KNOWN_KEYS.contains(&name) {
                doc.extra.insert(k.clone(), v.clone());
            }
        }

        doc.project = mapping_at(root, "project")?;
        doc.hooks = mapping_at(root, "hooks")?;
        doc.cronjob = match root.get(key("cronjob")) {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                v.as_u64()
                    .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
                    .map(ClusterId)
                    .ok_or_else(|| {
                        DescriptionError::invalid("ledger", "cronjob", "must be a cluster id")
                    })?,
            ),
        };

        for (tag, defaults) in mapping_at(root, "pipelines")? {
            match (tag.as_str(), defaults) {
                (Some(tag), Value::Mapping(defaults)) => {
                    doc.pipelines.insert(tag.to_string(), defaults);
                }
                (Some(tag), Value::Null) => {
                    doc.pipelines.insert(tag.to_string(), Mapping::new());
                }
                _ => {
                    return Err(DescriptionError::invalid(
                        "ledger",
                        "pipelines",
                        "must map pipeline tags to mappings",
                    ))
                }
            }
        }

        for node in sequence_at(root, "events")? {
            let subject = Subject::from_node(node)?;
            if doc.subjects.contains_key(&subject.name) {
                return Err(DescriptionError::invalid(
                    "ledger",
                    "events",
                    format!("subject '{}' appears twice", subject.name),
                ));
            }
            doc.subjects.insert(subject.name.clone(), subject);
        }

        let project_key = if root.contains_key(key("project_analyses")) {
            "project_analyses"
        } else {
            "project analyses"
        };
        for node in sequence_at(root, project_key)? {
            let analysis = ProjectAnalysis::from_document(node)?;
            doc.project_analyses.insert(analysis.name.clone(), analysis);
        }

        for (name, node) in mapping_at(root, "postprocessing")? {
            let (Some(name), Value::Mapping(node)) = (name.as_str(), &node) else {
                return Err(DescriptionError::invalid(
                    "ledger",
                    "postprocessing",
                    "must map names to mappings",
                ));
            };
            doc.postprocessing
                .insert(name.to_string(), PostProcessDefinition::from_node(name, node)?);
        }
        Ok(doc)
    }

    /// Document as stored, with inherited values stripped
    pub fn to_value(&self) -> Value {
        let mut root = Mapping::new();
        root.insert(key("project"), Value::Mapping(self.project.clone()));
        for (k, v) in &self.extra {
            root.insert(k.clone(), v.clone());
        }
        if !self.pipelines.is_empty() {
            let pipelines: Mapping = self
                .pipelines
                .iter()
                .map(|(tag, defaults)| (key(tag), Value::Mapping(defaults.clone())))
                .collect();
            root.insert(key("pipelines"), Value::Mapping(pipelines));
        }
        for (k, v) in &self.defaults {
            root.insert(k.clone(), v.clone());
        }
        if !self.postprocessing.is_empty() {
            let definitions: Mapping = self
                .postprocessing
                .values()
                .map(|d| (key(&d.name), Value::Mapping(d.to_node())))
                .collect();
            root.insert(key("postprocessing"), Value::Mapping(definitions));
        }
        if !self.hooks.is_empty() {
            root.insert(key("hooks"), Value::Mapping(self.hooks.clone()));
        }
        if let Some(id) = self.cronjob {
            root.insert(key("cronjob"), Value::Number(id.0.into()));
        }

        let events = self
            .subjects
            .values()
            .map(|subject| Value::Mapping(self.compressed_subject(subject)))
            .collect();
        root.insert(key("events"), Value::Sequence(events));

        if !self.project_analyses.is_empty() {
            let analyses = self
                .project_analyses
                .values()
                .map(|pa| {
                    let mut stored = pa.clone();
                    let inherited =
                        merge_mapping(self.pipeline_defaults(&pa.pipeline), &self.defaults);
                    stored.meta = compress(&inherited, &pa.meta);
                    Value::Mapping(stored.to_document())
                })
                .collect();
            root.insert(key("project_analyses"), Value::Sequence(analyses));
        }
        Value::Mapping(root)
    }

    fn compressed_subject(&self, subject: &Subject) -> Mapping {
        let mut stored = subject.clone();
        stored.meta = compress(&self.defaults, &subject.meta);
        for analysis in stored.analyses.values_mut() {
            let inherited = merge_all([
                self.pipeline_defaults(&analysis.pipeline),
                &self.defaults,
                &subject.meta,
            ]);
            analysis.meta = compress(&inherited, &analysis.meta);
        }
        stored.to_node()
    }

    /// Project name recorded by `init`
    pub fn project_name(&self) -> Option<&str> {
        self.project.get(key("name")).and_then(Value::as_str)
    }

    /// Stored subject, without project defaults
    pub fn subject(&self, name: &str) -> Option<&Subject> {
        self.subjects.get(name)
    }

    /// Stored subject for in-place edits
    pub fn subject_mut(&mut self, name: &str) -> Option<&mut Subject> {
        self.subjects.get_mut(name)
    }

    /// Stored project analysis
    pub fn project_analysis(&self, name: &str) -> Option<&ProjectAnalysis> {
        self.project_analyses.get(name)
    }

    /// `pipelines.<tag>`, empty when absent
    pub fn pipeline_defaults(&self, tag: &str) -> &Mapping {
        static EMPTY: std::sync::OnceLock<Mapping> = std::sync::OnceLock::new();
        self.pipelines
            .get(tag)
            .or_else(|| {
                self.pipelines
                    .iter()
                    .find(|(t, _)| t.eq_ignore_ascii_case(tag))
                    .map(|(_, m)| m)
            })
            .unwrap_or_else(|| EMPTY.get_or_init(Mapping::new))
    }

    /// Subject with project defaults merged into its metadata
    pub fn resolved_subject(&self, name: &str) -> Option<Subject> {
        let mut subject = self.subject(name)?.clone();
        subject.meta = merge_mapping(&self.defaults, &subject.meta);
        Some(subject)
    }

    /// Resolved metadata of one analysis
    pub fn resolve_analysis(&self, subject: &Subject, analysis: &Analysis) -> Mapping {
        let mut resolved = resolve(&[
            self.pipeline_defaults(&analysis.pipeline),
            &self.defaults,
            &subject.meta,
            &analysis.meta,
        ]);
        set_review_status(&mut resolved, analysis.review.status());
        resolved
    }

    /// Every analysis of a subject, in ledger order
    pub fn analysis_views(&self, subject: &Subject) -> Vec<AnalysisView> {
        subject
            .analyses
            .values()
            .map(|analysis| AnalysisView {
                subject: subject.name.clone(),
                analysis: analysis.clone(),
                resolved: self.resolve_analysis(subject, analysis),
            })
            .collect()
    }

    /// Analyses matching every filter, optionally within one subject
    ///
    /// # Errors
    /// [`DescriptionError::UnknownSubject`] for an unknown subject
    pub fn get_analyses(
        &self,
        subject: Option<&str>,
        filters: &[Selector],
    ) -> Result<Vec<AnalysisView>, DescriptionError> {
        let subjects: Vec<&Subject> = match subject {
            Some(name) => vec![self
                .subject(name)
                .ok_or_else(|| DescriptionError::UnknownSubject(name.to_string()))?],
            None => self.subjects.values().collect(),
        };
        Ok(subjects
            .into_iter()
            .flat_map(|s| self.analysis_views(s))
            .filter(|view| Selector::matches_all(filters, view))
            .collect())
    }

    /// Analyses of the same subject that `analysis` depends on
    pub fn dependencies<'v>(
        analysis: &Analysis,
        views: &'v [AnalysisView],
    ) -> Vec<&'v AnalysisView> {
        if analysis.needs.is_empty() {
            return Vec::new();
        }
        views
            .iter()
            .filter(|view| view.analysis.name != analysis.name)
            .filter(|view| analysis.needs.iter().any(|selector| selector.matches(*view)))
            .collect()
    }

    /// Dependency graph of one subject
    ///
    /// # Errors
    /// [`DescriptionError::UnknownSubject`], or
    /// [`DescriptionError::DependencyCycle`] when `needs` form a cycle
    pub fn dependency_graph(&self, subject: &str) -> Result<DependencyGraph, DescriptionError> {
        let owner = self
            .subject(subject)
            .ok_or_else(|| DescriptionError::UnknownSubject(subject.to_string()))?;
        let views = self.analysis_views(owner);
        let mut graph = DependencyGraph::new();
        for view in &views {
            graph.add_node(&view.analysis.name);
        }
        for view in &views {
            for dependency in Self::dependencies(&view.analysis, &views) {
                graph
                    .add_dependency(&view.analysis.name, &dependency.analysis.name)
                    .map_err(|source| DescriptionError::DependencyCycle {
                        subject: subject.to_string(),
                        analysis: view.analysis.name.clone(),
                        source,
                    })?;
            }
        }
        Ok(graph)
    }

    /// Unfinished analyses whose dependencies are all finished
    ///
    /// # Errors
    /// As [`LedgerDocument::dependency_graph`]
    pub fn get_all_latest(&self, subject: &str) -> Result<Vec<String>, DescriptionError> {
        let graph = self.dependency_graph(subject)?;
        let owner = self
            .subject(subject)
            .ok_or_else(|| DescriptionError::UnknownSubject(subject.to_string()))?;
        Ok(graph.latest(|name| {
            owner
                .analysis(name)
                .is_some_and(|a| a.status.is_finished())
        }))
    }

    /// `wait` if any dependency is unfinished, else `ready`
    pub fn initial_status(&self, subject: &Subject, analysis: &Analysis) -> AnalysisStatus {
        let views = self.analysis_views(subject);
        if Self::dependencies(analysis, &views)
            .iter()
            .all(|view| view.is_finished())
        {
            AnalysisStatus::Ready
        } else {
            AnalysisStatus::Wait
        }
    }

    /// Post-processing definitions that produce an instance for this subject
    pub fn postprocessing_for(&self, subject: &str) -> Vec<&PostProcessDefinition> {
        let Some(owner) = self.subject(subject) else {
            return Vec::new();
        };
        let views = self.analysis_views(owner);
        self.postprocessing
            .values()
            .filter(|d| d.project_analysis.is_none())
            .filter(|d| {
                owner.postprocesses.contains_key(&d.name)
                    || views.iter().any(|v| Selector::matches_all(&d.analyses, v))
            })
            .collect()
    }

    /// Resolved inputs of a project analysis
    pub fn project_inputs(&self, analysis: &ProjectAnalysis) -> Vec<AnalysisView> {
        let subjects: Vec<&Subject> = if analysis.subjects.is_empty() {
            self.subjects.values().collect()
        } else {
            analysis
                .subjects
                .iter()
                .filter_map(|name| {
                    let subject = self.subject(name);
                    if subject.is_none() {
                        tracing::warn!(
                            "Project analysis {} names unknown subject {}",
                            analysis.name,
                            name
                        );
                    }
                    subject
                })
                .collect()
        };
        subjects
            .into_iter()
            .flat_map(|s| self.analysis_views(s))
            .filter(|view| Selector::matches_all(&analysis.analyses, view))
            .collect()
    }

    /// Materialise every production, in ledger order
    ///
    /// Per subject: its analyses, then its post-processing instances. Then
    /// each project analysis followed by its post-processing instances.
    pub fn productions(&self, workspace: &Workspace) -> Vec<Production> {
        let mut out = Vec::new();
        for subject in self.subjects.values() {
            let views = self.analysis_views(subject);
            for view in &views {
                let id = ProductionId::analysis(&subject.name, &view.analysis.name);
                let rundir = rundir_for(&view.resolved, subject, &id, workspace);
                let mut production = Production::new(id, &view.analysis.pipeline, rundir);
                production.status = view.analysis.status;
                production.comment.clone_from(&view.analysis.comment);
                production.review = view.analysis.review.status();
                production.meta = view.resolved.clone();
                production.inputs = Self::dependencies(&view.analysis, &views)
                    .into_iter()
                    .map(|dep| input(dep, subject, workspace))
                    .collect();
                out.push(production);
            }
            let per_subject = self
                .postprocessing
                .values()
                .filter(|d| d.project_analysis.is_none());
            for definition in per_subject {
                let inputs: Vec<InputAnalysis> = views
                    .iter()
                    .filter(|v| Selector::matches_all(&definition.analyses, *v))
                    .map(|v| input(v, subject, workspace))
                    .collect();
                let state = subject.postprocesses.get(&definition.name);
                if inputs.is_empty() && state.is_none() {
                    continue;
                }
                out.push(self.postprocess_production(
                    Owner::Subject(subject.name.clone()),
                    definition,
                    state.cloned().unwrap_or_default(),
                    &subject.meta,
                    inputs,
                    workspace,
                ));
            }
        }

        for analysis in self.project_analyses.values() {
            let inputs: Vec<InputAnalysis> = self
                .project_inputs(analysis)
                .iter()
                .filter_map(|v| self.subject(&v.subject).map(|s| input(v, s, workspace)))
                .collect();
            let id = ProductionId::Project {
                name: analysis.name.clone(),
            };
            let mut meta = resolve(&[
                self.pipeline_defaults(&analysis.pipeline),
                &self.defaults,
                &analysis.meta,
            ]);
            set_review_status(&mut meta, analysis.review.status());
            let rundir = match get_path_mapping(&meta, "rundir").and_then(scalar_string) {
                Some(dir) => workspace.root().join(dir),
                None => workspace.rundir(&id),
            };
            let mut production = Production::new(id, &analysis.pipeline, rundir);
            production.status = analysis.status;
            production.comment.clone_from(&analysis.comment);
            production.review = analysis.review.status();
            production.meta = meta;
            production.inputs.clone_from(&inputs);
            out.push(production);

            for definition in self
                .postprocessing
                .values()
                .filter(|d| d.project_analysis.as_deref() == Some(analysis.name.as_str()))
            {
                let state = analysis
                    .postprocesses
                    .get(&definition.name)
                    .cloned()
                    .unwrap_or_default();
                out.push(self.postprocess_production(
                    Owner::Project(analysis.name.clone()),
                    definition,
                    state,
                    &analysis.meta,
                    inputs.clone(),
                    workspace,
                ));
            }
        }
        out
    }

    fn postprocess_production(
        &self,
        owner: Owner,
        definition: &PostProcessDefinition,
        state: ProcessState,
        owner_meta: &Mapping,
        inputs: Vec<InputAnalysis>,
        workspace: &Workspace,
    ) -> Production {
        let id = ProductionId::PostProcess {
            owner,
            name: definition.name.clone(),
        };
        let meta = resolve(&[
            self.pipeline_defaults(&definition.pipeline),
            &self.defaults,
            owner_meta,
            &definition.meta,
            &state.meta,
        ]);
        let rundir = workspace.rundir(&id);
        let mut production = Production::new(id, &definition.pipeline, rundir);
        production.status = state.status;
        production.meta = meta;
        production.inputs = inputs;
        production
    }

    /// The stored status and metadata of a production's owning node
    pub(crate) fn node_mut(
        &mut self,
        id: &ProductionId,
    ) -> Option<(&mut AnalysisStatus, &mut Mapping)> {
        match id {
            ProductionId::Analysis { subject, name } => {
                let analysis = self.subjects.get_mut(subject)?.analyses.get_mut(name)?;
                Some((&mut analysis.status, &mut analysis.meta))
            }
            ProductionId::Project { name } => {
                let analysis = self.project_analyses.get_mut(name)?;
                Some((&mut analysis.status, &mut analysis.meta))
            }
            ProductionId::PostProcess { owner, name } => {
                let states = match owner {
                    Owner::Subject(subject) => &mut self.subjects.get_mut(subject)?.postprocesses,
                    Owner::Project(project) => {
                        &mut self.project_analyses.get_mut(project)?.postprocesses
                    }
                };
                let state = states.entry(name.clone()).or_default();
                Some((&mut state.status, &mut state.meta))
            }
        }
    }

    /// Copy status and bookkeeping from a production to its ledger node
    ///
    /// # Errors
    /// [`AsimovError::UnknownProduction`] if the node no longer exists
    pub fn record(&mut self, production: &Production) -> Result<(), AsimovError> {
        let (status, meta) = self
            .node_mut(&production.id)
            .ok_or_else(|| AsimovError::UnknownProduction(production.id.to_string()))?;
        *status = production.status;
        for path in BOOKKEEPING_PATHS {
            match get_path_mapping(&production.meta, path) {
                Some(value) => set_path_mapping(meta, path, value.clone()),
                None => {
                    remove_path(meta, path);
                }
            }
        }
        if matches!(meta.get(key("scheduler")), Some(Value::Mapping(m)) if m.is_empty()) {
            meta.remove(key("scheduler"));
        }
        Ok(())
    }
}

fn rundir_for(
    resolved: &Mapping,
    subject: &Subject,
    id: &ProductionId,
    workspace: &Workspace,
) -> PathBuf {
    if let Some(dir) = get_path_mapping(resolved, "rundir").and_then(scalar_string) {
        return workspace.root().join(dir);
    }
    match &subject.working_directory {
        Some(base) => workspace.root().join(base).join(id.name()),
        None => workspace.rundir(id),
    }
}

fn input(view: &AnalysisView, subject: &Subject, workspace: &Workspace) -> InputAnalysis {
    let id = ProductionId::analysis(&view.subject, &view.analysis.name);
    InputAnalysis {
        subject: view.subject.clone(),
        name: view.analysis.name.clone(),
        pipeline: view.analysis.pipeline.clone(),
        status: view.analysis.status,
        rundir: rundir_for(&view.resolved, subject, &id, workspace),
        meta: view.resolved.clone(),
    }
}

fn mapping_at(root: &Mapping, field: &str) -> Result<Mapping, DescriptionError> {
    match root.get(key(field)) {
        None | Some(Value::Null) => Ok(Mapping::new()),
        Some(Value::Mapping(m)) => Ok(m.clone()),
        Some(_) => Err(DescriptionError::invalid("ledger", field, "must be a mapping")),
    }
}

fn sequence_at<'a>(root: &'a Mapping, field: &str) -> Result<Vec<&'a Mapping>, DescriptionError> {
    match root.get(key(field)) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Sequence(items)) => items
            .iter()
            .map(|item| match item {
                Value::Mapping(m) => Ok(m),
                _ => Err(DescriptionError::invalid("ledger", field, "entries must be mappings")),
            })
            .collect(),
        Some(_) => Err(DescriptionError::invalid("ledger", field, "must be a list")),
    }
}

/// A ledger document bound to its file
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
    doc: LedgerDocument,
}

impl Ledger {
    /// Write a new empty ledger
    ///
    /// # Errors
    /// [`LedgerError::AlreadyExists`] if the file exists, or a write failure
    pub fn create(path: &Path, project_name: &str) -> Result<Self, AsimovError> {
        if path.exists() {
            return Err(LedgerError::AlreadyExists(path.to_path_buf()).into());
        }
        let ledger = Self::from_document(path, LedgerDocument::new(project_name));
        ledger.save()?;
        Ok(ledger)
    }

    /// Read and parse a ledger file
    ///
    /// # Errors
    /// [`LedgerError::NotFound`], [`LedgerError::Read`] or [`LedgerError::Malformed`]
    pub fn load(path: &Path) -> Result<Self, LedgerError> {
        let text = fs::read_to_string(path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                LedgerError::NotFound(path.to_path_buf())
            } else {
                LedgerError::Read {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        let malformed = |message: String| LedgerError::Malformed {
            path: path.to_path_buf(),
            message,
        };
        let value: Value = serde_yaml::from_str(&text).map_err(|e| malformed(e.to_string()))?;
        let doc = LedgerDocument::from_value(&value).map_err(|e| malformed(e.to_string()))?;
        tracing::debug!(
            "Loaded ledger {} with {} subjects",
            path.display(),
            doc.subjects.len()
        );
        Ok(Self {
            path: path.to_path_buf(),
            doc,
        })
    }

    /// Wrap a document without touching the filesystem
    pub fn from_document(path: impl Into<PathBuf>, doc: LedgerDocument) -> Self {
        Self {
            path: path.into(),
            doc,
        }
    }

    /// File the ledger was loaded from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The parsed document
    pub fn document(&self) -> &LedgerDocument {
        &self.doc
    }

    /// Stored YAML text
    ///
    /// # Errors
    /// [`PersistenceError::Serialize`] if encoding fails
    pub fn to_yaml(&self) -> Result<String, PersistenceError> {
        serialize(&self.doc)
    }

    /// Write the whole document back
    ///
    /// # Errors
    /// [`PersistenceError`] on encoding or write failure
    pub fn save(&self) -> Result<(), PersistenceError> {
        write(&self.path, &self.doc)
    }

    /// Apply `change` to a copy, persist it, then adopt it
    ///
    /// Nothing in memory changes unless both the closure and the write succeed.
    ///
    /// # Errors
    /// The closure's error, or [`AsimovError::Persistence`]
    pub fn update<T, F>(&mut self, change: F) -> Result<T, AsimovError>
    where
        F: FnOnce(&mut LedgerDocument) -> Result<T, AsimovError>,
    {
        let mut next = self.doc.clone();
        let out = change(&mut next)?;
        write(&self.path, &next)?;
        self.doc = next;
        Ok(out)
    }

    /// Insert or replace a subject by name, keeping its position
    ///
    /// # Errors
    /// As [`Ledger::update`]
    pub fn add_subject(&mut self, subject: Subject) -> Result<(), AsimovError> {
        self.update(|doc| {
            doc.subjects.insert(subject.name.clone(), subject);
            Ok(())
        })
    }

    /// Same as [`Ledger::add_subject`]
    ///
    /// # Errors
    /// As [`Ledger::update`]
    pub fn update_subject(&mut self, subject: Subject) -> Result<(), AsimovError> {
        self.add_subject(subject)
    }

    /// One subject with project defaults merged in
    pub fn get_subject(&self, name: &str) -> Option<Subject> {
        self.doc.resolved_subject(name)
    }

    /// Every subject with project defaults merged in
    pub fn get_subjects(&self) -> Vec<Subject> {
        self.doc
            .subjects
            .keys()
            .filter_map(|name| self.doc.resolved_subject(name))
            .collect()
    }

    /// # Errors
    /// See [`LedgerDocument::get_analyses`]
    pub fn get_analyses(
        &self,
        subject: Option<&str>,
        filters: &[Selector],
    ) -> Result<Vec<AnalysisView>, DescriptionError> {
        self.doc.get_analyses(subject, filters)
    }

    /// # Errors
    /// See [`LedgerDocument::get_all_latest`]
    pub fn get_all_latest(&self, subject: &str) -> Result<Vec<String>, DescriptionError> {
        self.doc.get_all_latest(subject)
    }

    /// Post-processing definitions that apply to `subject`
    pub fn postprocessing(&self, subject: &str) -> Vec<&PostProcessDefinition> {
        self.doc.postprocessing_for(subject)
    }

    /// Every analysis and project analysis as a production, in ledger order
    pub fn productions(&self, workspace: &Workspace) -> Vec<Production> {
        self.doc.productions(workspace)
    }

    /// Persist a production's status and bookkeeping
    ///
    /// # Errors
    /// As [`LedgerDocument::record`] and [`Ledger::update`]
    pub fn record(&mut self, production: &Production) -> Result<(), AsimovError> {
        self.update(|doc| doc.record(production))
    }

    /// # Errors
    /// As [`Ledger::update`]
    pub fn set_cronjob(&mut self, id: Option<ClusterId>) -> Result<(), AsimovError> {
        self.update(|doc| {
            doc.cronjob = id;
            Ok(())
        })
    }
}

fn serialize(doc: &LedgerDocument) -> Result<String, PersistenceError> {
    serde_yaml::to_string(&doc.to_value()).map_err(|e| PersistenceError::Serialize(e.to_string()))
}

fn write(path: &Path, doc: &LedgerDocument) -> Result<(), PersistenceError> {
    let text = serialize(doc)?;
    write_atomic(path, text.as_bytes()).map_err(|source| PersistenceError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::trace!("Wrote ledger {}", path.display());
    Ok(())
}
