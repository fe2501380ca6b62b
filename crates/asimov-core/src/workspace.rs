//! Project workspace layout
//!
//! ```text
//! <root>/asimov.conf
//! <root>/ledger.yml
//! <root>/working/<subject>/<analysis>/      run directories
//! <root>/checkouts/<subject>/<analysis>.<ext> rendered configurations
//! <root>/results/                           results store
//! <root>/logs/<subject>/<analysis>.log      per-production failure log
//! <root>/.asimov/_cache_jobs.yaml           job-table cache
//! ```

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use asimov_artifact::{ResultsStore, StoreError};
use asimov_config::{
    project_file, rewrite_project_root, ConfigLoader, ProcessConfig, TemplateRenderer,
};
use chrono::Utc;

use crate::error::{AsimovError, LedgerError};
use crate::ledger::Ledger;
use crate::model::ProductionId;

/// Project configuration file name
pub const CONFIG_FILE: &str = "asimov.conf";
/// Rendered configuration directory
pub const CHECKOUTS_DIR: &str = "checkouts";
/// Supervisor-private state directory
pub const STATE_DIR: &str = ".asimov";

/// A project root together with its merged configuration
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    config: ProcessConfig,
}

impl Workspace {
    /// Workspace over an existing root
    pub fn new(root: impl Into<PathBuf>, config: ProcessConfig) -> Self {
        Self {
            root: root.into(),
            config,
        }
    }

    /// Open the project at `root` with the standard configuration layers
    ///
    /// # Errors
    /// [`AsimovError::NotAProject`] without `asimov.conf`, or a configuration error
    pub fn open(root: &Path) -> Result<Self, AsimovError> {
        let mut paths = ConfigLoader::standard_paths("asimov");
        paths.retain(|p| p.is_absolute());
        Self::open_with(root, ConfigLoader::new("asimov").with_paths(paths))
    }

    /// Open with a caller-supplied loader; the project file is added as the top layer
    ///
    /// # Errors
    /// See [`Workspace::open`]
    pub fn open_with(root: &Path, loader: ConfigLoader) -> Result<Self, AsimovError> {
        let conf = root.join(CONFIG_FILE);
        if !conf.is_file() {
            return Err(AsimovError::NotAProject(root.to_path_buf()));
        }
        let config = loader.add_path(conf).load()?;
        tracing::debug!("Opened project {} at {}", config.project.name, root.display());
        Ok(Self::new(root, config))
    }

    /// Create a new project
    ///
    /// # Errors
    /// [`LedgerError::AlreadyExists`] if a ledger is present
    pub fn init(root: &Path, name: &str) -> Result<Self, AsimovError> {
        let mut paths = ConfigLoader::standard_paths("asimov");
        paths.retain(|p| p.is_absolute());
        Self::init_with(root, name, ConfigLoader::new("asimov").with_paths(paths))
    }

    /// Create a new project, loading configuration through `loader`
    ///
    /// # Errors
    /// See [`Workspace::init`]
    pub fn init_with(root: &Path, name: &str, loader: ConfigLoader) -> Result<Self, AsimovError> {
        create_dir(root)?;
        let root = root
            .canonicalize()
            .map_err(|e| AsimovError::io(root, e))?;
        let conf = root.join(CONFIG_FILE);
        if conf.is_file() {
            let existing = Self::open_with(&root, loader.clone())?;
            if existing.ledger_path().exists() {
                return Err(LedgerError::AlreadyExists(existing.ledger_path()).into());
            }
        }
        let text = project_file(name, &root)?;
        fs::write(&conf, text).map_err(|e| AsimovError::io(&conf, e))?;

        let workspace = Self::open_with(&root, loader)?;
        Ledger::create(&workspace.ledger_path(), name)?;
        workspace.ensure_dirs()?;
        tracing::info!("Initialised project {} in {}", name, root.display());
        Ok(workspace)
    }

    /// Copy another project's configuration and ledger into `root`
    ///
    /// # Errors
    /// [`AsimovError::NotAProject`] if `source` is not a project,
    /// [`LedgerError::AlreadyExists`] if `root` already has a ledger
    pub fn clone_from(source: &Path, root: &Path) -> Result<Self, AsimovError> {
        let origin = Self::open(source)?;
        create_dir(root)?;
        let root = root
            .canonicalize()
            .map_err(|e| AsimovError::io(root, e))?;

        let source_conf = source.join(CONFIG_FILE);
        let text = fs::read_to_string(&source_conf).map_err(|e| AsimovError::io(&source_conf, e))?;
        let rewritten = rewrite_project_root(&text, &source_conf, &root)?;
        let conf = root.join(CONFIG_FILE);
        fs::write(&conf, rewritten).map_err(|e| AsimovError::io(&conf, e))?;

        let workspace = Self::open(&root)?;
        let ledger = workspace.ledger_path();
        if ledger.exists() {
            return Err(LedgerError::AlreadyExists(ledger).into());
        }
        fs::copy(origin.ledger_path(), &ledger).map_err(|e| AsimovError::io(&ledger, e))?;
        workspace.ensure_dirs()?;
        tracing::info!(
            "Cloned project {} from {} into {}",
            workspace.project_name(),
            source.display(),
            root.display()
        );
        Ok(workspace)
    }

    /// Create the standard directories. Idempotent.
    ///
    /// # Errors
    /// [`AsimovError::Io`] if a directory cannot be created
    pub fn ensure_dirs(&self) -> Result<(), AsimovError> {
        for dir in [
            self.working_root(),
            self.root.join(CHECKOUTS_DIR),
            self.results_root(),
            self.log_root(),
        ] {
            create_dir(&dir)?;
        }
        Ok(())
    }

    /// Project root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Process configuration in effect
    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// Name given at `init`
    pub fn project_name(&self) -> &str {
        &self.config.project.name
    }

    /// The ledger file
    pub fn ledger_path(&self) -> PathBuf {
        self.root.join(&self.config.ledger.location)
    }

    /// Parent of every run directory
    pub fn working_root(&self) -> PathBuf {
        self.root.join(&self.config.general.rundir_default)
    }

    /// Default run directory of a production
    pub fn rundir(&self, id: &ProductionId) -> PathBuf {
        nested(self.working_root(), id)
    }

    /// Rendered configuration file of a production
    pub fn checkout_path(&self, id: &ProductionId, extension: &str) -> PathBuf {
        nested_file(self.root.join(CHECKOUTS_DIR), id, extension)
    }

    /// Parent of the per-production logs
    pub fn log_root(&self) -> PathBuf {
        self.root.join(&self.config.logging.directory)
    }

    /// Failure log of a production
    pub fn log_path(&self, id: &ProductionId) -> PathBuf {
        nested_file(self.log_root(), id, "log")
    }

    /// Results store root
    pub fn results_root(&self) -> PathBuf {
        self.root.join(&self.config.storage.results_store)
    }

    /// Directory reports are written to
    pub fn report_dir(&self) -> PathBuf {
        self.root.join(&self.config.report.location)
    }

    /// Private state, `.asimov/`
    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    /// Cached scheduler job table
    pub fn job_cache_path(&self) -> PathBuf {
        self.state_dir().join("_cache_jobs.yaml")
    }

    /// Project template directory
    pub fn templates(&self) -> TemplateRenderer {
        TemplateRenderer::new(self.root.join(&self.config.templating.directory))
    }

    /// Open the results store, creating it on first use
    ///
    /// # Errors
    /// [`StoreError`] if the manifest cannot be read or created
    pub fn open_store(&self) -> Result<ResultsStore, StoreError> {
        ResultsStore::open_or_create(self.results_root(), self.project_name())
    }

    /// Append one timestamped line to a production's log
    ///
    /// # Errors
    /// Any I/O error creating or appending to the file
    pub fn append_log(&self, id: &ProductionId, message: &str) -> io::Result<()> {
        let path = self.log_path(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let line = message.replace('\n', " ");
        writeln!(file, "{} {}", Utc::now().to_rfc3339(), line)
    }
}

fn nested(base: PathBuf, id: &ProductionId) -> PathBuf {
    id.segments().into_iter().fold(base, |path, segment| path.join(segment))
}

fn nested_file(base: PathBuf, id: &ProductionId, extension: &str) -> PathBuf {
    let segments = id.segments();
    match segments.split_last() {
        Some((last, parents)) => parents
            .iter()
            .fold(base, |path, segment| path.join(segment))
            .join(format!("{last}.{extension}")),
        None => base,
    }
}

fn create_dir(dir: &Path) -> Result<(), AsimovError> {
    fs::create_dir_all(dir).map_err(|e| AsimovError::io(dir, e))
}
