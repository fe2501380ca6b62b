//! Layered process configuration
//!
//! Layers are read in a fixed order and merged shallowly: a key set in a
//! later layer replaces the same `(section, key)` from an earlier one, and
//! everything else survives. Environment overrides are applied last.
//!
//! ```text
//! embedded defaults -> /etc/<name> -> $HOME/.<name>
//!     -> $HOME/.config/<name>/<name>.conf -> ./<name>.conf -> environment
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const DEFAULT_LAYER: &str = include_str!("default.toml");

/// Environment variables that override a `(section, key)` pair
const ENV_OVERRIDES: [(&str, &str, &str); 3] = [
    ("ASIMOV_ACCOUNTING_USER", "condor", "user"),
    ("ASIMOV_SCHEDULER_HOST", "condor", "scheduler"),
    ("ASIMOV_SERVICE_URL", "general", "service_url"),
];

/// Merged configuration before typing: section name to key/value table
pub type RawConfig = BTreeMap<String, toml::Table>;

/// `[general]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSection {
    /// Where calibration envelopes are looked up
    pub calibration_directory: String,
    /// Parent directory of run directories, relative to the project root
    pub rundir_default: String,
    /// Software environment activated in generated jobs
    pub environment: String,
    /// Web output directory
    pub webroot: String,
    /// Remote service endpoint, carried but not interpreted
    pub service_url: String,
}

impl Default for GeneralSection {
    fn default() -> Self {
        Self {
            calibration_directory: String::new(),
            rundir_default: "working".to_string(),
            environment: String::new(),
            webroot: "pages".to_string(),
            service_url: String::new(),
        }
    }
}

/// `[pipelines]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelinesSection {
    /// Software environment for pipeline executables
    pub environment: String,
    /// Scheduler accounting tag attached to every job
    pub accounting: String,
}

impl Default for PipelinesSection {
    fn default() -> Self {
        Self {
            environment: String::new(),
            accounting: "ligo.dev.o4.cbc.pe.lalinference".to_string(),
        }
    }
}

/// `[condor]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CondorSection {
    /// Schedd to talk to; empty means the local default
    pub scheduler: String,
    /// Accounting user
    pub user: String,
    /// Cron minute specification for the periodic monitor job
    pub cron_minute: String,
    /// Upper bound on every scheduler command, in seconds
    pub timeout: u64,
    /// Lifetime of the job-table cache, in seconds
    pub cache_ttl: u64,
}

impl Default for CondorSection {
    fn default() -> Self {
        Self {
            scheduler: String::new(),
            user: String::new(),
            cron_minute: "*/15".to_string(),
            timeout: 60,
            cache_ttl: 900,
        }
    }
}

/// `[ledger]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSection {
    /// Storage engine; only `yamlfile` exists
    pub engine: String,
    /// Ledger file, relative to the project root
    pub location: String,
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            engine: "yamlfile".to_string(),
            location: "ledger.yml".to_string(),
        }
    }
}

/// `[storage]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Results store root, relative to the project root
    pub results_store: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            results_store: "results".to_string(),
        }
    }
}

/// `[templating]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplatingSection {
    /// Directory searched for `<pipeline>.<ext>` templates
    pub directory: String,
}

impl Default for TemplatingSection {
    fn default() -> Self {
        Self {
            directory: "templates".to_string(),
        }
    }
}

/// `[report]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportSection {
    /// Report output directory, relative to the project root
    pub location: String,
    /// Where reports are mailed; empty disables mail
    pub report_email: String,
}

impl Default for ReportSection {
    fn default() -> Self {
        Self {
            location: "reports".to_string(),
            report_email: String::new(),
        }
    }
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Per-production log directory, relative to the project root
    pub directory: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            directory: "logs".to_string(),
        }
    }
}

/// `[project]`, written by `init`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectSection {
    /// Project name
    pub name: String,
    /// Project root; the directory holding `asimov.conf` when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
}

/// Typed view of the merged configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// `[general]`
    pub general: GeneralSection,
    /// `[pipelines]`
    pub pipelines: PipelinesSection,
    /// `[condor]`
    pub condor: CondorSection,
    /// `[ledger]`
    pub ledger: LedgerSection,
    /// `[storage]`
    pub storage: StorageSection,
    /// `[templating]`
    pub templating: TemplatingSection,
    /// `[report]`
    pub report: ReportSection,
    /// `[logging]`
    pub logging: LoggingSection,
    /// `[project]`
    pub project: ProjectSection,
    #[serde(skip)]
    raw: RawConfig,
}

impl ProcessConfig {
    /// Type a merged raw configuration
    ///
    /// # Errors
    /// [`ConfigError::Invalid`] when a known key has the wrong type
    pub fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let table: toml::Table = raw
            .iter()
            .map(|(section, values)| (section.clone(), toml::Value::Table(values.clone())))
            .collect();
        let mut config: Self = toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Invalid(e.to_string()))?;
        config.raw = raw;
        Ok(config)
    }

    /// The merged configuration including sections the typed view ignores
    #[must_use]
    pub fn raw(&self) -> &RawConfig {
        &self.raw
    }

    /// Look up a raw `(section, key)` value
    #[must_use]
    pub fn get(&self, section: &str, key: &str) -> Option<&toml::Value> {
        self.raw.get(section)?.get(key)
    }
}

/// Where environment overrides come from
#[derive(Debug, Clone, Default)]
pub enum EnvSource {
    /// The process environment
    #[default]
    Process,
    /// A fixed set of variables
    Fixed(BTreeMap<String, String>),
    /// No overrides
    Disabled,
}

impl EnvSource {
    fn lookup(&self, key: &str) -> Option<String> {
        match self {
            Self::Process => std::env::var(key).ok(),
            Self::Fixed(vars) => vars.get(key).cloned(),
            Self::Disabled => None,
        }
    }
}

/// Builder that reads and merges configuration layers
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    paths: Vec<PathBuf>,
    env: EnvSource,
}

impl ConfigLoader {
    /// Loader with the standard search path for `name`
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            paths: Self::standard_paths(name),
            env: EnvSource::Process,
        }
    }

    /// `/etc/<name>`, `$HOME/.<name>`, `$HOME/.config/<name>/<name>.conf`, `./<name>.conf`
    #[must_use]
    pub fn standard_paths(name: &str) -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc").join(name)];
        if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
            paths.push(home.join(format!(".{name}")));
            paths.push(home.join(".config").join(name).join(format!("{name}.conf")));
        }
        paths.push(PathBuf::from(format!("{name}.conf")));
        paths
    }

    /// Replace the search path
    #[inline]
    #[must_use]
    pub fn with_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.paths = paths;
        self
    }

    /// Append a layer with the highest file precedence
    #[inline]
    #[must_use]
    pub fn add_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.paths.push(path.into());
        self
    }

    /// Choose where environment overrides come from
    #[inline]
    #[must_use]
    pub fn with_env(mut self, env: EnvSource) -> Self {
        self.env = env;
        self
    }

    /// Search path in precedence order
    #[must_use]
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Merge every layer into a raw section map
    ///
    /// # Errors
    /// [`ConfigError::Malformed`] for unparsable layers, [`ConfigError::Io`] for unreadable ones
    pub fn load_raw(&self) -> Result<RawConfig, ConfigError> {
        let mut raw = RawConfig::new();
        let defaults: toml::Table = DEFAULT_LAYER
            .parse()
            .map_err(|e: toml::de::Error| {
                ConfigError::malformed("<embedded defaults>", e.to_string())
            })?;
        apply_layer(&mut raw, defaults, Path::new("<embedded defaults>"))?;

        for path in &self.paths {
            if !path.is_file() {
                tracing::trace!("Skipping absent configuration layer {}", path.display());
                continue;
            }
            let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            let table: toml::Table = text
                .parse()
                .map_err(|e: toml::de::Error| ConfigError::malformed(path, e.to_string()))?;
            apply_layer(&mut raw, table, path)?;
            tracing::debug!("Loaded configuration layer {}", path.display());
        }

        for (var, section, key) in ENV_OVERRIDES {
            if let Some(value) = self.env.lookup(var) {
                tracing::debug!("Applying {} to {}.{}", var, section, key);
                raw.entry(section.to_string())
                    .or_default()
                    .insert(key.to_string(), toml::Value::String(value));
            }
        }
        Ok(raw)
    }

    /// Merge every layer and type the result
    ///
    /// # Errors
    /// See [`ConfigLoader::load_raw`] and [`ProcessConfig::from_raw`]
    pub fn load(&self) -> Result<ProcessConfig, ConfigError> {
        ProcessConfig::from_raw(self.load_raw()?)
    }
}

fn apply_layer(raw: &mut RawConfig, layer: toml::Table, path: &Path) -> Result<(), ConfigError> {
    for (section, value) in layer {
        let toml::Value::Table(values) = value else {
            return Err(ConfigError::malformed(
                path,
                format!("top-level key '{section}' is not a section"),
            ));
        };
        let target = raw.entry(section).or_default();
        for (key, value) in values {
            target.insert(key, value);
        }
    }
    Ok(())
}

/// Text of a fresh project configuration file
///
/// # Errors
/// [`ConfigError::Serialize`] if the values cannot be encoded
pub fn project_file(name: &str, root: &Path) -> Result<String, ConfigError> {
    let mut project = toml::Table::new();
    project.insert("name".to_string(), toml::Value::String(name.to_string()));
    project.insert(
        "root".to_string(),
        toml::Value::String(root.to_string_lossy().into_owned()),
    );
    let mut doc = toml::Table::new();
    doc.insert("project".to_string(), toml::Value::Table(project));
    toml::to_string(&doc).map_err(|e| ConfigError::Serialize(e.to_string()))
}

/// Rewrite `project.root` in an existing project configuration file
///
/// # Errors
/// [`ConfigError::Malformed`] if `text` is not TOML
pub fn rewrite_project_root(text: &str, origin: &Path, root: &Path) -> Result<String, ConfigError> {
    let mut doc: toml::Table = text
        .parse()
        .map_err(|e: toml::de::Error| ConfigError::malformed(origin, e.to_string()))?;
    let project = doc
        .entry("project".to_string())
        .or_insert_with(|| toml::Value::Table(toml::Table::new()));
    let toml::Value::Table(project) = project else {
        return Err(ConfigError::malformed(origin, "'project' is not a section"));
    };
    project.insert(
        "root".to_string(),
        toml::Value::String(root.to_string_lossy().into_owned()),
    );
    toml::to_string(&doc).map_err(|e| ConfigError::Serialize(e.to_string()))
}
