//! Asimov Configuration Layer
//!
//! Everything that turns text on disk into typed values before the ledger
//! sees it.
//!
//! # Core Operations
//!
//! - **Process configuration**: [`ConfigLoader`] stacks TOML layers and
//!   environment overrides into a [`ProcessConfig`]
//! - **Descriptions**: [`parse_documents`] splits a multi-document YAML
//!   stream into mappings
//! - **Templates**: [`TemplateRenderer`] locates and renders a pipeline's
//!   configuration file
//!
//! # Example
//!
//! ```rust,ignore
//! use asimov_config::ConfigLoader;
//!
//! let config = ConfigLoader::new("asimov").load()?;
//! println!("run directories under {}", config.general.rundir_default);
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod config;
pub mod documents;
pub mod error;
pub mod template;

pub use config::{
    CondorSection, ConfigLoader, EnvSource, GeneralSection, LedgerSection, LoggingSection,
    PipelinesSection, ProcessConfig, ProjectSection, RawConfig, ReportSection, StorageSection,
    TemplatingSection, project_file, rewrite_project_root,
};
pub use documents::{parse_documents, read_documents};
pub use error::{ConfigError, DocumentError, TemplateError};
pub use template::TemplateRenderer;
