//! Error types for the configuration layer

use std::path::PathBuf;

/// Errors while loading process configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A layer exists but is not valid configuration
    #[error("malformed configuration in {path}: {message}")]
    Malformed {
        /// Offending file
        path: PathBuf,
        /// Parser diagnostic
        message: String,
    },

    /// A layer exists but could not be read
    #[error("io error reading {path}: {source}")]
    Io {
        /// Offending file
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The merged layers do not fit the typed view
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// Configuration could not be written
    #[error("failed to serialize configuration: {0}")]
    Serialize(String),
}

impl ConfigError {
    /// Create a malformed-layer error
    pub fn malformed(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Malformed {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Errors while reading description documents
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    /// YAML syntax error
    #[error("invalid YAML in document {index}: {message}")]
    Syntax {
        /// Zero-based document index in the stream
        index: usize,
        /// Parser diagnostic
        message: String,
    },

    /// Document is valid YAML but not a mapping
    #[error("document {index} is not a mapping")]
    NotAMapping {
        /// Zero-based document index in the stream
        index: usize,
    },

    /// File could not be read
    #[error("io error reading {path}: {source}")]
    Io {
        /// Offending file
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

/// Errors while locating or rendering configuration templates
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    /// An explicitly named template is missing
    #[error("template {0} does not exist")]
    NotFound(PathBuf),

    /// Template could not be read
    #[error("io error reading template {path}: {source}")]
    Io {
        /// Offending file
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Template syntax or evaluation error
    #[error("failed to render template {name}: {message}")]
    Render {
        /// Template name
        name: String,
        /// Engine diagnostic
        message: String,
    },
}
