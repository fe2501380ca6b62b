//! Multi-document YAML streams
//!
//! Description files hold any number of `---`-separated documents. Each
//! document must be a mapping; empty documents (a trailing `---`) are
//! skipped.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_yaml::{Mapping, Value};

use crate::error::DocumentError;

/// Split a YAML stream into its mapping documents
///
/// # Errors
/// [`DocumentError::Syntax`] for invalid YAML, [`DocumentError::NotAMapping`]
/// for scalar or sequence documents
pub fn parse_documents(text: &str) -> Result<Vec<Mapping>, DocumentError> {
    let mut documents = Vec::new();
    for (index, document) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let value = Value::deserialize(document).map_err(|e| DocumentError::Syntax {
            index,
            message: e.to_string(),
        })?;
        match value {
            Value::Null => {}
            Value::Mapping(mapping) => documents.push(mapping),
            _ => return Err(DocumentError::NotAMapping { index }),
        }
    }
    Ok(documents)
}

/// Read and split a YAML file
///
/// # Errors
/// [`DocumentError::Io`] if the file is unreadable, otherwise as [`parse_documents`]
pub fn read_documents(path: &Path) -> Result<Vec<Mapping>, DocumentError> {
    let text = fs::read_to_string(path).map_err(|source| DocumentError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_documents(&text)
}
