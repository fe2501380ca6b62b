//! Asimov Merge Engine
//!
//! Layered metadata is the backbone of the ledger: pipeline defaults, project
//! defaults, subject metadata and analysis metadata are stacked and resolved on
//! every read, and compressed back to their differences on every write.
//!
//! # Core Operations
//!
//! - [`merge`]: recursive right-biased union of two trees
//! - [`diff`]: the subset of a target tree that differs from a base tree
//! - [`get_path`] / [`set_path`] / [`remove_path`]: dotted-path access
//!
//! Sequences are opaque values: they are replaced wholesale, never
//! concatenated.
//!
//! # Example
//!
//! ```rust
//! use asimov_merge::{diff, merge};
//! use serde_yaml::Value;
//!
//! let base: Value = serde_yaml::from_str("priors: {q: [0, 1], chirp: 10}").unwrap();
//! let own: Value = serde_yaml::from_str("priors: {chirp: 12}").unwrap();
//!
//! let resolved = merge(&base, &own);
//! assert_eq!(merge(&base, &diff(&base, &resolved)), resolved);
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod diff;
mod merge;
mod path;

pub use diff::{diff, diff_mapping};
pub use merge::{merge, merge_all, merge_mapping};
pub use path::{get_path, get_path_mapping, remove_path, scalar_string, set_path, set_path_mapping};

pub use serde_yaml::{Mapping, Value};
