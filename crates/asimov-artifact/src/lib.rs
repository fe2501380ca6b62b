//! Asimov Results Store
//!
//! Write-once, content-addressed storage for the files an analysis produces.
//!
//! # Core Concepts
//!
//! - [`ContentHash`]: 16-byte MD5 digest identifying a resource's bytes
//! - [`Manifest`]: nested `subject -> analysis -> resource` index persisted as YAML
//! - [`ResultsStore`]: copies files in, marks them read-only, verifies them on the way out
//!
//! # Layout
//!
//! ```text
//! <root>/.manifest/manifest.yaml
//! <root>/<subject>/<analysis>/<resource>
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use asimov_artifact::ResultsStore;
//!
//! let mut store = ResultsStore::open_or_create("results", "project")?;
//! let stored = store.add_file("S0", "A0", "posterior.h5".as_ref(), None)?;
//! let path = store.fetch_file("S0", "A0", "posterior.h5", Some(&stored.hash))?;
//! ```

#![warn(unreachable_pub)]

mod fs;
mod hash;
mod manifest;
mod store;

pub use fs::write_atomic;
pub use hash::{ContentHash, HashError};
pub use manifest::{Manifest, ResourceRecord};
pub use store::{IntegrityIssue, ResultsStore, StoreError, StoredResource};
