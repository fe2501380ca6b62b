//! Asimov Pipelines
//!
//! Reference plugins for the asimov supervisor:
//! - [`CommandPipeline`] (`command`): one scheduler job per production with
//!   an optional post-processing job
//! - [`DagmanPipeline`] (`dagman`): a multi-stage HTCondor DAG run by DAGMan
//!
//! Both read their settings from the production's resolved metadata, so the
//! ledger's `pipelines.<tag>` section supplies defaults for every analysis
//! that uses them.
//!
//! # Example
//!
//! ```rust,ignore
//! use asimov_core::PipelineRegistry;
//!
//! let mut registry = PipelineRegistry::new();
//! asimov_pipelines::register_builtin(&mut registry);
//! assert!(registry.contains("dagman"));
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod command;
mod common;
pub mod dagman;

use std::sync::Arc;

use asimov_core::{Pipeline, PipelineRegistry};

pub use command::CommandPipeline;
pub use dagman::{DagmanPipeline, Stage};

/// Register every bundled plugin under its tag
pub fn register_builtin(registry: &mut PipelineRegistry) {
    registry.register(command::TAG, || Arc::new(CommandPipeline::new()) as Arc<dyn Pipeline>);
    registry.register(dagman::TAG, || Arc::new(DagmanPipeline::new()) as Arc<dyn Pipeline>);
}

/// A registry holding the bundled plugins
pub fn builtin_registry() -> PipelineRegistry {
    let mut registry = PipelineRegistry::new();
    register_builtin(&mut registry);
    registry
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_tags() {
        let registry = builtin_registry();
        assert_eq!(registry.tags().collect::<Vec<_>>(), vec!["command", "dagman"]);
        assert_eq!(registry.create("DAGMan").unwrap().resurrection_cap(), 90);
        assert_eq!(registry.create("command").unwrap().resurrection_cap(), 5);
    }
}
