//! Configuration rendering for productions
//!
//! A pipeline's configuration file is produced from a template found, in
//! order, at the production's `template` metadata path, in the project's
//! template directory as `<pipeline>.<ext>`, or embedded in the plugin.

use std::path::{Path, PathBuf};

use asimov_config::RawConfig;
use asimov_merge::Mapping;
use serde::Serialize;

use crate::error::PipelineError;
use crate::model::{InputAnalysis, Production};
use crate::pipeline::Pipeline;
use crate::workspace::Workspace;

#[derive(Serialize)]
struct InputContext<'a> {
    subject: &'a str,
    name: &'a str,
    pipeline: &'a str,
    status: &'a str,
    rundir: &'a Path,
    meta: &'a Mapping,
}

impl<'a> From<&'a InputAnalysis> for InputContext<'a> {
    fn from(input: &'a InputAnalysis) -> Self {
        Self {
            subject: &input.subject,
            name: &input.name,
            pipeline: &input.pipeline,
            status: input.status.as_str(),
            rundir: &input.rundir,
            meta: &input.meta,
        }
    }
}

#[derive(Serialize)]
struct AnalysisContext<'a> {
    name: &'a str,
    subject: Option<&'a str>,
    pipeline: &'a str,
    status: &'a str,
    comment: Option<&'a str>,
    rundir: &'a Path,
    config_file: &'a Path,
    meta: &'a Mapping,
    inputs: Vec<InputContext<'a>>,
}

#[derive(Serialize)]
struct RenderContext<'a> {
    analysis: AnalysisContext<'a>,
    config: &'a RawConfig,
}

/// Render the production's configuration text
///
/// Returns `None` when no template exists for the pipeline; such pipelines
/// build their job graph without a configuration file.
///
/// # Errors
/// [`PipelineError::Template`] for a missing explicit template or a
/// render failure
pub fn render_configuration(
    production: &Production,
    plugin: &dyn Pipeline,
    workspace: &Workspace,
) -> Result<Option<String>, PipelineError> {
    let explicit = explicit_template(production, workspace);
    let renderer = workspace.templates();
    let Some((name, source)) = renderer.locate(
        &production.pipeline,
        plugin.config_extension(),
        explicit.as_deref(),
        plugin.default_template(),
    )?
    else {
        return Ok(None);
    };

    let context = RenderContext {
        analysis: AnalysisContext {
            name: production.id.name(),
            subject: production.id.subject(),
            pipeline: &production.pipeline,
            status: production.status.as_str(),
            comment: production.comment.as_deref(),
            rundir: &production.rundir,
            config_file: &production.config_file,
            meta: &production.meta,
            inputs: production.inputs.iter().map(InputContext::from).collect(),
        },
        config: workspace.config().raw(),
    };
    tracing::debug!(production = %production.id, "Rendering {}", name);
    Ok(Some(renderer.render(&name, &source, &context)?))
}

fn explicit_template(production: &Production, workspace: &Workspace) -> Option<PathBuf> {
    let template = production.meta_str("template")?;
    let path = PathBuf::from(template);
    if path.is_absolute() {
        Some(path)
    } else {
        Some(workspace.root().join(path))
    }
}
