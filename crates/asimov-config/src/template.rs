//! Pipeline configuration templates
//!
//! A template is looked up in this order:
//!
//! 1. an explicit path supplied by the analysis metadata (`template:`)
//! 2. `<templating.directory>/<pipeline>.<ext>` under the project root
//! 3. the default shipped with the pipeline plugin
//!
//! Templates are rendered with `minijinja`. Missing attributes chain to
//! undefined and render as empty strings, so optional metadata can be
//! tested with `{% if analysis.meta.quality.window %}`.

use std::fs;
use std::path::{Path, PathBuf};

use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;

use crate::error::TemplateError;

/// Template lookup and rendering
#[derive(Debug, Clone)]
pub struct TemplateRenderer {
    directory: PathBuf,
}

impl TemplateRenderer {
    /// Renderer searching `directory` for project templates
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// Project template directory
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Find template text for a pipeline.
    ///
    /// Returns the template name and its source, or `None` when neither the
    /// project nor the plugin supplies one.
    ///
    /// # Errors
    /// [`TemplateError::NotFound`] when an explicit path does not exist,
    /// [`TemplateError::Io`] when a found template cannot be read
    pub fn locate(
        &self,
        pipeline: &str,
        extension: &str,
        explicit: Option<&Path>,
        embedded: Option<&str>,
    ) -> Result<Option<(String, String)>, TemplateError> {
        if let Some(path) = explicit {
            if !path.is_file() {
                return Err(TemplateError::NotFound(path.to_path_buf()));
            }
            return read(path).map(Some);
        }
        let project = self.directory.join(format!("{pipeline}.{extension}"));
        if project.is_file() {
            return read(&project).map(Some);
        }
        Ok(embedded.map(|source| (format!("{pipeline}.{extension}"), source.to_string())))
    }

    /// Render template source against a serializable context
    ///
    /// # Errors
    /// [`TemplateError::Render`] on syntax or evaluation errors
    pub fn render<C: Serialize>(
        &self,
        name: &str,
        source: &str,
        context: &C,
    ) -> Result<String, TemplateError> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Chainable);
        env.set_keep_trailing_newline(true);
        let render_error = |e: minijinja::Error| TemplateError::Render {
            name: name.to_string(),
            message: e.to_string(),
        };
        env.add_template(name, source).map_err(render_error)?;
        let template = env.get_template(name).map_err(render_error)?;
        template.render(context).map_err(render_error)
    }
}

fn read(path: &Path) -> Result<(String, String), TemplateError> {
    let source = fs::read_to_string(path).map_err(|source| TemplateError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok((path.display().to_string(), source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup_order() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = TemplateRenderer::new(dir.path());

        let (_, source) = renderer
            .locate("bilby", "ini", None, Some("embedded"))
            .unwrap()
            .unwrap();
        assert_eq!(source, "embedded");

        fs::write(dir.path().join("bilby.ini"), "project").unwrap();
        let (_, source) = renderer
            .locate("bilby", "ini", None, Some("embedded"))
            .unwrap()
            .unwrap();
        assert_eq!(source, "project");

        let explicit = dir.path().join("custom.ini");
        fs::write(&explicit, "explicit").unwrap();
        let (_, source) = renderer
            .locate("bilby", "ini", Some(&explicit), Some("embedded"))
            .unwrap()
            .unwrap();
        assert_eq!(source, "explicit");
    }

    #[test]
    fn test_missing_explicit_template() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = TemplateRenderer::new(dir.path());
        let missing = dir.path().join("missing.ini");
        assert!(matches!(
            renderer.locate("bilby", "ini", Some(&missing), None),
            Err(TemplateError::NotFound(_))
        ));
        assert!(renderer.locate("bilby", "ini", None, None).unwrap().is_none());
    }

    #[test]
    fn test_render_with_missing_attributes() {
        let renderer = TemplateRenderer::new("templates");
        let context = json!({
            "analysis": {"name": "A0", "meta": {"priors": {"q": [0, 1]}}},
            "config": {"general": {"webroot": "pages"}}
        });
        let out = renderer
            .render(
                "t.ini",
                "name={{ analysis.name }}\nq={{ analysis.meta.priors.q[1] }}\n\
                 window={{ analysis.meta.quality.window }}\nweb={{ config.general.webroot }}\n",
                &context,
            )
            .unwrap();
        assert_eq!(out, "name=A0\nq=1\nwindow=\nweb=pages\n");
    }

    #[test]
    fn test_render_syntax_error() {
        let renderer = TemplateRenderer::new("templates");
        let err = renderer
            .render("bad.ini", "{% if %}", &json!({}))
            .unwrap_err();
        assert!(matches!(err, TemplateError::Render { ref name, .. } if name == "bad.ini"));
    }
}
