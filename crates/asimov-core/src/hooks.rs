//! Post-monitor hooks
//!
//! Hooks run after every non-dry monitor pass. The ledger's
//! `hooks.postmonitor` mapping selects them by tag and hands each its own
//! settings. A failing hook is logged and skipped; it never fails the pass.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use asimov_artifact::write_atomic;
use asimov_merge::{Mapping, Value};

use crate::error::HookError;
use crate::ledger::Ledger;
use crate::model::key;
use crate::workspace::Workspace;

/// Code run after a monitor pass
pub trait PostMonitorHook: Send + Sync {
    /// Tag under `hooks.postmonitor`
    fn tag(&self) -> &str;

    /// # Errors
    /// [`HookError`] describing what went wrong; logged by the caller
    fn run(
        &self,
        ledger: &Ledger,
        workspace: &Workspace,
        settings: &Mapping,
    ) -> Result<(), HookError>;
}

/// Tag to hook
#[derive(Default, Clone)]
pub struct HookRegistry {
    hooks: BTreeMap<String, Arc<dyn PostMonitorHook>>,
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("tags", &self.hooks.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HookRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in hooks
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SummaryHook));
        registry
    }

    /// Add a hook, replacing any with the same tag
    pub fn register(&mut self, hook: Arc<dyn PostMonitorHook>) {
        self.hooks.insert(hook.tag().to_string(), hook);
    }

    /// Run every configured hook in ledger order; returns the tags that ran
    pub fn run_postmonitor(&self, ledger: &Ledger, workspace: &Workspace) -> Vec<String> {
        let Some(Value::Mapping(configured)) = ledger
            .document()
            .hooks
            .get(key("postmonitor"))
        else {
            return Vec::new();
        };
        let empty = Mapping::new();
        let mut ran = Vec::new();
        for (tag, settings) in configured {
            let Some(tag) = tag.as_str() else {
                continue;
            };
            let Some(hook) = self.hooks.get(tag) else {
                tracing::warn!("No postmonitor hook registered for '{}'", tag);
                continue;
            };
            let settings = match settings {
                Value::Mapping(m) => m,
                _ => &empty,
            };
            match hook.run(ledger, workspace, settings) {
                Ok(()) => {
                    tracing::debug!("Postmonitor hook {} finished", tag);
                    ran.push(tag.to_string());
                }
                Err(e) => tracing::warn!("{}", e),
            }
        }
        ran
    }
}

/// Counts productions by status and writes `status.yaml` to the report directory
#[derive(Debug, Clone, Copy, Default)]
pub struct SummaryHook;

impl PostMonitorHook for SummaryHook {
    fn tag(&self) -> &str {
        "summary"
    }

    fn run(
        &self,
        ledger: &Ledger,
        workspace: &Workspace,
        _settings: &Mapping,
    ) -> Result<(), HookError> {
        let mut counts: BTreeMap<&'static str, u64> = BTreeMap::new();
        let mut productions = Mapping::new();
        for production in ledger.productions(workspace) {
            *counts.entry(production.status.as_str()).or_default() += 1;
            productions.insert(
                Value::String(production.id.to_string()),
                Value::String(production.status.as_str().to_string()),
            );
        }
        let summary = counts
            .iter()
            .map(|(status, n)| format!("{status}={n}"))
            .collect::<Vec<_>>()
            .join(" ");
        tracing::info!("Production summary: {}", summary);

        let mut doc = Mapping::new();
        doc.insert(
            key("counts"),
            Value::Mapping(
                counts
                    .into_iter()
                    .map(|(status, n)| (key(status), Value::Number(n.into())))
                    .collect(),
            ),
        );
        doc.insert(key("productions"), Value::Mapping(productions));
        let text = serde_yaml::to_string(&doc).map_err(|e| HookError {
            tag: self.tag().to_string(),
            message: e.to_string(),
        })?;
        let path = workspace.report_dir().join("status.yaml");
        write_atomic(&path, text.as_bytes()).map_err(|e| HookError {
            tag: self.tag().to_string(),
            message: format!("{}: {e}", path.display()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerDocument;
    use crate::model::{Analysis, Subject};
    use asimov_config::ProcessConfig;
    use asimov_kernel::state_machine::AnalysisStatus;

    struct Failing;

    impl PostMonitorHook for Failing {
        fn tag(&self) -> &str {
            "failing"
        }

        fn run(&self, _l: &Ledger, _w: &Workspace, _s: &Mapping) -> Result<(), HookError> {
            Err(HookError {
                tag: "failing".into(),
                message: "boom".into(),
            })
        }
    }

    fn ledger(dir: &std::path::Path, hooks: &str) -> Ledger {
        let mut doc = LedgerDocument::new("demo");
        let mut subject = Subject::new("S0");
        subject
            .add_analysis(Analysis::new("A0", "bilby").with_status(AnalysisStatus::Running))
            .unwrap();
        subject.add_analysis(Analysis::new("A1", "bilby")).unwrap();
        doc.subjects.insert("S0".into(), subject);
        doc.hooks = serde_yaml::from_str(hooks).unwrap();
        Ledger::from_document(dir.join("ledger.yml"), doc)
    }

    #[test]
    fn test_summary_writes_status_file() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(dir.path(), ProcessConfig::default());
        let ledger = ledger(dir.path(), "postmonitor:\n  summary: {}\n");

        let ran = HookRegistry::with_builtin().run_postmonitor(&ledger, &workspace);
        assert_eq!(ran, vec!["summary".to_string()]);

        let text = std::fs::read_to_string(workspace.report_dir().join("status.yaml")).unwrap();
        let doc: Mapping = serde_yaml::from_str(&text).unwrap();
        let counts = doc.get(key("counts")).unwrap();
        assert_eq!(counts.get("running"), Some(&Value::from(1)));
        assert_eq!(counts.get("ready"), Some(&Value::from(1)));
    }

    #[test]
    fn test_failures_and_unknown_tags_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(dir.path(), ProcessConfig::default());
        let ledger = ledger(
            dir.path(),
            "postmonitor:\n  failing: {}\n  mystery: {}\n  summary: {}\n",
        );
        let mut registry = HookRegistry::with_builtin();
        registry.register(Arc::new(Failing));

        assert_eq!(registry.run_postmonitor(&ledger, &workspace), vec!["summary".to_string()]);
    }

    #[test]
    fn test_nothing_configured() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(dir.path(), ProcessConfig::default());
        let ledger = ledger(dir.path(), "{}");
        assert!(HookRegistry::with_builtin()
            .run_postmonitor(&ledger, &workspace)
            .is_empty());
    }
}
