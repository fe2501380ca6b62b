//! Subjects, analyses and the nodes that describe them in the ledger
//!
//! Every entity reads itself from a `serde_yaml::Mapping` node and writes
//! itself back. Fields the model does not interpret are kept in `meta` and
//! survive a round trip untouched.

pub mod analysis;
pub mod postprocess;
pub mod production;
pub mod project;
pub mod review;
pub mod selector;
pub mod subject;

pub use analysis::Analysis;
pub use postprocess::{Owner, PostProcessDefinition, ProcessState};
pub use production::{InputAnalysis, Production, ProductionId};
pub use project::ProjectAnalysis;
pub use review::{Review, ReviewMessage, ReviewStatus};
pub use selector::{Selectable, Selector};
pub use subject::Subject;

use asimov_kernel::scheduler::ClusterId;
use asimov_kernel::state_machine::AnalysisStatus;
use asimov_merge::{get_path_mapping, remove_path, set_path_mapping, Mapping, Value};

use crate::error::DescriptionError;

/// Where the scheduler cluster id lives inside resolved metadata
pub const JOB_ID_PATH: &str = "scheduler.job id";
/// Legacy location of the cluster id, read but never written
pub const LEGACY_JOB_ID_KEY: &str = "job id";

pub(crate) fn key(name: &str) -> Value {
    Value::String(name.to_string())
}

pub(crate) fn string_field(
    node: &Mapping,
    field: &str,
    context: &str,
) -> Result<Option<String>, DescriptionError> {
    match node.get(key(field)) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(_) => Err(DescriptionError::invalid(context, field, "must be a scalar")),
    }
}

pub(crate) fn required_string(
    node: &Mapping,
    field: &str,
    context: &str,
) -> Result<String, DescriptionError> {
    string_field(node, field, context)?.ok_or_else(|| DescriptionError::missing(context, field))
}

pub(crate) fn status_field(
    node: &Mapping,
    context: &str,
) -> Result<Option<AnalysisStatus>, DescriptionError> {
    string_field(node, "status", context)?
        .map(|s| s.parse::<AnalysisStatus>().map_err(DescriptionError::from))
        .transpose()
}

/// A list of strings, also accepting a single scalar
pub(crate) fn string_list(
    node: &Mapping,
    field: &str,
    context: &str,
) -> Result<Vec<String>, DescriptionError> {
    match node.get(key(field)) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s.clone()]),
        Some(Value::Sequence(items)) => items
            .iter()
            .map(|item| {
                asimov_merge::scalar_string(item).ok_or_else(|| {
                    DescriptionError::invalid(context, field, "must be a list of strings")
                })
            })
            .collect(),
        Some(_) => Err(DescriptionError::invalid(
            context,
            field,
            "must be a string or a list of strings",
        )),
    }
}

pub(crate) fn selector_list(
    node: &Mapping,
    field: &str,
    context: &str,
) -> Result<Vec<Selector>, DescriptionError> {
    string_list(node, field, context)?
        .iter()
        .map(|s| s.parse::<Selector>())
        .collect()
}

pub(crate) fn mapping_field(
    node: &Mapping,
    field: &str,
    context: &str,
) -> Result<Mapping, DescriptionError> {
    match node.get(key(field)) {
        None | Some(Value::Null) => Ok(Mapping::new()),
        Some(Value::Mapping(m)) => Ok(m.clone()),
        Some(_) => Err(DescriptionError::invalid(context, field, "must be a mapping")),
    }
}

pub(crate) fn sequence_value(items: &[String]) -> Value {
    Value::Sequence(items.iter().map(|s| Value::String(s.clone())).collect())
}

/// Everything in `node` except the structural keys
pub(crate) fn remainder(node: &Mapping, structural: &[&str]) -> Mapping {
    node.iter()
        .filter(|(k, _)| !k.as_str().is_some_and(|k| structural.contains(&k)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Read the cluster id from metadata
pub(crate) fn job_id_in(meta: &Mapping) -> Option<ClusterId> {
    match get_path_mapping(meta, JOB_ID_PATH)? {
        Value::Number(n) => n.as_u64().map(ClusterId),
        Value::String(s) => s.trim().parse::<u64>().ok().map(ClusterId),
        _ => None,
    }
}

pub(crate) fn set_job_id_in(meta: &mut Mapping, id: ClusterId) {
    set_path_mapping(meta, JOB_ID_PATH, Value::Number(id.0.into()));
}

pub(crate) fn clear_job_id_in(meta: &mut Mapping) {
    remove_path(meta, JOB_ID_PATH);
}

/// Move a top-level `job id` under `scheduler`
pub(crate) fn migrate_legacy_job_id(meta: &mut Mapping) {
    if let Some(legacy) = meta.remove(key(LEGACY_JOB_ID_KEY)) {
        if get_path_mapping(meta, JOB_ID_PATH).is_none() && !legacy.is_null() {
            tracing::debug!("Moving legacy job id under scheduler");
            set_path_mapping(meta, JOB_ID_PATH, legacy);
        }
    }
}
