//! Metadata resolution and diff-aware compression
//!
//! Resolution folds, lowest precedence first:
//!
//! ```text
//! pipelines.<tag>  ->  project defaults  ->  subject  ->  analysis
//! ```
//!
//! Compression is the inverse used on save: within the inherited sections,
//! any key whose value equals what the node would inherit is dropped.

use asimov_merge::{diff, merge_all, Mapping, Value};

use crate::model::key;
use crate::model::ReviewStatus;

/// Sections that inherit from project defaults and are compressed on save
pub const INHERITED_SECTIONS: [&str; 6] =
    ["priors", "sampler", "likelihood", "quality", "data", "scheduler"];

/// Sections present in every resolved analysis
pub const REQUIRED_SECTIONS: [&str; 6] =
    ["scheduler", "sampler", "review", "quality", "likelihood", "priors"];

/// Merge the layers and ensure the required sections exist
pub fn resolve(layers: &[&Mapping]) -> Mapping {
    let mut resolved = merge_all(layers.iter().copied());
    ensure_sections(&mut resolved);
    resolved
}

/// Insert an empty mapping for every missing required section
pub fn ensure_sections(meta: &mut Mapping) {
    for section in REQUIRED_SECTIONS {
        let entry = meta
            .entry(key(section))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        if entry.is_null() {
            *entry = Value::Mapping(Mapping::new());
        }
    }
}

/// Record the effective review status in the resolved `review` section
pub fn set_review_status(meta: &mut Mapping, status: Option<ReviewStatus>) {
    if let Some(Value::Mapping(review)) = meta.get_mut(key("review")) {
        match status {
            Some(status) => {
                review.insert(key("status"), Value::String(status.as_str().to_string()));
            }
            None => {
                review.remove(key("status"));
            }
        }
    }
}

/// Drop inherited values from a node's own metadata
///
/// Only [`INHERITED_SECTIONS`] are touched; a section that becomes empty is
/// removed.
pub fn compress(inherited: &Mapping, own: &Mapping) -> Mapping {
    let mut out = Mapping::new();
    for (k, value) in own {
        let section = k.as_str().filter(|k| INHERITED_SECTIONS.contains(k));
        let Some(base) = section.and_then(|_| inherited.get(k)) else {
            out.insert(k.clone(), value.clone());
            continue;
        };
        if base == value {
            continue;
        }
        match diff(base, value) {
            Value::Mapping(m) if m.is_empty() => {}
            reduced => {
                out.insert(k.clone(), reduced);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use asimov_merge::get_path_mapping;
    use pretty_assertions::assert_eq;

    fn mapping(text: &str) -> Mapping {
        serde_yaml::from_str(text).unwrap()
    }

    #[test]
    fn test_precedence() {
        let pipeline = mapping("sampler: {nlive: 500, npool: 4}\npriors: {q: [0, 1]}");
        let project = mapping("sampler: {nlive: 1000}\nquality: {minimum frequency: 20}");
        let subject = mapping("quality: {minimum frequency: 18}");
        let analysis = mapping("sampler: {npool: 16}");

        let resolved = resolve(&[&pipeline, &project, &subject, &analysis]);
        let at = |path: &str| get_path_mapping(&resolved, path).cloned();
        assert_eq!(at("sampler.nlive"), Some(Value::from(1000)));
        assert_eq!(at("sampler.npool"), Some(Value::from(16)));
        assert_eq!(at("quality.minimum frequency"), Some(Value::from(18)));
        assert_eq!(at("priors.q"), Some(serde_yaml::from_str("[0, 1]").unwrap()));
        for section in REQUIRED_SECTIONS {
            assert!(resolved.get(key(section)).is_some_and(Value::is_mapping));
        }
    }

    #[test]
    fn test_compress_drops_inherited_keys() {
        let inherited =
            mapping("priors: {q: [0, 1], chirp mass: [20, 40]}\nsampler: {nlive: 1000}");
        let own = mapping(
            "priors: {q: [0, 1], chirp mass: [10, 40]}\nsampler: {nlive: 1000}\n\
             waveform: {approximant: X}",
        );
        let compressed = compress(&inherited, &own);
        assert_eq!(
            compressed,
            mapping("priors: {chirp mass: [10, 40]}\nwaveform: {approximant: X}")
        );

        let resolved_before = resolve(&[&inherited, &own]);
        let resolved_after = resolve(&[&inherited, &compressed]);
        assert_eq!(resolved_before, resolved_after);
    }

    #[test]
    fn test_compress_leaves_other_sections() {
        let inherited = mapping("waveform: {approximant: X}");
        let own = mapping("waveform: {approximant: X}");
        assert_eq!(compress(&inherited, &own), own);
    }

    #[test]
    fn test_review_status() {
        let mut meta = resolve(&[]);
        set_review_status(&mut meta, Some(ReviewStatus::Approved));
        assert_eq!(
            get_path_mapping(&meta, "review.status"),
            Some(&Value::String("APPROVED".into()))
        );
    }
}
