//! Structural diff: the part of a target that a base does not already supply

use serde_yaml::{Mapping, Value};

/// Return the subset of `target` that differs from `base`.
///
/// For two mappings this keeps every key whose value is absent from, or
/// different in, `base`; nested mappings are diffed recursively and dropped
/// when nothing inside them differs. For anything else the whole target is
/// returned, so `merge(base, diff(base, target)) == merge(base, target)`.
#[must_use]
pub fn diff(base: &Value, target: &Value) -> Value {
    match (base, target) {
        (Value::Mapping(base_map), Value::Mapping(target_map)) => {
            Value::Mapping(diff_mapping(base_map, target_map))
        }
        (_, target) => target.clone(),
    }
}

/// Mapping-level form of [`diff`].
#[must_use]
pub fn diff_mapping(base: &Mapping, target: &Mapping) -> Mapping {
    let mut out = Mapping::new();
    for (key, value) in target {
        match base.get(key) {
            Some(existing) if existing == value => {}
            Some(Value::Mapping(existing)) => {
                if let Value::Mapping(nested) = value {
                    let inner = diff_mapping(existing, nested);
                    if !inner.is_empty() {
                        out.insert(key.clone(), Value::Mapping(inner));
                    }
                } else {
                    out.insert(key.clone(), value.clone());
                }
            }
            _ => {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge;
    use pretty_assertions::assert_eq;

    fn yaml(text: &str) -> Value {
        serde_yaml::from_str(text).unwrap()
    }

    #[test]
    fn test_equal_trees_have_empty_diff() {
        let tree = yaml("priors: {q: [0, 1]}\nsampler: {nlive: 500}");
        assert_eq!(diff(&tree, &tree), Value::Mapping(Mapping::new()));
    }

    #[test]
    fn test_only_differences_survive() {
        let base = yaml("priors: {q: [0, 1], chirp: 10}");
        let target = yaml("priors: {q: [0, 1], chirp: 12}\nextra: true");
        assert_eq!(diff(&base, &target), yaml("priors: {chirp: 12}\nextra: true"));
    }

    #[test]
    fn test_sequence_change_kept_whole() {
        let base = yaml("ifos: [H1, L1]");
        let target = yaml("ifos: [H1, L1, V1]");
        assert_eq!(diff(&base, &target), target);
    }

    #[test]
    fn test_diff_reconstructs_target_under_merge() {
        let base = yaml("a: {b: 1, c: {d: 2}}\ne: 3");
        let target = yaml("a: {b: 1, c: {d: 4}}\nf: 5");
        assert_eq!(merge(&base, &diff(&base, &target)), merge(&base, &target));
    }
}
