//! Dotted-path access into YAML trees
//!
//! Paths are split on `.`; each segment addresses a string key of a mapping.
//! Keys containing spaces (`job id`) are ordinary segments.

use serde_yaml::{Mapping, Value};

fn key(segment: &str) -> Value {
    Value::String(segment.to_string())
}

/// Look up a dotted path.
#[must_use]
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        match current {
            Value::Mapping(map) => current = map.get(key(segment))?,
            _ => return None,
        }
    }
    Some(current)
}

/// Look up a dotted path starting from a mapping.
#[must_use]
pub fn get_path_mapping<'a>(map: &'a Mapping, path: &str) -> Option<&'a Value> {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    let value = map.get(key(head))?;
    match rest {
        Some(rest) => get_path(value, rest),
        None => Some(value),
    }
}

/// Set a dotted path, creating intermediate mappings.
///
/// Intermediate non-mapping values on the way are replaced by mappings.
pub fn set_path(value: &mut Value, path: &str, new_value: Value) {
    if !value.is_mapping() {
        *value = Value::Mapping(Mapping::new());
    }
    if let Value::Mapping(map) = value {
        set_path_mapping(map, path, new_value);
    }
}

/// Mapping-level form of [`set_path`].
pub fn set_path_mapping(map: &mut Mapping, path: &str, new_value: Value) {
    match path.split_once('.') {
        None => {
            map.insert(key(path), new_value);
        }
        Some((head, rest)) => {
            let entry = map
                .entry(key(head))
                .or_insert_with(|| Value::Mapping(Mapping::new()));
            set_path(entry, rest, new_value);
        }
    }
}

/// Remove a dotted path, returning the removed value.
///
/// Parent mappings are left in place even when they become empty.
pub fn remove_path(map: &mut Mapping, path: &str) -> Option<Value> {
    match path.split_once('.') {
        None => map.remove(key(path)),
        Some((head, rest)) => match map.get_mut(key(head))? {
            Value::Mapping(inner) => remove_path(inner, rest),
            _ => None,
        },
    }
}

/// Render a scalar as a string for comparisons.
///
/// Mappings, sequences and nulls have no scalar form.
#[must_use]
pub fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Tagged(tagged) => scalar_string(&tagged.value),
        Value::Null | Value::Sequence(_) | Value::Mapping(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(text: &str) -> Value {
        serde_yaml::from_str(text).unwrap()
    }

    #[test]
    fn test_get_nested() {
        let tree = yaml("scheduler: {job id: 42, accounting: {group: cbc}}");
        assert_eq!(get_path(&tree, "scheduler.job id"), Some(&yaml("42")));
        assert_eq!(
            get_path(&tree, "scheduler.accounting.group"),
            Some(&yaml("cbc"))
        );
        assert_eq!(get_path(&tree, "scheduler.missing"), None);
        assert_eq!(get_path(&tree, "scheduler.job id.deeper"), None);
    }

    #[test]
    fn test_set_creates_parents() {
        let mut tree = Value::Null;
        set_path(&mut tree, "scheduler.job id", yaml("42"));
        assert_eq!(tree, yaml("scheduler: {job id: 42}"));
    }

    #[test]
    fn test_remove_leaves_parent() {
        let mut map: Mapping = serde_yaml::from_str("scheduler: {job id: 42}").unwrap();
        assert_eq!(remove_path(&mut map, "scheduler.job id"), Some(yaml("42")));
        assert_eq!(Value::Mapping(map), yaml("scheduler: {}"));
    }

    #[test]
    fn test_scalar_string() {
        assert_eq!(scalar_string(&yaml("12")), Some("12".to_string()));
        assert_eq!(scalar_string(&yaml("true")), Some("true".to_string()));
        assert_eq!(scalar_string(&yaml("[1]")), None);
    }
}
