//! Recursive right-biased merge

use serde_yaml::{Mapping, Value};

/// Merge `overlay` on top of `base`.
///
/// When both sides are mappings the result holds every key of either side;
/// keys present on both sides are merged recursively. In every other case
/// the overlay wins, including sequences and explicit nulls.
#[must_use]
pub fn merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            Value::Mapping(merge_mapping(base_map, overlay_map))
        }
        (_, overlay) => overlay.clone(),
    }
}

/// Mapping-level form of [`merge`].
#[must_use]
pub fn merge_mapping(base: &Mapping, overlay: &Mapping) -> Mapping {
    let mut merged = base.clone();
    for (key, value) in overlay {
        let next = match merged.get(key) {
            Some(existing) => merge(existing, value),
            None => value.clone(),
        };
        merged.insert(key.clone(), next);
    }
    merged
}

/// Fold a stack of layers, lowest precedence first.
#[must_use]
pub fn merge_all<'a, I>(layers: I) -> Mapping
where
    I: IntoIterator<Item = &'a Mapping>,
{
    layers
        .into_iter()
        .fold(Mapping::new(), |acc, layer| merge_mapping(&acc, layer))
}
