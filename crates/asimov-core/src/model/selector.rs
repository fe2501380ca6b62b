//! Attribute selectors
//!
//! Grammar shared by `needs`, project analyses and post-processing:
//!
//! ```text
//! A0                        name equals A0
//! pipeline:bayeswave        attribute equals value
//! waveform.approximant:X    dotted path into resolved metadata
//! !status:cancelled         negation
//! ```
//!
//! Comparison is case-insensitive on trimmed string forms. A missing
//! attribute never matches, so its negation always does.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::DescriptionError;

/// Something selectors can be evaluated against
pub trait Selectable {
    /// String form of an attribute or dotted metadata path
    fn attribute(&self, key: &str) -> Option<String>;
}

/// One `[!]key:value` predicate
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Selector {
    key: String,
    value: String,
    negated: bool,
}

impl Selector {
    /// Name equality
    pub fn name(value: impl Into<String>) -> Self {
        Self::new("name", value)
    }

    /// Equality selector on `key`
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            negated: false,
        }
    }

    /// Invert the predicate
    #[inline]
    #[must_use]
    pub fn negate(mut self) -> Self {
        self.negated = !self.negated;
        self
    }

    /// Attribute or dotted metadata path
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Expected value
    pub fn value(&self) -> &str {
        &self.value
    }

    /// True for `!key:value`
    pub fn is_negated(&self) -> bool {
        self.negated
    }

    /// Evaluate against a target
    pub fn matches<T: Selectable + ?Sized>(&self, target: &T) -> bool {
        let hit = target
            .attribute(&self.key)
            .is_some_and(|actual| actual.trim().eq_ignore_ascii_case(self.value.trim()));
        hit != self.negated
    }

    /// Conjunction; an empty list matches everything
    pub fn matches_all<T: Selectable + ?Sized>(selectors: &[Selector], target: &T) -> bool {
        selectors.iter().all(|s| s.matches(target))
    }
}

impl FromStr for Selector {
    type Err = DescriptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        let (negated, body) = match text.strip_prefix('!') {
            Some(rest) => (true, rest.trim_start()),
            None => (false, text),
        };
        let (key, value) = match body.split_once(':') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => ("name", body),
        };
        if key.is_empty() || value.is_empty() {
            return Err(DescriptionError::InvalidSelector(s.to_string()));
        }
        Ok(Self {
            key: key.to_string(),
            value: value.to_string(),
            negated,
        })
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negated {
            f.write_str("!")?;
        }
        if self.key == "name" {
            f.write_str(&self.value)
        } else {
            write!(f, "{}:{}", self.key, self.value)
        }
    }
}

impl Serialize for Selector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Selector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
