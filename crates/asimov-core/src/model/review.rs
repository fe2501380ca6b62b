//! Review log
//!
//! An append-only sequence of timestamped messages. The review status of an
//! analysis is the status of the most recent message that carries one.

use std::fmt;
use std::str::FromStr;

use asimov_merge::{Mapping, Value};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{key, string_field};
use crate::error::DescriptionError;

/// Verdict attached to a review message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReviewStatus {
    /// Results should not be used
    Rejected,
    /// Results are fit for use
    Approved,
    /// The analysis to use for this subject
    Preferred,
    /// Superseded by another analysis
    Deprecated,
}

impl ReviewStatus {
    /// Upper-case wire form
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rejected => "REJECTED",
            Self::Approved => "APPROVED",
            Self::Preferred => "PREFERRED",
            Self::Deprecated => "DEPRECATED",
        }
    }
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReviewStatus {
    type Err = DescriptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "REJECTED" => Ok(Self::Rejected),
            "APPROVED" => Ok(Self::Approved),
            "PREFERRED" => Ok(Self::Preferred),
            "DEPRECATED" => Ok(Self::Deprecated),
            _ => Err(DescriptionError::UnknownReviewStatus(s.to_string())),
        }
    }
}

/// One entry in a review log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewMessage {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub status: Option<ReviewStatus>,
}

impl ReviewMessage {
    /// Message stamped with the current time
    pub fn new(message: impl Into<String>, status: Option<ReviewStatus>) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
            status,
        }
    }

    /// Override the timestamp
    #[inline]
    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    fn from_node(node: &Mapping) -> Result<Self, DescriptionError> {
        let context = "review message";
        let timestamp = match string_field(node, "timestamp", context)? {
            Some(text) => parse_timestamp(&text).ok_or_else(|| {
                let reason = format!("'{text}' is not a timestamp");
                DescriptionError::invalid(context, "timestamp", reason)
            })?,
            None => return Err(DescriptionError::missing(context, "timestamp")),
        };
        let message = string_field(node, "message", context)?.unwrap_or_default();
        let status = match string_field(node, "status", context)? {
            Some(s) if !s.trim().is_empty() => Some(s.parse()?),
            _ => None,
        };
        Ok(Self {
            timestamp,
            message,
            status,
        })
    }

    fn to_node(&self) -> Value {
        let mut node = Mapping::new();
        node.insert(key("timestamp"), Value::String(self.timestamp.to_rfc3339()));
        node.insert(key("message"), Value::String(self.message.clone()));
        if let Some(status) = self.status {
            node.insert(key("status"), Value::String(status.as_str().to_string()));
        }
        Value::Mapping(node)
    }
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text.trim()) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text.trim(), format).ok())
        .map(|naive| naive.and_utc())
}

/// Ordered review log
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Review {
    messages: Vec<ReviewMessage>,
}

impl Review {
    /// Empty review log
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message, keeping the log ordered by timestamp
    pub fn add(&mut self, message: ReviewMessage) {
        let at = self
            .messages
            .partition_point(|m| m.timestamp <= message.timestamp);
        self.messages.insert(at, message);
    }

    /// Effective review status
    #[must_use]
    pub fn status(&self) -> Option<ReviewStatus> {
        self.messages.iter().rev().find_map(|m| m.status)
    }

    /// Messages sorted by timestamp
    pub fn messages(&self) -> &[ReviewMessage] {
        &self.messages
    }

    /// True when nothing has been reviewed
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Add every message of `other` not already present
    pub fn absorb(&mut self, other: &Review) {
        for message in &other.messages {
            if !self.messages.contains(message) {
                self.add(message.clone());
            }
        }
    }

    pub(crate) fn from_value(
        value: Option<&Value>,
        context: &str,
    ) -> Result<Self, DescriptionError> {
        let mut review = Self::new();
        match value {
            None | Some(Value::Null) => {}
            Some(Value::Sequence(items)) => {
                for item in items {
                    let Value::Mapping(node) = item else {
                        return Err(DescriptionError::invalid(
                            context,
                            "review",
                            "entries must be mappings",
                        ));
                    };
                    review.add(ReviewMessage::from_node(node)?);
                }
            }
            Some(_) => {
                return Err(DescriptionError::invalid(context, "review", "must be a list"));
            }
        }
        Ok(review)
    }

    pub(crate) fn to_value(&self) -> Value {
        Value::Sequence(self.messages.iter().map(ReviewMessage::to_node).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_effective_status_is_last_non_empty() {
        let mut review = Review::new();
        review.add(ReviewMessage::new("looks fine", Some(ReviewStatus::Approved)).at(at(1)));
        review.add(ReviewMessage::new("note only", None).at(at(3)));
        assert_eq!(review.status(), Some(ReviewStatus::Approved));

        review.add(ReviewMessage::new("bad psd", Some(ReviewStatus::Rejected)).at(at(2)));
        assert_eq!(review.status(), Some(ReviewStatus::Rejected));
        assert_eq!(review.messages()[1].message, "bad psd");
    }

    #[test]
    fn test_round_trip_through_value() {
        let mut review = Review::new();
        review.add(ReviewMessage::new("preferred run", Some(ReviewStatus::Preferred)).at(at(4)));
        let parsed = Review::from_value(Some(&review.to_value()), "test").unwrap();
        assert_eq!(parsed, review);
    }

    #[test]
    fn test_legacy_timestamp_and_unknown_status() {
        let value: Value = serde_yaml::from_str(
            "- {timestamp: '2023-01-02 10:11:12', message: ok, status: approved}",
        )
        .unwrap();
        let review = Review::from_value(Some(&value), "test").unwrap();
        assert_eq!(review.status(), Some(ReviewStatus::Approved));

        let value: Value =
            serde_yaml::from_str("- {timestamp: '2023-01-02 10:11:12', status: MAYBE}").unwrap();
        assert!(matches!(
            Review::from_value(Some(&value), "test"),
            Err(DescriptionError::UnknownReviewStatus(_))
        ));
    }
}
