//! Results manifest: the index of every stored resource

use std::fs;
use std::io;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fs::write_atomic;
use crate::hash::ContentHash;

/// What the manifest remembers about one stored file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Stable identifier, independent of the resource's location
    pub uuid: Uuid,
    /// Digest of the bytes at the time they were stored
    pub hash: ContentHash,
}

type Resources = IndexMap<String, ResourceRecord>;
type Analyses = IndexMap<String, Resources>;

/// Nested `subject -> analysis -> resource` index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Store name, normally the project name
    pub name: String,
    #[serde(default)]
    events: IndexMap<String, Analyses>,
}

impl Manifest {
    /// Empty manifest for a new store
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: IndexMap::new(),
        }
    }

    /// Read a manifest from disk
    ///
    /// # Errors
    /// I/O failures, or `InvalidData` when the YAML does not describe a manifest
    pub fn load(path: &Path) -> io::Result<Self> {
        let text = fs::read_to_string(path)?;
        serde_yaml::from_str(&text).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Persist the manifest atomically
    ///
    /// # Errors
    /// Returns the I/O error; the previous manifest stays in place on failure
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let text = serde_yaml::to_string(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_atomic(path, text.as_bytes())
    }

    /// Look up one resource
    #[must_use]
    pub fn get(&self, subject: &str, analysis: &str, resource: &str) -> Option<&ResourceRecord> {
        self.events.get(subject)?.get(analysis)?.get(resource)
    }

    /// Record a resource, replacing any previous record under the same name
    pub fn insert(
        &mut self,
        subject: &str,
        analysis: &str,
        resource: &str,
        record: ResourceRecord,
    ) {
        self.events
            .entry(subject.to_string())
            .or_default()
            .entry(analysis.to_string())
            .or_default()
            .insert(resource.to_string(), record);
    }

    /// Resources stored for one analysis, in insertion order
    #[must_use]
    pub fn resources(
        &self,
        subject: &str,
        analysis: &str,
    ) -> Option<&IndexMap<String, ResourceRecord>> {
        self.events.get(subject)?.get(analysis)
    }

    /// Every `(subject, analysis, resource, record)` in the manifest
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &str, &ResourceRecord)> {
        self.events.iter().flat_map(|(subject, analyses)| {
            analyses.iter().flat_map(move |(analysis, resources)| {
                resources.iter().map(move |(name, record)| {
                    (subject.as_str(), analysis.as_str(), name.as_str(), record)
                })
            })
        })
    }

    /// Find where a digest is already stored
    #[must_use]
    pub fn find_hash(&self, hash: &ContentHash) -> Option<(&str, &str, &str)> {
        self.iter()
            .find(|(_, _, _, record)| record.hash == *hash)
            .map(|(s, a, r, _)| (s, a, r))
    }

    /// Find a resource by its UUID
    #[must_use]
    pub fn find_uuid(&self, uuid: &Uuid) -> Option<(&str, &str, &str)> {
        self.iter()
            .find(|(_, _, _, record)| record.uuid == *uuid)
            .map(|(s, a, r, _)| (s, a, r))
    }

    /// Number of stored resources
    #[must_use]
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// True when nothing has been stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(data: &[u8]) -> ResourceRecord {
        ResourceRecord {
            uuid: Uuid::new_v4(),
            hash: ContentHash::compute(data),
        }
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut manifest = Manifest::new("project");
        let rec = record(b"samples");
        manifest.insert("S0", "A0", "samples.dat", rec);

        assert_eq!(manifest.get("S0", "A0", "samples.dat"), Some(&rec));
        assert_eq!(manifest.get("S0", "A1", "samples.dat"), None);
        assert_eq!(
            manifest.find_hash(&rec.hash),
            Some(("S0", "A0", "samples.dat"))
        );
        assert_eq!(
            manifest.find_uuid(&rec.uuid),
            Some(("S0", "A0", "samples.dat"))
        );
        assert_eq!(manifest.len(), 1);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".manifest/manifest.yaml");

        let mut manifest = Manifest::new("project");
        manifest.insert("S0", "A0", "a.txt", record(b"a"));
        manifest.insert("S0", "A0", "b.txt", record(b"b"));
        manifest.save(&path).unwrap();

        let loaded = Manifest::load(&path).unwrap();
        assert_eq!(loaded, manifest);
        let names: Vec<_> = loaded
            .resources("S0", "A0")
            .unwrap()
            .keys()
            .cloned()
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
    }
}
