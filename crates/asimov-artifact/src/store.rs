//! The results store proper
//!
//! Files are copied in, never moved or linked, and made read-only once
//! stored. The manifest is rewritten atomically after every accepted file, so
//! a crash between the copy and the rewrite leaves at most an orphan file
//! that a later [`ResultsStore::verify`] reports.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use uuid::Uuid;

use crate::hash::ContentHash;
use crate::manifest::{Manifest, ResourceRecord};

const MANIFEST_DIR: &str = ".manifest";
const MANIFEST_FILE: &str = "manifest.yaml";

/// Result of a successful [`ResultsStore::add_file`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResource {
    /// Name the resource is stored under
    pub name: String,
    /// Where the read-only copy lives
    pub path: PathBuf,
    /// Identifier recorded in the manifest
    pub uuid: Uuid,
    /// Digest recorded in the manifest
    pub hash: ContentHash,
}

/// Problem found by [`ResultsStore::verify`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityIssue {
    /// The manifest lists a file that is gone
    Missing {
        /// `subject/analysis/resource`
        location: String,
    },
    /// The file no longer matches its recorded digest
    Corrupted {
        /// `subject/analysis/resource`
        location: String,
        /// Digest in the manifest
        expected: ContentHash,
        /// Digest on disk
        actual: ContentHash,
    },
}

/// Store failures
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem failure
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path being accessed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// No manifest at the store root
    #[error("no results store at {0}")]
    NotInitialised(PathBuf),

    /// The same bytes are already stored somewhere
    #[error("resource with hash {hash} is already stored at {location}")]
    AlreadyPresent {
        /// Digest of the rejected file
        hash: ContentHash,
        /// Where the identical bytes live
        location: String,
    },

    /// A different resource already uses this name
    #[error("a resource named {location} already exists")]
    NameTaken {
        /// `subject/analysis/resource`
        location: String,
    },

    /// Stored bytes no longer match the manifest
    #[error("hash mismatch for {location}: expected {expected}, found {actual}")]
    HashMismatch {
        /// `subject/analysis/resource`
        location: String,
        /// Digest the caller or manifest expected
        expected: ContentHash,
        /// Digest on disk
        actual: ContentHash,
    },

    /// Unknown resource
    #[error("no resource {location} in the store")]
    NotFound {
        /// `subject/analysis/resource`
        location: String,
    },

    /// Unknown UUID
    #[error("no resource with uuid {0}")]
    UnknownUuid(Uuid),
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

fn location(subject: &str, analysis: &str, resource: &str) -> String {
    format!("{subject}/{analysis}/{resource}")
}

fn make_read_only(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o444))
    }
    #[cfg(not(unix))]
    {
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_readonly(true);
        fs::set_permissions(path, perms)
    }
}

fn make_writable(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o644))
    }
    #[cfg(not(unix))]
    {
        let mut perms = fs::metadata(path)?.permissions();
        #[allow(clippy::permissions_set_readonly_false)]
        perms.set_readonly(false);
        fs::set_permissions(path, perms)
    }
}

/// Content-addressed, write-once store rooted at a directory
#[derive(Debug)]
pub struct ResultsStore {
    root: PathBuf,
    manifest: Manifest,
}

impl ResultsStore {
    /// Create a new store, writing an empty manifest
    ///
    /// # Errors
    /// Returns [`StoreError::Io`] if the directories or manifest cannot be written
    pub fn create(root: impl Into<PathBuf>, name: &str) -> Result<Self, StoreError> {
        let root = root.into();
        let store = Self {
            manifest: Manifest::new(name),
            root,
        };
        let path = store.manifest_path();
        store
            .manifest
            .save(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        tracing::debug!("Created results store at {}", store.root.display());
        Ok(store)
    }

    /// Open an existing store
    ///
    /// # Errors
    /// [`StoreError::NotInitialised`] without a manifest, [`StoreError::Io`] if it is unreadable
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let path = root.join(MANIFEST_DIR).join(MANIFEST_FILE);
        if !path.exists() {
            return Err(StoreError::NotInitialised(root));
        }
        let manifest = Manifest::load(&path).map_err(|e| StoreError::io(&path, e))?;
        Ok(Self { root, manifest })
    }

    /// Open the store, creating it if it does not exist yet
    ///
    /// # Errors
    /// See [`ResultsStore::open`] and [`ResultsStore::create`]
    pub fn open_or_create(root: impl Into<PathBuf>, name: &str) -> Result<Self, StoreError> {
        let root = root.into();
        match Self::open(root.clone()) {
            Err(StoreError::NotInitialised(_)) => Self::create(root, name),
            other => other,
        }
    }

    /// Store root directory
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Current manifest
    #[must_use]
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_DIR).join(MANIFEST_FILE)
    }

    fn resource_path(&self, subject: &str, analysis: &str, resource: &str) -> PathBuf {
        self.root.join(subject).join(analysis).join(resource)
    }

    /// Copy a file into the store under `subject/analysis/<name>`.
    ///
    /// `new_name` renames the resource; otherwise the source file name is used.
    ///
    /// # Errors
    /// - [`StoreError::AlreadyPresent`] if identical bytes are already stored
    /// - [`StoreError::NameTaken`] if the name is used by different bytes
    /// - [`StoreError::Io`] on copy or manifest failures; the store is unchanged
    pub fn add_file(
        &mut self,
        subject: &str,
        analysis: &str,
        source: &Path,
        new_name: Option<&str>,
    ) -> Result<StoredResource, StoreError> {
        let hash = ContentHash::compute_file(source).map_err(|e| StoreError::io(source, e))?;
        if let Some((s, a, r)) = self.manifest.find_hash(&hash) {
            return Err(StoreError::AlreadyPresent {
                hash,
                location: location(s, a, r),
            });
        }

        let name = match new_name {
            Some(name) => name.to_string(),
            None => source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    StoreError::io(
                        source,
                        io::Error::new(io::ErrorKind::InvalidInput, "source has no file name"),
                    )
                })?,
        };
        if self.manifest.get(subject, analysis, &name).is_some() {
            return Err(StoreError::NameTaken {
                location: location(subject, analysis, &name),
            });
        }

        let dest = self.resource_path(subject, analysis, &name);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        if dest.exists() {
            // Orphan left behind by an interrupted add.
            tracing::warn!("Replacing unrecorded file {}", dest.display());
            make_writable(&dest).map_err(|e| StoreError::io(&dest, e))?;
            fs::remove_file(&dest).map_err(|e| StoreError::io(&dest, e))?;
        }
        fs::copy(source, &dest).map_err(|e| StoreError::io(&dest, e))?;
        make_read_only(&dest).map_err(|e| StoreError::io(&dest, e))?;

        let record = ResourceRecord {
            uuid: Uuid::new_v4(),
            hash,
        };
        let mut next = self.manifest.clone();
        next.insert(subject, analysis, &name, record);
        let manifest_path = self.manifest_path();
        if let Err(e) = next.save(&manifest_path) {
            if let Err(undo) = make_writable(&dest).and_then(|()| fs::remove_file(&dest)) {
                tracing::warn!(
                    "Manifest write failed; unrecorded file {} left behind: {}",
                    dest.display(),
                    undo
                );
            }
            return Err(StoreError::io(&manifest_path, e));
        }
        self.manifest = next;

        tracing::info!(
            "Stored {} ({})",
            location(subject, analysis, &name),
            hash.short()
        );
        Ok(StoredResource {
            name,
            path: dest,
            uuid: record.uuid,
            hash,
        })
    }

    /// Resolve a stored resource, verifying its bytes.
    ///
    /// When `expected` is given it must also match the recorded digest.
    ///
    /// # Errors
    /// [`StoreError::NotFound`] for unknown resources, [`StoreError::HashMismatch`]
    /// when the bytes on disk or the caller's expectation disagree with the manifest
    pub fn fetch_file(
        &self,
        subject: &str,
        analysis: &str,
        resource: &str,
        expected: Option<&ContentHash>,
    ) -> Result<PathBuf, StoreError> {
        let loc = location(subject, analysis, resource);
        let record = self
            .manifest
            .get(subject, analysis, resource)
            .ok_or_else(|| StoreError::NotFound {
                location: loc.clone(),
            })?;
        if let Some(expected) = expected {
            if *expected != record.hash {
                return Err(StoreError::HashMismatch {
                    location: loc,
                    expected: *expected,
                    actual: record.hash,
                });
            }
        }
        let path = self.resource_path(subject, analysis, resource);
        let actual = ContentHash::compute_file(&path).map_err(|e| StoreError::io(&path, e))?;
        if actual != record.hash {
            return Err(StoreError::HashMismatch {
                location: loc,
                expected: record.hash,
                actual,
            });
        }
        Ok(path)
    }

    /// Resolve a resource by UUID
    ///
    /// # Errors
    /// [`StoreError::UnknownUuid`] if no resource carries this UUID
    pub fn fetch_uuid(&self, uuid: &Uuid) -> Result<PathBuf, StoreError> {
        let (s, a, r) = self
            .manifest
            .find_uuid(uuid)
            .ok_or(StoreError::UnknownUuid(*uuid))?;
        Ok(self.resource_path(s, a, r))
    }

    /// Resources stored for one analysis
    #[must_use]
    pub fn list_resources(
        &self,
        subject: &str,
        analysis: &str,
    ) -> IndexMap<String, ResourceRecord> {
        self.manifest
            .resources(subject, analysis)
            .cloned()
            .unwrap_or_default()
    }

    /// Re-hash every stored file and report anything that drifted
    #[must_use]
    pub fn verify(&self) -> Vec<IntegrityIssue> {
        let mut issues = Vec::new();
        for (subject, analysis, resource, record) in self.manifest.iter() {
            let path = self.resource_path(subject, analysis, resource);
            let loc = location(subject, analysis, resource);
            match ContentHash::compute_file(&path) {
                Err(_) => issues.push(IntegrityIssue::Missing { location: loc }),
                Ok(actual) if actual != record.hash => issues.push(IntegrityIssue::Corrupted {
                    location: loc,
                    expected: record.hash,
                    actual,
                }),
                Ok(_) => {}
            }
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ResultsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultsStore::create(dir.path().join("results"), "project").unwrap();
        (dir, store)
    }

    fn source(dir: &TempDir, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_add_then_fetch() {
        let (dir, mut store) = setup();
        let src = source(&dir, "posterior.dat", b"samples");

        let stored = store.add_file("S0", "A0", &src, None).unwrap();
        assert_eq!(stored.name, "posterior.dat");
        assert_eq!(stored.hash, ContentHash::compute(b"samples"));

        let path = store
            .fetch_file("S0", "A0", "posterior.dat", Some(&stored.hash))
            .unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"samples");
        assert!(fs::metadata(&path).unwrap().permissions().readonly());
        assert!(src.exists(), "source must be copied, not moved");
    }

    #[test]
    fn test_manifest_persisted() {
        let (dir, mut store) = setup();
        let src = source(&dir, "a.txt", b"a");
        let stored = store.add_file("S0", "A0", &src, Some("renamed.txt")).unwrap();

        let reopened = ResultsStore::open(store.root().to_path_buf()).unwrap();
        assert_eq!(
            reopened.list_resources("S0", "A0").get("renamed.txt").map(|r| r.uuid),
            Some(stored.uuid)
        );
        assert_eq!(reopened.fetch_uuid(&stored.uuid).unwrap(), stored.path);
    }

    #[test]
    fn test_failed_manifest_write_removes_payload() {
        let (dir, mut store) = setup();
        let src = source(&dir, "a.txt", b"a");
        let staging = store.root().join(MANIFEST_DIR).join("manifest.yaml.tmp");
        fs::create_dir(&staging).unwrap();

        assert!(store.add_file("S0", "A0", &src, None).is_err());
        assert!(!store.root().join("S0/A0/a.txt").exists());
        assert!(store.list_resources("S0", "A0").is_empty());

        fs::remove_dir(&staging).unwrap();
        assert!(store.add_file("S0", "A0", &src, None).is_ok());
    }

    #[test]
    fn test_duplicate_bytes_rejected() {
        let (dir, mut store) = setup();
        let first = source(&dir, "one.txt", b"same");
        let second = source(&dir, "two.txt", b"same");

        store.add_file("S0", "A0", &first, None).unwrap();
        let err = store.add_file("S0", "A1", &second, None).unwrap_err();
        assert!(matches!(
            err,
            StoreError::AlreadyPresent { ref location, .. } if location == "S0/A0/one.txt"
        ));
        assert_eq!(store.manifest().len(), 1);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let (dir, mut store) = setup();
        let first = source(&dir, "one.txt", b"first");
        let second = source(&dir, "two.txt", b"second");

        store.add_file("S0", "A0", &first, Some("result.txt")).unwrap();
        let err = store
            .add_file("S0", "A0", &second, Some("result.txt"))
            .unwrap_err();
        assert!(matches!(err, StoreError::NameTaken { .. }));
    }

    #[test]
    fn test_tampering_detected() {
        let (dir, mut store) = setup();
        let src = source(&dir, "a.txt", b"original");
        let stored = store.add_file("S0", "A0", &src, None).unwrap();

        make_writable(&stored.path).unwrap();
        fs::write(&stored.path, b"tampered").unwrap();

        let err = store.fetch_file("S0", "A0", "a.txt", None).unwrap_err();
        assert!(matches!(err, StoreError::HashMismatch { .. }));
        assert_eq!(store.verify().len(), 1);
    }

    #[test]
    fn test_wrong_expected_hash() {
        let (dir, mut store) = setup();
        let src = source(&dir, "a.txt", b"original");
        store.add_file("S0", "A0", &src, None).unwrap();

        let other = ContentHash::compute(b"other");
        let err = store
            .fetch_file("S0", "A0", "a.txt", Some(&other))
            .unwrap_err();
        assert!(matches!(err, StoreError::HashMismatch { expected, .. } if expected == other));
    }

    #[test]
    fn test_unknown_resource() {
        let (_dir, store) = setup();
        assert!(matches!(
            store.fetch_file("S0", "A0", "nope", None),
            Err(StoreError::NotFound { .. })
        ));
        assert!(store.list_resources("S0", "A0").is_empty());
        assert!(store.verify().is_empty());
    }

    #[test]
    fn test_open_missing_store() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ResultsStore::open(dir.path().join("nothing")),
            Err(StoreError::NotInitialised(_))
        ));
    }
}
