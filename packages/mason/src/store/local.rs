//! Local filesystem-backed content-addressed storage.
//!
//! ## File structure
//!
//! Objects live at `{root}/{hex[0..2]}/{hex}` where `hex` is the digest of
//! the (unwrapped) payload. The stored file is a signed envelope; the name
//! is self-verifying against the payload inside.
//!
//! ## Atomic writes
//!
//! Writes go to a uuid-suffixed temp file in the destination directory and
//! are renamed into place, so concurrent writers of the same object are
//! harmless and readers never observe partial objects.
//!
//! ## Eviction
//!
//! Append-only in normal operation; [`LocalStore::gc`] removes
//! least-recently-used objects that no live action-cache entry references
//! until the store fits its byte budget. Access recency is tracked by
//! bumping the object file's mtime on read.

use std::{
    io,
    path::{Path, PathBuf},
};

use filetime::FileTime;
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::{
    envelope::{self, SigningKey, magic},
    error::{BuildError, BuildErrorKind, Result},
    hash::{Digest, hash_bytes},
    layout::sharded_path,
};

use super::ObjectStore;

/// Garbage collection policy: the byte budget the store must fit after a
/// collection pass.
#[derive(Clone, Copy, Debug, bon::Builder)]
pub struct GcPolicy {
    pub max_total_bytes: u64,
}

/// The local, authoritative cache store tier.
#[derive(Clone, Debug)]
pub struct LocalStore {
    root: PathBuf,
    key: SigningKey,
    max_object_bytes: Option<u64>,
}

impl LocalStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    #[instrument(skip(key))]
    pub fn open(root: impl Into<PathBuf> + std::fmt::Debug, key: SigningKey) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|err| BuildError::storage(format!("create store root {root:?}"), err))?;
        trace!(?root, "opened local store");
        Ok(Self {
            root,
            key,
            max_object_bytes: None,
        })
    }

    /// Refuse single objects larger than this many bytes with
    /// `StorageFull`.
    pub fn with_max_object_bytes(mut self, max: u64) -> Self {
        self.max_object_bytes = Some(max);
        self
    }

    fn object_path(&self, digest: &Digest) -> PathBuf {
        sharded_path(&self.root, &digest.to_hex())
    }

    /// Evict a corrupt object so it is recomputed rather than served again.
    fn evict(&self, digest: &Digest, reason: &str) {
        let path = self.object_path(digest);
        warn!(?digest, reason, "evicting corrupt cache object");
        if let Err(err) = std::fs::remove_file(&path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(?path, %err, "failed to evict corrupt object");
            }
        }
    }

    /// Total bytes currently stored, by file size.
    pub fn total_bytes(&self) -> Result<u64> {
        let mut total = 0;
        for entry in WalkDir::new(&self.root) {
            let entry = entry
                .map_err(|err| BuildError::storage("scan store", err.into()))?;
            if entry.file_type().is_file() {
                total += entry
                    .metadata()
                    .map_err(|err| BuildError::storage("stat store object", err.into()))?
                    .len();
            }
        }
        Ok(total)
    }

    /// Remove objects not referenced by `live`, least-recently-used first,
    /// until the store fits `policy.max_total_bytes`. Returns the number of
    /// evicted objects.
    #[instrument(skip(self, live))]
    pub fn gc(
        &self,
        policy: GcPolicy,
        live: &std::collections::BTreeSet<Digest>,
    ) -> Result<u64> {
        struct Candidate {
            path: PathBuf,
            digest: Option<Digest>,
            size: u64,
            accessed: FileTime,
        }

        let mut candidates = Vec::new();
        let mut total: u64 = 0;
        for entry in WalkDir::new(&self.root) {
            let entry = entry
                .map_err(|err| BuildError::storage("scan store", err.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let meta = entry
                .metadata()
                .map_err(|err| BuildError::storage("stat store object", err.into()))?;
            total += meta.len();
            let digest = entry
                .path()
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| Digest::from_hex(name).ok());
            candidates.push(Candidate {
                path: entry.path().to_path_buf(),
                digest,
                size: meta.len(),
                accessed: FileTime::from_last_modification_time(&meta),
            });
        }

        if total <= policy.max_total_bytes {
            return Ok(0);
        }

        // Least recently used first. Objects with unparseable names are
        // stray temp files and sort ahead of everything.
        candidates.sort_by_key(|c| (c.digest.is_some(), c.accessed));

        let mut evicted = 0;
        for candidate in candidates {
            if total <= policy.max_total_bytes {
                break;
            }
            if let Some(digest) = candidate.digest {
                if live.contains(&digest) {
                    continue;
                }
            }
            match std::fs::remove_file(&candidate.path) {
                Ok(()) => {
                    total = total.saturating_sub(candidate.size);
                    evicted += 1;
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(BuildError::storage(
                        format!("evict {:?}", candidate.path),
                        err,
                    ));
                }
            }
        }
        debug!(evicted, remaining_bytes = total, "store gc finished");
        Ok(evicted)
    }
}

impl ObjectStore for LocalStore {
    #[instrument(skip(self, bytes))]
    fn put(&self, bytes: &[u8]) -> Result<Digest> {
        let digest = hash_bytes(bytes);
        if let Some(max) = self.max_object_bytes {
            if bytes.len() as u64 > max {
                return Err(BuildError::new(BuildErrorKind::StorageFull {
                    needed: bytes.len() as u64,
                    budget: max,
                }));
            }
        }

        let path = self.object_path(&digest);
        if path.exists() {
            trace!(?digest, "object already stored");
            return Ok(digest);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| BuildError::storage(format!("create {parent:?}"), err))?;
        }

        let sealed = envelope::seal(magic::OBJECT, &self.key, bytes);
        let temp = temp_path(&path);
        std::fs::write(&temp, &sealed)
            .map_err(|err| BuildError::storage(format!("write {temp:?}"), err))?;
        match std::fs::rename(&temp, &path) {
            Ok(()) => {
                trace!(?digest, bytes = bytes.len(), "stored object");
                Ok(digest)
            }
            Err(err) => {
                let _ = std::fs::remove_file(&temp);
                // A concurrent writer beat us to it; the content is
                // identical by construction.
                if path.exists() {
                    Ok(digest)
                } else {
                    Err(BuildError::storage(format!("rename into {path:?}"), err))
                }
            }
        }
    }

    #[instrument(skip(self))]
    fn get(&self, digest: &Digest) -> Result<Option<Vec<u8>>> {
        let path = self.object_path(digest);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(BuildError::storage(format!("read {path:?}"), err)),
        };

        let unsealed = match envelope::open(magic::OBJECT, &self.key, &bytes) {
            Ok(unsealed) => unsealed,
            Err(err) => {
                self.evict(digest, "envelope verification failed");
                return Err(err.context("read store object", digest));
            }
        };
        if hash_bytes(&unsealed.payload) != *digest {
            self.evict(digest, "payload digest does not match name");
            return Err(BuildError::new(BuildErrorKind::CacheCorrupted {
                detail: format!("object {digest} payload hash mismatch"),
            }));
        }

        // Bump recency for LRU eviction. Best effort.
        let _ = filetime::set_file_mtime(&path, FileTime::now());
        Ok(Some(unsealed.payload))
    }

    fn has(&self, digest: &Digest) -> Result<bool> {
        let path = self.object_path(digest);
        match std::fs::metadata(&path) {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(BuildError::storage(format!("stat {path:?}"), err)),
        }
    }

    fn delete(&self, digest: &Digest) -> Result<()> {
        let path = self.object_path(digest);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(BuildError::storage(format!("delete {path:?}"), err)),
        }
    }
}

/// Generate a temporary file path in the same directory as the target, so
/// the final rename never crosses a filesystem boundary.
fn temp_path(target: &Path) -> PathBuf {
    let mut temp = target.as_os_str().to_owned();
    temp.push(".tmp.");
    temp.push(Uuid::new_v4().to_string());
    PathBuf::from(temp)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use pretty_assertions::assert_eq;

    use super::*;

    fn store() -> (LocalStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let key = SigningKey::derive("/test/workspace", "test-machine");
        let store = LocalStore::open(dir.path().join("objects"), key).unwrap();
        (store, dir)
    }

    #[test]
    fn round_trip() {
        let (store, _dir) = store();
        let digest = store.put(b"artifact bytes").unwrap();
        assert!(store.has(&digest).unwrap());
        let bytes = store.get(&digest).unwrap().unwrap();
        assert_eq!(bytes, b"artifact bytes");
    }

    #[test]
    fn put_is_idempotent() {
        let (store, _dir) = store();
        let one = store.put(b"same").unwrap();
        let two = store.put(b"same").unwrap();
        assert_eq!(one, two);
    }

    #[test]
    fn missing_object_is_none() {
        let (store, _dir) = store();
        let digest = hash_bytes(b"never stored");
        assert_eq!(store.get(&digest).unwrap(), None);
        assert!(!store.has(&digest).unwrap());
    }

    #[test]
    fn corrupted_object_is_evicted_not_served() {
        let (store, _dir) = store();
        let digest = store.put(b"will corrupt").unwrap();

        // Flip a payload byte on disk.
        let path = store.object_path(&digest);
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let err = store.get(&digest).unwrap_err();
        assert!(matches!(err.kind(), BuildErrorKind::CacheCorrupted { .. }));
        assert!(!store.has(&digest).unwrap(), "corrupt object was evicted");
    }

    #[test]
    fn oversized_object_is_storage_full() {
        let (store, _dir) = store();
        let store = store.with_max_object_bytes(4);
        let err = store.put(b"too large for budget").unwrap_err();
        assert!(matches!(err.kind(), BuildErrorKind::StorageFull { .. }));
    }

    #[test]
    fn gc_respects_live_set_and_budget() {
        let (store, _dir) = store();
        let live_digest = store.put(b"live object").unwrap();
        let dead_digest = store.put(b"dead object").unwrap();

        let live: BTreeSet<Digest> = [live_digest].into();
        let evicted = store
            .gc(GcPolicy::builder().max_total_bytes(0).build(), &live)
            .unwrap();

        assert_eq!(evicted, 1);
        assert!(store.has(&live_digest).unwrap());
        assert!(!store.has(&dead_digest).unwrap());
    }

    #[test]
    fn gc_noop_under_budget() {
        let (store, _dir) = store();
        store.put(b"content").unwrap();
        let evicted = store
            .gc(
                GcPolicy::builder().max_total_bytes(1024 * 1024).build(),
                &BTreeSet::new(),
            )
            .unwrap();
        assert_eq!(evicted, 0);
    }

    #[test]
    fn delete_is_idempotent() {
        let (store, _dir) = store();
        let digest = store.put(b"to delete").unwrap();
        store.delete(&digest).unwrap();
        store.delete(&digest).unwrap();
        assert!(!store.has(&digest).unwrap());
    }
}
