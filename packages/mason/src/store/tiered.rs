//! Composition of the local and remote store tiers.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::{
    error::{BuildErrorKind, Result},
    hash::Digest,
};

use super::{GcPolicy, LocalStore, ObjectStore, RemoteStore};

/// Local-first store with an optional remote tier.
///
/// The local tier is authoritative. Reads that miss locally fall through
/// to the remote tier and write the result back locally; writes land
/// locally and are mirrored to the remote tier best-effort (a remote
/// failure never fails a build).
#[derive(Clone, Debug)]
pub struct TieredStore {
    local: Arc<LocalStore>,
    remote: Option<Arc<RemoteStore>>,
    write_through: bool,
}

impl TieredStore {
    pub fn local_only(local: LocalStore) -> Self {
        Self {
            local: Arc::new(local),
            remote: None,
            write_through: false,
        }
    }

    pub fn with_remote(local: LocalStore, remote: RemoteStore, write_through: bool) -> Self {
        Self {
            local: Arc::new(local),
            remote: Some(Arc::new(remote)),
            write_through,
        }
    }

    pub fn local(&self) -> &LocalStore {
        &self.local
    }

    /// Collect garbage in the local tier. The remote tier manages its own
    /// lifetime.
    pub fn gc(&self, policy: GcPolicy, live: &BTreeSet<Digest>) -> Result<u64> {
        self.local.gc(policy, live)
    }
}

impl ObjectStore for TieredStore {
    #[instrument(skip(self, bytes))]
    fn put(&self, bytes: &[u8]) -> Result<Digest> {
        let digest = self.local.put(bytes)?;
        if self.write_through {
            if let Some(remote) = &self.remote {
                if let Err(err) = remote.put(bytes) {
                    warn!(%digest, %err, "remote write-through failed; local tier is authoritative");
                }
            }
        }
        Ok(digest)
    }

    #[instrument(skip(self))]
    fn get(&self, digest: &Digest) -> Result<Option<Vec<u8>>> {
        if let Some(bytes) = self.local.get(digest)? {
            return Ok(Some(bytes));
        }
        let Some(remote) = &self.remote else {
            return Ok(None);
        };
        match remote.get(digest) {
            Ok(Some(bytes)) => {
                debug!(%digest, "remote hit; writing back to local tier");
                self.local.put(&bytes)?;
                Ok(Some(bytes))
            }
            Ok(None) => Ok(None),
            // Missing remotely is a miss, not an error.
            Err(err) if matches!(err.kind(), BuildErrorKind::CacheNotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn has(&self, digest: &Digest) -> Result<bool> {
        if self.local.has(digest)? {
            return Ok(true);
        }
        match &self.remote {
            Some(remote) => remote.has(digest),
            None => Ok(false),
        }
    }

    fn delete(&self, digest: &Digest) -> Result<()> {
        // Local tier only: remote objects may be shared by other machines.
        self.local.delete(digest)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::envelope::SigningKey;
    use crate::hash::hash_bytes;

    fn tiered() -> (TieredStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let key = SigningKey::derive("/test", "machine");
        let local = LocalStore::open(dir.path().join("objects"), key).unwrap();
        (TieredStore::local_only(local), dir)
    }

    #[test]
    fn local_only_round_trip() {
        let (store, _dir) = tiered();
        let digest = store.put(b"bytes").unwrap();
        assert_eq!(store.get(&digest).unwrap().unwrap(), b"bytes");
        assert!(store.has(&digest).unwrap());
    }

    #[test]
    fn miss_without_remote_is_none() {
        let (store, _dir) = tiered();
        assert_eq!(store.get(&hash_bytes(b"missing")).unwrap(), None);
    }
}
