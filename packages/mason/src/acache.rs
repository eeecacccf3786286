//! The action cache: `(action fingerprint) -> (cached result)`.
//!
//! Entries are signed envelopes at `actions/<2-hex-prefix>/<action_fp>`.
//! A lookup only counts as a hit when the entry's MAC verifies and every
//! referenced cache-store object still exists; anything else is a miss.
//! MAC failures are additionally logged as security events (possible
//! tampering) rather than crashing the build.

use std::{
    collections::BTreeSet,
    io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tap::Pipe as _;
use tracing::{instrument, trace, warn};
use uuid::Uuid;

use crate::{
    action::{ActionFingerprint, OutputSetFingerprint},
    envelope::{self, SigningKey, magic},
    error::{BuildError, Result},
    hash::Digest,
    layout::sharded_path,
    store::ObjectStore,
    target::TargetId,
};

/// Execution metadata recorded with a cached result.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionMetadata {
    pub target: TargetId,
    pub mnemonic: String,
    pub duration_ms: u64,
    pub exit_code: i32,
}

/// A memoized action result: where the outputs live in the cache store and
/// what their combined fingerprint is.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CachedResult {
    pub fingerprint: ActionFingerprint,
    /// Ordered `(output path, content digest)` pairs.
    pub outputs: Vec<(PathBuf, Digest)>,
    pub output_fp: OutputSetFingerprint,
    pub metadata: ActionMetadata,
    /// Seconds since the epoch at record time.
    pub recorded_at: i64,
}

impl CachedResult {
    pub fn new(
        fingerprint: ActionFingerprint,
        outputs: Vec<(PathBuf, Digest)>,
        metadata: ActionMetadata,
    ) -> Self {
        let output_fp = OutputSetFingerprint::compute(outputs.iter().map(|(p, d)| (p, d)));
        Self {
            fingerprint,
            outputs,
            output_fp,
            metadata,
            recorded_at: Timestamp::now().as_second(),
        }
    }
}

/// The on-disk action cache.
///
/// A single mutex serializes mutations; lookups are short and contention
/// is low. (Sharding by fingerprint prefix is the escape hatch if that
/// ever stops being true.)
#[derive(Debug)]
pub struct ActionCache {
    root: PathBuf,
    key: SigningKey,
    write_lock: Mutex<()>,
}

impl ActionCache {
    #[instrument(skip(key))]
    pub fn open(root: impl Into<PathBuf> + std::fmt::Debug, key: SigningKey) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|err| BuildError::storage(format!("create action cache root {root:?}"), err))?;
        Ok(Self {
            root,
            key,
            write_lock: Mutex::new(()),
        })
    }

    fn entry_path(&self, fingerprint: &ActionFingerprint) -> PathBuf {
        sharded_path(&self.root, &fingerprint.to_hex())
    }

    /// Look up a fingerprint. Returns the cached result only if the entry
    /// verifies and all referenced artifacts still exist in `store`.
    #[instrument(skip(self, store))]
    pub fn lookup(
        &self,
        fingerprint: &ActionFingerprint,
        store: &dyn ObjectStore,
    ) -> Result<Option<CachedResult>> {
        let path = self.entry_path(fingerprint);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(BuildError::storage(format!("read {path:?}"), err)),
        };

        let result: CachedResult = match envelope::open_json(magic::ACTION, &self.key, &bytes) {
            Ok(result) => result,
            Err(err) => {
                // Treated as a miss, logged as a security event: a MAC
                // failure here means the entry was modified outside of us.
                warn!(
                    %fingerprint,
                    %err,
                    security = true,
                    "action cache entry failed verification; possible tampering"
                );
                let _ = std::fs::remove_file(&path);
                return Ok(None);
            }
        };

        if result.fingerprint != *fingerprint {
            warn!(%fingerprint, security = true, "action cache entry fingerprint mismatch");
            let _ = std::fs::remove_file(&path);
            return Ok(None);
        }

        // A hit is only a hit if the store can actually satisfy it.
        for (output, digest) in &result.outputs {
            if !store.has(digest)? {
                trace!(%fingerprint, ?output, %digest, "referenced artifact missing; miss");
                return Ok(None);
            }
        }

        trace!(%fingerprint, outputs = result.outputs.len(), "action cache hit");
        result.pipe(Some).pipe(Ok)
    }

    /// Record a result, overwriting any existing entry for the same
    /// fingerprint.
    #[instrument(skip(self, result), fields(fingerprint = %result.fingerprint))]
    pub fn record(&self, result: &CachedResult) -> Result<()> {
        let path = self.entry_path(&result.fingerprint);
        let sealed = envelope::seal_json(magic::ACTION, &self.key, result)?;

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| BuildError::internal("action cache lock poisoned"))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| BuildError::storage(format!("create {parent:?}"), err))?;
        }
        let temp = temp_path(&path);
        std::fs::write(&temp, &sealed)
            .map_err(|err| BuildError::storage(format!("write {temp:?}"), err))?;
        std::fs::rename(&temp, &path).map_err(|err| {
            let _ = std::fs::remove_file(&temp);
            BuildError::storage(format!("rename into {path:?}"), err)
        })?;
        trace!("recorded action cache entry");
        Ok(())
    }

    /// Drop the entry for a fingerprint, if any.
    #[instrument(skip(self))]
    pub fn invalidate(&self, fingerprint: &ActionFingerprint) -> Result<()> {
        let path = self.entry_path(fingerprint);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(BuildError::storage(format!("delete {path:?}"), err)),
        }
    }

    /// Every store digest referenced by a verifiable entry. This is the
    /// live set for cache-store garbage collection.
    #[instrument(skip(self))]
    pub fn live_digests(&self) -> Result<BTreeSet<Digest>> {
        let mut live = BTreeSet::new();
        for entry in walkdir::WalkDir::new(&self.root) {
            let entry =
                entry.map_err(|err| BuildError::storage("scan action cache", err.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let bytes = std::fs::read(entry.path())
                .map_err(|err| BuildError::storage("read action cache entry", err))?;
            let Ok(result) =
                envelope::open_json::<CachedResult>(magic::ACTION, &self.key, &bytes)
            else {
                // Unverifiable entries pin nothing.
                continue;
            };
            live.extend(result.outputs.into_iter().map(|(_, digest)| digest));
        }
        Ok(live)
    }
}

fn temp_path(target: &Path) -> PathBuf {
    let mut temp = target.as_os_str().to_owned();
    temp.push(".tmp.");
    temp.push(Uuid::new_v4().to_string());
    PathBuf::from(temp)
}
