//! Hashing operations and types.
//!
//! Two tiers of fingerprinting live here:
//!
//! - [`Digest`]: a 256-bit Blake3 content hash. Collision-resistant; the only
//!   thing allowed as a cache key.
//! - [`MetaDigest`]: a stable 64-bit hash over file size and mtime. Cheap and
//!   consistent, but NOT safe as a cache key on its own; it only gates
//!   whether the content hash needs recomputing.
//!
//! The two-tier API ([`hash_file_two_tier`], [`StampDb`]) is what makes warm
//! builds fast: unchanged metadata means the stored content digest is reused
//! without reading the file.

use std::{
    collections::BTreeMap,
    fs::File,
    hash::{Hash, Hasher},
    io::{self, BufReader},
    path::{Path, PathBuf},
    sync::LazyLock,
};

use dashmap::DashMap;
use rustc_stable_hash::StableSipHasher128;
use serde::{Deserialize, Serialize, de, ser};
use tracing::{instrument, trace, warn};
use walkdir::WalkDir;

use crate::error::{BuildError, Result};

/// Digest length in bytes. All cryptographic digests in the core are
/// 256-bit Blake3.
pub const DIGEST_LEN: usize = 32;

static EMPTY_DIGEST: LazyLock<Digest> = LazyLock::new(|| Digest::from_bytes(b""));

/// A 256-bit Blake3 content digest, rendered as lowercase hex.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    /// Hash a buffer.
    pub fn from_bytes(buffer: impl AsRef<[u8]>) -> Self {
        Self(*blake3::hash(buffer.as_ref()).as_bytes())
    }

    /// Hash the fields of the iterator in order, each length-prefixed so
    /// that field boundaries cannot alias.
    pub fn from_fields(fields: impl IntoIterator<Item = impl AsRef<[u8]>>) -> Self {
        let mut hasher = blake3::Hasher::new();
        for field in fields {
            let field = field.as_ref();
            hasher.update(&(field.len() as u64).to_be_bytes());
            hasher.update(field);
        }
        Self(*hasher.finalize().as_bytes())
    }

    /// The sentinel digest used for missing files: the hash of the empty
    /// byte string.
    pub fn empty() -> Self {
        *EMPTY_DIGEST
    }

    pub fn from_raw(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The two-character shard prefix used in on-disk layouts.
    pub fn shard_prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }

    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str)
            .map_err(|err| BuildError::config(format!("malformed digest: {err}")))?;
        let bytes: [u8; DIGEST_LEN] = bytes
            .try_into()
            .map_err(|_| BuildError::config("digest must be 32 bytes"))?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest({})", &self.to_hex()[..12])
    }
}

impl std::str::FromStr for Digest {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl ser::Serialize for Digest {
    fn serialize<S: ser::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> de::Deserialize<'de> for Digest {
    fn deserialize<D: de::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex_str = String::deserialize(deserializer)?;
        Self::from_hex(&hex_str).map_err(de::Error::custom)
    }
}

/// A stable 64-bit metadata hash. Consistent across processes and machines,
/// non-cryptographic.
#[derive(
    Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize,
)]
pub struct MetaDigest(u64);

impl MetaDigest {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for MetaDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Hash anything hashable with the stable sip hasher. The result is
/// consistent across runs, platforms, and compiler versions.
pub fn stable_hash_u64<H: Hash>(hashable: H) -> u64 {
    let mut hasher = StableSipHasher128::new();
    hashable.hash(&mut hasher);
    Hasher::finish(&hasher)
}

/// Size and mtime of a file, the inputs to the metadata tier.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct FileStamp {
    pub size: u64,
    pub mtime_secs: i64,
    pub mtime_nanos: u32,
}

impl FileStamp {
    /// Read the stamp for a path. Returns `None` for missing files.
    /// Symlinks are followed: the stamp describes the target.
    pub fn read(path: &Path) -> Result<Option<Self>> {
        let meta = match std::fs::metadata(path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(BuildError::storage(format!("stat {path:?}"), err)),
        };
        let mtime = filetime::FileTime::from_last_modification_time(&meta);
        Ok(Some(Self {
            size: meta.len(),
            mtime_secs: mtime.unix_seconds(),
            mtime_nanos: mtime.nanoseconds(),
        }))
    }

    pub fn digest(&self) -> MetaDigest {
        MetaDigest(stable_hash_u64((self.size, self.mtime_secs, self.mtime_nanos)))
    }
}

/// Hash a buffer.
pub fn hash_bytes(buffer: impl AsRef<[u8]>) -> Digest {
    Digest::from_bytes(buffer)
}

/// Hash the contents of the file at the specified path.
///
/// Missing files hash to the sentinel empty digest. Symlink targets are
/// hashed, not the link itself. Directories are hashed as a canonical
/// listing via [`hash_dir`].
#[instrument]
pub fn hash_file(path: &Path) -> Result<Digest> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            trace!(?path, "missing file; sentinel digest");
            return Ok(Digest::empty());
        }
        Err(err) => return Err(BuildError::storage(format!("open {path:?}"), err)),
    };
    if file
        .metadata()
        .map_err(|err| BuildError::storage(format!("stat {path:?}"), err))?
        .is_dir()
    {
        return hash_dir(path);
    }

    let mut reader = BufReader::new(file);
    let mut hasher = blake3::Hasher::new();
    let bytes = io::copy(&mut reader, &mut hasher)
        .map_err(|err| BuildError::storage(format!("read {path:?}"), err))?;
    let digest = Digest(*hasher.finalize().as_bytes());
    trace!(?path, ?digest, ?bytes, "hash file");
    Ok(digest)
}

/// Hash a directory as the canonical sorted listing of
/// `(relative path, content digest)` pairs, recursively.
#[instrument]
pub fn hash_dir(root: &Path) -> Result<Digest> {
    let mut hasher = blake3::Hasher::new();
    let walk = WalkDir::new(root).sort_by_file_name().follow_links(true);
    for entry in walk {
        let entry =
            entry.map_err(|err| BuildError::storage(format!("walk {root:?}"), err.into()))?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .into_owned();
        if entry.file_type().is_dir() {
            update_field(&mut hasher, format!("{rel}/").as_bytes());
            update_field(&mut hasher, Digest::empty().as_bytes());
        } else {
            let digest = hash_file(entry.path())?;
            update_field(&mut hasher, rel.as_bytes());
            update_field(&mut hasher, digest.as_bytes());
        }
    }
    Ok(Digest(*hasher.finalize().as_bytes()))
}

fn update_field(hasher: &mut blake3::Hasher, field: &[u8]) {
    hasher.update(&(field.len() as u64).to_be_bytes());
    hasher.update(field);
}

/// Metadata-tier hash for a path. Missing files hash the sentinel marker.
pub fn hash_meta(path: &Path) -> Result<MetaDigest> {
    match FileStamp::read(path)? {
        Some(stamp) => Ok(stamp.digest()),
        None => Ok(MetaDigest(stable_hash_u64("missing"))),
    }
}

/// The result of a two-tier hash: the fresh metadata digest, plus a content
/// digest only when metadata changed (or no prior stamp was supplied).
#[derive(Clone, Copy, Debug)]
pub struct TwoTier {
    pub stamp: Option<FileStamp>,
    pub meta: MetaDigest,
    /// `None` means the metadata tier matched and the caller's previous
    /// content digest remains valid.
    pub content: Option<Digest>,
}

/// Two-tier file hash: return metadata-only when the stamp matches a prior
/// value, skipping the content read entirely.
#[instrument]
pub fn hash_file_two_tier(path: &Path, prev: Option<&FileStamp>) -> Result<TwoTier> {
    let stamp = FileStamp::read(path)?;
    let meta = match stamp {
        Some(stamp) => stamp.digest(),
        None => MetaDigest(stable_hash_u64("missing")),
    };
    if let (Some(current), Some(prev)) = (stamp.as_ref(), prev) {
        if current == prev {
            trace!(?path, "metadata unchanged; content hash skipped");
            return Ok(TwoTier {
                stamp,
                meta,
                content: None,
            });
        }
    }
    let content = hash_file(path)?;
    Ok(TwoTier {
        stamp,
        meta,
        content: Some(content),
    })
}

/// Persistent `(path -> (stamp, content digest))` memo backing the two-tier
/// validation path across builds.
///
/// The in-memory map is concurrent; persistence is a snapshot the
/// orchestrator writes at the end of a build.
#[derive(Debug, Default)]
pub struct StampDb {
    entries: DashMap<PathBuf, StampEntry>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct StampEntry {
    pub stamp: FileStamp,
    pub content: Digest,
}

impl StampDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rehydrate from a persisted snapshot.
    pub fn from_snapshot(snapshot: BTreeMap<PathBuf, StampEntry>) -> Self {
        let entries = DashMap::new();
        for (path, entry) in snapshot {
            entries.insert(path, entry);
        }
        Self { entries }
    }

    /// Deterministic snapshot for persistence.
    pub fn snapshot(&self) -> BTreeMap<PathBuf, StampEntry> {
        self.entries
            .iter()
            .map(|kv| (kv.key().clone(), *kv.value()))
            .collect()
    }

    /// The content digest for a path, via the two-tier fast path: if the
    /// file's stamp matches the memo, the stored digest is returned without
    /// reading the file.
    #[instrument(skip(self))]
    pub fn content_digest(&self, path: &Path) -> Result<Digest> {
        let prev = self.entries.get(path).map(|entry| entry.stamp);
        let hashed = hash_file_two_tier(path, prev.as_ref())?;
        match (hashed.content, hashed.stamp) {
            // Metadata matched: reuse the memoized content digest. If the
            // memo got invalidated concurrently, fall back to hashing.
            (None, _) => match self.entries.get(path) {
                Some(entry) => Ok(entry.content),
                None => hash_file(path),
            },
            (Some(content), Some(stamp)) => {
                self.entries
                    .insert(path.to_path_buf(), StampEntry { stamp, content });
                Ok(content)
            }
            // Missing file: sentinel digest, nothing worth memoizing.
            (Some(content), None) => {
                self.entries.remove(path);
                Ok(content)
            }
        }
    }

    /// Forget a path; the next lookup rehashes content.
    pub fn forget(&self, path: &Path) {
        if self.entries.remove(path).is_some() {
            warn!(?path, "stamp memo invalidated");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn buffer_hash_is_stable() {
        let one = hash_bytes(b"hello world");
        let two = hash_bytes(b"hello world");
        assert_eq!(one, two);
        assert_ne!(one, hash_bytes(b"hello worlds"));
    }

    #[test]
    fn missing_file_hashes_to_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let digest = hash_file(&dir.path().join("nope")).unwrap();
        assert_eq!(digest, Digest::empty());
    }

    #[test]
    fn two_tier_skips_content_when_stamp_matches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.txt");
        std::fs::write(&path, b"contents").unwrap();

        let first = hash_file_two_tier(&path, None).unwrap();
        let content = first.content.expect("first hash computes content");

        let second = hash_file_two_tier(&path, first.stamp.as_ref()).unwrap();
        assert_eq!(second.content, None, "unchanged stamp skips content");
        assert_eq!(second.meta, first.meta);

        // Changing content forces a fresh digest through the stamp change.
        std::fs::write(&path, b"different!").unwrap();
        let third = hash_file_two_tier(&path, first.stamp.as_ref()).unwrap();
        let fresh = third.content.expect("changed stamp recomputes content");
        assert_ne!(fresh, content);
    }

    #[test]
    fn stamp_db_memoizes_across_lookups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.c");
        std::fs::write(&path, b"int main() {}").unwrap();

        let db = StampDb::new();
        let first = db.content_digest(&path).unwrap();
        let second = db.content_digest(&path).unwrap();
        assert_eq!(first, second);

        let snapshot = db.snapshot();
        let rehydrated = StampDb::from_snapshot(snapshot);
        assert_eq!(rehydrated.content_digest(&path).unwrap(), first);
    }

    #[test]
    fn directory_hash_is_order_independent_of_creation() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), b"bee").unwrap();
        std::fs::write(dir.path().join("a.txt"), b"ay").unwrap();
        let one = hash_dir(dir.path()).unwrap();

        let dir2 = tempfile::tempdir().unwrap();
        std::fs::write(dir2.path().join("a.txt"), b"ay").unwrap();
        std::fs::write(dir2.path().join("b.txt"), b"bee").unwrap();
        let two = hash_dir(dir2.path()).unwrap();

        assert_eq!(one, two);
    }

    #[test]
    fn digest_serde_round_trip() {
        let digest = hash_bytes(b"round trip");
        let json = serde_json::to_string(&digest).unwrap();
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
    }
}
