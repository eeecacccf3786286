//! The signed wire envelope shared by every persisted cache artifact.
//!
//! Layout, big-endian throughout:
//!
//! ```not_rust
//! [magic(4) | version(4) | timestamp(8) | MAC(32) | payload...]
//! ```
//!
//! The MAC is a keyed Blake3 hash over `magic | version | timestamp |
//! payload`. The key is derived per-workspace from the workspace identifier
//! plus a machine identifier, so caches are not portable across workspaces
//! (or machines) by accident.

use std::path::Path;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tap::Pipe as _;
use tracing::{instrument, trace};

use crate::error::{BuildError, BuildErrorKind, Result};

/// Schema version shared by all envelope-wrapped artifacts.
pub const ENVELOPE_VERSION: u32 = 1;

/// Envelope header length: magic + version + timestamp + MAC.
pub const HEADER_LEN: usize = 4 + 4 + 8 + 32;

/// Magic numbers for each persisted artifact family.
pub mod magic {
    /// Cache store object.
    pub const OBJECT: [u8; 4] = *b"MSNO";
    /// Action cache entry.
    pub const ACTION: [u8; 4] = *b"MSNA";
    /// Serialized dependency graph.
    pub const GRAPH: [u8; 4] = *b"MSNG";
    /// Two-tier stamp memo.
    pub const STAMPS: [u8; 4] = *b"MSNS";
}

const KEY_CONTEXT: &str = "mason 2025-11-02 workspace cache signing v1";

/// The per-workspace signing key.
///
/// Derivation binds the key to both the workspace and the machine; moving a
/// cache directory between workspaces yields MAC failures, which readers
/// treat as misses rather than trusting foreign entries.
#[derive(Clone)]
pub struct SigningKey([u8; 32]);

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material never renders.
        f.write_str("SigningKey(..)")
    }
}

impl SigningKey {
    /// Derive from explicit identifiers. Exposed for tests; production use
    /// goes through [`SigningKey::for_workspace`].
    pub fn derive(workspace_id: &str, machine_id: &str) -> Self {
        let mut material = Vec::with_capacity(workspace_id.len() + machine_id.len() + 1);
        material.extend_from_slice(workspace_id.as_bytes());
        material.push(0);
        material.extend_from_slice(machine_id.as_bytes());
        Self(blake3::derive_key(KEY_CONTEXT, &material))
    }

    /// Derive the key for a workspace root using the machine identity.
    pub fn for_workspace(workspace_root: &Path) -> Self {
        let workspace_id = workspace_root.to_string_lossy().into_owned();
        Self::derive(&workspace_id, &machine_id())
    }

    fn mac(&self, magic: [u8; 4], version: u32, timestamp: u64, payload: &[u8]) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new_keyed(&self.0);
        hasher.update(&magic);
        hasher.update(&version.to_be_bytes());
        hasher.update(&timestamp.to_be_bytes());
        hasher.update(payload);
        hasher.finalize()
    }
}

/// A stable identifier for this machine.
///
/// Prefers the OS machine id; falls back to the hostname. The exact value
/// only matters in that it is stable on one machine and differs across
/// machines.
pub fn machine_id() -> String {
    #[cfg(target_os = "linux")]
    {
        if let Ok(id) = std::fs::read_to_string("/etc/machine-id") {
            let id = id.trim();
            if !id.is_empty() {
                return id.to_string();
            }
        }
    }
    sysinfo::System::host_name().unwrap_or_else(|| "unknown-machine".to_string())
}

/// A decoded envelope.
#[derive(Clone, Debug)]
pub struct Unsealed {
    pub version: u32,
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

/// Seal a payload: prepend the signed header.
pub fn seal(magic: [u8; 4], key: &SigningKey, payload: &[u8]) -> Vec<u8> {
    let timestamp = Timestamp::now().as_second() as u64;
    let mac = key.mac(magic, ENVELOPE_VERSION, timestamp, payload);

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&magic);
    out.extend_from_slice(&ENVELOPE_VERSION.to_be_bytes());
    out.extend_from_slice(&timestamp.to_be_bytes());
    out.extend_from_slice(mac.as_bytes());
    out.extend_from_slice(payload);
    out
}

/// Open a sealed envelope, verifying magic, version, and MAC.
///
/// MAC comparison is constant-time: [`blake3::Hash`]'s equality against raw
/// bytes is specified as constant-time by the blake3 crate.
#[instrument(skip(key, bytes))]
pub fn open(magic: [u8; 4], key: &SigningKey, bytes: &[u8]) -> Result<Unsealed> {
    let corrupted = |detail: &str| {
        BuildError::new(BuildErrorKind::CacheCorrupted {
            detail: detail.to_string(),
        })
    };

    if bytes.len() < HEADER_LEN {
        return Err(corrupted("envelope shorter than header"));
    }
    if bytes[0..4] != magic {
        return Err(corrupted("magic number mismatch"));
    }
    let version = u32::from_be_bytes(bytes[4..8].try_into().unwrap_or_default());
    if version != ENVELOPE_VERSION {
        return Err(corrupted("unsupported schema version"));
    }
    let timestamp = u64::from_be_bytes(bytes[8..16].try_into().unwrap_or_default());
    let stored_mac: [u8; 32] = bytes[16..48].try_into().unwrap_or_default();
    let payload = &bytes[HEADER_LEN..];

    let expected = key.mac(magic, version, timestamp, payload);
    if expected != stored_mac {
        return Err(corrupted("MAC verification failed"));
    }

    trace!(?version, ?timestamp, payload_len = payload.len(), "opened envelope");
    Ok(Unsealed {
        version,
        timestamp,
        payload: payload.to_vec(),
    })
}

/// Seal a serde payload as JSON.
pub fn seal_json<T: Serialize>(magic: [u8; 4], key: &SigningKey, value: &T) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(value)
        .map_err(|err| BuildError::internal(format!("serialize envelope payload: {err}")))?;
    seal(magic, key, &payload).pipe(Ok)
}

/// Open a sealed envelope and deserialize its JSON payload.
pub fn open_json<T: for<'de> Deserialize<'de>>(
    magic: [u8; 4],
    key: &SigningKey,
    bytes: &[u8],
) -> Result<T> {
    let unsealed = open(magic, key, bytes)?;
    serde_json::from_slice(&unsealed.payload).map_err(|err| {
        BuildError::new(BuildErrorKind::CacheCorrupted {
            detail: format!("payload deserialization failed: {err}"),
        })
    })
}
