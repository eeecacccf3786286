//! Content-addressed artifact storage.
//!
//! The store is deliberately "stupid": bytes in, bytes out, keyed by their
//! Blake3 digest. Implementation details of any particular build system
//! never leak into it.
//!
//! Two tiers exist behind the same [`ObjectStore`] interface:
//! - [`LocalStore`]: filesystem-backed, authoritative, signed envelopes,
//!   LRU garbage collection.
//! - [`RemoteStore`]: an HTTP artifact service; optional, never
//!   authoritative.
//!
//! [`TieredStore`] composes them: reads fall through to the remote tier
//! and write back locally; writes go local-first with best-effort
//! write-through.

mod local;
mod remote;
mod tiered;

pub use local::{GcPolicy, LocalStore};
pub use remote::{RemoteConfig, RemoteStore};
pub use tiered::TieredStore;

use crate::{error::Result, hash::Digest};

/// Content-addressed byte storage.
///
/// Every implementation is self-verifying: `get` only ever returns bytes
/// whose digest equals the requested key.
pub trait ObjectStore: Send + Sync {
    /// Store bytes, returning their digest. Idempotent.
    fn put(&self, bytes: &[u8]) -> Result<Digest>;

    /// Fetch bytes by digest. `None` means the object is not present.
    fn get(&self, digest: &Digest) -> Result<Option<Vec<u8>>>;

    /// Metadata-only presence check.
    fn has(&self, digest: &Digest) -> Result<bool>;

    /// Remove an object. Removing a missing object is not an error.
    fn delete(&self, digest: &Digest) -> Result<()>;
}
