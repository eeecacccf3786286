//! Determinism environment injection.
//!
//! Two mechanisms layer on top of isolation:
//!
//! 1. A fixed environment (`SOURCE_DATE_EPOCH`, `TZ`, `LC_ALL`,
//!    `BUILD_TIMESTAMP`) that well-behaved toolchains honor.
//! 2. An optional preload shim that intercepts time, randomness, and pid
//!    queries for toolchains that do not, returning values seeded from the
//!    action fingerprint so that identical fingerprints see identical
//!    "randomness".

use std::{collections::BTreeMap, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::hash::Digest;

/// The epoch injected into deterministic builds: 1980-01-01T00:00:00Z,
/// the floor shared with archive formats that cannot represent earlier
/// timestamps.
pub const DETERMINISTIC_EPOCH: u64 = 315_532_800;

/// Environment variable carrying the shim's seed.
pub const SEED_ENV: &str = "MASON_DETERMINISM_SEED";

/// Determinism configuration applied to every action.
#[derive(Clone, Debug, Default, Serialize, Deserialize, bon::Builder)]
pub struct DeterminismEnv {
    /// Value for `SOURCE_DATE_EPOCH` and `BUILD_TIMESTAMP`. Defaults to
    /// [`DETERMINISTIC_EPOCH`].
    pub source_date_epoch: Option<u64>,
    /// Path to the preload shim library, if one is installed. Injected via
    /// the platform's library-preload mechanism.
    pub preload_shim: Option<PathBuf>,
}

impl DeterminismEnv {
    /// Inject the deterministic environment into `env`, seeding the shim
    /// from the action fingerprint digest.
    ///
    /// Injected values override whatever the action declared: determinism
    /// is not negotiable per-action.
    pub fn inject(&self, env: &mut BTreeMap<String, String>, seed: &Digest) {
        let epoch = self.source_date_epoch.unwrap_or(DETERMINISTIC_EPOCH);
        env.insert("SOURCE_DATE_EPOCH".into(), epoch.to_string());
        env.insert("BUILD_TIMESTAMP".into(), epoch.to_string());
        env.insert("TZ".into(), "UTC".into());
        env.insert("LC_ALL".into(), "C".into());

        if let Some(shim) = &self.preload_shim {
            let shim = shim.display().to_string();
            #[cfg(target_os = "macos")]
            env.insert("DYLD_INSERT_LIBRARIES".into(), shim);
            #[cfg(not(target_os = "macos"))]
            env.insert("LD_PRELOAD".into(), shim);
            // The shim derives its fake clock, rng stream, and pid from
            // this value, so identical fingerprints replay identically.
            env.insert(SEED_ENV.into(), seed.to_hex());
        }
    }
}
