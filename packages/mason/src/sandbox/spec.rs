//! Declaration of an action's isolation envelope.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{BuildError, Result},
    hash::Digest,
};

/// Per-action resource limits. `None` means unlimited.
#[derive(Clone, Copy, Default, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_bytes: Option<u64>,
    pub cpu_time: Option<Duration>,
    pub wall_time: Option<Duration>,
    pub max_fds: Option<u64>,
    pub max_procs: Option<u64>,
}

/// Network access policy for an action. The default denies everything;
/// hermetic actions have no business on the network.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize, Default)]
pub enum NetworkPolicy {
    #[default]
    Disabled,
    Allowlist(BTreeSet<String>),
}

impl NetworkPolicy {
    pub fn is_disabled(&self) -> bool {
        matches!(self, NetworkPolicy::Disabled)
    }
}

/// The hermetic envelope for a single action: which paths it may read,
/// which it may write, its environment, and its resource budget.
///
/// Inputs, outputs, and temps must be pairwise disjoint; [`HermeticSpec::validate`]
/// enforces this before any fingerprint is computed.
#[derive(Clone, Default, Eq, PartialEq, Debug, Serialize, Deserialize, bon::Builder)]
pub struct HermeticSpec {
    #[builder(default)]
    pub inputs: BTreeSet<PathBuf>,
    #[builder(default)]
    pub outputs: BTreeSet<PathBuf>,
    #[builder(default)]
    pub temps: BTreeSet<PathBuf>,
    #[builder(default)]
    pub env: BTreeMap<String, String>,
    #[builder(default)]
    pub resources: ResourceLimits,
    #[builder(default)]
    pub network: NetworkPolicy,
}

impl HermeticSpec {
    /// Check the pairwise-disjointness invariant on the path sets.
    pub fn validate(&self) -> Result<()> {
        let overlap = |a: &BTreeSet<PathBuf>, b: &BTreeSet<PathBuf>| {
            a.intersection(b).next().cloned()
        };
        if let Some(path) = overlap(&self.inputs, &self.outputs) {
            return Err(BuildError::config(format!(
                "path {path:?} declared as both input and output"
            )));
        }
        if let Some(path) = overlap(&self.inputs, &self.temps) {
            return Err(BuildError::config(format!(
                "path {path:?} declared as both input and temp"
            )));
        }
        if let Some(path) = overlap(&self.outputs, &self.temps) {
            return Err(BuildError::config(format!(
                "path {path:?} declared as both output and temp"
            )));
        }
        Ok(())
    }

    /// Canonical digest of the spec, folded into action fingerprints. Field
    /// order is fixed; `BTree*` collections make serialization canonical.
    pub fn digest(&self) -> Digest {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        Digest::from_fields([b"hermetic-spec-v1".as_slice(), &encoded])
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn paths(items: &[&str]) -> BTreeSet<PathBuf> {
        items.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn disjoint_sets_validate() {
        let spec = HermeticSpec::builder()
            .inputs(paths(&["src/a.c"]))
            .outputs(paths(&["out/a.o"]))
            .temps(paths(&["tmp/work"]))
            .build();
        spec.validate().unwrap();
    }

    #[test]
    fn overlap_is_rejected() {
        let spec = HermeticSpec::builder()
            .inputs(paths(&["src/a.c", "shared.h"]))
            .outputs(paths(&["shared.h"]))
            .build();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn digest_tracks_every_field() {
        let base = HermeticSpec::builder().inputs(paths(&["a"])).build();
        let mut with_env = base.clone();
        with_env.env.insert("CC".into(), "clang".into());
        let mut with_net = base.clone();
        with_net.network = NetworkPolicy::Allowlist(["proxy.internal".to_string()].into());

        assert_eq!(base.digest(), base.clone().digest());
        assert_ne!(base.digest(), with_env.digest());
        assert_ne!(base.digest(), with_net.digest());
    }
}
