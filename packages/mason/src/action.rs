//! Actions: the minimum unit of execution and of cache granularity.
//!
//! An action provider turns a target into a sequence of actions; the core
//! fingerprints each action and either replays it from cache or executes it
//! hermetically. Two actions with identical fingerprints must produce
//! identical outputs under the hermetic contract.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
};

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{
    hash::Digest,
    sandbox::spec::HermeticSpec,
    target::TargetId,
};

/// Version folded into every fingerprint. Bump to invalidate all caches
/// when fingerprint semantics change.
pub const FINGERPRINT_PROTOCOL_VERSION: u32 = 1;

/// A single unit of execution produced by an action provider.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Action {
    /// The target this action builds.
    pub target: TargetId,
    /// Short human-readable label, e.g. `compile` or `link`.
    pub mnemonic: String,
    /// Command line; `argv[0]` is the program.
    pub argv: Vec<String>,
    /// Environment the command runs with. Nothing is inherited implicitly.
    pub env: BTreeMap<String, String>,
    /// Declared input paths. Content participates in the fingerprint.
    pub inputs: BTreeSet<PathBuf>,
    /// Declared output paths. Only the paths participate in the
    /// fingerprint; output content is captured after execution.
    pub outputs: BTreeSet<PathBuf>,
    /// Optional per-action override of the sandbox defaults.
    #[serde(default)]
    pub sandbox: Option<HermeticSpec>,
}

impl Action {
    pub fn new(target: TargetId, mnemonic: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            target,
            mnemonic: mnemonic.into(),
            argv,
            env: BTreeMap::new(),
            inputs: BTreeSet::new(),
            outputs: BTreeSet::new(),
            sandbox: None,
        }
    }

    pub fn with_env(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn with_inputs(mut self, inputs: impl IntoIterator<Item = PathBuf>) -> Self {
        self.inputs.extend(inputs);
        self
    }

    pub fn with_outputs(mut self, outputs: impl IntoIterator<Item = PathBuf>) -> Self {
        self.outputs.extend(outputs);
        self
    }
}

/// A fixed-size fingerprint uniquely naming an action's memoization key.
#[derive(
    Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize,
)]
pub struct ActionFingerprint(Digest);

impl ActionFingerprint {
    /// Compute the fingerprint over the canonicalized command, the sorted
    /// environment, the content digests of all declared inputs, the declared
    /// output paths (paths only), the hermetic spec digest, and the protocol
    /// version.
    #[instrument(skip_all, fields(target = %action.target, mnemonic = %action.mnemonic))]
    pub fn compute(
        action: &Action,
        input_digests: &BTreeMap<PathBuf, Digest>,
        hermetic: &HermeticSpec,
    ) -> Self {
        let mut fields: Vec<Vec<u8>> = Vec::new();
        fields.push(FINGERPRINT_PROTOCOL_VERSION.to_be_bytes().to_vec());
        fields.push(b"argv".to_vec());
        for arg in &action.argv {
            fields.push(arg.as_bytes().to_vec());
        }
        fields.push(b"env".to_vec());
        for (key, value) in &action.env {
            fields.push(key.as_bytes().to_vec());
            fields.push(value.as_bytes().to_vec());
        }
        fields.push(b"inputs".to_vec());
        for (path, digest) in input_digests {
            fields.push(path.to_string_lossy().into_owned().into_bytes());
            fields.push(digest.as_bytes().to_vec());
        }
        fields.push(b"outputs".to_vec());
        for path in &action.outputs {
            fields.push(path.to_string_lossy().into_owned().into_bytes());
        }
        fields.push(b"hermetic".to_vec());
        fields.push(hermetic.digest().as_bytes().to_vec());

        Self(Digest::from_fields(fields))
    }

    pub fn digest(&self) -> &Digest {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }

    pub fn from_digest(digest: Digest) -> Self {
        Self(digest)
    }
}

impl std::fmt::Display for ActionFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A hash over the ordered list of `(output path, content hash)` pairs an
/// action produced.
#[derive(
    Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize,
)]
pub struct OutputSetFingerprint(Digest);

impl OutputSetFingerprint {
    pub fn compute<'a>(outputs: impl IntoIterator<Item = (&'a PathBuf, &'a Digest)>) -> Self {
        let mut fields: Vec<Vec<u8>> = Vec::new();
        for (path, digest) in outputs {
            fields.push(path.to_string_lossy().into_owned().into_bytes());
            fields.push(digest.as_bytes().to_vec());
        }
        Self(Digest::from_fields(fields))
    }

    pub fn digest(&self) -> &Digest {
        &self.0
    }
}

impl std::fmt::Display for OutputSetFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
