//! Build targets: the immutable, user-declared units the graph is built from.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
};

use serde::{Deserialize, Serialize};

/// Unique identifier of a target: workspace-relative package path plus the
/// target's name within that package.
///
/// Renders as `package:name`. Identifiers order lexicographically, which is
/// the tie-breaking order used for deterministic scheduling and topological
/// sorts.
#[derive(
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Debug,
    parse_display::Display,
    parse_display::FromStr,
    Serialize,
    Deserialize,
)]
#[display("{package}:{name}")]
pub struct TargetId {
    pub package: String,
    pub name: String,
}

impl TargetId {
    pub fn new(package: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            name: name.into(),
        }
    }
}

/// Tag identifying which action provider handles a target.
#[derive(
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Debug,
    derive_more::Display,
    Serialize,
    Deserialize,
)]
#[display("{_0}")]
pub struct LanguageTag(String);

impl LanguageTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LanguageTag {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

/// An immutable target descriptor, produced by the (out of scope) config
/// layer and referenced read-only for the entire build.
///
/// The `config` payload is opaque to the core: it is passed through to the
/// action provider unmodified, and hashed as part of action planning only
/// if the provider folds it into its actions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub sources: BTreeSet<PathBuf>,
    pub deps: BTreeSet<TargetId>,
    pub language: LanguageTag,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl Target {
    pub fn new(id: TargetId, language: impl Into<LanguageTag>) -> Self {
        Self {
            id,
            sources: BTreeSet::new(),
            deps: BTreeSet::new(),
            language: language.into(),
            config: serde_json::Value::Null,
        }
    }

    pub fn with_sources(mut self, sources: impl IntoIterator<Item = PathBuf>) -> Self {
        self.sources.extend(sources);
        self
    }

    pub fn with_deps(mut self, deps: impl IntoIterator<Item = TargetId>) -> Self {
        self.deps.extend(deps);
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }
}

/// A rule describing an external repository targets may reference.
///
/// The core only carries these through to providers; resolution is the
/// dependency manager's problem.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepositoryRule {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}
