//! On-disk layout of the per-workspace cache root.
//!
//! ```not_rust
//! .builder-cache/
//!   objects/<2-hex-prefix>/<digest>       # cache store
//!   actions/<2-hex-prefix>/<action_fp>    # action cache entries
//!   graph.bin                             # serialized graph + config digest
//!   parse/<config_digest>.bin             # reserved for the DSL parse cache
//!   stamps.bin                            # two-tier stamp memo
//! ```

use std::path::{Path, PathBuf};

use crate::error::{BuildError, Result};

/// Name of the cache directory inside a workspace.
pub const CACHE_DIR_NAME: &str = ".builder-cache";

/// Paths within one workspace's cache root.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    /// The layout for a workspace, rooted at `<workspace>/.builder-cache`.
    pub fn for_workspace(workspace_root: &Path) -> Self {
        Self {
            root: workspace_root.join(CACHE_DIR_NAME),
        }
    }

    /// A layout rooted at an explicit directory (shared caches, tests).
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.root.join("objects")
    }

    pub fn actions_dir(&self) -> PathBuf {
        self.root.join("actions")
    }

    pub fn graph_file(&self) -> PathBuf {
        self.root.join("graph.bin")
    }

    pub fn parse_dir(&self) -> PathBuf {
        self.root.join("parse")
    }

    pub fn stamps_file(&self) -> PathBuf {
        self.root.join("stamps.bin")
    }

    /// Create the directory skeleton.
    pub fn ensure(&self) -> Result<()> {
        for dir in [self.objects_dir(), self.actions_dir(), self.parse_dir()] {
            std::fs::create_dir_all(&dir)
                .map_err(|err| BuildError::storage(format!("create {dir:?}"), err))?;
        }
        Ok(())
    }
}

/// Shard a hex-named entry under a directory by its two-character prefix:
/// `dir/<2-hex>/<full-hex>`. Keeps directory fanout bounded on filesystems
/// that degrade with very large directories.
pub fn sharded_path(dir: &Path, hex_name: &str) -> PathBuf {
    let prefix: String = hex_name.chars().take(2).collect();
    dir.join(prefix).join(hex_name)
}
