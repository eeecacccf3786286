//! Error taxonomy for the build core.
//!
//! Errors form a closed set of kinds, each carrying a typed payload and an
//! optional chain of context frames. Callers match on [`BuildErrorKind`],
//! never on rendered text; the rendered form exists purely for reports.

use std::{fmt, io, sync::Arc};

use derive_more::Display;
use itertools::Itertools as _;
use serde::{Deserialize, Serialize};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::target::TargetId;

/// Result alias used throughout the core.
pub type Result<T, E = BuildError> = std::result::Result<T, E>;

/// A resource class that can be limited per-action.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize,
)]
pub enum ResourceKind {
    #[display("memory")]
    Memory,
    #[display("cpu")]
    Cpu,
    #[display("procs")]
    Procs,
    #[display("fds")]
    Fds,
}

/// The closed set of error kinds.
///
/// Recoverability is a property of the kind (see [`BuildError::is_transient`]),
/// not of any particular instance.
#[derive(Clone, Debug, Display, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr, strum::Display, Hash))]
#[strum_discriminants(name(BuildErrorName))]
pub enum BuildErrorKind {
    /// The target set or a target's declaration is malformed.
    #[display("invalid configuration: {reason}")]
    ConfigInvalid { reason: String },

    /// Adding an edge would create a cycle. Carries the offending path,
    /// beginning and ending at the same node.
    #[display("dependency cycle: {}", path.iter().map(|id| id.to_string()).join(" -> "))]
    GraphCyclic { path: Vec<TargetId> },

    /// A target references a dependency that was never declared.
    #[display("{wanted_by} depends on undeclared target {id}")]
    GraphMissingNode { id: TargetId, wanted_by: TargetId },

    /// An action exited non-zero or produced outputs that failed validation.
    #[display("action for {target} failed{}", match exit_code {
        Some(code) => format!(" with exit code {code}"),
        None => String::new(),
    })]
    ActionFailed {
        target: TargetId,
        exit_code: Option<i32>,
        stderr_head: String,
    },

    /// A cache object or entry failed MAC or digest verification.
    #[display("cache entry corrupted: {detail}")]
    CacheCorrupted { detail: String },

    /// Internal signal that a lookup missed; never surfaced to users.
    #[display("cache miss")]
    CacheMiss,

    /// The cache store cannot accept the object within its byte budget.
    #[display("cache store full: need {needed} bytes, budget {budget}")]
    StorageFull { needed: u64, budget: u64 },

    /// A local disk operation failed.
    #[display("storage error during {op}")]
    StorageIO { op: String, transient: bool },

    /// The remote tier failed at the transport level.
    #[display("network error: {reason}")]
    NetworkError { reason: String },

    /// The remote tier rejected our credentials.
    #[display("remote cache rejected credentials")]
    CacheUnauthorized,

    /// The remote tier does not have the object. Internal; converted to a
    /// plain miss at the tiered-store boundary.
    #[display("remote cache object not found")]
    CacheNotFound,

    /// The platform cannot provide the isolation level an action requires.
    #[display("required sandbox isolation unavailable: {missing}")]
    SandboxUnavailable { missing: String },

    /// An action hit one of its declared resource limits.
    #[display("resource limit exceeded: {which}")]
    ResourceExceeded { which: ResourceKind },

    /// An action exceeded its wall-clock budget.
    #[display("action timed out after {limit_ms}ms")]
    Timeout { limit_ms: u64 },

    /// The scheduler drained this work before it ran to completion.
    #[display("cancelled")]
    Cancelled,

    /// An invariant the core relies on was violated.
    #[display("internal error: {reason}")]
    Internal { reason: String },
}

/// One frame of context added at a propagation point.
#[derive(Clone, Eq, PartialEq, Debug, Display, Serialize, Deserialize)]
#[display("{operation}: {details}")]
pub struct ErrorContext {
    pub operation: String,
    pub details: String,
    pub location: Option<String>,
}

/// An error from the build core: a kind plus the context chain accumulated
/// on the way up.
#[derive(Clone, Debug)]
pub struct BuildError {
    kind: BuildErrorKind,
    frames: Vec<ErrorContext>,
    source: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
}

impl BuildError {
    pub fn new(kind: BuildErrorKind) -> Self {
        Self {
            kind,
            frames: Vec::new(),
            source: None,
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::new(BuildErrorKind::Internal {
            reason: reason.into(),
        })
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::new(BuildErrorKind::ConfigInvalid {
            reason: reason.into(),
        })
    }

    /// Wrap a local I/O failure, classifying transience from the OS error.
    pub fn storage(op: impl Into<String>, err: io::Error) -> Self {
        let transient = matches!(
            err.kind(),
            io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
        );
        Self::new(BuildErrorKind::StorageIO {
            op: op.into(),
            transient,
        })
        .with_source(err)
    }

    pub fn network(reason: impl fmt::Display) -> Self {
        Self::new(BuildErrorKind::NetworkError {
            reason: reason.to_string(),
        })
    }

    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Add a context frame. Frames accumulate outermost-last.
    pub fn context(mut self, operation: impl Into<String>, details: impl fmt::Display) -> Self {
        self.frames.push(ErrorContext {
            operation: operation.into(),
            details: details.to_string(),
            location: None,
        });
        self
    }

    pub fn kind(&self) -> &BuildErrorKind {
        &self.kind
    }

    pub fn name(&self) -> &'static str {
        BuildErrorName::from(&self.kind).into()
    }

    pub fn frames(&self) -> &[ErrorContext] {
        &self.frames
    }

    /// The chain of kind names plus frames, outermost first. This is the
    /// report form required for failed targets.
    pub fn chain(&self) -> Vec<String> {
        let mut chain = vec![self.name().to_string()];
        chain.extend(self.frames.iter().rev().map(|frame| frame.to_string()));
        chain
    }

    /// Whether a retry can reasonably succeed. Only cache corruption,
    /// network failures, and transient disk errors qualify.
    pub fn is_transient(&self) -> bool {
        match &self.kind {
            BuildErrorKind::CacheCorrupted { .. } | BuildErrorKind::NetworkError { .. } => true,
            BuildErrorKind::StorageIO { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Map to the process exit code contract: 1 for build failures, 2 for
    /// configuration and graph violations, 3 and up for internal errors.
    pub fn exit_code(&self) -> i32 {
        match &self.kind {
            BuildErrorKind::ConfigInvalid { .. }
            | BuildErrorKind::GraphCyclic { .. }
            | BuildErrorKind::GraphMissingNode { .. } => 2,
            BuildErrorKind::Internal { .. } => 3,
            _ => 1,
        }
    }
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for frame in self.frames.iter().rev() {
            write!(f, "\n  while {frame}")?;
        }
        Ok(())
    }
}

impl std::error::Error for BuildError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|err| err as &(dyn std::error::Error + 'static))
    }
}

impl From<BuildErrorKind> for BuildError {
    fn from(kind: BuildErrorKind) -> Self {
        Self::new(kind)
    }
}

/// Context chaining for `Result`, mirroring the usual `.context(..)`
/// propagation discipline.
pub trait ContextExt<T> {
    /// Append an `{operation, details}` frame to the error, if any.
    fn ctx(self, operation: impl Into<String>, details: impl fmt::Display) -> Result<T>;
}

impl<T> ContextExt<T> for Result<T> {
    fn ctx(self, operation: impl Into<String>, details: impl fmt::Display) -> Result<T> {
        self.map_err(|err| err.context(operation, details))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    use super::*;
    use crate::target::TargetId;

    #[test_case(BuildError::new(BuildErrorKind::CacheCorrupted { detail: "mac".into() }), true; "cache_corrupted")]
    #[test_case(BuildError::network("connection reset"), true; "network")]
    #[test_case(BuildError::new(BuildErrorKind::ActionFailed {
        target: TargetId::new("lib", "core"),
        exit_code: Some(1),
        stderr_head: String::new(),
    }), false; "action_failed")]
    #[test_case(BuildError::new(BuildErrorKind::Timeout { limit_ms: 100 }), false; "timeout")]
    #[test_case(BuildError::new(BuildErrorKind::Cancelled), false; "cancelled")]
    #[test]
    fn transience_is_by_kind(err: BuildError, transient: bool) {
        pretty_assertions::assert_eq!(err.is_transient(), transient);
    }

    #[test_case(BuildError::config("bad field"), 2; "config_invalid")]
    #[test_case(BuildError::internal("unreachable"), 3; "internal")]
    #[test_case(BuildError::new(BuildErrorKind::Timeout { limit_ms: 5 }), 1; "timeout")]
    #[test_case(BuildError::new(BuildErrorKind::CacheUnauthorized), 1; "unauthorized")]
    #[test]
    fn exit_codes_follow_severity(err: BuildError, code: i32) {
        pretty_assertions::assert_eq!(err.exit_code(), code);
    }

    #[test]
    fn context_frames_render_outermost_first() {
        let err = BuildError::new(BuildErrorKind::CacheMiss)
            .context("read entry", "fp deadbeef")
            .context("lookup action", "target lib:core");
        let chain = err.chain();
        assert_eq!(chain[0], "CacheMiss");
        assert!(chain[1].starts_with("lookup action"));
        assert!(chain[2].starts_with("read entry"));
    }

    #[test]
    fn cycle_kind_renders_path() {
        let path = vec![
            TargetId::new("c", "c"),
            TargetId::new("a", "a"),
            TargetId::new("c", "c"),
        ];
        let err = BuildError::new(BuildErrorKind::GraphCyclic { path });
        assert_eq!(err.to_string(), "dependency cycle: c:c -> a:a -> c:c");
    }
}
