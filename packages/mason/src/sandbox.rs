//! Hermetic, deterministic execution of single build actions.
//!
//! Layers, bottom up:
//!
//! - [`spec`]: the declared isolation envelope ([`spec::HermeticSpec`]).
//! - [`platform`]: what isolation this host can actually provide.
//! - [`exec`]: the executor itself (Prepare -> Launch -> Monitor ->
//!   Collect), with resource limits, watchdog, and cancellation.
//! - [`determinism`]: injected environment and preload shim seeding.
//! - [`detect`]: static analysis of command lines for missing determinism
//!   flags.
//! - [`verify`]: the N-run output comparison harness.
//! - [`fuzzy`]: format-aware normalization of embedded nondeterminism in
//!   ELF, Mach-O, `ar`, and PE artifacts.
//! - [`linux`]: the Linux namespace/rootfs/cgroup machinery behind the
//!   `Sandboxed` isolation level.

pub mod detect;
pub mod determinism;
pub mod exec;
pub mod fuzzy;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod platform;
pub mod spec;
pub mod verify;

pub use detect::{Finding, Priority};
pub use determinism::DeterminismEnv;
pub use exec::{ExecutionResult, HermeticExecutor, SandboxDefaults};
pub use platform::{Capabilities, IsolationLevel};
pub use spec::{HermeticSpec, NetworkPolicy, ResourceLimits};
pub use verify::{ComparisonOutcome, Strategy, Verifier, VerifyReport};
