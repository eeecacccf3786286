//! Platform isolation capability probing.
//!
//! Every platform exposes the same contract; what differs is how much of
//! it the host can honor. Callers that need strong isolation check the
//! probed [`Capabilities`] and refuse to run rather than silently building
//! unsandboxed.

use serde::{Deserialize, Serialize};
use parse_display::Display;
use tracing::debug;

use crate::error::{BuildError, BuildErrorKind, Result};

/// How strongly an action can be isolated on this host.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize,
)]
pub enum IsolationLevel {
    /// No isolation at all.
    #[display("none")]
    None,
    /// Working-directory confinement plus environment filtering only.
    #[display("confined")]
    Confined,
    /// Kernel-enforced isolation (namespaces or an OS sandbox profile).
    #[display("sandboxed")]
    Sandboxed,
}

/// The isolation features this host supports.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Capabilities {
    pub level: IsolationLevel,
    /// Linux: user+network namespaces usable by unprivileged processes.
    pub namespaces: bool,
    /// Linux: a cgroup hierarchy is visible.
    pub cgroups: bool,
    /// macOS: `sandbox-exec` is present.
    pub sandbox_exec: bool,
    /// Library preloading (LD_PRELOAD / DYLD_INSERT_LIBRARIES) works.
    pub preload: bool,
    /// Network access can be denied to the child.
    pub network_isolation: bool,
    pub platform: &'static str,
}

impl Capabilities {
    /// Probe the current host.
    pub fn probe() -> Self {
        let caps = Self::probe_inner();
        debug!(?caps, "probed sandbox capabilities");
        caps
    }

    #[cfg(target_os = "linux")]
    fn probe_inner() -> Self {
        let namespaces =
            std::path::Path::new("/proc/self/ns/user").exists() && probe_user_namespaces();
        // Seeing /sys/fs/cgroup is not the same as being allowed to
        // create cgroups; probe by actually creating one.
        let cgroups = super::linux::probe_cgroup_delegation();
        Self {
            // `Sandboxed` is backed by the namespace/rootfs machinery in
            // `sandbox::linux`, which needs user+mount namespaces.
            level: if namespaces {
                IsolationLevel::Sandboxed
            } else {
                IsolationLevel::Confined
            },
            namespaces,
            cgroups,
            sandbox_exec: false,
            preload: true,
            network_isolation: namespaces,
            platform: "linux",
        }
    }

    #[cfg(target_os = "macos")]
    fn probe_inner() -> Self {
        let sandbox_exec = std::path::Path::new("/usr/bin/sandbox-exec").exists();
        Self {
            level: if sandbox_exec {
                IsolationLevel::Sandboxed
            } else {
                IsolationLevel::Confined
            },
            namespaces: false,
            cgroups: false,
            sandbox_exec,
            preload: true,
            network_isolation: sandbox_exec,
            platform: "macos",
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    fn probe_inner() -> Self {
        // No-op sandbox: working-directory confinement and environment
        // filtering still apply, and callers see the weak capability.
        Self {
            level: IsolationLevel::Confined,
            namespaces: false,
            cgroups: false,
            sandbox_exec: false,
            preload: false,
            network_isolation: false,
            platform: std::env::consts::OS,
        }
    }

    /// Refuse to run when the host cannot provide `required`.
    pub fn require(&self, required: IsolationLevel) -> Result<()> {
        if self.level >= required {
            return Ok(());
        }
        Err(BuildError::new(BuildErrorKind::SandboxUnavailable {
            missing: format!(
                "{required} isolation required but {} only provides {}",
                self.platform, self.level
            ),
        }))
    }
}

/// Whether this process can actually unshare user+mount namespaces.
/// Kernel knobs lie (seccomp filters and container policies block the
/// syscall regardless), so the only trustworthy probe is doing it in a
/// throwaway child.
#[cfg(target_os = "linux")]
fn probe_user_namespaces() -> bool {
    // SAFETY: the forked child only calls unshare and _exit, both raw
    // async-signal-safe syscalls; the parent just reaps it.
    unsafe {
        match libc::fork() {
            -1 => false,
            0 => {
                let ok = libc::unshare(libc::CLONE_NEWUSER | libc::CLONE_NEWNS) == 0;
                libc::_exit(if ok { 0 } else { 1 });
            }
            pid => {
                let mut status: libc::c_int = 0;
                loop {
                    if libc::waitpid(pid, &mut status, 0) == -1 {
                        if *libc::__errno_location() == libc::EINTR {
                            continue;
                        }
                        return false;
                    }
                    return libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0;
                }
            }
        }
    }
}

/// Generate the SBPL profile used with `sandbox-exec` on macOS: deny by
/// default, allow reads of declared inputs, writes of declared outputs and
/// temps, and network only when the policy allows it.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
pub fn sbpl_profile(spec: &super::spec::HermeticSpec, workdir: &std::path::Path) -> String {
    let mut profile = String::from("(version 1)\n(deny default)\n");
    profile.push_str("(allow process-exec*)\n(allow process-fork)\n(allow sysctl-read)\n");
    profile.push_str(&format!(
        "(allow file-read* (subpath \"{}\"))\n",
        workdir.display()
    ));
    for input in &spec.inputs {
        profile.push_str(&format!(
            "(allow file-read* (subpath \"{}\"))\n",
            input.display()
        ));
    }
    for path in spec.outputs.iter().chain(&spec.temps) {
        profile.push_str(&format!(
            "(allow file-write* file-read* (subpath \"{}\"))\n",
            path.display()
        ));
    }
    if !spec.network.is_disabled() {
        profile.push_str("(allow network*)\n");
    }
    profile
}
