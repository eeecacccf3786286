//! Linux namespace sandboxing.
//!
//! The sandboxed path unshares mount, pid, net, ipc, uts, and user
//! namespaces, maps the caller to root inside the user namespace, and
//! confines the action to a fresh rootfs assembled under the scratch
//! directory:
//!
//! - well-known system paths are bind-mounted read-only,
//! - the working tree is bind-mounted read-write,
//! - declared inputs outside the working tree are bind-mounted read-only,
//! - declared output parents and temps outside the working tree are
//!   bind-mounted read-write,
//! - `/tmp` is a plain directory inside the (scratch-backed, discarded)
//!   rootfs.
//!
//! Work splits across the fork boundary: [`plan`] runs in the parent and
//! does everything that may allocate (directory skeleton, `CString`
//! paths, uid map rendering); [`enter`] runs between fork and exec and
//! only issues raw syscalls on the pre-built plan.
//!
//! Cgroup v2 limits are managed from the parent via [`CgroupScope`]:
//! a per-action cgroup under the caller's own cgroup carries
//! `memory.max` and `pids.max`, and the child is attached right after
//! spawn. CPU *time* stays with `RLIMIT_CPU`; cgroup `cpu.max` is a
//! bandwidth knob and maps to no declared limit.

use std::{
    collections::BTreeMap,
    ffi::{CStr, CString},
    io,
    os::unix::ffi::OsStrExt as _,
    path::{Path, PathBuf},
};

use tracing::{debug, instrument, trace, warn};

use crate::error::{BuildError, Result};

use super::spec::HermeticSpec;

/// Host paths bound read-only into every sandbox so toolchains resolve.
/// Missing ones are skipped.
const SYSTEM_PATHS: &[&str] = &[
    "/usr", "/bin", "/sbin", "/lib", "/lib32", "/lib64", "/etc", "/dev", "/proc", "/run",
];

/// One bind mount of the sandbox filesystem.
struct BindMount {
    source: CString,
    target: CString,
    read_only: bool,
    /// Flags carried into the read-only remount. Inside a user namespace
    /// the kernel refuses a remount that drops flags locked on the
    /// source (nosuid/nodev/noexec on /proc and /dev, typically), so the
    /// source's flags are probed parent-side and preserved.
    remount_flags: libc::c_ulong,
}

/// Everything [`enter`] needs, pre-built so the post-fork side never
/// allocates.
pub struct SandboxPlan {
    unshare_flags: libc::c_int,
    setgroups_path: CString,
    uid_map_path: CString,
    uid_map: Vec<u8>,
    gid_map_path: CString,
    gid_map: Vec<u8>,
    mounts: Vec<BindMount>,
    root: CString,
    workdir: CString,
}

impl std::fmt::Debug for SandboxPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxPlan")
            .field("mounts", &self.mounts.len())
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

/// Assemble the sandbox for one action: rootfs skeleton on disk plus the
/// mount table and namespace parameters. Parent-side only.
#[instrument(skip(spec))]
pub fn plan(spec: &HermeticSpec, workdir: &Path, scratch: &Path) -> Result<SandboxPlan> {
    let rootfs = scratch.join("rootfs");
    create_dir(&rootfs)?;
    create_dir(&rootfs.join("tmp"))?;

    // Target path -> (source, read_only). BTreeMap orders parents before
    // their children, which is the order the mounts must happen in.
    let mut mounts: BTreeMap<PathBuf, (PathBuf, bool)> = BTreeMap::new();

    for system in SYSTEM_PATHS {
        let source = Path::new(system);
        if source.exists() {
            mounts.insert(source.to_path_buf(), (source.to_path_buf(), true));
        }
    }

    // The action's working tree, read-write.
    mounts.insert(workdir.to_path_buf(), (workdir.to_path_buf(), false));

    let resolve = |path: &Path| -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            workdir.join(path)
        }
    };

    // Declared inputs outside the working tree, read-only. Inputs inside
    // it ride along with the read-write workdir mount.
    for input in &spec.inputs {
        let source = resolve(input);
        if !source.starts_with(workdir) && source.exists() {
            mounts.entry(source.clone()).or_insert((source, true));
        }
    }

    // Output parents and temps outside the working tree, read-write.
    for output in &spec.outputs {
        let resolved = resolve(output);
        if resolved.starts_with(workdir) {
            continue;
        }
        if let Some(parent) = resolved.parent() {
            if parent.exists() {
                mounts.insert(parent.to_path_buf(), (parent.to_path_buf(), false));
            }
        }
    }
    for temp in &spec.temps {
        let source = resolve(temp);
        if source.starts_with(workdir) {
            continue;
        }
        if !source.exists() {
            create_dir(&source)?;
        }
        mounts.insert(source.clone(), (source, false));
    }

    let mut binds = Vec::with_capacity(mounts.len());
    for (target, (source, read_only)) in mounts {
        let node = prepare_node(&rootfs, &source, &target)?;
        let remount_flags = if read_only {
            libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY | preserved_mount_flags(&source)
        } else {
            0
        };
        binds.push(BindMount {
            source: cstr(&source)?,
            target: cstr(&node)?,
            read_only,
            remount_flags,
        });
        trace!(?source, ?target, read_only, "planned bind mount");
    }

    // Map the calling user to root inside the namespace; everything else
    // stays unmapped.
    // SAFETY: getuid/getgid have no preconditions.
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };

    let mut unshare_flags = libc::CLONE_NEWUSER
        | libc::CLONE_NEWNS
        | libc::CLONE_NEWPID
        | libc::CLONE_NEWIPC
        | libc::CLONE_NEWUTS;
    if spec.network.is_disabled() {
        unshare_flags |= libc::CLONE_NEWNET;
    }

    debug!(mounts = binds.len(), ?rootfs, "sandbox planned");
    Ok(SandboxPlan {
        unshare_flags,
        setgroups_path: CString::from(c"/proc/self/setgroups"),
        uid_map_path: CString::from(c"/proc/self/uid_map"),
        uid_map: format!("0 {uid} 1").into_bytes(),
        gid_map_path: CString::from(c"/proc/self/gid_map"),
        gid_map: format!("0 {gid} 1").into_bytes(),
        mounts: binds,
        root: cstr(&rootfs)?,
        workdir: cstr(workdir)?,
    })
}

/// Create the mount-target node for `source` under the rootfs: a
/// directory for directories, an empty file for files.
fn prepare_node(rootfs: &Path, source: &Path, target: &Path) -> Result<PathBuf> {
    let rel = target.strip_prefix("/").unwrap_or(target);
    let node = rootfs.join(rel);
    if source.is_dir() {
        create_dir(&node)?;
    } else {
        if let Some(parent) = node.parent() {
            create_dir(parent)?;
        }
        if !node.exists() {
            std::fs::File::create(&node)
                .map_err(|err| BuildError::storage(format!("create mount node {node:?}"), err))?;
        }
    }
    Ok(node)
}

fn create_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .map_err(|err| BuildError::storage(format!("create {path:?}"), err))
}

fn cstr(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| BuildError::config(format!("path {path:?} contains a NUL byte")))
}

/// Mount flags on the source that a user namespace will insist we keep.
fn preserved_mount_flags(source: &Path) -> libc::c_ulong {
    let Ok(path) = cstr(source) else {
        return 0;
    };
    // SAFETY: statvfs fills the zeroed out-param on success and touches
    // nothing else.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(path.as_ptr(), &mut stat) } != 0 {
        return 0;
    }
    let mut flags = 0;
    for (st_flag, ms_flag) in [
        (libc::ST_NOSUID, libc::MS_NOSUID),
        (libc::ST_NODEV, libc::MS_NODEV),
        (libc::ST_NOEXEC, libc::MS_NOEXEC),
        (libc::ST_NOATIME, libc::MS_NOATIME),
        (libc::ST_NODIRATIME, libc::MS_NODIRATIME),
        (libc::ST_RELATIME, libc::MS_RELATIME),
    ] {
        if stat.f_flag & st_flag != 0 {
            flags |= ms_flag;
        }
    }
    flags
}

/// Enter the sandbox. Runs between fork and exec.
///
/// Unshares the namespaces, maps the user, performs the planned bind
/// mounts, chroots into the rootfs, and forks once more so the exec'd
/// action becomes init of the fresh pid namespace (the intermediate
/// process only waits and propagates the exit status).
///
/// # Safety
/// Must only be called between fork and exec, with `plan` built by
/// [`plan`]. Every call below is a raw syscall on pre-built data; nothing
/// allocates or locks.
pub unsafe fn enter(plan: &SandboxPlan) -> io::Result<()> {
    // SAFETY: contract is documented on the function; each call is a
    // plain syscall.
    unsafe {
        if libc::unshare(plan.unshare_flags) == -1 {
            return Err(io::Error::last_os_error());
        }

        // Without this, writing gid_map is refused for unprivileged users.
        write_file(&plan.setgroups_path, b"deny")?;
        write_file(&plan.uid_map_path, &plan.uid_map)?;
        write_file(&plan.gid_map_path, &plan.gid_map)?;

        // Keep every mount below from propagating back to the host.
        if libc::mount(
            c"none".as_ptr(),
            c"/".as_ptr(),
            std::ptr::null(),
            libc::MS_REC | libc::MS_PRIVATE,
            std::ptr::null(),
        ) == -1
        {
            return Err(io::Error::last_os_error());
        }

        for mount in &plan.mounts {
            bind(mount)?;
        }

        if libc::chroot(plan.root.as_ptr()) == -1 {
            return Err(io::Error::last_os_error());
        }
        if libc::chdir(plan.workdir.as_ptr()) == -1 {
            return Err(io::Error::last_os_error());
        }

        // The first fork after unshare(CLONE_NEWPID) lands in the new pid
        // namespace; the action must be that process so its own children
        // get a working init. The intermediate shim waits and exits with
        // the action's status.
        match libc::fork() {
            -1 => Err(io::Error::last_os_error()),
            0 => Ok(()),
            child => {
                let mut status: libc::c_int = 0;
                loop {
                    if libc::waitpid(child, &mut status, 0) == -1 {
                        if *libc::__errno_location() == libc::EINTR {
                            continue;
                        }
                        libc::_exit(127);
                    }
                    if libc::WIFEXITED(status) {
                        libc::_exit(libc::WEXITSTATUS(status));
                    }
                    if libc::WIFSIGNALED(status) {
                        libc::_exit(128 + libc::WTERMSIG(status));
                    }
                }
            }
        }
    }
}

/// Bind-mount one plan entry, remounting read-only when asked.
///
/// # Safety
/// Between fork and exec only.
unsafe fn bind(mount: &BindMount) -> io::Result<()> {
    // SAFETY: raw syscalls on pre-built NUL-terminated paths.
    unsafe {
        if libc::mount(
            mount.source.as_ptr(),
            mount.target.as_ptr(),
            std::ptr::null(),
            libc::MS_BIND | libc::MS_REC,
            std::ptr::null(),
        ) == -1
        {
            return Err(io::Error::last_os_error());
        }
        if mount.read_only
            && libc::mount(
                c"none".as_ptr(),
                mount.target.as_ptr(),
                std::ptr::null(),
                mount.remount_flags,
                std::ptr::null(),
            ) == -1
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Write a small buffer to a path with raw syscalls.
///
/// # Safety
/// Between fork and exec only.
unsafe fn write_file(path: &CStr, bytes: &[u8]) -> io::Result<()> {
    // SAFETY: open/write/close are async-signal-safe syscalls.
    unsafe {
        let fd = libc::open(path.as_ptr(), libc::O_WRONLY);
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        let written = libc::write(fd, bytes.as_ptr().cast(), bytes.len());
        libc::close(fd);
        if written != bytes.len() as isize {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// A per-action cgroup v2 scope under the caller's own cgroup. Dropping
/// removes the (by then empty) cgroup directory.
#[derive(Debug)]
pub struct CgroupScope {
    path: PathBuf,
}

impl CgroupScope {
    /// Create the scope and apply the declared limits. Returns `None`
    /// when the host does not delegate cgroup control to this process.
    #[instrument(skip(limits))]
    pub fn create(limits: &super::spec::ResourceLimits) -> Option<Self> {
        let base = current_cgroup_dir()?;
        let path = base.join(format!("mason-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir(&path).ok()?;

        let scope = Self { path };
        if let Some(memory) = limits.memory_bytes {
            scope.write("memory.max", &memory.to_string());
        }
        if let Some(procs) = limits.max_procs {
            scope.write("pids.max", &procs.to_string());
        }
        debug!(path = ?scope.path, "created cgroup scope");
        Some(scope)
    }

    fn write(&self, knob: &str, value: &str) {
        if let Err(err) = std::fs::write(self.path.join(knob), value) {
            warn!(knob, %err, "failed to apply cgroup limit");
        }
    }

    /// Move a freshly spawned child into the scope.
    pub fn attach(&self, pid: u32) -> io::Result<()> {
        std::fs::write(self.path.join("cgroup.procs"), pid.to_string())
    }

    /// Current memory usage of everything in the scope, including the
    /// whole process tree under the pid-namespace shim.
    pub fn memory_current(&self) -> Option<u64> {
        std::fs::read_to_string(self.path.join("memory.current"))
            .ok()?
            .trim()
            .parse()
            .ok()
    }
}

impl Drop for CgroupScope {
    fn drop(&mut self) {
        // Fails while members linger; they are gone once the action was
        // reaped, and a leftover empty directory is harmless.
        let _ = std::fs::remove_dir(&self.path);
    }
}

/// The cgroup v2 directory this process currently lives in.
fn current_cgroup_dir() -> Option<PathBuf> {
    let contents = std::fs::read_to_string("/proc/self/cgroup").ok()?;
    // v2 format: `0::/user.slice/...`
    let path = contents
        .lines()
        .find_map(|line| line.strip_prefix("0::"))?
        .trim();
    Some(PathBuf::from("/sys/fs/cgroup").join(path.trim_start_matches('/')))
}

/// Whether this process can actually create cgroups, not just see the
/// hierarchy: tries to create and remove a probe directory in its own
/// cgroup.
pub fn probe_cgroup_delegation() -> bool {
    let Some(base) = current_cgroup_dir() else {
        return false;
    };
    let probe = base.join(format!("mason-probe-{}", std::process::id()));
    match std::fs::create_dir(&probe) {
        Ok(()) => {
            let _ = std::fs::remove_dir(&probe);
            true
        }
        Err(_) => false,
    }
}
