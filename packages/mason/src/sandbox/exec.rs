//! The hermetic executor: run one command under isolation, resource
//! limits, a wall-clock watchdog, and cooperative cancellation.
//!
//! Execution walks a fixed state machine — Prepare -> Launch -> Monitor ->
//! Collect — and cleanup of the scratch directory and the child process is
//! guaranteed on every exit path (the child is killed on drop if it is
//! still running).

use std::{
    collections::BTreeMap,
    io::Read,
    path::Path,
    process::{Child, Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, instrument, trace, warn};

use crate::{
    cancel::CancelToken,
    error::{BuildError, BuildErrorKind, ResourceKind, Result},
    hash::Digest,
};

#[cfg(target_os = "linux")]
use super::linux;
use super::{
    determinism::DeterminismEnv,
    platform::{Capabilities, IsolationLevel},
    spec::HermeticSpec,
};

/// The per-action cgroup scope, where the platform has one.
#[cfg(target_os = "linux")]
type CgroupHandle = Option<linux::CgroupScope>;
#[cfg(not(target_os = "linux"))]
type CgroupHandle = Option<std::convert::Infallible>;

/// Defaults applied to every action unless its spec overrides them.
#[derive(Clone, Debug, bon::Builder)]
pub struct SandboxDefaults {
    /// Isolation level the executor applies (and that the host must
    /// provide; execution refuses to start below it). At `Sandboxed` on
    /// Linux, each action runs inside fresh user/mount/pid/ipc/uts (and,
    /// when the network policy denies, net) namespaces, chrooted into a
    /// rootfs of bind mounts derived from its hermetic spec, with cgroup
    /// limits where the host delegates them.
    #[builder(default = IsolationLevel::Confined)]
    pub required_isolation: IsolationLevel,
    /// Resource sampling cadence for the monitor loop.
    #[builder(default = Duration::from_millis(50))]
    pub sample_interval: Duration,
    /// Time between graceful termination and force-kill on timeout.
    #[builder(default = Duration::from_secs(2))]
    pub grace_period: Duration,
    /// Determinism environment injected into every action.
    #[builder(default)]
    pub determinism: DeterminismEnv,
    /// Pass the parent's `PATH` through when the action does not declare
    /// one. Without it nothing resolves, which is rarely what anyone
    /// wants; set to false for fully explicit environments.
    #[builder(default = true)]
    pub inherit_path: bool,
}

impl Default for SandboxDefaults {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Peak resource consumption observed for one action.
#[derive(Clone, Copy, Debug, Default)]
pub struct ResourceUsage {
    pub peak_rss_bytes: u64,
    pub cpu_time: Option<Duration>,
}

/// Everything captured from one hermetic execution.
#[derive(Clone, Debug)]
pub struct ExecutionResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` when the child died to a signal.
    pub exit_code: Option<i32>,
    pub usage: ResourceUsage,
    pub duration: Duration,
    /// The isolation level actually applied.
    pub isolation: IsolationLevel,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// First `n` lines of stderr, for failure reports.
    pub fn stderr_head(&self, n: usize) -> String {
        String::from_utf8_lossy(&self.stderr)
            .lines()
            .take(n)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Executes single commands hermetically.
#[derive(Clone, Debug)]
pub struct HermeticExecutor {
    caps: Capabilities,
    defaults: SandboxDefaults,
}

impl HermeticExecutor {
    /// Probe the host and build an executor.
    pub fn new(defaults: SandboxDefaults) -> Self {
        Self {
            caps: Capabilities::probe(),
            defaults,
        }
    }

    /// The platform capability set, for callers that refuse weak hosts.
    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    /// Execute `argv` in `workdir` under `spec`. `seed` feeds the
    /// determinism shim; pass the action fingerprint digest.
    #[instrument(skip_all, fields(program = argv.first().map(String::as_str).unwrap_or("<empty>")))]
    pub fn execute(
        &self,
        argv: &[String],
        workdir: &Path,
        spec: &HermeticSpec,
        seed: &Digest,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult> {
        // Prepare.
        let start = Instant::now();
        if argv.is_empty() {
            return Err(BuildError::config("action has an empty command line"));
        }
        spec.validate()?;
        self.caps.require(self.defaults.required_isolation)?;
        if cancel.is_cancelled() {
            return Err(BuildError::new(BuildErrorKind::Cancelled));
        }

        let sandboxed = self.defaults.required_isolation == IsolationLevel::Sandboxed;
        let scratch = tempfile::tempdir()
            .map_err(|err| BuildError::storage("create scratch directory", err))?;

        // On Linux the sandboxed level means the real thing: a rootfs of
        // bind mounts derived from the spec, entered via pre_exec, plus a
        // cgroup scope when the host delegates one.
        #[cfg(target_os = "linux")]
        let plan = if sandboxed {
            Some(std::sync::Arc::new(linux::plan(spec, workdir, scratch.path())?))
        } else {
            None
        };
        #[cfg(target_os = "linux")]
        let cgroup: CgroupHandle = if sandboxed && self.caps.cgroups {
            linux::CgroupScope::create(&spec.resources)
        } else {
            None
        };
        #[cfg(not(target_os = "linux"))]
        let cgroup: CgroupHandle = None;

        let env = self.prepare_env(spec, seed, scratch.path(), sandboxed);
        let mut command = self.prepare_command(argv, workdir, spec, &env, sandboxed)?;
        #[cfg(target_os = "linux")]
        if let Some(plan) = plan.clone() {
            use std::os::unix::process::CommandExt as _;
            // SAFETY: `enter` only issues raw syscalls on the pre-built
            // plan between fork and exec; see its safety contract.
            unsafe {
                command.pre_exec(move || unsafe { linux::enter(&plan) });
            }
        }
        let isolation = self.applied_isolation(sandboxed);
        debug!(?workdir, %isolation, "prepared action");

        // Launch.
        let child = command.spawn().map_err(|err| {
            BuildError::storage(format!("spawn {}", argv[0]), err)
                .context("launch action", argv.join(" "))
        })?;
        let mut child = ChildGuard::new(child);
        trace!(pid = child.id(), "launched");
        #[cfg(target_os = "linux")]
        if let Some(scope) = &cgroup {
            if let Err(err) = scope.attach(child.id()) {
                warn!(%err, "failed to attach action to its cgroup scope");
            }
        }

        let stdout = child.take_stdout();
        let stderr = child.take_stderr();
        let stdout_reader = spawn_pipe_reader(stdout);
        let stderr_reader = spawn_pipe_reader(stderr);

        // Monitor.
        let monitored = self.monitor(&mut child, spec, cancel, start, &cgroup);

        // Collect. Reader threads finish once the child's pipes close,
        // which the guard guarantees by killing on every error path.
        let stdout = join_pipe_reader(stdout_reader);
        let stderr = join_pipe_reader(stderr_reader);
        let (status, usage) = monitored?;

        let duration = start.elapsed();
        let exit_code = status_code(&status);

        #[cfg(unix)]
        if let Some(signal) = status_signal(&status) {
            if signal == libc::SIGXCPU {
                return Err(BuildError::new(BuildErrorKind::ResourceExceeded {
                    which: ResourceKind::Cpu,
                }));
            }
        }
        // Under the pid-namespace shim the action's signal death reaches
        // us re-encoded as 128+signal.
        #[cfg(target_os = "linux")]
        if sandboxed && exit_code == Some(128 + libc::SIGXCPU) {
            return Err(BuildError::new(BuildErrorKind::ResourceExceeded {
                which: ResourceKind::Cpu,
            }));
        }

        debug!(?exit_code, ?duration, rss = usage.peak_rss_bytes, "collected action");
        Ok(ExecutionResult {
            stdout,
            stderr,
            exit_code,
            usage,
            duration,
            isolation,
        })
    }

    /// The isolation level this executor actually applies, as opposed to
    /// what the host is capable of.
    #[cfg(target_os = "linux")]
    fn applied_isolation(&self, sandboxed: bool) -> IsolationLevel {
        if sandboxed {
            IsolationLevel::Sandboxed
        } else {
            IsolationLevel::Confined
        }
    }

    #[cfg(target_os = "macos")]
    fn applied_isolation(&self, _sandboxed: bool) -> IsolationLevel {
        // sandbox-exec costs nothing, so it is applied whenever present.
        if self.caps.sandbox_exec {
            IsolationLevel::Sandboxed
        } else {
            IsolationLevel::Confined
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    fn applied_isolation(&self, _sandboxed: bool) -> IsolationLevel {
        self.caps.level
    }

    fn prepare_env(
        &self,
        spec: &HermeticSpec,
        seed: &Digest,
        scratch: &Path,
        sandboxed: bool,
    ) -> BTreeMap<String, String> {
        let mut env = spec.env.clone();
        if self.defaults.inherit_path && !env.contains_key("PATH") {
            if let Ok(path) = std::env::var("PATH") {
                env.insert("PATH".into(), path);
            }
        }
        // Inside the rootfs the scratch path does not exist; /tmp is the
        // rootfs-local scratch there.
        let tmpdir = if cfg!(target_os = "linux") && sandboxed {
            "/tmp".to_string()
        } else {
            scratch.display().to_string()
        };
        env.insert("TMPDIR".into(), tmpdir);
        self.defaults.determinism.inject(&mut env, seed);
        env
    }

    fn prepare_command(
        &self,
        argv: &[String],
        workdir: &Path,
        spec: &HermeticSpec,
        env: &BTreeMap<String, String>,
        sandboxed: bool,
    ) -> Result<Command> {
        let mut command = self.platform_command(argv, workdir, spec);
        command
            .current_dir(workdir)
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        self.apply_limits(&mut command, spec, sandboxed);
        Ok(command)
    }

    #[cfg(target_os = "macos")]
    fn platform_command(&self, argv: &[String], workdir: &Path, spec: &HermeticSpec) -> Command {
        if self.caps.sandbox_exec {
            let profile = super::platform::sbpl_profile(spec, workdir);
            let mut command = Command::new("/usr/bin/sandbox-exec");
            command.arg("-p").arg(profile).args(argv);
            command
        } else {
            let mut command = Command::new(&argv[0]);
            command.args(&argv[1..]);
            command
        }
    }

    #[cfg(not(target_os = "macos"))]
    fn platform_command(&self, argv: &[String], _workdir: &Path, _spec: &HermeticSpec) -> Command {
        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]);
        command
    }

    #[cfg(unix)]
    fn apply_limits(&self, command: &mut Command, spec: &HermeticSpec, sandboxed: bool) {
        use std::os::unix::process::CommandExt as _;

        let limits = spec.resources;
        // Confined-mode fallback only: the sandboxed path gets its net
        // namespace from the full unshare in `linux::enter`.
        let unshare_net = cfg!(target_os = "linux")
            && !sandboxed
            && self.caps.namespaces
            && spec.network.is_disabled();

        // SAFETY: the closure runs in the forked child before exec. Every
        // call inside is a raw syscall (setsid, setrlimit, unshare), all of
        // which are async-signal-safe; no allocation or locking happens.
        unsafe {
            command.pre_exec(move || {
                // New session so the whole process tree shares a process
                // group the monitor can signal as a unit.
                // SAFETY: plain syscalls between fork and exec, see above.
                if unsafe { libc::setsid() } == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                if let Some(cpu) = limits.cpu_time {
                    // SAFETY: see above.
                    unsafe { set_rlimit(libc::RLIMIT_CPU, cpu.as_secs().max(1)) }?;
                }
                if let Some(mem) = limits.memory_bytes {
                    // SAFETY: see above.
                    unsafe { set_rlimit(libc::RLIMIT_AS, mem) }?;
                }
                if let Some(fds) = limits.max_fds {
                    // SAFETY: see above.
                    unsafe { set_rlimit(libc::RLIMIT_NOFILE, fds) }?;
                }
                #[cfg(target_os = "linux")]
                if let Some(procs) = limits.max_procs {
                    // SAFETY: see above.
                    unsafe { set_rlimit(libc::RLIMIT_NPROC, procs) }?;
                }
                #[cfg(target_os = "linux")]
                if unshare_net {
                    // A fresh user namespace makes the fresh network
                    // namespace reachable without privileges; the child
                    // ends up with only a loopback-less netns.
                    // SAFETY: see above.
                    if unsafe { libc::unshare(libc::CLONE_NEWUSER | libc::CLONE_NEWNET) } == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                #[cfg(not(target_os = "linux"))]
                let _ = unshare_net;
                Ok(())
            });
        }
    }

    #[cfg(not(unix))]
    fn apply_limits(&self, _command: &mut Command, _spec: &HermeticSpec, _sandboxed: bool) {
        // Job-object style limits are not implemented here; the capability
        // probe already reports this platform as weakly isolated.
    }

    /// Poll the child until it exits, enforcing wall clock, memory, and
    /// cancellation. Returns the exit status and observed usage.
    ///
    /// Memory accounting prefers the cgroup scope when one exists: under
    /// the pid-namespace shim the direct child is only the tiny wait
    /// shim, while the cgroup sees the whole tree.
    fn monitor(
        &self,
        child: &mut ChildGuard,
        spec: &HermeticSpec,
        cancel: &CancelToken,
        start: Instant,
        cgroup: &CgroupHandle,
    ) -> Result<(std::process::ExitStatus, ResourceUsage)> {
        #[cfg(not(target_os = "linux"))]
        let _ = cgroup;
        let pid = Pid::from_u32(child.id());
        let mut system = System::new();
        let refresh = ProcessRefreshKind::nothing().with_memory().with_cpu();
        let mut usage = ResourceUsage::default();
        let deadline = spec.resources.wall_time.map(|limit| (start + limit, limit));

        loop {
            if let Some(status) = child.try_wait()? {
                return Ok((status, usage));
            }

            if cancel.is_cancelled() {
                warn!("cancellation observed; killing action");
                child.kill_group(self.defaults.grace_period)?;
                return Err(BuildError::new(BuildErrorKind::Cancelled));
            }

            if let Some((deadline, limit)) = deadline {
                if Instant::now() >= deadline {
                    warn!(?limit, "wall clock exceeded; killing action");
                    child.kill_group(self.defaults.grace_period)?;
                    return Err(BuildError::new(BuildErrorKind::Timeout {
                        limit_ms: limit.as_millis() as u64,
                    }));
                }
            }

            let mut rss = 0u64;
            system.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), true, refresh);
            if let Some(process) = system.process(pid) {
                rss = process.memory();
                usage.cpu_time = Some(Duration::from_millis(process.accumulated_cpu_time()));
            }
            #[cfg(target_os = "linux")]
            if let Some(scope) = cgroup {
                if let Some(current) = scope.memory_current() {
                    rss = rss.max(current);
                }
            }
            usage.peak_rss_bytes = usage.peak_rss_bytes.max(rss);
            if let Some(limit) = spec.resources.memory_bytes {
                if rss > limit {
                    warn!(rss, limit, "memory limit exceeded");
                    child.kill_group(self.defaults.grace_period)?;
                    return Err(BuildError::new(BuildErrorKind::ResourceExceeded {
                        which: ResourceKind::Memory,
                    }));
                }
            }

            thread::sleep(self.defaults.sample_interval);
        }
    }
}

fn status_code(status: &std::process::ExitStatus) -> Option<i32> {
    status.code()
}

#[cfg(unix)]
fn status_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt as _;
    status.signal()
}

/// Owns the child process; kills the whole process group if dropped while
/// the child still runs, so no exit path leaks processes.
struct ChildGuard {
    child: Child,
    reaped: bool,
}

impl ChildGuard {
    fn new(child: Child) -> Self {
        Self {
            child,
            reaped: false,
        }
    }

    fn id(&self) -> u32 {
        self.child.id()
    }

    fn take_stdout(&mut self) -> Option<std::process::ChildStdout> {
        self.child.stdout.take()
    }

    fn take_stderr(&mut self) -> Option<std::process::ChildStderr> {
        self.child.stderr.take()
    }

    fn try_wait(&mut self) -> Result<Option<std::process::ExitStatus>> {
        let status = self
            .child
            .try_wait()
            .map_err(|err| BuildError::storage("wait on action", err))?;
        if status.is_some() {
            self.reaped = true;
        }
        Ok(status)
    }

    /// Terminate the child's process group: graceful signal, grace period,
    /// then force kill. Always reaps.
    fn kill_group(&mut self, grace: Duration) -> Result<()> {
        #[cfg(unix)]
        {
            signal_group(self.child.id(), libc::SIGTERM);
            let waited = Instant::now();
            while waited.elapsed() < grace {
                if self
                    .child
                    .try_wait()
                    .map_err(|err| BuildError::storage("wait on action", err))?
                    .is_some()
                {
                    self.reaped = true;
                    return Ok(());
                }
                thread::sleep(Duration::from_millis(20));
            }
            signal_group(self.child.id(), libc::SIGKILL);
        }
        #[cfg(not(unix))]
        {
            let _ = grace;
            let _ = self.child.kill();
        }
        let _ = self
            .child
            .wait()
            .map_err(|err| BuildError::storage("reap action", err))?;
        self.reaped = true;
        Ok(())
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = self.kill_group(Duration::from_millis(200));
        }
    }
}

/// Signal the child's process group. The child called `setsid`, so its
/// pgid equals its pid.
#[cfg(unix)]
fn signal_group(pid: u32, signal: i32) {
    // SAFETY: kill(2) with a negative pgid is a plain syscall; a stale pid
    // at worst returns ESRCH, which we ignore.
    unsafe {
        libc::kill(-(pid as i32), signal);
    }
}

fn spawn_pipe_reader<R: Read + Send + 'static>(
    pipe: Option<R>,
) -> Option<thread::JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buffer = Vec::new();
            let _ = pipe.read_to_end(&mut buffer);
            buffer
        })
    })
}

fn join_pipe_reader(handle: Option<thread::JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

/// The platform's rlimit resource selector type: glibc uses a dedicated
/// enum type, everything else a plain int.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
type RlimitResource = libc::__rlimit_resource_t;
#[cfg(all(unix, not(all(target_os = "linux", target_env = "gnu"))))]
type RlimitResource = libc::c_int;

/// Set one rlimit in the pre-exec child.
///
/// # Safety
/// Must only be called between fork and exec; setrlimit is
/// async-signal-safe.
#[cfg(unix)]
unsafe fn set_rlimit(resource: RlimitResource, value: u64) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: value,
        rlim_max: value,
    };
    // SAFETY: `limit` is a valid rlimit struct on the child's stack.
    if unsafe { libc::setrlimit(resource, &limit) } == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn executor() -> HermeticExecutor {
        HermeticExecutor::new(SandboxDefaults::default())
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    #[test_log::test]
    fn captures_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let result = executor()
            .execute(
                &sh("echo out; echo err >&2; exit 3"),
                dir.path(),
                &HermeticSpec::default(),
                &crate::hash::hash_bytes(b"seed"),
                &CancelToken::new(),
            )
            .unwrap();

        assert_eq!(result.exit_code, Some(3));
        assert_eq!(String::from_utf8_lossy(&result.stdout).trim(), "out");
        assert_eq!(String::from_utf8_lossy(&result.stderr).trim(), "err");
        assert!(!result.success());
    }

    #[test_log::test]
    fn injects_deterministic_environment() {
        let dir = tempfile::tempdir().unwrap();
        let result = executor()
            .execute(
                &sh("printf '%s/%s' \"$TZ\" \"$LC_ALL\""),
                dir.path(),
                &HermeticSpec::default(),
                &crate::hash::hash_bytes(b"seed"),
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&result.stdout), "UTC/C");
    }

    #[test_log::test]
    fn environment_is_filtered_not_inherited() {
        // SAFETY: test-only env mutation; no other thread in this test
        // process depends on this variable.
        unsafe { std::env::set_var("MASON_TEST_LEAK", "should-not-appear") };
        let dir = tempfile::tempdir().unwrap();
        let result = executor()
            .execute(
                &sh("printf '%s' \"${MASON_TEST_LEAK:-clean}\""),
                dir.path(),
                &HermeticSpec::default(),
                &crate::hash::hash_bytes(b"seed"),
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&result.stdout), "clean");
    }

    #[test_log::test]
    fn wall_clock_timeout_kills_the_action() {
        let dir = tempfile::tempdir().unwrap();
        let spec = HermeticSpec {
            resources: super::super::spec::ResourceLimits {
                wall_time: Some(Duration::from_millis(200)),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = executor()
            .execute(
                &sh("sleep 30"),
                dir.path(),
                &spec,
                &crate::hash::hash_bytes(b"seed"),
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err.kind(), BuildErrorKind::Timeout { .. }));
    }

    #[test_log::test]
    fn pre_cancelled_token_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = executor()
            .execute(
                &sh("sleep 30"),
                dir.path(),
                &HermeticSpec::default(),
                &crate::hash::hash_bytes(b"seed"),
                &cancel,
            )
            .unwrap_err();
        assert!(matches!(err.kind(), BuildErrorKind::Cancelled));
    }

    /// Full namespace sandbox: the action sees its working tree
    /// read-write but nothing of the host outside the planned mounts.
    /// Skipped on hosts that cannot unshare user namespaces.
    #[cfg(target_os = "linux")]
    #[test_log::test]
    fn namespace_sandbox_confines_the_filesystem() {
        let caps = Capabilities::probe();
        if !caps.namespaces {
            eprintln!("user namespaces unavailable; skipping");
            return;
        }

        let workdir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), b"hidden").unwrap();

        let executor = HermeticExecutor::new(
            SandboxDefaults::builder()
                .required_isolation(IsolationLevel::Sandboxed)
                .build(),
        );
        let script = format!(
            "echo reached > marker.txt && [ ! -e {} ]",
            outside.path().join("secret.txt").display()
        );
        let result = executor
            .execute(
                &sh(&script),
                workdir.path(),
                &HermeticSpec::default(),
                &crate::hash::hash_bytes(b"seed"),
                &CancelToken::new(),
            )
            .unwrap();

        assert_eq!(
            result.exit_code,
            Some(0),
            "stderr: {}",
            String::from_utf8_lossy(&result.stderr)
        );
        assert_eq!(result.isolation, IsolationLevel::Sandboxed);
        assert!(
            workdir.path().join("marker.txt").exists(),
            "workdir bind mount is read-write"
        );
    }

    /// Without the sandboxed level the executor reports what it actually
    /// applied, not what the host could do.
    #[test_log::test]
    fn confined_mode_reports_confined() {
        let dir = tempfile::tempdir().unwrap();
        let result = executor()
            .execute(
                &sh("true"),
                dir.path(),
                &HermeticSpec::default(),
                &crate::hash::hash_bytes(b"seed"),
                &CancelToken::new(),
            )
            .unwrap();
        #[cfg(target_os = "linux")]
        assert_eq!(result.isolation, IsolationLevel::Confined);
        #[cfg(not(target_os = "linux"))]
        assert!(result.isolation >= IsolationLevel::Confined);
    }

    #[test_log::test]
    fn cancellation_kills_a_running_action() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();
        let canceller = {
            let cancel = cancel.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(150));
                cancel.cancel();
            })
        };

        let started = Instant::now();
        let err = executor()
            .execute(
                &sh("sleep 30"),
                dir.path(),
                &HermeticSpec::default(),
                &crate::hash::hash_bytes(b"seed"),
                &cancel,
            )
            .unwrap_err();
        canceller.join().unwrap();

        assert!(matches!(err.kind(), BuildErrorKind::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
