//! End-to-end test infrastructure for the build core.
//!
//! Provides a throwaway workspace plus a shell-command action provider so
//! tests can drive the full pipeline (graph -> scheduler -> cache ->
//! hermetic executor) with real processes and a real cache directory.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use color_eyre::{Result, eyre::Context as _};
use mason::{
    Action, ActionProvider, BuildContext, BuildOptions, LanguageTag, ProviderRegistry, Target,
    TargetId,
    error::BuildError,
    orchestrator::{BuildEvent, EventSink},
    sched::SchedulerConfig,
};

/// A provider that turns a target's `command` config into a single
/// `sh -c` action. Inputs are the target's sources; outputs come from the
/// `outputs` config list.
pub struct ShellProvider;

impl ActionProvider for ShellProvider {
    fn language(&self) -> LanguageTag {
        LanguageTag::new("shell")
    }

    fn plan(
        &self,
        target: &Target,
        _ctx: &BuildContext,
    ) -> mason::Result<Vec<Action>> {
        let command = target
            .config
            .get("command")
            .and_then(|value| value.as_str())
            .ok_or_else(|| {
                BuildError::config(format!("target {} has no command", target.id))
            })?;

        let action = Action::new(
            target.id.clone(),
            "run",
            vec!["sh".into(), "-c".into(), command.to_string()],
        )
        .with_inputs(target.sources.iter().cloned())
        .with_outputs(self.outputs_from_config(target));
        Ok(vec![action])
    }

    fn outputs(&self, target: &Target, _ctx: &BuildContext) -> Vec<PathBuf> {
        self.outputs_from_config(target)
    }
}

impl ShellProvider {
    fn outputs_from_config(&self, target: &Target) -> Vec<PathBuf> {
        target
            .config
            .get("outputs")
            .and_then(|value| value.as_array())
            .map(|outputs| {
                outputs
                    .iter()
                    .filter_map(|value| value.as_str())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Event sink counting executed vs cache-replayed actions.
#[derive(Debug, Default)]
pub struct CountingSink {
    executed: AtomicUsize,
    cached: AtomicUsize,
}

impl CountingSink {
    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }

    pub fn cached(&self) -> usize {
        self.cached.load(Ordering::SeqCst)
    }
}

impl EventSink for CountingSink {
    fn event(&self, event: &BuildEvent) {
        match event {
            BuildEvent::ActionExecuted { .. } => {
                self.executed.fetch_add(1, Ordering::SeqCst);
            }
            BuildEvent::ActionCached { .. } => {
                self.cached.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
    }
}

/// A temporary workspace wired up with the shell provider.
pub struct TestWorkspace {
    root: tempfile::TempDir,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        Ok(Self {
            root: tempfile::tempdir().context("create workspace")?,
        })
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Write a workspace-relative file, creating parent directories.
    pub fn write(&self, rel: &str, contents: &str) -> Result<PathBuf> {
        let path = self.root.path().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("create parents")?;
        }
        std::fs::write(&path, contents).with_context(|| format!("write {rel}"))?;
        Ok(path)
    }

    pub fn read(&self, rel: &str) -> Result<String> {
        std::fs::read_to_string(self.root.path().join(rel)).with_context(|| format!("read {rel}"))
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.root.path().join(rel).exists()
    }

    /// A shell target: `command` runs with `sources` as declared inputs
    /// and `outputs` as declared outputs.
    pub fn target(
        &self,
        name: &str,
        command: &str,
        sources: &[&str],
        deps: &[&str],
        outputs: &[&str],
    ) -> Target {
        Target::new(TargetId::new("test", name), "shell")
            .with_sources(sources.iter().map(PathBuf::from))
            .with_deps(deps.iter().map(|dep| TargetId::new("test", *dep)))
            .with_config(serde_json::json!({
                "command": command,
                "outputs": outputs,
            }))
    }

    pub fn id(name: &str) -> TargetId {
        TargetId::new("test", name)
    }

    pub fn roots(names: &[&str]) -> BTreeSet<TargetId> {
        names.iter().map(|name| Self::id(name)).collect()
    }

    /// A context with the shell provider, a counting sink, and the given
    /// worker count.
    pub fn context(&self, workers: usize) -> Result<(BuildContext, Arc<CountingSink>)> {
        self.context_with(
            workers,
            BuildOptions::builder()
                .scheduler(SchedulerConfig::builder().workers(workers).build())
                .build(),
        )
    }

    pub fn context_with(
        &self,
        workers: usize,
        mut options: BuildOptions,
    ) -> Result<(BuildContext, Arc<CountingSink>)> {
        options.scheduler = SchedulerConfig::builder().workers(workers).build();
        let mut providers = ProviderRegistry::new();
        providers.register(Box::new(ShellProvider));
        let sink = Arc::new(CountingSink::default());
        let ctx = BuildContext::open(self.root.path(), providers, options, sink.clone())
            .context("open build context")?;
        tracing::debug!(root = ?self.root.path(), workers, "opened test build context");
        Ok((ctx, sink))
    }
}
