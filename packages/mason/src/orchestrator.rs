//! The build orchestrator: the public entry point to the core.
//!
//! Ties the graph, the caches, the scheduler, and the hermetic executor
//! together:
//!
//! 1. Materialize the graph for the requested targets plus transitive
//!    deps, and validate it.
//! 2. Plan actions per target through the provider registry and
//!    fingerprint them (two-tier input hashing).
//! 3. Schedule; per node, replay from the action cache when the
//!    fingerprint hits, execute hermetically otherwise.
//! 4. Record outputs, persist the stamp memo, optionally collect garbage,
//!    and report.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use rayon::prelude::*;
use tracing::{debug, info, instrument, warn};

use crate::{
    acache::{ActionCache, ActionMetadata, CachedResult},
    action::{Action, ActionFingerprint},
    cancel::CancelToken,
    envelope::{self, SigningKey, magic},
    error::{BuildError, BuildErrorKind, ContextExt as _, Result},
    graph::DependencyGraph,
    hash::{Digest, StampDb, hash_bytes},
    layout::CacheLayout,
    provider::ProviderRegistry,
    sandbox::{HermeticExecutor, HermeticSpec, SandboxDefaults},
    sched::{Scheduler, SchedulerConfig, TaskOutcome},
    store::{GcPolicy, LocalStore, ObjectStore as _, RemoteConfig, RemoteStore, TieredStore},
    target::{Target, TargetId},
};

/// Telemetry boundary. Implementations live outside the core; the
/// orchestrator only emits.
pub trait EventSink: Send + Sync {
    fn event(&self, event: &BuildEvent);
}

/// Observable build events.
#[derive(Clone, Debug)]
pub enum BuildEvent {
    BuildStarted { targets: usize },
    ActionCached { target: TargetId },
    ActionExecuted { target: TargetId, duration: Duration },
    TargetFailed { target: TargetId, kind: String },
    CacheEvicted { objects: u64 },
    BuildFinished { built: usize, cached: usize, failed: usize },
}

/// Sink that drops everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn event(&self, _event: &BuildEvent) {}
}

/// Sink that forwards events to `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn event(&self, event: &BuildEvent) {
        info!(?event, "build event");
    }
}

/// Build configuration beyond the component defaults.
#[derive(Debug, bon::Builder)]
pub struct BuildOptions {
    /// Cache root override; defaults to `.builder-cache` under the
    /// workspace.
    pub cache_root: Option<PathBuf>,
    /// Remote cache tier, if any.
    pub remote: Option<RemoteConfig>,
    /// Mirror local writes to the remote tier.
    #[builder(default = true)]
    pub write_through: bool,
    #[builder(default)]
    pub scheduler: SchedulerConfig,
    #[builder(default)]
    pub sandbox: SandboxDefaults,
    /// Byte budget that triggers store GC at the end of a build.
    pub gc_max_bytes: Option<u64>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// One failed target in the report: the error kind chain, the command if
/// one was involved, and the head of its stderr.
#[derive(Clone, Debug)]
pub struct FailedTarget {
    pub target: TargetId,
    pub error: BuildError,
    /// Kind name first, then context frames outermost-first.
    pub chain: Vec<String>,
    pub command: Option<String>,
    pub stderr_head: String,
}

impl FailedTarget {
    fn new(target: TargetId, error: BuildError) -> Self {
        let chain = error.chain();
        let command = error
            .frames()
            .iter()
            .find(|frame| frame.operation == "run action")
            .map(|frame| frame.details.clone());
        let stderr_head = match error.kind() {
            BuildErrorKind::ActionFailed { stderr_head, .. } => stderr_head.clone(),
            _ => String::new(),
        };
        Self {
            target,
            error,
            chain,
            command,
            stderr_head,
        }
    }
}

/// The result of one build.
#[derive(Debug, Default)]
pub struct BuildReport {
    pub built: Vec<TargetId>,
    pub cached: Vec<TargetId>,
    pub failed: Vec<FailedTarget>,
    /// Blocked or cancelled: never attempted.
    pub skipped: Vec<TargetId>,
    pub duration: Duration,
    pub total_work: Duration,
    pub peak_in_flight: usize,
}

impl BuildReport {
    pub fn success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }

    /// Exit code contract: 0 success, 1 build failure, >=3 internal.
    /// (Config and graph violations surface as errors from
    /// [`BuildContext::build`] itself and map through
    /// [`BuildError::exit_code`] to 2.)
    pub fn exit_code(&self) -> i32 {
        self.failed
            .iter()
            .map(|failed| failed.error.exit_code())
            .max()
            .unwrap_or(if self.skipped.is_empty() { 0 } else { 1 })
    }
}

/// Map a whole build result to a process exit code.
pub fn exit_code(result: &Result<BuildReport>) -> i32 {
    match result {
        Ok(report) => report.exit_code(),
        Err(err) => err.exit_code(),
    }
}

/// Everything a build needs, threaded explicitly instead of living in
/// globals. Workers receive a shared read-only handle.
pub struct BuildContext {
    workspace_root: PathBuf,
    layout: CacheLayout,
    key: SigningKey,
    store: TieredStore,
    acache: ActionCache,
    providers: ProviderRegistry,
    scheduler: Scheduler,
    executor: HermeticExecutor,
    stamps: StampDb,
    events: Arc<dyn EventSink>,
    gc_max_bytes: Option<u64>,
}

impl std::fmt::Debug for BuildContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildContext")
            .field("workspace_root", &self.workspace_root)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl BuildContext {
    /// Open (or create) the caches for a workspace and assemble a context.
    #[instrument(skip(providers, options, events))]
    pub fn open(
        workspace_root: impl Into<PathBuf> + std::fmt::Debug,
        providers: ProviderRegistry,
        options: BuildOptions,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let workspace_root = workspace_root.into();
        let layout = match &options.cache_root {
            Some(root) => CacheLayout::at(root.clone()),
            None => CacheLayout::for_workspace(&workspace_root),
        };
        layout.ensure()?;

        let key = SigningKey::for_workspace(&workspace_root);
        let local = LocalStore::open(layout.objects_dir(), key.clone())?;
        let store = match &options.remote {
            Some(remote) => TieredStore::with_remote(
                local,
                RemoteStore::new(remote.clone())?,
                options.write_through,
            ),
            None => TieredStore::local_only(local),
        };
        let acache = ActionCache::open(layout.actions_dir(), key.clone())?;
        let stamps = load_stamps(&layout, &key);

        Ok(Self {
            workspace_root,
            layout,
            key,
            store,
            acache,
            providers,
            scheduler: Scheduler::new(options.scheduler),
            executor: HermeticExecutor::new(options.sandbox),
            stamps,
            events,
            gc_max_bytes: options.gc_max_bytes,
        })
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn store(&self) -> &TieredStore {
        &self.store
    }

    pub fn action_cache(&self) -> &ActionCache {
        &self.acache
    }

    pub fn executor(&self) -> &HermeticExecutor {
        &self.executor
    }

    /// Resolve a declared path: relative paths are workspace-relative.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }

    /// Two-tier content digest of a declared path.
    pub fn digest_of(&self, path: &Path) -> Result<Digest> {
        self.stamps.content_digest(&self.resolve(path))
    }

    /// Build the requested roots plus their transitive dependencies.
    #[instrument(skip_all, fields(roots = roots.len()))]
    pub fn build(
        &self,
        roots: &BTreeSet<TargetId>,
        targets: impl IntoIterator<Item = Target>,
    ) -> Result<BuildReport> {
        let started = Instant::now();
        let universe: BTreeMap<TargetId, Target> = targets
            .into_iter()
            .map(|target| (target.id.clone(), target))
            .collect();

        // The config digest covers everything that shapes the graph; it is
        // the invalidation key for the serialized graph cached on disk.
        let config_digest = config_digest(roots, &universe);
        let graph = match self.load_cached_graph(&config_digest) {
            Some(graph) => graph,
            None => {
                let graph = self.materialize(roots, &universe)?;
                self.persist_graph(&graph, &config_digest);
                graph
            }
        };
        graph.validate()?;
        self.events.event(&BuildEvent::BuildStarted {
            targets: graph.len(),
        });

        let plans = self.plan_all(&graph)?;
        let cancel = CancelToken::new();
        let sched_report = self.scheduler.run(&graph, &cancel, |target| {
            let plan = plans.get(&target.id).ok_or_else(|| {
                BuildError::internal(format!("no plan for scheduled target {}", target.id))
            })?;
            self.build_target(target, plan, &cancel)
        })?;

        self.persist_stamps();
        self.maybe_gc();

        let mut report = BuildReport {
            built: sched_report.executed,
            cached: sched_report.cached,
            failed: sched_report
                .failed
                .into_iter()
                .map(|(target, error)| {
                    self.events.event(&BuildEvent::TargetFailed {
                        target: target.clone(),
                        kind: error.name().to_string(),
                    });
                    FailedTarget::new(target, error)
                })
                .collect(),
            skipped: Vec::new(),
            duration: started.elapsed(),
            total_work: sched_report.total_work,
            peak_in_flight: sched_report.peak_in_flight,
        };
        report.skipped.extend(
            sched_report
                .blocked
                .into_iter()
                .map(|(target, _)| target)
                .chain(sched_report.cancelled),
        );
        report.skipped.sort();

        self.events.event(&BuildEvent::BuildFinished {
            built: report.built.len(),
            cached: report.cached.len(),
            failed: report.failed.len(),
        });
        debug!(
            built = report.built.len(),
            cached = report.cached.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "build finished"
        );
        Ok(report)
    }

    /// Materialize the graph for `roots` plus transitive deps.
    fn materialize(
        &self,
        roots: &BTreeSet<TargetId>,
        universe: &BTreeMap<TargetId, Target>,
    ) -> Result<DependencyGraph> {
        let mut graph = DependencyGraph::new();
        let mut queue: Vec<&TargetId> = roots.iter().collect();
        let mut seen: BTreeSet<&TargetId> = BTreeSet::new();

        while let Some(id) = queue.pop() {
            if !seen.insert(id) {
                continue;
            }
            let target = universe.get(id).ok_or_else(|| {
                BuildError::config(format!("unknown target {id}"))
            })?;
            graph.add_node(target.clone());
            queue.extend(&target.deps);
        }

        for id in seen {
            let target = &universe[id];
            for dep in &target.deps {
                graph
                    .add_edge(id, dep)
                    .ctx("materialize graph", format!("edge {id} -> {dep}"))?;
            }
        }
        Ok(graph)
    }

    /// Plan and fingerprint every node's actions up front. Planning is
    /// cheap and single-threaded; execution is where the parallelism is.
    ///
    /// Output ownership is checked here: no two actions anywhere in the
    /// build may declare the same output path, which is what makes
    /// concurrent execution safe.
    fn plan_all(&self, graph: &DependencyGraph) -> Result<BTreeMap<TargetId, Vec<PlannedAction>>> {
        let mut plans = BTreeMap::new();
        let mut output_owners: BTreeMap<PathBuf, TargetId> = BTreeMap::new();
        for node in graph.nodes() {
            let target = node.target();
            let provider = self.providers.get(&target.language).ok_or_else(|| {
                BuildError::config(format!(
                    "no provider registered for language {} (target {})",
                    target.language, target.id
                ))
            })?;
            let forced = provider.needs_rebuild(target, self);
            let actions = provider
                .plan(target, self)
                .ctx("plan target", &target.id)?;

            let mut planned = Vec::with_capacity(actions.len());
            for action in actions {
                for output in &action.outputs {
                    if let Some(owner) =
                        output_owners.insert(output.clone(), target.id.clone())
                    {
                        if owner != target.id {
                            return Err(BuildError::config(format!(
                                "output {output:?} declared by both {owner} and {}",
                                target.id
                            )));
                        }
                    }
                }
                planned.push(self.plan_action(action, forced)?);
            }
            plans.insert(target.id.clone(), planned);
        }
        Ok(plans)
    }

    fn plan_action(&self, action: Action, forced: bool) -> Result<PlannedAction> {
        let spec = match &action.sandbox {
            Some(spec) => spec.clone(),
            None => HermeticSpec {
                inputs: action.inputs.clone(),
                outputs: action.outputs.clone(),
                temps: BTreeSet::new(),
                env: action.env.clone(),
                resources: Default::default(),
                network: Default::default(),
            },
        };
        spec.validate()?;

        let mut input_digests = BTreeMap::new();
        for input in &action.inputs {
            let digest = self
                .digest_of(input)
                .ctx("fingerprint input", input.display())?;
            input_digests.insert(input.clone(), digest);
        }
        let fingerprint = ActionFingerprint::compute(&action, &input_digests, &spec);
        Ok(PlannedAction {
            action,
            spec,
            fingerprint,
            forced,
        })
    }

    /// Run one target's planned actions: replay each from cache when its
    /// fingerprint hits, execute hermetically otherwise.
    fn build_target(
        &self,
        target: &Target,
        plan: &[PlannedAction],
        cancel: &CancelToken,
    ) -> Result<TaskOutcome> {
        let mut outputs = Vec::new();
        let mut all_cached = true;

        for planned in plan {
            match self.try_restore(planned)? {
                Some(cached) => {
                    self.events.event(&BuildEvent::ActionCached {
                        target: target.id.clone(),
                    });
                    outputs.extend(cached.outputs);
                }
                None => {
                    all_cached = false;
                    let produced = self.execute_action(target, planned, cancel)?;
                    outputs.extend(produced);
                }
            }
        }

        if all_cached && !plan.is_empty() {
            Ok(TaskOutcome::Cached { outputs })
        } else {
            Ok(TaskOutcome::Executed { outputs })
        }
    }

    /// Attempt a cache replay. Corruption during restoration invalidates
    /// the entry and falls back to execution rather than failing.
    fn try_restore(&self, planned: &PlannedAction) -> Result<Option<CachedResult>> {
        if planned.forced {
            return Ok(None);
        }
        let Some(cached) = self.acache.lookup(&planned.fingerprint, &self.store)? else {
            return Ok(None);
        };

        for (path, digest) in &cached.outputs {
            let bytes = match self.store.get(digest) {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    warn!(%digest, "cached artifact vanished; re-executing");
                    self.acache.invalidate(&planned.fingerprint)?;
                    return Ok(None);
                }
                Err(err) if matches!(err.kind(), BuildErrorKind::CacheCorrupted { .. }) => {
                    warn!(%digest, %err, "cached artifact corrupt; re-executing");
                    self.acache.invalidate(&planned.fingerprint)?;
                    return Ok(None);
                }
                Err(err) => return Err(err),
            };
            let destination = self.resolve(path);
            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| BuildError::storage(format!("create {parent:?}"), err))?;
            }
            std::fs::write(&destination, &bytes)
                .map_err(|err| BuildError::storage(format!("restore {destination:?}"), err))?;
        }
        Ok(Some(cached))
    }

    /// Execute one action hermetically, capture and store its outputs,
    /// and record the action-cache entry.
    fn execute_action(
        &self,
        target: &Target,
        planned: &PlannedAction,
        cancel: &CancelToken,
    ) -> Result<Vec<(PathBuf, Digest)>> {
        let action = &planned.action;
        let result = self
            .executor
            .execute(
                &action.argv,
                &self.workspace_root,
                &planned.spec,
                planned.fingerprint.digest(),
                cancel,
            )
            .ctx("run action", action.argv.join(" "))?;

        if !result.success() {
            return Err(BuildError::new(BuildErrorKind::ActionFailed {
                target: target.id.clone(),
                exit_code: result.exit_code,
                stderr_head: result.stderr_head(20),
            })
            .context("run action", action.argv.join(" ")));
        }

        // Capture: hash and store every declared output, fanning the
        // hashing out across the rayon pool since artifacts can be large.
        // The stamp memo is refreshed so downstream fingerprints see the
        // new content without rereading.
        let outputs: Vec<(PathBuf, Digest)> = action
            .outputs
            .par_iter()
            .map(|path| {
                let resolved = self.resolve(path);
                let bytes = std::fs::read(&resolved).map_err(|err| {
                    if err.kind() == std::io::ErrorKind::NotFound {
                        BuildError::new(BuildErrorKind::ActionFailed {
                            target: target.id.clone(),
                            exit_code: result.exit_code,
                            stderr_head: format!("declared output {path:?} was not produced"),
                        })
                    } else {
                        BuildError::storage(format!("read output {resolved:?}"), err)
                    }
                })?;
                let digest = hash_bytes(&bytes);
                self.store.put(&bytes)?;
                self.stamps.forget(&resolved);
                Ok((path.clone(), digest))
            })
            .collect::<Result<_>>()?;

        self.acache.record(&CachedResult::new(
            planned.fingerprint,
            outputs.clone(),
            ActionMetadata {
                target: target.id.clone(),
                mnemonic: action.mnemonic.clone(),
                duration_ms: result.duration.as_millis() as u64,
                exit_code: result.exit_code.unwrap_or_default(),
            },
        ))?;

        self.events.event(&BuildEvent::ActionExecuted {
            target: target.id.clone(),
            duration: result.duration,
        });
        Ok(outputs)
    }

    /// Load the serialized graph from a previous build if its config
    /// digest still matches. Any failure here just means a rebuild.
    fn load_cached_graph(&self, config_digest: &Digest) -> Option<DependencyGraph> {
        let bytes = std::fs::read(self.layout.graph_file()).ok()?;
        match DependencyGraph::deserialize(&bytes, &self.key, config_digest) {
            Ok(Some(graph)) => {
                debug!(%config_digest, nodes = graph.len(), "reusing cached graph");
                Some(graph)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(%err, "cached graph unusable; rebuilding");
                None
            }
        }
    }

    fn persist_graph(&self, graph: &DependencyGraph, config_digest: &Digest) {
        match graph.serialize(&self.key, config_digest) {
            Ok(bytes) => {
                if let Err(err) = std::fs::write(self.layout.graph_file(), bytes) {
                    warn!(%err, "failed to persist graph cache");
                }
            }
            Err(err) => warn!(%err, "failed to serialize graph cache"),
        }
    }

    fn persist_stamps(&self) {
        let snapshot = self.stamps.snapshot();
        match envelope::seal_json(magic::STAMPS, &self.key, &snapshot) {
            Ok(sealed) => {
                if let Err(err) = std::fs::write(self.layout.stamps_file(), sealed) {
                    warn!(%err, "failed to persist stamp memo");
                }
            }
            Err(err) => warn!(%err, "failed to serialize stamp memo"),
        }
    }

    fn maybe_gc(&self) {
        let Some(max_bytes) = self.gc_max_bytes else {
            return;
        };
        let evicted = self
            .acache
            .live_digests()
            .and_then(|live| {
                self.store
                    .gc(GcPolicy::builder().max_total_bytes(max_bytes).build(), &live)
            });
        match evicted {
            Ok(0) => {}
            Ok(objects) => self.events.event(&BuildEvent::CacheEvicted { objects }),
            Err(err) => warn!(%err, "store gc failed"),
        }
    }
}

/// An action with its resolved spec and fingerprint.
#[derive(Clone, Debug)]
struct PlannedAction {
    action: Action,
    spec: HermeticSpec,
    fingerprint: ActionFingerprint,
    forced: bool,
}

/// Digest over the requested roots plus every target declaration: the
/// invalidation key for the cached graph.
fn config_digest(roots: &BTreeSet<TargetId>, universe: &BTreeMap<TargetId, Target>) -> Digest {
    // Values iterate in key order, so the serialization is canonical.
    let targets: Vec<&Target> = universe.values().collect();
    let canonical = serde_json::to_vec(&(roots, targets)).unwrap_or_default();
    hash_bytes(&canonical)
}

fn load_stamps(layout: &CacheLayout, key: &SigningKey) -> StampDb {
    match std::fs::read(layout.stamps_file()) {
        Ok(bytes) => match envelope::open_json(magic::STAMPS, key, &bytes) {
            Ok(snapshot) => StampDb::from_snapshot(snapshot),
            Err(err) => {
                warn!(%err, "stamp memo unreadable; starting cold");
                StampDb::new()
            }
        },
        Err(_) => StampDb::new(),
    }
}
