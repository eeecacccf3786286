//! The parallel scheduler: a work-stealing worker pool over the
//! dependency graph.
//!
//! Each worker owns a Chase–Lev deque. Leaves are round-robined across
//! workers at start; when a node finishes, its dependents' remaining-dep
//! counters are decremented and any dependent that reaches zero is pushed
//! onto the completing worker's deque. Idle workers steal by
//! power-of-two-choices: sample two random peers and steal from the deeper
//! deque.
//!
//! Backpressure is structural: a worker runs one action at a time, so
//! in-flight work never exceeds the worker count.

pub mod peers;

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_deque::{Steal, Stealer, Worker as Deque};
use rand::Rng as _;
use tracing::{debug, error, instrument, trace, warn};

use crate::{
    cancel::CancelToken,
    error::{BuildError, BuildErrorKind, Result},
    graph::{DependencyGraph, NodeOutcome, NodeStatus},
    hash::Digest,
    target::{Target, TargetId},
};

/// What to do when a node fails.
#[derive(Copy, Clone, Eq, PartialEq, Debug, strum::Display)]
pub enum FailMode {
    /// Cancel everything in flight and drain the queues.
    #[strum(serialize = "fail-fast")]
    FailFast,
    /// Finish independent work and aggregate all failures.
    #[strum(serialize = "resilient")]
    Resilient,
}

/// Bounded exponential backoff for transient failures.
#[derive(Clone, Copy, Debug, bon::Builder)]
pub struct RetryPolicy {
    /// Total tries per node, first attempt included.
    #[builder(default = 3)]
    pub max_attempts: u32,
    #[builder(default = Duration::from_millis(50))]
    pub base_delay: Duration,
    #[builder(default = Duration::from_secs(2))]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), with jitter so
    /// retrying workers do not stampede.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis().max(1) as u64 / 2);
        base + Duration::from_millis(jitter_ms)
    }
}

/// Scheduler configuration.
#[derive(Clone, Debug, bon::Builder)]
pub struct SchedulerConfig {
    /// Worker count; also the admission bound on in-flight actions.
    #[builder(default = num_cpus::get().max(1))]
    pub workers: usize,
    #[builder(default = FailMode::FailFast)]
    pub fail_mode: FailMode,
    #[builder(default)]
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// What the work closure reports for one node.
#[derive(Clone, Debug)]
pub enum TaskOutcome {
    /// At least one action executed.
    Executed { outputs: Vec<(PathBuf, Digest)> },
    /// Every action replayed from cache.
    Cached { outputs: Vec<(PathBuf, Digest)> },
}

/// Aggregated result of one scheduler run.
#[derive(Debug, Default)]
pub struct SchedulerReport {
    pub executed: Vec<TargetId>,
    pub cached: Vec<TargetId>,
    pub failed: Vec<(TargetId, BuildError)>,
    /// `(node, failed dependency that blocks it)`.
    pub blocked: Vec<(TargetId, TargetId)>,
    pub cancelled: Vec<TargetId>,
    pub wall: Duration,
    /// Sum of time spent inside the work closure across workers.
    pub total_work: Duration,
    pub peak_in_flight: usize,
}

impl SchedulerReport {
    pub fn success(&self) -> bool {
        self.failed.is_empty() && self.blocked.is_empty() && self.cancelled.is_empty()
    }
}

/// Live queue metrics, exported to distributed peers.
#[derive(Debug, Default)]
pub struct QueueState {
    queued: AtomicUsize,
    in_flight: AtomicUsize,
    workers: AtomicUsize,
}

/// A point-in-time snapshot of [`QueueState`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QueueMetrics {
    pub queue_depth: usize,
    pub load_factor: f64,
}

impl QueueState {
    pub fn metrics(&self) -> QueueMetrics {
        let workers = self.workers.load(Ordering::Relaxed).max(1);
        let in_flight = self.in_flight.load(Ordering::Relaxed);
        QueueMetrics {
            queue_depth: self.queued.load(Ordering::Relaxed),
            load_factor: in_flight as f64 / workers as f64,
        }
    }
}

enum Event {
    Executed(TargetId, Duration),
    Cached(TargetId, Duration),
    Failed(TargetId, BuildError),
    Blocked(TargetId, TargetId),
    Cancelled(TargetId),
}

/// The work-stealing scheduler.
#[derive(Debug)]
pub struct Scheduler {
    config: SchedulerConfig,
    queue_state: Arc<QueueState>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            queue_state: Arc::new(QueueState::default()),
        }
    }

    /// Live metrics handle for distributed peers.
    pub fn queue_state(&self) -> Arc<QueueState> {
        Arc::clone(&self.queue_state)
    }

    /// Run `work` for every node of the validated graph, honoring
    /// dependency order, the fail mode, and the retry policy.
    #[instrument(skip_all, fields(nodes = graph.len(), workers = self.config.workers))]
    pub fn run<W>(
        &self,
        graph: &DependencyGraph,
        cancel: &CancelToken,
        work: W,
    ) -> Result<SchedulerReport>
    where
        W: Fn(&Target) -> Result<TaskOutcome> + Send + Sync,
    {
        let started = Instant::now();
        let total = graph.len();
        if total == 0 {
            return Ok(SchedulerReport::default());
        }

        let workers = self.config.workers.max(1);
        self.queue_state.workers.store(workers, Ordering::Relaxed);

        let mut deques: Vec<Deque<TargetId>> = (0..workers).map(|_| Deque::new_fifo()).collect();
        let stealers: Vec<Stealer<TargetId>> = deques.iter().map(Deque::stealer).collect();

        let remaining: BTreeMap<&TargetId, AtomicUsize> = graph
            .ids()
            .map(|id| (id, AtomicUsize::new(graph.deps_of(id).count())))
            .collect();

        let shared = Shared {
            graph,
            remaining,
            stealers,
            completed: AtomicUsize::new(0),
            total,
            swept: AtomicBool::new(false),
            queue_state: &self.queue_state,
            peak_in_flight: AtomicUsize::new(0),
            config: &self.config,
        };

        // Seed: round-robin the leaves across the workers.
        let mut seeded = 0usize;
        for id in graph.ids() {
            if shared.remaining[id].load(Ordering::Relaxed) == 0 {
                let node = shared.node(id)?;
                if node.transition(NodeStatus::Pending, NodeStatus::Ready)? {
                    deques[seeded % workers].push(id.clone());
                    shared.queue_state.queued.fetch_add(1, Ordering::Relaxed);
                    seeded += 1;
                }
            }
        }
        debug!(seeded, "seeded leaf nodes");

        let (events_tx, events_rx) = flume::unbounded::<Event>();
        thread::scope(|scope| {
            for (index, deque) in deques.drain(..).enumerate() {
                let shared = &shared;
                let work = &work;
                let events = events_tx.clone();
                let cancel = cancel.clone();
                thread::Builder::new()
                    .name(format!("mason-worker-{index}"))
                    .spawn_scoped(scope, move || {
                        worker_loop(index, deque, shared, cancel, work, events);
                    })
                    .map_err(|err| BuildError::storage("spawn worker thread", err))?;
            }
            Ok::<_, BuildError>(())
        })?;
        drop(events_tx);

        let mut report = SchedulerReport {
            wall: started.elapsed(),
            peak_in_flight: shared.peak_in_flight.load(Ordering::Relaxed),
            ..Default::default()
        };
        for event in events_rx.drain() {
            match event {
                Event::Executed(id, duration) => {
                    report.total_work += duration;
                    report.executed.push(id);
                }
                Event::Cached(id, duration) => {
                    report.total_work += duration;
                    report.cached.push(id);
                }
                Event::Failed(id, err) => report.failed.push((id, err)),
                Event::Blocked(id, by) => report.blocked.push((id, by)),
                Event::Cancelled(id) => report.cancelled.push(id),
            }
        }
        report.executed.sort();
        report.cached.sort();
        report.failed.sort_by(|a, b| a.0.cmp(&b.0));
        report.blocked.sort();
        report.cancelled.sort();
        debug!(
            executed = report.executed.len(),
            cached = report.cached.len(),
            failed = report.failed.len(),
            blocked = report.blocked.len(),
            cancelled = report.cancelled.len(),
            "scheduler finished"
        );
        Ok(report)
    }
}

struct Shared<'g> {
    graph: &'g DependencyGraph,
    remaining: BTreeMap<&'g TargetId, AtomicUsize>,
    stealers: Vec<Stealer<TargetId>>,
    completed: AtomicUsize,
    total: usize,
    swept: AtomicBool,
    queue_state: &'g QueueState,
    peak_in_flight: AtomicUsize,
    config: &'g SchedulerConfig,
}

impl<'g> Shared<'g> {
    fn node(&self, id: &TargetId) -> Result<&'g crate::graph::Node> {
        self.graph
            .node(id)
            .ok_or_else(|| BuildError::internal(format!("unknown node {id} in scheduler")))
    }

    fn complete_one(&self) {
        self.completed.fetch_add(1, Ordering::AcqRel);
    }

    fn all_done(&self) -> bool {
        self.completed.load(Ordering::Acquire) >= self.total
    }
}

fn worker_loop(
    index: usize,
    local: Deque<TargetId>,
    shared: &Shared<'_>,
    cancel: CancelToken,
    work: &(impl Fn(&Target) -> Result<TaskOutcome> + Send + Sync),
    events: flume::Sender<Event>,
) {
    loop {
        if shared.all_done() {
            break;
        }
        if cancel.is_cancelled() {
            sweep_cancelled(shared, &events);
        }

        let task = local.pop().or_else(|| steal(index, shared, &local));
        match task {
            Some(id) => {
                shared.queue_state.queued.fetch_sub(1, Ordering::Relaxed);
                if let Err(err) = process(&id, &local, shared, &cancel, work, &events) {
                    // An invariant violation inside processing; the node is
                    // accounted for so the run can still terminate.
                    error!(%id, %err, "internal scheduler error");
                    let _ = events.send(Event::Failed(id, err));
                    shared.complete_one();
                }
            }
            None => thread::sleep(Duration::from_micros(200)),
        }
    }
    trace!(index, "worker exiting");
}

/// Power-of-two-choices stealing: sample two random peers and steal from
/// the deeper deque. Steal attempts are non-blocking.
fn steal(me: usize, shared: &Shared<'_>, local: &Deque<TargetId>) -> Option<TargetId> {
    let peers = shared.stealers.len();
    if peers <= 1 {
        return None;
    }
    let mut rng = rand::thread_rng();
    let mut pick = || loop {
        let candidate = rng.gen_range(0..peers);
        if candidate != me {
            return candidate;
        }
    };
    let (a, b) = (pick(), pick());
    let deeper = if shared.stealers[a].len() >= shared.stealers[b].len() {
        [a, b]
    } else {
        [b, a]
    };

    for victim in deeper {
        loop {
            match shared.stealers[victim].steal_batch_and_pop(local) {
                Steal::Success(id) => {
                    trace!(victim, %id, "stole work");
                    return Some(id);
                }
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
    }
    None
}

fn process(
    id: &TargetId,
    local: &Deque<TargetId>,
    shared: &Shared<'_>,
    cancel: &CancelToken,
    work: &(impl Fn(&Target) -> Result<TaskOutcome> + Send + Sync),
    events: &flume::Sender<Event>,
) -> Result<()> {
    let node = shared.node(id)?;
    if !node.transition(NodeStatus::Ready, NodeStatus::Building)? {
        // Lost to a cancellation sweep.
        return Ok(());
    }

    let in_flight = shared.queue_state.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
    shared.peak_in_flight.fetch_max(in_flight, Ordering::Relaxed);
    let result = run_with_retries(node.target(), shared, cancel, work);
    shared.queue_state.in_flight.fetch_sub(1, Ordering::Relaxed);

    match result {
        Ok((outcome, duration)) => {
            let (status, event, outputs) = match outcome {
                TaskOutcome::Executed { outputs } => (
                    NodeStatus::Success,
                    Event::Executed(id.clone(), duration),
                    outputs,
                ),
                TaskOutcome::Cached { outputs } => (
                    NodeStatus::Cached,
                    Event::Cached(id.clone(), duration),
                    outputs,
                ),
            };
            let node_outcome = match status {
                NodeStatus::Cached => NodeOutcome::FromCache { outputs },
                _ => NodeOutcome::Built { outputs },
            };
            node.finish(NodeStatus::Building, status, node_outcome)?;
            shared.complete_one();
            let _ = events.send(event);
            unlock_dependents(id, local, shared)?;
        }
        Err(err) if matches!(err.kind(), BuildErrorKind::Cancelled) => {
            node.finish(NodeStatus::Building, NodeStatus::Cancelled, NodeOutcome::Cancelled)?;
            shared.complete_one();
            let _ = events.send(Event::Cancelled(id.clone()));
        }
        Err(err) => {
            warn!(%id, %err, "node failed");
            node.finish(
                NodeStatus::Building,
                NodeStatus::Failed,
                NodeOutcome::Failed { error: err.clone() },
            )?;
            shared.complete_one();
            let _ = events.send(Event::Failed(id.clone(), err));
            block_dependents(id, shared, events)?;
            if shared.config.fail_mode == FailMode::FailFast {
                cancel.cancel();
            }
        }
    }
    Ok(())
}

fn run_with_retries(
    target: &Target,
    shared: &Shared<'_>,
    cancel: &CancelToken,
    work: &(impl Fn(&Target) -> Result<TaskOutcome> + Send + Sync),
) -> Result<(TaskOutcome, Duration)> {
    let retry = shared.config.retry;
    let started = Instant::now();
    let mut attempt = 1;
    loop {
        match work(target) {
            Ok(outcome) => return Ok((outcome, started.elapsed())),
            Err(err)
                if err.is_transient()
                    && attempt < retry.max_attempts
                    && !cancel.is_cancelled() =>
            {
                let delay = retry.backoff(attempt);
                warn!(id = %target.id, attempt, ?delay, %err, "transient failure; retrying");
                thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Decrement dependents' remaining-dep counters; push any that reach zero
/// onto this worker's deque.
fn unlock_dependents(
    id: &TargetId,
    local: &Deque<TargetId>,
    shared: &Shared<'_>,
) -> Result<()> {
    for dependent in shared.graph.dependents_of(id) {
        let Some(counter) = shared.remaining.get(dependent) else {
            continue;
        };
        if counter.fetch_sub(1, Ordering::AcqRel) == 1 {
            let node = shared.node(dependent)?;
            if node.transition(NodeStatus::Pending, NodeStatus::Ready)? {
                local.push(dependent.clone());
                shared.queue_state.queued.fetch_add(1, Ordering::Relaxed);
                trace!(%dependent, "dependent ready");
            }
        }
    }
    Ok(())
}

/// Mark every transitive dependent of a failed node `Blocked{by}`.
fn block_dependents(
    failed: &TargetId,
    shared: &Shared<'_>,
    events: &flume::Sender<Event>,
) -> Result<()> {
    let mut queue: Vec<&TargetId> = shared.graph.dependents_of(failed).collect();
    while let Some(id) = queue.pop() {
        let node = shared.node(id)?;
        let status = node.status();
        if status.is_terminal() || status == NodeStatus::Building {
            continue;
        }
        let won = node.finish(
            status,
            NodeStatus::Blocked,
            NodeOutcome::Blocked { by: failed.clone() },
        );
        match won {
            Ok(true) => {
                shared.complete_one();
                let _ = events.send(Event::Blocked(id.clone(), failed.clone()));
                queue.extend(shared.graph.dependents_of(id));
            }
            // Lost a race to another terminal transition; whoever won
            // accounted for the node.
            Ok(false) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// After cancellation, mark every not-yet-started node `Cancelled` exactly
/// once so the run can terminate. Building nodes finish through their own
/// workers.
fn sweep_cancelled(shared: &Shared<'_>, events: &flume::Sender<Event>) {
    if shared.swept.swap(true, Ordering::AcqRel) {
        return;
    }
    debug!("cancellation sweep");
    for node in shared.graph.nodes() {
        let status = node.status();
        if status.is_terminal() || status == NodeStatus::Building {
            continue;
        }
        if let Ok(true) = node.finish(status, NodeStatus::Cancelled, NodeOutcome::Cancelled) {
            shared.complete_one();
            let _ = events.send(Event::Cancelled(node.id().clone()));
        }
    }
}
