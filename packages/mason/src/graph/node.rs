//! Graph nodes: runtime wrappers around targets with an atomic status cell.

use std::{
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU8, AtomicU32, Ordering},
    },
};

use serde::{Deserialize, Serialize};
use strum::{Display, FromRepr};

use crate::{
    error::{BuildError, Result},
    hash::Digest,
    target::{Target, TargetId},
};

/// Node execution status.
///
/// Legal transitions form a fixed DFA:
///
/// ```not_rust
/// Pending -> Ready            (all deps terminal-successful)
/// Ready   -> Building         (claimed by a worker)
/// Building-> Success | Cached | Failed | Cancelled
/// Pending | Ready -> Blocked | Cancelled
/// ```
///
/// Everything else is an invariant violation.
#[derive(
    Copy, Clone, Eq, PartialEq, Debug, Display, FromRepr, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum NodeStatus {
    Pending = 0,
    Ready = 1,
    Building = 2,
    Success = 3,
    Cached = 4,
    Failed = 5,
    Blocked = 6,
    Cancelled = 7,
}

impl NodeStatus {
    /// Whether the node has reached a final state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeStatus::Success
                | NodeStatus::Cached
                | NodeStatus::Failed
                | NodeStatus::Blocked
                | NodeStatus::Cancelled
        )
    }

    /// Whether dependents of a node in this state may proceed.
    pub fn unblocks_dependents(self) -> bool {
        matches!(self, NodeStatus::Success | NodeStatus::Cached)
    }

    fn may_become(self, next: NodeStatus) -> bool {
        use NodeStatus::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Ready, Building)
                | (Building, Success)
                | (Building, Cached)
                | (Building, Failed)
                | (Building, Cancelled)
                | (Pending, Blocked)
                | (Ready, Blocked)
                | (Pending, Cancelled)
                | (Ready, Cancelled)
        )
    }
}

/// Payload attached to a terminal node state.
#[derive(Clone, Debug)]
pub enum NodeOutcome {
    /// Built by executing actions; carries the produced outputs.
    Built { outputs: Vec<(PathBuf, Digest)> },
    /// Every action replayed from cache.
    FromCache { outputs: Vec<(PathBuf, Digest)> },
    Failed { error: BuildError },
    Blocked { by: TargetId },
    Cancelled,
}

/// A graph node. The graph owns all nodes; everything else refers to them
/// by [`TargetId`].
///
/// The status cell is a single atomic byte (release on write, acquire on
/// read) — this is the only cross-thread ordering edge the scheduler
/// needs. The outcome payload lives in a side slot written exactly once,
/// before the terminal status is published.
#[derive(Debug)]
pub struct Node {
    target: Arc<Target>,
    status: AtomicU8,
    depth: AtomicU32,
    outcome: Mutex<Option<NodeOutcome>>,
}

impl Node {
    pub fn new(target: Target) -> Self {
        Self {
            target: Arc::new(target),
            status: AtomicU8::new(NodeStatus::Pending as u8),
            depth: AtomicU32::new(0),
            outcome: Mutex::new(None),
        }
    }

    pub fn target(&self) -> &Arc<Target> {
        &self.target
    }

    pub fn id(&self) -> &TargetId {
        &self.target.id
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus::from_repr(self.status.load(Ordering::Acquire))
            .unwrap_or(NodeStatus::Pending)
    }

    /// Longest path from any root; leaves are 0. Assigned by validation.
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Relaxed)
    }

    pub(super) fn set_depth(&self, depth: u32) {
        self.depth.store(depth, Ordering::Relaxed);
    }

    /// Transition `from -> to`, enforcing the DFA. Returns whether this
    /// call won the transition: a lost race to an equally-legal transition
    /// is reported as `Ok(false)`, an illegal transition is an error.
    pub fn transition(&self, from: NodeStatus, to: NodeStatus) -> Result<bool> {
        if !from.may_become(to) {
            return Err(BuildError::internal(format!(
                "illegal node transition {from} -> {to} for {}",
                self.id()
            )));
        }
        Ok(self
            .status
            .compare_exchange(
                from as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok())
    }

    /// Publish the terminal outcome, then the terminal status. The write
    /// order matters: readers that observe a terminal status are
    /// guaranteed to see the outcome.
    pub fn finish(&self, from: NodeStatus, to: NodeStatus, outcome: NodeOutcome) -> Result<bool> {
        {
            let mut slot = self
                .outcome
                .lock()
                .map_err(|_| BuildError::internal("node outcome lock poisoned"))?;
            *slot = Some(outcome);
        }
        self.transition(from, to)
    }

    pub fn outcome(&self) -> Option<NodeOutcome> {
        self.outcome.lock().ok().and_then(|slot| slot.clone())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::target::{Target, TargetId};

    fn node() -> Node {
        Node::new(Target::new(TargetId::new("pkg", "t"), "shell"))
    }

    #[test]
    fn legal_lifecycle() {
        let node = node();
        assert_eq!(node.status(), NodeStatus::Pending);
        assert!(node.transition(NodeStatus::Pending, NodeStatus::Ready).unwrap());
        assert!(node.transition(NodeStatus::Ready, NodeStatus::Building).unwrap());
        assert!(
            node.finish(
                NodeStatus::Building,
                NodeStatus::Success,
                NodeOutcome::Built { outputs: vec![] },
            )
            .unwrap()
        );
        assert_eq!(node.status(), NodeStatus::Success);
        assert!(node.status().is_terminal());
    }

    #[test]
    fn illegal_transition_is_internal_error() {
        let node = node();
        let err = node
            .transition(NodeStatus::Pending, NodeStatus::Building)
            .unwrap_err();
        assert!(err.to_string().contains("illegal node transition"));
    }

    #[test]
    fn lost_race_is_not_an_error() {
        let node = node();
        assert!(node.transition(NodeStatus::Pending, NodeStatus::Ready).unwrap());
        // Second identical attempt loses the CAS but is legal.
        assert!(!node.transition(NodeStatus::Pending, NodeStatus::Ready).unwrap());
    }

    #[test]
    fn only_success_and_cached_unblock() {
        assert!(NodeStatus::Success.unblocks_dependents());
        assert!(NodeStatus::Cached.unblocks_dependents());
        assert!(!NodeStatus::Failed.unblocks_dependents());
        assert!(!NodeStatus::Blocked.unblocks_dependents());
    }
}
