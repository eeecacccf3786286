//! Peer tracking for the distributed work-stealing variant.
//!
//! Networked workers announce their queue depth and load factor via
//! `PeerMetricsUpdate` frames (see [`crate::proto`]). The table applies the
//! same power-of-two-choices policy used locally when picking a steal
//! victim, and prunes peers whose metrics have gone stale.

use std::time::Duration;

use dashmap::DashMap;
use jiff::Timestamp;
use rand::Rng as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace};

use crate::proto::{self, Message, PeerInfo};

/// Identifier of a networked peer.
#[derive(
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Debug,
    derive_more::Display,
    Serialize,
    Deserialize,
)]
#[display("{_0}")]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

/// Last-known state of one peer.
#[derive(Clone, Debug)]
pub struct PeerState {
    pub address: String,
    pub queue_depth: usize,
    pub load_factor: f64,
    pub last_seen: Timestamp,
}

/// Table of known peers and their load.
#[derive(Debug)]
pub struct PeerTable {
    peers: DashMap<PeerId, PeerState>,
    staleness: Duration,
}

impl PeerTable {
    /// `staleness` bounds how old a peer's metrics may be before
    /// [`PeerTable::prune`] drops it.
    pub fn new(staleness: Duration) -> Self {
        Self {
            peers: DashMap::new(),
            staleness,
        }
    }

    /// Record a metrics observation for a peer, inserting it if new.
    #[instrument(skip(self))]
    pub fn observe(
        &self,
        peer: PeerId,
        address: impl Into<String> + std::fmt::Debug,
        queue_depth: usize,
        load_factor: f64,
    ) {
        self.peers.insert(
            peer,
            PeerState {
                address: address.into(),
                queue_depth,
                load_factor,
                last_seen: Timestamp::now(),
            },
        );
    }

    pub fn remove(&self, peer: &PeerId) {
        self.peers.remove(peer);
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, peer: &PeerId) -> Option<PeerState> {
        self.peers.get(peer).map(|entry| entry.value().clone())
    }

    /// Drop peers whose last observation exceeds the staleness threshold.
    /// Returns how many were pruned.
    #[instrument(skip(self))]
    pub fn prune(&self) -> usize {
        let cutoff = Timestamp::now() - self.staleness;
        let before = self.peers.len();
        self.peers.retain(|_, state| state.last_seen >= cutoff);
        let pruned = before - self.peers.len();
        if pruned > 0 {
            debug!(pruned, "pruned stale peers");
        }
        pruned
    }

    /// Pick a steal victim by power-of-two-choices over queue depth:
    /// sample two random peers, prefer the deeper queue. Peers with empty
    /// queues are never picked.
    pub fn pick_victim(&self) -> Option<PeerId> {
        let candidates: Vec<(PeerId, usize)> = self
            .peers
            .iter()
            .filter(|entry| entry.value().queue_depth > 0)
            .map(|entry| (entry.key().clone(), entry.value().queue_depth))
            .collect();
        match candidates.len() {
            0 => None,
            1 => Some(candidates[0].0.clone()),
            len => {
                let mut rng = rand::thread_rng();
                let a = &candidates[rng.gen_range(0..len)];
                let b = &candidates[rng.gen_range(0..len)];
                let victim = if a.1 >= b.1 { &a.0 } else { &b.0 };
                trace!(%victim, "picked steal victim");
                Some(victim.clone())
            }
        }
    }

    /// Snapshot for `PeerDiscoveryResponse`.
    pub fn snapshot(&self) -> Vec<(PeerId, PeerState)> {
        let mut peers: Vec<_> = self
            .peers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        peers.sort_by(|a, b| a.0.cmp(&b.0));
        peers
    }

    /// Fold a received protocol message into the table. Returns the reply
    /// the message calls for, if any.
    pub fn handle(&self, message: &Message) -> Option<Message> {
        match message {
            Message::PeerAnnounce(info) => {
                self.observe(
                    PeerId::new(info.peer.as_str()),
                    info.address.clone(),
                    info.queue_depth,
                    info.load_factor,
                );
                None
            }
            Message::PeerMetricsUpdate {
                peer,
                queue_depth,
                load_factor,
            } => {
                if let Some(mut entry) = self.peers.get_mut(&PeerId::new(peer.as_str())) {
                    entry.queue_depth = *queue_depth;
                    entry.load_factor = *load_factor;
                    entry.last_seen = Timestamp::now();
                }
                None
            }
            Message::PeerDiscoveryRequest {} => Some(Message::PeerDiscoveryResponse {
                peers: self
                    .snapshot()
                    .into_iter()
                    .map(|(peer, state)| PeerInfo {
                        peer: peer.to_string(),
                        address: state.address,
                        queue_depth: state.queue_depth,
                        load_factor: state.load_factor,
                    })
                    .collect(),
            }),
            _ => None,
        }
    }
}

/// Announce this worker to a peer over an established connection.
pub fn announce(
    stream: &mut (impl std::io::Read + std::io::Write),
    info: PeerInfo,
) -> crate::error::Result<()> {
    proto::write_frame(stream, &Message::PeerAnnounce(info))
}

/// Ask a peer for everything it knows and fold the answer into `table`.
/// Returns how many peers were learned.
#[instrument(skip_all)]
pub fn discover(
    stream: &mut (impl std::io::Read + std::io::Write),
    table: &PeerTable,
) -> crate::error::Result<usize> {
    proto::write_frame(stream, &Message::PeerDiscoveryRequest {})?;
    match proto::read_frame(stream)? {
        Message::PeerDiscoveryResponse { peers } => {
            let learned = peers.len();
            for info in peers {
                table.observe(
                    PeerId::new(info.peer.as_str()),
                    info.address,
                    info.queue_depth,
                    info.load_factor,
                );
            }
            Ok(learned)
        }
        other => Err(crate::error::BuildError::network(format!(
            "expected discovery response, got {other:?}"
        ))),
    }
}
