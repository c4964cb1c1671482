//! Connection watermarks and protection tags

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use libp2p::swarm::ConnectionId;
use libp2p::PeerId;

pub const LOW_WATERMARK: usize = 50;
pub const HIGH_WATERMARK: usize = 100;
pub const GRACE_PERIOD: Duration = Duration::from_secs(60);

struct TrackedConnection {
    peer: PeerId,
    opened: Instant,
}

pub struct ConnManager {
    low: usize,
    high: usize,
    grace: Duration,
    protected: HashMap<PeerId, HashSet<String>>,
    connections: HashMap<ConnectionId, TrackedConnection>,
    last_trim: Option<DateTime<Utc>>,
}

impl Default for ConnManager {
    fn default() -> Self {
        Self::new(LOW_WATERMARK, HIGH_WATERMARK, GRACE_PERIOD)
    }
}

impl ConnManager {
    pub fn new(low: usize, high: usize, grace: Duration) -> Self {
        Self {
            low,
            high,
            grace,
            protected: HashMap::new(),
            connections: HashMap::new(),
            last_trim: None,
        }
    }

    pub fn protect(&mut self, peer: PeerId, tag: &str) {
        self.protected.entry(peer).or_default().insert(tag.to_string());
    }

    /// Drop one tag; returns whether the peer is still protected
    pub fn unprotect(&mut self, peer: &PeerId, tag: &str) -> bool {
        let Some(tags) = self.protected.get_mut(peer) else {
            return false;
        };
        tags.remove(tag);
        if tags.is_empty() {
            self.protected.remove(peer);
            return false;
        }
        true
    }

    pub fn is_protected(&self, peer: &PeerId) -> bool {
        self.protected.contains_key(peer)
    }

    pub fn connection_opened(&mut self, id: ConnectionId, peer: PeerId, now: Instant) {
        self.connections.insert(id, TrackedConnection { peer, opened: now });
    }

    pub fn connection_closed(&mut self, id: &ConnectionId) {
        self.connections.remove(id);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn over_high_watermark(&self) -> bool {
        self.connections.len() > self.high
    }

    /// Peers to disconnect so the connection count falls to the low
    /// watermark, oldest first. Protected peers and peers with a connection
    /// younger than the grace period are kept.
    pub fn select_trim(&self, now: Instant) -> Vec<PeerId> {
        let total = self.connections.len();
        if total <= self.low {
            return Vec::new();
        }

        let mut per_peer: HashMap<PeerId, (usize, Instant)> = HashMap::new();
        for conn in self.connections.values() {
            let entry = per_peer.entry(conn.peer).or_insert((0, conn.opened));
            entry.0 += 1;
            entry.1 = entry.1.max(conn.opened);
        }

        let mut candidates: Vec<(PeerId, usize, Instant)> = per_peer
            .into_iter()
            .filter(|(peer, (_, newest))| {
                !self.is_protected(peer) && now.saturating_duration_since(*newest) >= self.grace
            })
            .map(|(peer, (count, newest))| (peer, count, newest))
            .collect();
        candidates.sort_by_key(|(_, _, newest)| *newest);

        let mut remaining = total;
        let mut trimmed = Vec::new();
        for (peer, count, _) in candidates {
            if remaining <= self.low {
                break;
            }
            remaining -= count;
            trimmed.push(peer);
        }
        trimmed
    }

    pub fn mark_trimmed(&mut self) {
        self.last_trim = Some(Utc::now());
    }

    pub fn last_trim(&self) -> Option<DateTime<Utc>> {
        self.last_trim
    }
}
