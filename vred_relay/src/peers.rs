// Datagram peer tracking for the unreliable transport.
//
// UDP has no connection object, so "who is in the session" is derived from
// recent traffic: every datagram refreshes its sender's last-seen time, and
// broadcasts go to every tracked address except the sender. The liveness
// sweep (`expire`) is the only way a peer leaves the set; it collects the
// expired addresses first and removes them afterwards, so the map is never
// mutated while being iterated.
//
// Time is passed in by the caller (`Instant`), which keeps this module free
// of clocks and lets tests step time explicitly.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::router::Delivery;

/// A peer dropped by the liveness sweep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExpiredPeer {
    pub addr: SocketAddr,
    /// Time since the peer was last heard from.
    pub silent_for: Duration,
}

pub struct DatagramPeers {
    last_seen: HashMap<SocketAddr, Instant>,
    timeout: Duration,
}

impl DatagramPeers {
    pub fn new(timeout: Duration) -> Self {
        Self {
            last_seen: HashMap::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record traffic from `addr`. Returns true if the peer is new.
    pub fn touch(&mut self, addr: SocketAddr, now: Instant) -> bool {
        self.last_seen.insert(addr, now).is_none()
    }

    /// Addresses a payload from `from` should be sent to.
    pub fn targets(&self, from: SocketAddr, delivery: Delivery) -> Vec<SocketAddr> {
        match delivery {
            Delivery::Broadcast => self
                .last_seen
                .keys()
                .filter(|addr| **addr != from)
                .copied()
                .collect(),
            Delivery::Reply => vec![from],
        }
    }

    /// Drop every peer silent for longer than the timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<ExpiredPeer> {
        let expired: Vec<ExpiredPeer> = self
            .last_seen
            .iter()
            .filter_map(|(addr, seen)| {
                let silent_for = now.saturating_duration_since(*seen);
                (silent_for > self.timeout).then_some(ExpiredPeer {
                    addr: *addr,
                    silent_for,
                })
            })
            .collect();
        for peer in &expired {
            self.last_seen.remove(&peer.addr);
        }
        expired
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.last_seen.contains_key(addr)
    }

    pub fn clear(&mut self) {
        self.last_seen.clear();
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }
}
