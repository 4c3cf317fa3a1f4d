// The relay engine: one value owning all mutable relay state.
//
// `Relay` holds the state cache, the stream session set, the datagram peer
// map and the datagram send socket. `server.rs` owns exactly one `Relay` on
// its dispatch thread and feeds it events one at a time, so routing, cache
// updates and fan-out never interleave. Every method here runs to
// completion without blocking on reads.
//
// Fault scoping:
// - a message that fails to decode is logged and dropped; its sender stays
//   connected and the cache is untouched.
// - a stream session that cannot take a payload (its queue is full or its
//   writer hit an error) is closed; the others still receive it.
// - a failed datagram send is ignored (loss is acceptable on UDP).

use std::io;
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::time::Instant;

use tracing::{debug, error, info, warn};
use vred_protocol::split_frames;

use crate::config::{ConfigError, RelayConfig};
use crate::peers::DatagramPeers;
use crate::router::route;
use crate::session::{SessionId, StreamSessions};
use crate::state::StateCache;

pub struct Relay {
    state: StateCache,
    sessions: StreamSessions,
    peers: DatagramPeers,
    socket: Option<UdpSocket>,
}

impl Relay {
    /// `socket` is the handle datagram replies and broadcasts are sent from;
    /// without one, datagrams still update peers and state but nothing is
    /// sent.
    pub fn new(state: StateCache, peers: DatagramPeers, socket: Option<UdpSocket>) -> Self {
        Self {
            state,
            sessions: StreamSessions::new(),
            peers,
            socket,
        }
    }

    pub fn from_config(config: &RelayConfig, socket: Option<UdpSocket>) -> Result<Self, ConfigError> {
        Ok(Self::new(
            StateCache::new(config.keep_state),
            DatagramPeers::new(config.datagram_timeout()?),
            socket,
        ))
    }

    pub fn open_session(&mut self, stream: TcpStream, peer: SocketAddr) -> io::Result<SessionId> {
        let id = self.sessions.open(stream, peer)?;
        info!(session = %id, %peer, "stream session connected");
        Ok(id)
    }

    pub fn close_session(&mut self, id: SessionId) {
        if let Some(peer) = self.sessions.close(id) {
            info!(session = %id, %peer, "stream session disconnected");
        }
    }

    /// Handle one read's worth of bytes from a stream session. Every
    /// complete message in the buffer is routed in order; bytes are never
    /// carried over to the next read.
    pub fn on_stream_data(&mut self, from: SessionId, data: &[u8]) {
        debug!(session = %from, bytes = data.len(), "stream data");
        for frame in split_frames(data) {
            if !self.sessions.contains(from) {
                // Closed after this read was queued, or by a failed reply.
                return;
            }
            self.route_stream_message(from, frame);
        }
    }

    fn route_stream_message(&mut self, from: SessionId, raw: &[u8]) {
        let decision = match route(raw, &mut self.state) {
            Ok(decision) => decision,
            Err(e) => {
                error!(session = %from, error = %e, "dropping undecodable stream message");
                return;
            }
        };
        for (id, e) in self.sessions.deliver(from, &decision) {
            warn!(session = %id, error = %e, "stream session cannot take payload");
            self.close_session(id);
        }
    }

    /// Handle one datagram received at `now`.
    pub fn on_datagram(&mut self, from: SocketAddr, data: &[u8], now: Instant) {
        if self.peers.touch(from, now) {
            info!(peer = %from, "datagram peer joined");
        }
        debug!(peer = %from, bytes = data.len(), "datagram");

        let decision = match route(data, &mut self.state) {
            Ok(decision) => decision,
            Err(e) => {
                error!(peer = %from, error = %e, "dropping undecodable datagram");
                return;
            }
        };
        let Some(socket) = &self.socket else {
            return;
        };
        for target in self.peers.targets(from, decision.delivery) {
            if let Err(e) = socket.send_to(&decision.payload, target) {
                debug!(peer = %target, error = %e, "datagram send failed");
            }
        }
    }

    /// Liveness sweep: drop datagram peers that have gone quiet. Returns how
    /// many were dropped.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let expired = self.peers.expire(now);
        let timeout_secs = self.peers.timeout().as_secs_f64();
        for peer in &expired {
            warn!(
                peer = %peer.addr,
                elapsed_secs = peer.silent_for.as_secs_f64(),
                timeout_secs,
                "datagram peer timed out"
            );
        }
        expired.len()
    }

    /// Close every stream session and the datagram send socket.
    pub fn shutdown(&mut self) {
        debug!("shutting down relay");
        let closed = self.sessions.close_all();
        self.peers.clear();
        self.socket = None;
        debug!(sessions = closed, "closed all sessions");
    }

    pub fn state(&self) -> &StateCache {
        &self.state
    }

    pub fn sessions(&self) -> &StreamSessions {
        &self.sessions
    }

    pub fn peers(&self) -> &DatagramPeers {
        &self.peers
    }
}
