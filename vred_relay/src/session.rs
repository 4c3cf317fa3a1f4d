// Stream session set for the reliable transport.
//
// `StreamSessions` owns every open TCP connection, keyed by a relay-assigned
// `SessionId`. It is driven from the dispatch thread in `server.rs` (via
// `Relay`), which decides what each session receives; per-connection reader
// threads only read. Nothing here locks.
//
// The dispatch thread never writes to a socket itself. Each session has a
// writer thread draining a bounded outbound queue, so a client that stops
// reading can only stall its own writer. Once that client's queue is full,
// the next enqueue fails and the caller closes the session. A writer whose
// write fails (or times out) shuts the socket down and exits; the reader
// then sees end of stream, and any enqueue in between fails because the
// queue is disconnected.
//
// A session is `Open` while it is in the map. Closing it shuts the socket
// down in both directions (which also unblocks its reader and writer
// threads) and drops the handle; later sends addressed to it are silently
// skipped.
//
// Writes go out with `TCP_NODELAY` set, so small sync packs are not held
// back by Nagle coalescing.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::router::{Delivery, RoutingDecision};

/// Messages a session may have waiting behind a slow client before it is
/// dropped.
pub const OUTBOUND_QUEUE_LEN: usize = 256;

/// A single socket write taking longer than this disconnects the session.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Relay-assigned identifier for one stream connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct StreamSession {
    peer: SocketAddr,
    stream: TcpStream,
    outbound: SyncSender<Arc<[u8]>>,
}

/// The active set of stream sessions.
#[derive(Default)]
pub struct StreamSessions {
    sessions: BTreeMap<SessionId, StreamSession>,
    next_id: u64,
}

impl StreamSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an accepted connection and start its writer thread.
    pub fn open(&mut self, stream: TcpStream, peer: SocketAddr) -> io::Result<SessionId> {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(%peer, error = %e, "could not disable Nagle on stream session");
        }
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        let writer = stream.try_clone()?;

        let id = SessionId(self.next_id);
        let (outbound, queue) = mpsc::sync_channel(OUTBOUND_QUEUE_LEN);
        // Detached: it exits once the session's sender is dropped.
        let _ = thread::Builder::new()
            .name(format!("relay-writer-{}", id.0))
            .spawn(move || writer_loop(writer, queue, id))?;

        self.next_id += 1;
        self.sessions.insert(
            id,
            StreamSession {
                peer,
                stream,
                outbound,
            },
        );
        Ok(id)
    }

    /// Close and forget a session. Returns its peer address if it was open.
    pub fn close(&mut self, id: SessionId) -> Option<SocketAddr> {
        let session = self.sessions.remove(&id)?;
        session.stream.shutdown(Shutdown::Both).ok();
        Some(session.peer)
    }

    /// Close every session. Returns how many were open.
    pub fn close_all(&mut self) -> usize {
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in &ids {
            self.close(*id);
        }
        ids.len()
    }

    /// Queue `payload` for one session without blocking. A session that is
    /// no longer open is skipped without error.
    ///
    /// Fails when the session's queue is full or its writer has stopped;
    /// either way the session is no longer usable.
    pub fn send_to(&self, id: SessionId, payload: Arc<[u8]>) -> io::Result<()> {
        let Some(session) = self.sessions.get(&id) else {
            return Ok(());
        };
        session.outbound.try_send(payload).map_err(|e| match e {
            TrySendError::Full(_) => {
                io::Error::new(io::ErrorKind::WouldBlock, "outbound queue full")
            }
            TrySendError::Disconnected(_) => {
                io::Error::new(io::ErrorKind::BrokenPipe, "stream writer stopped")
            }
        })
    }

    /// Fan a routing decision out from session `from`: to every other open
    /// session for a broadcast, or back to `from` for a reply.
    ///
    /// Returns the sessions that could not take the payload; the caller
    /// closes them.
    pub fn deliver(
        &self,
        from: SessionId,
        decision: &RoutingDecision,
    ) -> Vec<(SessionId, io::Error)> {
        let targets: Vec<SessionId> = match decision.delivery {
            Delivery::Broadcast => self.ids().filter(|id| *id != from).collect(),
            Delivery::Reply => vec![from],
        };
        let payload: Arc<[u8]> = Arc::from(decision.payload.as_slice());
        let mut failed = Vec::new();
        for id in targets {
            if let Err(e) = self.send_to(id, payload.clone()) {
                failed.push((id, e));
            }
        }
        failed
    }

    pub fn ids(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.sessions.keys().copied()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Writer loop for a single stream session. Runs in its own thread until the
/// session is dropped or a write fails.
fn writer_loop(mut stream: TcpStream, queue: Receiver<Arc<[u8]>>, session: SessionId) {
    for payload in queue {
        if let Err(e) = stream.write_all(&payload) {
            debug!(session = %session, error = %e, "stream write failed");
            stream.shutdown(Shutdown::Both).ok();
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::net::TcpListener;

    use super::*;

    /// Create a TCP pair: (client_stream, server_stream) on localhost.
    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        (client, server)
    }

    fn open(sessions: &mut StreamSessions) -> (TcpStream, SessionId) {
        let (client, server) = tcp_pair();
        let peer = client.local_addr().unwrap();
        let id = sessions.open(server, peer).unwrap();
        (client, id)
    }

    /// Read exactly `len` bytes, or fail the test on timeout.
    fn read_n(client: &mut TcpStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        client.read_exact(&mut buf).unwrap();
        buf
    }

    fn nothing_pending(client: &mut TcpStream) -> bool {
        let mut buf = [0u8; 16];
        match client.read(&mut buf) {
            Err(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            Ok(_) => false,
        }
    }

    fn decision(delivery: Delivery, payload: &[u8]) -> RoutingDecision {
        RoutingDecision {
            delivery,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn ids_are_unique_and_sequential() {
        let mut sessions = StreamSessions::new();
        let (_a, id_a) = open(&mut sessions);
        let (_b, id_b) = open(&mut sessions);
        assert_eq!(id_a, SessionId(0));
        assert_eq!(id_b, SessionId(1));
        assert_eq!(sessions.len(), 2);
    }

    #[test]
    fn broadcast_skips_sender() {
        let mut sessions = StreamSessions::new();
        let (mut a, id_a) = open(&mut sessions);
        let (mut b, _) = open(&mut sessions);
        let (mut c, _) = open(&mut sessions);

        let failed = sessions.deliver(id_a, &decision(Delivery::Broadcast, b"sync"));
        assert!(failed.is_empty());

        assert_eq!(read_n(&mut b, 4), b"sync");
        assert_eq!(read_n(&mut c, 4), b"sync");
        assert!(nothing_pending(&mut a));
    }

    #[test]
    fn reply_goes_to_sender_only() {
        let mut sessions = StreamSessions::new();
        let (mut a, id_a) = open(&mut sessions);
        let (mut b, _) = open(&mut sessions);

        sessions.deliver(id_a, &decision(Delivery::Reply, b"pong"));

        assert_eq!(read_n(&mut a, 4), b"pong");
        assert!(nothing_pending(&mut b));
    }

    #[test]
    fn closed_session_is_skipped() {
        let mut sessions = StreamSessions::new();
        let (_a, id_a) = open(&mut sessions);
        let (mut b, id_b) = open(&mut sessions);
        let (mut c, _) = open(&mut sessions);

        assert!(sessions.close(id_b).is_some());
        assert!(sessions.close(id_b).is_none());
        assert!(!sessions.contains(id_b));

        let failed = sessions.deliver(id_a, &decision(Delivery::Broadcast, b"rpc!"));
        assert!(failed.is_empty());
        assert_eq!(read_n(&mut c, 4), b"rpc!");

        // Shut down: the client sees end of stream.
        let mut buf = [0u8; 4];
        assert_eq!(b.read(&mut buf).unwrap(), 0);
        assert!(sessions.send_to(id_b, Arc::from(&b"late"[..])).is_ok());
    }

    #[test]
    fn close_all_empties_the_set() {
        let mut sessions = StreamSessions::new();
        let (mut a, _) = open(&mut sessions);
        let (_b, _) = open(&mut sessions);

        assert_eq!(sessions.close_all(), 2);
        assert!(sessions.is_empty());
        let mut buf = [0u8; 4];
        assert_eq!(a.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn stalled_reader_overflows_its_queue_without_blocking() {
        let mut sessions = StreamSessions::new();
        let (_stalled, id) = open(&mut sessions);
        let big = decision(Delivery::Broadcast, &vec![7u8; 60_000]);

        // Nobody reads `_stalled`, so the socket buffers fill, then the
        // queue. Sending from an unknown id reaches every session.
        let mut failure = None;
        for _ in 0..(OUTBOUND_QUEUE_LEN * 10) {
            let mut failed = sessions.deliver(SessionId(u64::MAX), &big);
            if let Some(f) = failed.pop() {
                failure = Some(f);
                break;
            }
        }
        let (failed_id, e) = failure.expect("queue never filled");
        assert_eq!(failed_id, id);
        assert_eq!(e.kind(), io::ErrorKind::WouldBlock);
        assert!(sessions.close(id).is_some());
    }

    #[test]
    fn failed_write_is_reported_on_later_sends() {
        let mut sessions = StreamSessions::new();
        let (gone, id) = open(&mut sessions);
        drop(gone);

        // The first writes after the peer vanished may still be accepted by
        // the kernel; the writer stops at the first error.
        let reply = decision(Delivery::Reply, b"pong");
        let mut failure = None;
        for _ in 0..500 {
            if let Some(f) = sessions.deliver(id, &reply).pop() {
                failure = Some(f);
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        let (failed_id, e) = failure.expect("write to a closed peer never failed");
        assert_eq!(failed_id, id);
        assert_eq!(e.kind(), io::ErrorKind::BrokenPipe);
    }
}
