// Network threads and the dispatch loop for the relay.
//
// Architecture: thread-per-reader feeding one `mpsc` channel.
//
// - **Listener thread**: non-blocking `TcpListener::accept()` poll loop;
//   sends `InternalEvent::NewConnection` for each accepted stream.
// - **Reader threads** (one per stream session): blocking `read()` into a
//   buffer; each read becomes one `StreamData` event. End of stream or a read
//   error becomes `StreamClosed`.
// - **Datagram thread**: `recv_from()` with a short timeout so it can notice
//   shutdown; each datagram becomes one `Datagram` event stamped with its
//   arrival time.
// - **Writer threads** (one per stream session, see `session.rs`): drain a
//   bounded queue filled by the dispatch thread.
// - **Dispatch thread**: owns the `Relay` and handles events one at a time.
//   It is the only thread that touches relay state, and it never blocks on
//   a stream write. Its
//   `recv_timeout` deadline doubles as the liveness sweep timer; the sweep
//   also runs after any event that lands past the deadline, so steady
//   traffic cannot starve it.
//
// Shutdown: `RelayHandle::stop` clears `keep_running` and wakes the dispatch
// thread with `InternalEvent::Shutdown`. The dispatch thread closes every
// stream session (which unblocks their readers), drops its datagram send
// socket, joins the listener and datagram threads and exits.

use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::relay::Relay;
use crate::session::SessionId;

/// How long the listener and datagram threads wait between checks of the
/// running flag.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Size of one stream read. Messages are split within a read, never across
/// reads.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Largest UDP payload over IPv4.
const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Events sent from network threads to the dispatch thread.
enum InternalEvent {
    NewConnection {
        stream: TcpStream,
        peer: SocketAddr,
    },
    StreamData {
        session: SessionId,
        data: Vec<u8>,
    },
    StreamClosed {
        session: SessionId,
        error: Option<io::Error>,
    },
    Datagram {
        from: SocketAddr,
        data: Vec<u8>,
        at: Instant,
    },
    Shutdown,
}

/// Addresses the relay actually bound (useful when port 0 is configured).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelayAddrs {
    pub stream: SocketAddr,
    pub datagram: SocketAddr,
}

/// Handle returned by `start_relay` to control the running server.
pub struct RelayHandle {
    keep_running: Arc<AtomicBool>,
    wake: Sender<InternalEvent>,
    thread: Option<JoinHandle<()>>,
}

impl RelayHandle {
    /// Shut the relay down and wait for the dispatch thread to finish.
    pub fn stop(mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
        let _ = self.wake.send(InternalEvent::Shutdown);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Bind both transports and start the relay on background threads. Returns
/// a handle for stopping it and the bound addresses.
pub fn start_relay(config: RelayConfig) -> Result<(RelayHandle, RelayAddrs), RelayError> {
    config.validate()?;
    let sweep_interval = config.sweep_interval()?;

    let stream_addr = config.stream_addr()?;
    let listener = TcpListener::bind(stream_addr).map_err(|source| RelayError::Bind {
        transport: "stream",
        addr: stream_addr,
        source,
    })?;
    let datagram_addr = config.datagram_addr()?;
    let socket = UdpSocket::bind(datagram_addr).map_err(|source| RelayError::Bind {
        transport: "datagram",
        addr: datagram_addr,
        source,
    })?;
    let addrs = RelayAddrs {
        stream: listener.local_addr()?,
        datagram: socket.local_addr()?,
    };

    listener.set_nonblocking(true)?;
    socket.set_read_timeout(Some(POLL_INTERVAL))?;
    let relay = Relay::from_config(&config, Some(socket.try_clone()?))?;

    let keep_running = Arc::new(AtomicBool::new(true));
    let (tx, rx) = mpsc::channel();

    let workers = vec![
        spawn_named("relay-listener", {
            let tx = tx.clone();
            let keep_running = keep_running.clone();
            move || accept_loop(listener, tx, keep_running)
        })?,
        spawn_named("relay-datagram", {
            let tx = tx.clone();
            let keep_running = keep_running.clone();
            move || datagram_loop(socket, tx, keep_running)
        })?,
    ];

    let dispatch = Dispatch {
        relay,
        rx,
        tx: tx.clone(),
        keep_running: keep_running.clone(),
        sweep_interval,
        workers,
    };
    let thread = spawn_named("relay-dispatch", move || dispatch.run())?;

    info!(
        stream = %addrs.stream,
        datagram = %addrs.datagram,
        keep_state = config.keep_state,
        datagram_timeout_secs = config.datagram_timeout_secs,
        "relay startup complete"
    );

    Ok((
        RelayHandle {
            keep_running,
            wake: tx,
            thread: Some(thread),
        },
        addrs,
    ))
}

fn spawn_named<F>(name: &str, f: F) -> io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new().name(name.to_owned()).spawn(f)
}

/// State owned by the dispatch thread.
struct Dispatch {
    relay: Relay,
    rx: Receiver<InternalEvent>,
    /// Cloned into each new reader thread.
    tx: Sender<InternalEvent>,
    keep_running: Arc<AtomicBool>,
    sweep_interval: Duration,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatch {
    fn run(mut self) {
        let mut next_sweep = Instant::now() + self.sweep_interval;

        while self.keep_running.load(Ordering::SeqCst) {
            let wait = next_sweep.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(wait) {
                Ok(InternalEvent::Shutdown) => break,
                Ok(event) => self.handle_event(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            let now = Instant::now();
            if now >= next_sweep {
                self.relay.sweep(now);
                next_sweep = now + self.sweep_interval;
            }
        }

        self.keep_running.store(false, Ordering::SeqCst);
        self.relay.shutdown();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        info!("relay shutdown complete");
    }

    fn handle_event(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::NewConnection { stream, peer } => self.handle_new_connection(stream, peer),
            InternalEvent::StreamData { session, data } => {
                self.relay.on_stream_data(session, &data);
            }
            InternalEvent::StreamClosed { session, error } => {
                if let Some(e) = error {
                    warn!(session = %session, error = %e, "stream read failed");
                }
                self.relay.close_session(session);
            }
            InternalEvent::Datagram { from, data, at } => {
                self.relay.on_datagram(from, &data, at);
            }
            // Handled by the loop itself.
            InternalEvent::Shutdown => {}
        }
    }

    /// Register the session, then start its reader. The session is in the
    /// active set before any of its data can be dispatched.
    fn handle_new_connection(&mut self, stream: TcpStream, peer: SocketAddr) {
        let reader = match stream.try_clone() {
            Ok(reader) => reader,
            Err(e) => {
                warn!(%peer, error = %e, "could not clone accepted stream");
                return;
            }
        };
        let session = match self.relay.open_session(stream, peer) {
            Ok(session) => session,
            Err(e) => {
                warn!(%peer, error = %e, "could not open stream session");
                return;
            }
        };
        let tx = self.tx.clone();
        let spawned = spawn_named(&format!("relay-reader-{}", session.0), move || {
            reader_loop(reader, session, tx);
        });
        if let Err(e) = spawned {
            error!(session = %session, error = %e, "could not start reader thread");
            self.relay.close_session(session);
        }
    }
}

fn accept_loop(listener: TcpListener, tx: Sender<InternalEvent>, keep_running: Arc<AtomicBool>) {
    while keep_running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!(%peer, error = %e, "dropping stream that cannot block");
                    continue;
                }
                if tx.send(InternalEvent::NewConnection { stream, peer }).is_err() {
                    break;
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
    debug!("stream listener stopped");
}

/// Reader loop for a single stream session. Runs in its own thread.
fn reader_loop(mut stream: TcpStream, session: SessionId, tx: Sender<InternalEvent>) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => {
                let _ = tx.send(InternalEvent::StreamClosed {
                    session,
                    error: None,
                });
                break;
            }
            Ok(n) => {
                let data = buf[..n].to_vec();
                if tx.send(InternalEvent::StreamData { session, data }).is_err() {
                    break;
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                let _ = tx.send(InternalEvent::StreamClosed {
                    session,
                    error: Some(e),
                });
                break;
            }
        }
    }
}

fn datagram_loop(socket: UdpSocket, tx: Sender<InternalEvent>, keep_running: Arc<AtomicBool>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    while keep_running.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                let event = InternalEvent::Datagram {
                    from,
                    data: buf[..n].to_vec(),
                    at: Instant::now(),
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) => {}
            // Typically an ICMP "port unreachable" echoed back from an earlier
            // send to a departed peer.
            Err(e) => debug!(error = %e, "datagram receive failed"),
        }
    }
    debug!("datagram receiver stopped");
}
