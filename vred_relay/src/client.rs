// Minimal relay clients for tests and manual poking.
//
// `StreamClient` talks to the relay over TCP. `connect()` spawns a
// background reader thread that splits the byte stream into messages with
// `FrameBuffer` and pushes them into an `mpsc` channel; the caller's thread
// keeps the write half and drains the inbox with `poll()` or
// `recv_timeout()`, so it never blocks on a socket read.
//
// `DatagramClient` is a connected UDP socket: each datagram is one message,
// so no reader thread is needed.
//
// Neither client does anything the relay depends on; real clients are free
// to speak the protocol however they like.

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, UdpSocket};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::debug;
use vred_protocol::{FrameBuffer, Message, SyncEntry, SyncKind, Value};

/// TCP client for the relay's stream transport.
pub struct StreamClient {
    writer: TcpStream,
    inbox: Receiver<Message>,
    _reader_thread: Option<JoinHandle<()>>,
}

impl StreamClient {
    /// Connect and start the background reader.
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let writer = TcpStream::connect(addr)?;
        writer.set_nodelay(true)?;
        let reader = writer.try_clone()?;

        let (tx, rx) = mpsc::channel();
        let reader_thread = thread::spawn(move || reader_loop(reader, tx));

        Ok(Self {
            writer,
            inbox: rx,
            _reader_thread: Some(reader_thread),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.writer.local_addr()
    }

    pub fn send(&mut self, msg: &Message) -> io::Result<()> {
        self.send_raw(&msg.encode())
    }

    /// Write bytes as-is, e.g. to exercise the relay with malformed input.
    pub fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes)
    }

    /// Ask for the current world state; the relay answers with `ho`.
    pub fn hey(&mut self) -> io::Result<()> {
        self.send(&Message::Hey)
    }

    pub fn ping(&mut self, seq: impl Into<Value>) -> io::Result<()> {
        self.send(&Message::Ping(seq.into()))
    }

    pub fn rpc(&mut self, name: &str, args: Vec<Value>) -> io::Result<()> {
        self.send(&Message::rpc(name, args))
    }

    pub fn sync(&mut self, kind: SyncKind, entries: Vec<SyncEntry>) -> io::Result<()> {
        self.send(&Message::sync(kind, entries))
    }

    /// Drain all queued messages (non-blocking).
    pub fn poll(&self) -> Vec<Message> {
        self.inbox.try_iter().collect()
    }

    /// Wait up to `timeout` for the next message.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Message> {
        self.inbox.recv_timeout(timeout).ok()
    }
}

/// Reader thread: split the stream into messages and push them to the inbox.
fn reader_loop(mut stream: TcpStream, tx: Sender<Message>) {
    let mut frames = FrameBuffer::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        frames.extend(&buf[..n]);
        loop {
            match frames.next_message() {
                Ok(Some(msg)) => {
                    if tx.send(msg).is_err() {
                        return; // Owner dropped the client
                    }
                }
                Ok(None) => break,
                Err(e) => debug!(error = %e, "skipping undecodable message from relay"),
            }
        }
    }
}

/// UDP client for the relay's datagram transport.
pub struct DatagramClient {
    socket: UdpSocket,
}

impl DatagramClient {
    /// Bind an ephemeral local port and connect it to the relay.
    pub fn bind(relay: SocketAddr) -> io::Result<Self> {
        let local: SocketAddr = if relay.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local)?;
        socket.connect(relay)?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn send(&self, msg: &Message) -> io::Result<()> {
        self.send_raw(&msg.encode())
    }

    pub fn send_raw(&self, bytes: &[u8]) -> io::Result<()> {
        self.socket.send(bytes).map(|_| ())
    }

    /// Wait up to `timeout` for one datagram and return its bytes.
    pub fn recv_raw_timeout(&self, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        self.socket.set_read_timeout(Some(timeout))?;
        let mut buf = vec![0u8; 65_536];
        match self.socket.recv(&mut buf) {
            Ok(n) => Ok(Some(buf[..n].to_vec())),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Wait up to `timeout` for one datagram and decode it.
    pub fn recv_timeout(&self, timeout: Duration) -> io::Result<Option<Message>> {
        match self.recv_raw_timeout(timeout)? {
            Some(bytes) => Message::decode(&bytes)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            None => Ok(None),
        }
    }
}
