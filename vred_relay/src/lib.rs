// vred_relay: state-sync relay server for VRED networking.
//
// The relay lets several clients of a 3D application stay in sync. Clients
// send transforms, boolean states and RPCs over TCP or UDP; the relay
// rebroadcasts them to every other client on the same transport, keeps the
// newest state per entity, and hands that state to clients that join later
// (`hey` -> `ho`). It never interprets RPCs.
//
// Module overview:
// - `state.rs`:    `StateCache`: newest `(sequence, payload)` per entity.
// - `router.rs`:   `route()`: decode a message, decide reply vs broadcast,
//                  update the cache for sync packs.
// - `session.rs`:  `StreamSessions`: open TCP sessions and their fan-out.
// - `peers.rs`:    `DatagramPeers`: UDP peers by last-seen time, expiry.
// - `relay.rs`:    `Relay`: owns all of the above; one event at a time.
// - `server.rs`:   Sockets, reader threads, the dispatch loop (which also
//                  runs the liveness sweep) and shutdown.
// - `config.rs`:   `RelayConfig` and its JSON file form.
// - `client.rs`:   Small TCP/UDP clients for tests and manual use.
//
// Dependencies: `vred_protocol` for the wire format. Networking is plain
// `std::net` with threads and channels; no async runtime.

pub mod client;
pub mod config;
pub mod error;
pub mod peers;
pub mod relay;
pub mod router;
pub mod server;
pub mod session;
pub mod state;

pub use config::{ConfigError, RelayConfig};
pub use error::RelayError;
pub use server::{RelayAddrs, RelayHandle, start_relay};
