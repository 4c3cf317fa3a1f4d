// vred_protocol: wire protocol for the VRED networking relay.
//
// This crate defines the message vocabulary clients and the relay exchange,
// the value types carried by sync packs, and the MessagePack codec. It is
// shared by the relay (`vred_relay`) and by clients, and does no I/O of its
// own: everything works on byte slices.
//
// Module overview:
// - `types.rs`:    `SyncKind`, `Sequence`, `Payload`, `SyncEntry`, and the
//                  `StateSnapshot` sent to joining clients.
// - `message.rs`:  The `Message` enum and its MessagePack encode/decode.
// - `framing.rs`:  Splitting read buffers and client byte streams into
//                  messages.
// - `error.rs`:    `DecodeError`.
//
// Design decisions:
// - **Dynamic MessagePack values.** Messages are heterogeneous arrays keyed
//   by their first element, which serde derives cannot express directly, so
//   decoding goes through `rmpv::Value` and validates each shape by hand.
// - **Opaque RPCs.** RPC names and arguments are carried, never interpreted.
//   The relay forwards the original bytes.

pub mod error;
pub mod framing;
pub mod message;
pub mod types;

pub use error::DecodeError;
pub use framing::{FrameBuffer, MAX_FRAME_SIZE, read_frame, split_frames};
pub use message::Message;
pub use rmpv::Value;
pub use types::{CachedEntry, Number, Payload, Sequence, StateSnapshot, SyncEntry, SyncKind};
