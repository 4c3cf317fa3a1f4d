// Message routing: what to send, and to whom.
//
// `route` decodes one inbound message and decides the reply bytes and
// whether they go back to the sender only or to everyone else. It is
// transport-agnostic; the stream and datagram paths in `relay.rs` both call
// it and then do their own fan-out.
//
//   hey        -> reply `ho` with the state snapshot
//   ping(seq)  -> reply `pong(seq)`
//   rpc        -> broadcast the original bytes
//   sync pack  -> update the state cache, then broadcast the original bytes
//
// `ho` and `pong` only ever travel relay-to-client, so receiving one is
// treated like any unrecognized tag. Routing keeps no per-connection state.

use tracing::debug;
use vred_protocol::{DecodeError, Message};

use crate::state::StateCache;

/// Who receives the routed payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Everyone in the sender's transport set except the sender.
    Broadcast,
    /// The sender only.
    Reply,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RoutingDecision {
    pub delivery: Delivery,
    pub payload: Vec<u8>,
}

impl RoutingDecision {
    fn broadcast(payload: Vec<u8>) -> Self {
        Self {
            delivery: Delivery::Broadcast,
            payload,
        }
    }

    fn reply(payload: Vec<u8>) -> Self {
        Self {
            delivery: Delivery::Reply,
            payload,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.delivery == Delivery::Broadcast
    }
}

/// Decode `raw` and decide how to answer it. Sync packs update `state`
/// before the decision is returned.
pub fn route(raw: &[u8], state: &mut StateCache) -> Result<RoutingDecision, DecodeError> {
    let message = Message::decode(raw)?;
    debug!(?message, "parsed message");

    match message {
        Message::Hey => Ok(RoutingDecision::reply(
            Message::Ho(state.snapshot()).encode(),
        )),
        Message::Ping(seq) => Ok(RoutingDecision::reply(Message::Pong(seq).encode())),
        Message::Rpc { .. } => Ok(RoutingDecision::broadcast(raw.to_vec())),
        Message::Sync { kind, entries } => {
            let applied = state.update(kind, &entries);
            debug!(%kind, received = entries.len(), applied, "sync pack");
            Ok(RoutingDecision::broadcast(raw.to_vec()))
        }
        other @ (Message::Ho(_) | Message::Pong(_)) => {
            Err(DecodeError::UnknownMessageType(other.tag().to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use vred_protocol::{Payload, Sequence, SyncEntry, SyncKind, Value};

    use super::*;

    fn pos_pack(id: &str, seq: i64, v: (i32, i32, i32)) -> Vec<u8> {
        Message::sync(
            SyncKind::Pos,
            vec![SyncEntry::new(id, seq, Payload::vector(v.0, v.1, v.2))],
        )
        .encode()
    }

    #[test]
    fn hey_replies_with_snapshot() {
        let mut state = StateCache::new(true);
        route(&pos_pack("v1P", 121, (1, 2, 1)), &mut state).unwrap();

        let decision = route(&Message::Hey.encode(), &mut state).unwrap();
        assert_eq!(decision.delivery, Delivery::Reply);
        match Message::decode(&decision.payload).unwrap() {
            Message::Ho(snapshot) => {
                let entry = snapshot.get(SyncKind::Pos, "v1P").unwrap();
                assert_eq!(entry.sequence, Sequence(121));
                assert_eq!(entry.payload, Payload::vector(1, 2, 1));
                for kind in [SyncKind::Rot, SyncKind::Scale, SyncKind::State] {
                    assert!(snapshot.entities(kind).is_empty());
                }
            }
            other => panic!("expected Ho, got {other:?}"),
        }
    }

    #[test]
    fn ping_replies_pong_with_same_sequence() {
        let mut state = StateCache::new(true);
        let seq = Value::Array(vec![Value::from(3), Value::from("x")]);
        let decision = route(&Message::Ping(seq.clone()).encode(), &mut state).unwrap();
        assert_eq!(decision.delivery, Delivery::Reply);
        assert_eq!(decision.payload, Message::Pong(seq).encode());
    }

    #[test]
    fn rpc_broadcasts_original_bytes() {
        let mut state = StateCache::new(true);
        let mut raw = Message::rpc("do_stuff", vec![Value::from(1), Value::from("yolo")]).encode();
        raw.push(b'\n');
        let decision = route(&raw, &mut state).unwrap();
        assert!(decision.is_broadcast());
        assert_eq!(decision.payload, raw);
        assert!(state.is_empty());
    }

    #[test]
    fn sync_pack_updates_cache_and_broadcasts_verbatim() {
        let mut state = StateCache::new(true);
        let raw = pos_pack("a", 7, (1, 1, 1));
        let decision = route(&raw, &mut state).unwrap();
        assert!(decision.is_broadcast());
        assert_eq!(decision.payload, raw);
        assert_eq!(state.get(SyncKind::Pos, "a").unwrap().sequence, Sequence(7));
    }

    #[test]
    fn stale_sync_pack_still_broadcast() {
        let mut state = StateCache::new(true);
        route(&pos_pack("a", 7, (1, 1, 1)), &mut state).unwrap();
        let stale = pos_pack("a", 6, (9, 9, 9));
        let decision = route(&stale, &mut state).unwrap();
        assert!(decision.is_broadcast());
        assert_eq!(
            state.get(SyncKind::Pos, "a").unwrap().payload,
            Payload::vector(1, 1, 1)
        );
    }

    #[test]
    fn relay_only_messages_rejected() {
        let mut state = StateCache::new(true);
        let pong = Message::Pong(Value::from(1)).encode();
        assert!(matches!(
            route(&pong, &mut state),
            Err(DecodeError::UnknownMessageType(tag)) if tag == "pong"
        ));
        let ho = Message::Ho(state.snapshot()).encode();
        assert!(matches!(
            route(&ho, &mut state),
            Err(DecodeError::UnknownMessageType(tag)) if tag == "ho"
        ));
    }

    #[test]
    fn malformed_input_leaves_cache_unchanged() {
        let mut state = StateCache::new(true);
        route(&pos_pack("a", 1, (1, 1, 1)), &mut state).unwrap();

        assert!(route(b"\xc1garbage", &mut state).is_err());
        let mut bad_kind = pos_pack("a", 2, (2, 2, 2));
        // Swap the "pos" tag for "poz".
        let tag_at = bad_kind.iter().position(|b| *b == b's').unwrap();
        bad_kind[tag_at] = b'z';
        assert!(route(&bad_kind, &mut state).is_err());

        assert_eq!(state.len(), 1);
        assert_eq!(state.get(SyncKind::Pos, "a").unwrap().sequence, Sequence(1));
    }

    #[test]
    fn hey_with_retention_disabled_is_empty() {
        let mut state = StateCache::new(false);
        route(&pos_pack("a", 1, (1, 1, 1)), &mut state).unwrap();
        let decision = route(&Message::Hey.encode(), &mut state).unwrap();
        match Message::decode(&decision.payload).unwrap() {
            Message::Ho(snapshot) => assert!(snapshot.is_empty()),
            other => panic!("expected Ho, got {other:?}"),
        }
    }
}
