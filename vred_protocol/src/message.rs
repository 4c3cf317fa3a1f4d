// Protocol messages and their MessagePack encoding.
//
// Every message on the wire is a MessagePack array whose first element is a
// string tag:
//
//   ["hey"]                                  handshake request
//   ["ho", {kind: {id: [seq, payload]}}]     handshake reply with the snapshot
//   ["rpc", name, [args...]]                 opaque remote call
//   ["ping", seq] / ["pong", seq]            liveness probe and echo
//   [kind, [[id, seq, payload], ...]]        sync pack, kind in pos/rot/scale/state
//
// `Message` is the closed set of these shapes. Decoding validates the shape
// of every field (including that a payload matches its kind), so the relay
// only ever sees well-formed values. RPC arguments and ping sequence values
// are kept as raw `rmpv::Value`s: the relay never interprets them.

use rmpv::Value;

use crate::error::DecodeError;
use crate::types::{CachedEntry, Number, Payload, Sequence, StateSnapshot, SyncEntry, SyncKind};

/// A decoded protocol message.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// Join handshake; the relay answers with `Ho`.
    Hey,
    /// Handshake reply carrying the latest known state.
    Ho(StateSnapshot),
    /// Remote call, relayed verbatim to every other client.
    Rpc { name: String, args: Vec<Value> },
    /// Liveness probe. The sequence value is echoed back untouched.
    Ping(Value),
    Pong(Value),
    /// Batch of latest transforms or states for some entities.
    Sync {
        kind: SyncKind,
        entries: Vec<SyncEntry>,
    },
}

impl Message {
    pub fn rpc(name: impl Into<String>, args: Vec<Value>) -> Self {
        Message::Rpc {
            name: name.into(),
            args,
        }
    }

    pub fn sync(kind: SyncKind, entries: Vec<SyncEntry>) -> Self {
        Message::Sync { kind, entries }
    }

    /// The wire tag of this message.
    pub fn tag(&self) -> &'static str {
        match self {
            Message::Hey => "hey",
            Message::Ho(_) => "ho",
            Message::Rpc { .. } => "rpc",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::Sync { kind, .. } => kind.tag(),
        }
    }

    /// Encode to MessagePack bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &self.to_value())
            .expect("writing msgpack into a Vec is infallible");
        buf
    }

    /// Decode exactly one message from `bytes`.
    ///
    /// Trailing `\n` bytes are ignored (line-framed clients append one);
    /// anything else after the message is an error.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut rest = bytes;
        let value = rmpv::decode::read_value(&mut rest)?;
        if !rest.iter().all(|b| *b == b'\n') {
            return Err(DecodeError::TrailingBytes(rest.len()));
        }
        Self::from_value(value)
    }

    pub fn to_value(&self) -> Value {
        let mut items = vec![Value::from(self.tag())];
        match self {
            Message::Hey => {}
            Message::Ho(snapshot) => items.push(snapshot_to_value(snapshot)),
            Message::Rpc { name, args } => {
                items.push(Value::from(name.as_str()));
                items.push(Value::Array(args.clone()));
            }
            Message::Ping(seq) | Message::Pong(seq) => items.push(seq.clone()),
            Message::Sync { entries, .. } => {
                items.push(Value::Array(entries.iter().map(entry_to_value).collect()));
            }
        }
        Value::Array(items)
    }

    /// Interpret an already-decoded MessagePack value as a message.
    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let Value::Array(items) = value else {
            return Err(DecodeError::NotAnArray);
        };
        let mut items = items.into_iter();
        let tag = match items.next() {
            None => return Err(DecodeError::Empty),
            Some(Value::String(tag)) => tag.into_str().ok_or(DecodeError::TagNotString)?,
            Some(_) => return Err(DecodeError::TagNotString),
        };
        let fields: Vec<Value> = items.collect();

        match tag.as_str() {
            // Extra fields after "hey" carry nothing; older clients send none.
            "hey" => Ok(Message::Hey),
            "ho" => {
                let [snapshot] = take_fields::<1>("ho", fields)?;
                Ok(Message::Ho(snapshot_from_value(snapshot)?))
            }
            "rpc" => {
                let [name, args] = take_fields::<2>("rpc", fields)?;
                let name = string_field("rpc", name, "name")?;
                let Value::Array(args) = args else {
                    return Err(DecodeError::invalid("rpc", "args is not an array"));
                };
                Ok(Message::Rpc { name, args })
            }
            "ping" => {
                let [seq] = take_fields::<1>("ping", fields)?;
                Ok(Message::Ping(seq))
            }
            "pong" => {
                let [seq] = take_fields::<1>("pong", fields)?;
                Ok(Message::Pong(seq))
            }
            other => {
                let Some(kind) = SyncKind::from_tag(other) else {
                    return Err(DecodeError::UnknownMessageType(other.to_owned()));
                };
                let [entries] = take_fields::<1>(kind.tag(), fields)?;
                let Value::Array(entries) = entries else {
                    return Err(DecodeError::invalid(kind.tag(), "entries is not an array"));
                };
                let entries = entries
                    .into_iter()
                    .map(|entry| entry_from_value(kind, entry))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Message::Sync { kind, entries })
            }
        }
    }
}

fn take_fields<const N: usize>(
    tag: &'static str,
    fields: Vec<Value>,
) -> Result<[Value; N], DecodeError> {
    let len = fields.len();
    <[Value; N]>::try_from(fields)
        .map_err(|_| DecodeError::invalid(tag, format!("expected {N} fields, got {len}")))
}

fn string_field(tag: &'static str, value: Value, what: &str) -> Result<String, DecodeError> {
    match value {
        Value::String(s) => s
            .into_str()
            .ok_or_else(|| DecodeError::invalid(tag, format!("{what} is not valid utf-8"))),
        _ => Err(DecodeError::invalid(tag, format!("{what} is not a string"))),
    }
}

fn payload_to_value(payload: &Payload) -> Value {
    match payload {
        Payload::Vector(components) => {
            Value::Array(components.iter().map(|n| n.to_value()).collect())
        }
        Payload::Flag(flag) => Value::Boolean(*flag),
    }
}

fn payload_from_value(kind: SyncKind, value: &Value) -> Result<Payload, DecodeError> {
    if !kind.is_transform() {
        return value
            .as_bool()
            .map(Payload::Flag)
            .ok_or_else(|| DecodeError::invalid(kind.tag(), "payload is not a boolean"));
    }
    let not_vector = || DecodeError::invalid(kind.tag(), "payload is not a 3-number array");
    let [x, y, z] = value
        .as_array()
        .and_then(|items| <&[Value; 3]>::try_from(items.as_slice()).ok())
        .ok_or_else(not_vector)?;
    let num = |v: &Value| Number::from_value(v).ok_or_else(not_vector);
    Ok(Payload::Vector([num(x)?, num(y)?, num(z)?]))
}

fn entry_to_value(entry: &SyncEntry) -> Value {
    Value::Array(vec![
        Value::from(entry.entity_id.as_str()),
        Value::from(entry.sequence.0),
        payload_to_value(&entry.payload),
    ])
}

fn entry_from_value(kind: SyncKind, value: Value) -> Result<SyncEntry, DecodeError> {
    let Value::Array(parts) = value else {
        return Err(DecodeError::invalid(kind.tag(), "entry is not an array"));
    };
    let [entity_id, sequence, payload] = take_fields::<3>(kind.tag(), parts)?;
    Ok(SyncEntry {
        entity_id: string_field(kind.tag(), entity_id, "entity id")?,
        sequence: sequence_from_value(kind.tag(), &sequence)?,
        payload: payload_from_value(kind, &payload)?,
    })
}

fn sequence_from_value(tag: &'static str, value: &Value) -> Result<Sequence, DecodeError> {
    value
        .as_i64()
        .map(Sequence)
        .ok_or_else(|| DecodeError::invalid(tag, "sequence is not a 64-bit integer"))
}

fn snapshot_to_value(snapshot: &StateSnapshot) -> Value {
    Value::Map(
        snapshot
            .iter()
            .map(|(kind, entities)| {
                let entities = entities
                    .iter()
                    .map(|(id, cached)| {
                        (
                            Value::from(id.as_str()),
                            Value::Array(vec![
                                Value::from(cached.sequence.0),
                                payload_to_value(&cached.payload),
                            ]),
                        )
                    })
                    .collect();
                (Value::from(kind.tag()), Value::Map(entities))
            })
            .collect(),
    )
}

fn snapshot_from_value(value: Value) -> Result<StateSnapshot, DecodeError> {
    let Value::Map(kinds) = value else {
        return Err(DecodeError::invalid("ho", "snapshot is not a map"));
    };
    let mut snapshot = StateSnapshot::new();
    for (kind, entities) in kinds {
        let kind = kind
            .as_str()
            .and_then(SyncKind::from_tag)
            .ok_or_else(|| DecodeError::invalid("ho", "snapshot key is not a sync kind"))?;
        let Value::Map(entities) = entities else {
            return Err(DecodeError::invalid("ho", "snapshot bucket is not a map"));
        };
        let bucket = snapshot.entities_mut(kind);
        for (entity_id, cached) in entities {
            let entity_id = string_field("ho", entity_id, "entity id")?;
            let Value::Array(parts) = cached else {
                return Err(DecodeError::invalid("ho", "cached entry is not an array"));
            };
            let [sequence, payload] = take_fields::<2>("ho", parts)?;
            bucket.insert(
                entity_id,
                CachedEntry {
                    sequence: sequence_from_value("ho", &sequence)?,
                    payload: payload_from_value(kind, &payload)?,
                },
            );
        }
    }
    Ok(snapshot)
}
