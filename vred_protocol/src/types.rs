// Core value types for the sync protocol.
//
// These are shared by `message.rs` (wire encoding) and the relay's state
// cache (`vred_relay::state`). A sync pack carries one `SyncEntry` per
// entity; the relay keeps the newest entry per `(SyncKind, entity id)` and
// hands the whole set to joining clients as a `StateSnapshot`.
//
// Numbers inside transform payloads keep their MessagePack width (integer,
// f32, f64) so that a snapshot re-encodes exactly what clients sent.

use std::collections::BTreeMap;
use std::fmt;

use rmpv::Value;

/// The four kinds of sync pack. Each kind has its own bucket in the state
/// cache; the declaration order is the order kinds appear in a snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SyncKind {
    Pos,
    Rot,
    Scale,
    State,
}

impl SyncKind {
    pub const ALL: [SyncKind; 4] = [SyncKind::Pos, SyncKind::Rot, SyncKind::Scale, SyncKind::State];

    /// Wire tag for this kind.
    pub fn tag(self) -> &'static str {
        match self {
            SyncKind::Pos => "pos",
            SyncKind::Rot => "rot",
            SyncKind::Scale => "scale",
            SyncKind::State => "state",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "pos" => Some(SyncKind::Pos),
            "rot" => Some(SyncKind::Rot),
            "scale" => Some(SyncKind::Scale),
            "state" => Some(SyncKind::State),
            _ => None,
        }
    }

    /// True for kinds whose payload is a 3-component vector.
    pub fn is_transform(self) -> bool {
        !matches!(self, SyncKind::State)
    }
}

impl fmt::Display for SyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Per-entity sequence counter. Higher wins; arrival order is irrelevant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sequence(pub i64);

/// A numeric vector component, tagged with its MessagePack width.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Number {
    Int(i64),
    F32(f32),
    F64(f64),
}

impl Number {
    pub(crate) fn to_value(self) -> Value {
        match self {
            Number::Int(v) => Value::from(v),
            Number::F32(v) => Value::F32(v),
            Number::F64(v) => Value::F64(v),
        }
    }

    pub(crate) fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Integer(_) => value.as_i64().map(Number::Int),
            Value::F32(v) => Some(Number::F32(*v)),
            Value::F64(v) => Some(Number::F64(*v)),
            _ => None,
        }
    }
}

impl From<i64> for Number {
    fn from(v: i64) -> Self {
        Number::Int(v)
    }
}

impl From<i32> for Number {
    fn from(v: i32) -> Self {
        Number::Int(i64::from(v))
    }
}

impl From<f32> for Number {
    fn from(v: f32) -> Self {
        Number::F32(v)
    }
}

impl From<f64> for Number {
    fn from(v: f64) -> Self {
        Number::F64(v)
    }
}

/// Data carried for one entity in a sync pack.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// Position, rotation or scale.
    Vector([Number; 3]),
    /// Arbitrary boolean state.
    Flag(bool),
}

impl Payload {
    pub fn vector(x: impl Into<Number>, y: impl Into<Number>, z: impl Into<Number>) -> Self {
        Payload::Vector([x.into(), y.into(), z.into()])
    }
}

/// One `(entity id, sequence, payload)` triple inside a sync pack.
#[derive(Clone, Debug, PartialEq)]
pub struct SyncEntry {
    pub entity_id: String,
    pub sequence: Sequence,
    pub payload: Payload,
}

impl SyncEntry {
    pub fn new(entity_id: impl Into<String>, sequence: i64, payload: Payload) -> Self {
        Self {
            entity_id: entity_id.into(),
            sequence: Sequence(sequence),
            payload,
        }
    }
}

/// The latest stored `(sequence, payload)` for one entity.
#[derive(Clone, Debug, PartialEq)]
pub struct CachedEntry {
    pub sequence: Sequence,
    pub payload: Payload,
}

/// Latest known state of the world, grouped by kind then entity id.
///
/// Every kind is always present, possibly empty, so the `ho` reply has a
/// stable shape regardless of what has been synced so far.
#[derive(Clone, Debug, PartialEq)]
pub struct StateSnapshot {
    kinds: BTreeMap<SyncKind, BTreeMap<String, CachedEntry>>,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            kinds: SyncKind::ALL
                .into_iter()
                .map(|kind| (kind, BTreeMap::new()))
                .collect(),
        }
    }
}

impl StateSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: SyncKind, entity_id: &str) -> Option<&CachedEntry> {
        self.kinds.get(&kind).and_then(|entities| entities.get(entity_id))
    }

    /// Entities stored for `kind`, ordered by id.
    pub fn entities(&self, kind: SyncKind) -> &BTreeMap<String, CachedEntry> {
        // Default fills every kind and nothing removes one.
        &self.kinds[&kind]
    }

    pub fn entities_mut(&mut self, kind: SyncKind) -> &mut BTreeMap<String, CachedEntry> {
        self.kinds.entry(kind).or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SyncKind, &BTreeMap<String, CachedEntry>)> {
        self.kinds.iter().map(|(kind, entities)| (*kind, entities))
    }

    /// Total number of stored entities across all kinds.
    pub fn len(&self) -> usize {
        self.kinds.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
