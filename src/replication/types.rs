//! Replication Types
//!
//! Entries, digests and the protocol message envelope shared by the cache,
//! the wire framer and both reconciliation strategies.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque payload carried by an entry.
///
/// Floats travel as their IEEE-754 bit pattern so NaN and the infinities
/// survive JSON, and compare equal when their bits match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(#[serde(with = "float_bits")] f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            _ => false,
        }
    }
}

mod float_bits {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(v.to_bits())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        u64::deserialize(d).map(f64::from_bits)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

/// One replicated record.
///
/// Uses Last-Write-Wins semantics keyed on `version` alone; a tombstoned
/// entry keeps its slot and version so deletes propagate like writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    pub version: i64,
    #[serde(default)]
    pub value: Value,
    /// Deletion marker
    #[serde(rename = "flag", default)]
    pub tombstone: bool,
}

impl Entry {
    /// Create a live entry.
    pub fn new(key: impl Into<String>, version: i64, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            version,
            value: value.into(),
            tombstone: false,
        }
    }

    /// Create a deletion marker for `key` at `version`.
    pub fn tombstone(key: impl Into<String>, version: i64) -> Self {
        Self {
            key: key.into(),
            version,
            value: Value::Null,
            tombstone: true,
        }
    }

    /// Check if this entry wins over an incumbent for the same key.
    ///
    /// Strictly greater wins; ties keep the incumbent.
    pub fn supersedes(&self, incumbent: &Entry) -> bool {
        self.version > incumbent.version
    }

    pub fn digest(&self) -> Digest {
        Digest {
            key: self.key.clone(),
            version: self.version,
        }
    }
}

/// Compact `{key, version}` summary of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest {
    pub key: String,
    pub version: i64,
}

impl Digest {
    pub fn new(key: impl Into<String>, version: i64) -> Self {
        Self {
            key: key.into(),
            version,
        }
    }
}

/// Protocol message envelope, decoded once by the framer and then matched.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Push-pull: initiator's full snapshot
    Push(Vec<Entry>),
    /// Push-pull: entries the initiator was missing
    PushReply(Vec<Entry>),
    /// Digest exchange phase 1: initiator's digests
    Begin(Vec<Digest>),
    /// Digest exchange phase 2: receiver's newer entries plus the digests it wants
    Exchange { push: Vec<Entry>, pull: Vec<Digest> },
    /// Digest exchange phase 3: entries resolved from the pull list
    End(Vec<Entry>),
}

/// Discriminant of a [`Message`], used in logs and protocol errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Push,
    PushReply,
    Begin,
    Exchange,
    End,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Push(_) => MessageKind::Push,
            Message::PushReply(_) => MessageKind::PushReply,
            Message::Begin(_) => MessageKind::Begin,
            Message::Exchange { .. } => MessageKind::Exchange,
            Message::End(_) => MessageKind::End,
        }
    }

    /// Number of records (entries plus digests) carried.
    pub fn len(&self) -> usize {
        match self {
            Message::Push(entries) | Message::PushReply(entries) | Message::End(entries) => {
                entries.len()
            }
            Message::Begin(digests) => digests.len(),
            Message::Exchange { push, pull } => push.len() + pull.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Push => "Push",
            MessageKind::PushReply => "PushReply",
            MessageKind::Begin => "Begin",
            MessageKind::Exchange => "Exchange",
            MessageKind::End => "End",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_new() {
        let e = Entry::new("k1", 3, "x");
        assert_eq!(e.key, "k1");
        assert_eq!(e.version, 3);
        assert_eq!(e.value, Value::Text("x".to_string()));
        assert!(!e.tombstone);
    }

    #[test]
    fn test_tombstone_entry() {
        let e = Entry::tombstone("k1", 4);
        assert!(e.tombstone);
        assert_eq!(e.value, Value::Null);
    }

    #[test]
    fn test_supersedes_is_strict() {
        let old = Entry::new("k", 1, "a");
        let same = Entry::tombstone("k", 1);
        let newer = Entry::new("k", 2, "b");

        assert!(newer.supersedes(&old));
        assert!(!old.supersedes(&newer));
        assert!(!same.supersedes(&old));
    }

    #[test]
    fn test_entry_digest() {
        let e = Entry::new("k1", 7, 42i64);
        assert_eq!(e.digest(), Digest::new("k1", 7));
    }

    #[test]
    fn test_entry_json_field_names() {
        let e = Entry::tombstone("k1", 2);
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"key\":\"k1\""));
        assert!(json.contains("\"version\":2"));
        assert!(json.contains("\"flag\":true"));
    }

    #[test]
    fn test_entry_json_defaults() {
        let e: Entry = serde_json::from_str(r#"{"key":"k","version":1}"#).unwrap();
        assert_eq!(e.value, Value::Null);
        assert!(!e.tombstone);
    }

    #[test]
    fn test_value_survives_bincode() {
        let e = Entry::new("k", 1, vec![1u8, 2, 3]);
        let bytes = bincode::serialize(&e).unwrap();
        let decoded: Entry = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, e);
    }

    #[test]
    fn test_non_finite_float_survives_json() {
        for x in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, -0.0, 1.5] {
            let e = Entry::new("ratio", 1, x);
            let json = serde_json::to_string(&e).unwrap();
            let decoded: Entry = serde_json::from_str(&json).unwrap();
            assert_eq!(decoded, e, "{}", json);
        }
    }

    #[test]
    fn test_float_equality_is_bitwise() {
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_ne!(Value::Float(0.0), Value::Float(-0.0));
        assert_ne!(Value::Float(1.0), Value::Int(1));
    }

    #[test]
    fn test_message_kind_and_len() {
        let msg = Message::Exchange {
            push: vec![Entry::new("a", 1, "x")],
            pull: vec![Digest::new("b", 2), Digest::new("c", 3)],
        };
        assert_eq!(msg.kind(), MessageKind::Exchange);
        assert_eq!(msg.len(), 3);
        assert!(!msg.is_empty());
        assert!(Message::Begin(vec![]).is_empty());
    }

    #[test]
    fn test_message_kind_display() {
        assert_eq!(MessageKind::Begin.to_string(), "Begin");
        assert_eq!(MessageKind::PushReply.to_string(), "PushReply");
    }
}
