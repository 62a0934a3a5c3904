//! Reconciliation Protocol
//!
//! Two interchangeable strategies behind [`ReconciliationStrategy`]:
//!
//! - **Push-pull**: the initiator pushes its full snapshot, the receiver
//!   applies it and replies with whatever the initiator is missing. One round
//!   trip.
//! - **Digest exchange**: Begin (digests) -> Exchange (newer entries + wanted
//!   digests) -> End (resolved entries). The receiver keeps no per-exchange
//!   state; every reaction is determined by the message type and the cache.
//!
//! Uses Sans-IO pattern: strategies map an inbound message to an optional
//! reply and never touch sockets.

use crate::replication::cache::VersionedCache;
use crate::replication::transport::WireFormat;
use crate::replication::types::{Message, MessageKind};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A message the configured strategy does not speak.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{strategy} strategy cannot handle {kind} messages")]
pub struct ProtocolError {
    pub strategy: &'static str,
    pub kind: MessageKind,
}

/// Shared contract of both protocol variants.
pub trait ReconciliationStrategy: Send + Sync + 'static {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Payload format used on every connection of this node.
    fn wire_format(&self) -> WireFormat;

    /// Whether the opening message always draws a reply.
    fn expects_reply(&self) -> bool;

    /// Build the message that opens a round.
    fn open_round(&self, cache: &VersionedCache) -> Message;

    /// React to an inbound message, returning the reply to send, if any.
    fn on_message(
        &self,
        message: Message,
        cache: &VersionedCache,
    ) -> Result<Option<Message>, ProtocolError>;
}

/// Single round-trip full-state exchange.
#[derive(Debug, Default, Clone, Copy)]
pub struct PushPull;

impl ReconciliationStrategy for PushPull {
    fn name(&self) -> &'static str {
        "push-pull"
    }

    fn wire_format(&self) -> WireFormat {
        WireFormat::Json
    }

    fn expects_reply(&self) -> bool {
        false
    }

    fn open_round(&self, cache: &VersionedCache) -> Message {
        Message::Push(cache.get_all())
    }

    fn on_message(
        &self,
        message: Message,
        cache: &VersionedCache,
    ) -> Result<Option<Message>, ProtocolError> {
        match message {
            Message::Push(entries) => {
                let missing = cache.apply(entries);
                if missing.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(Message::PushReply(missing)))
                }
            }
            Message::PushReply(entries) => {
                cache.apply(entries);
                Ok(None)
            }
            other => Err(ProtocolError {
                strategy: self.name(),
                kind: other.kind(),
            }),
        }
    }
}

/// Three-phase digest exchange.
#[derive(Debug, Default, Clone, Copy)]
pub struct DigestExchange;

impl ReconciliationStrategy for DigestExchange {
    fn name(&self) -> &'static str {
        "digest"
    }

    fn wire_format(&self) -> WireFormat {
        WireFormat::Binary
    }

    fn expects_reply(&self) -> bool {
        true
    }

    fn open_round(&self, cache: &VersionedCache) -> Message {
        Message::Begin(cache.digests())
    }

    fn on_message(
        &self,
        message: Message,
        cache: &VersionedCache,
    ) -> Result<Option<Message>, ProtocolError> {
        match message {
            Message::Begin(digests) => {
                let diff = cache.apply_digest(&digests);
                // Always answered, even when empty, so the initiator's round ends.
                Ok(Some(Message::Exchange {
                    push: diff.newer,
                    pull: diff.wanted,
                }))
            }
            Message::Exchange { push, pull } => {
                cache.store(push);
                let resolved = cache.fetch(&pull);
                if resolved.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(Message::End(resolved)))
                }
            }
            Message::End(entries) => {
                cache.store(entries);
                Ok(None)
            }
            other => Err(ProtocolError {
                strategy: self.name(),
                kind: other.kind(),
            }),
        }
    }
}

/// Strategy selection made at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrategyKind {
    PushPull,
    #[default]
    Digest,
}

impl StrategyKind {
    pub fn build(self) -> Arc<dyn ReconciliationStrategy> {
        match self {
            StrategyKind::PushPull => Arc::new(PushPull),
            StrategyKind::Digest => Arc::new(DigestExchange),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::PushPull => "push-pull",
            StrategyKind::Digest => "digest",
        }
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "push-pull" | "pushpull" | "push_pull" | "json" => Ok(StrategyKind::PushPull),
            "digest" | "three-phase" | "binary" => Ok(StrategyKind::Digest),
            other => Err(other.to_string()),
        }
    }
}

/// Initiator-side state of the round running on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoundPhase {
    #[default]
    Idle,
    /// Opening message sent, reply not yet received
    AwaitingExchange { since: Instant },
    /// Reply received, final message being written
    SendingEnd,
}

impl RoundPhase {
    /// Whether a new round may start now.
    ///
    /// A round stuck awaiting its reply for longer than `stale_after` no
    /// longer blocks the connection.
    pub fn can_begin(&self, now: Instant, stale_after: Duration) -> bool {
        match self {
            RoundPhase::Idle => true,
            RoundPhase::AwaitingExchange { since } => now.duration_since(*since) >= stale_after,
            RoundPhase::SendingEnd => false,
        }
    }

    pub fn in_flight(&self) -> bool {
        !matches!(self, RoundPhase::Idle)
    }
}
