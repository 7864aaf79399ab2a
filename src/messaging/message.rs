use std::cmp::Ordering;
use std::time::Duration;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::util::clock::epoch_millis;

/// Destination accepted by every node's incoming relay.
pub const ALL: &str = "ALL";

/// Content keyword of the peer discovery handshake (COMMAND messages).
pub const SYNC: &str = "SYNC";

/// Datagram ceiling: receive buffers are sized to this, so anything longer
///  is cut off in flight exactly like it would be on the wire.
pub const MAX_PACKET_LEN: usize = 256;

/// User text cap so that an encoded DATA message fits [MAX_PACKET_LEN]
///  with room for the header fields.
pub const MAX_CONTENT_LEN: usize = 128;


#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Command,
    Acknowledge,
    Data,
}

impl MessageKind {
    pub fn as_token(&self) -> &'static str {
        match self {
            MessageKind::Command => "COMMAND",
            MessageKind::Acknowledge => "ACKNOWLEDGE",
            MessageKind::Data => "DATA",
        }
    }

    pub fn from_token(token: &str) -> Option<MessageKind> {
        match token {
            "COMMAND" => Some(MessageKind::Command),
            "ACKNOWLEDGE" => Some(MessageKind::Acknowledge),
            "DATA" => Some(MessageKind::Data),
            _ => None,
        }
    }
}


/// A single unit of group communication, exchanged between nodes as a
///  colon-delimited text datagram:
///
/// ```text
/// <id>:<created_at>:<sent_at>:<source>:<destination>:<KIND>:<content>
/// ```
///
/// `created_at` is fixed when the message comes into existence and orders
///  messages for display; `sent_at` is refreshed on every retransmission
///  ([Message::resurrect]) and drives the relays' freshness window. Both are
///  epoch milliseconds.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub source: String,
    pub destination: String,
    pub kind: MessageKind,
    pub content: String,
    pub created_at: u64,
    pub sent_at: u64,
}

impl Message {
    /// A user text message addressed to the whole group. Text longer than
    ///  [MAX_CONTENT_LEN] bytes is silently truncated (at a char boundary).
    pub fn data(id: u64, source: &str, text: &str) -> Message {
        let now = epoch_millis();
        Message {
            id,
            source: source.to_string(),
            destination: ALL.to_string(),
            kind: MessageKind::Data,
            content: capped(text),
            created_at: now,
            sent_at: now,
        }
    }

    /// The discovery announcement a node broadcasts when it comes up.
    pub fn sync_announcement(source: &str) -> Message {
        let now = epoch_millis();
        Message {
            id: 0,
            source: source.to_string(),
            destination: ALL.to_string(),
            kind: MessageKind::Command,
            content: SYNC.to_string(),
            created_at: now,
            sent_at: now,
        }
    }

    /// The acknowledgement for a received DATA message: id and content are
    ///  echoed, source/destination swap, and both timestamps are kept from
    ///  the original (the ack rides the freshness of the message it answers).
    pub fn ack_reply(&self, self_name: &str) -> Message {
        Message {
            id: self.id,
            source: self_name.to_string(),
            destination: self.source.clone(),
            kind: MessageKind::Acknowledge,
            content: self.content.clone(),
            created_at: self.created_at,
            sent_at: self.sent_at,
        }
    }

    /// The reply to a received SYNC: reflected back to the sender under this
    ///  node's name. Timestamps are deliberately NOT refreshed - two nodes
    ///  reflect SYNCs back and forth until the original send stamp ages out
    ///  of the relays' freshness window, which is what terminates the
    ///  handshake.
    pub fn sync_reflection(&self, self_name: &str) -> Message {
        Message {
            id: self.id,
            source: self_name.to_string(),
            destination: self.source.clone(),
            kind: MessageKind::Command,
            content: SYNC.to_string(),
            created_at: self.created_at,
            sent_at: self.sent_at,
        }
    }

    /// Refreshes the send stamp so the message passes the relays' freshness
    ///  window again. Called for each retransmission; `created_at` never
    ///  changes.
    pub fn resurrect(&mut self) {
        self.sent_at = epoch_millis();
    }

    pub fn is_expired(&self, now_millis: u64, ttl: Duration) -> bool {
        self.sent_at.saturating_add(ttl.as_millis() as u64) < now_millis
    }

    /// Display / retransmission order: oldest creation first, ties broken by
    ///  id. Explicit comparison - the timestamps are u64 and a subtraction
    ///  based comparator truncates for deltas beyond 32 bits.
    pub fn cmp_by_creation(&self, other: &Message) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }

    pub fn encode(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}:{}",
            self.id,
            self.created_at,
            self.sent_at,
            self.source,
            self.destination,
            self.kind.as_token(),
            self.content,
        )
    }

    /// [Message::decode] for a raw datagram that may not even be UTF-8.
    pub fn decode_datagram(buf: &[u8]) -> anyhow::Result<Message> {
        let raw = std::str::from_utf8(buf)?;
        Message::decode(raw)
    }

    /// Parses a wire datagram. The split is capped at seven fields so the
    ///  content field captures embedded colons verbatim. Anything that does
    ///  not parse is an error, and callers treat that as a droppable packet.
    pub fn decode(raw: &str) -> anyhow::Result<Message> {
        let mut parts = raw.trim().splitn(7, ':');
        let mut next_field =
            || parts.next().ok_or_else(|| anyhow!("wire message has fewer than 7 fields"));

        let id = parse_number(next_field()?, "id")?;
        let created_at = parse_number(next_field()?, "created_at")?;
        let sent_at = parse_number(next_field()?, "sent_at")?;
        let source = next_field()?.to_string();
        let destination = next_field()?.to_string();
        let kind_token = next_field()?;
        let kind = MessageKind::from_token(kind_token)
            .ok_or_else(|| anyhow!("unknown message kind {:?}", kind_token))?;
        let content = next_field()?.to_string();

        Ok(Message {
            id,
            source,
            destination,
            kind,
            content,
            created_at,
            sent_at,
        })
    }
}

fn parse_number(field: &str, name: &str) -> anyhow::Result<u64> {
    field
        .parse()
        .map_err(|e| anyhow!("invalid {} field {:?}: {}", name, field, e))
}

fn capped(text: &str) -> String {
    if text.len() <= MAX_CONTENT_LEN {
        return text.to_string();
    }
    let mut end = MAX_CONTENT_LEN;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
