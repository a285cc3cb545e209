//! Metadata records attached to an [`Envelope`](crate::Envelope).
//!
//! A stamp is a single fact about a message: its identity, its semantic name,
//! the partition it is ordered within, where it was received from. Stamps are
//! kept in attachment order and travel with the message through the outbox,
//! across the broker and into the inbox.
//!
//! Stamps the core does not know about are carried as [`RawStamp`] so that a
//! consumer always sees exactly the metadata the producer attached.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable message identifier.
///
/// Assigned once at submission and never changed afterwards, including across
/// redelivery and retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generate a new time-ordered identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for MessageId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageIdStamp {
    pub id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageNameStamp {
    pub name: String,
}

/// Ordering domain of a message. An empty key means no ordering constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionKeyStamp {
    pub key: String,
}

/// Postpones availability of an outbox row by `delay_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayStamp {
    pub delay_ms: u64,
}

/// Delivery provenance: the channel a message was received from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceivedStamp {
    pub channel: String,
}

/// A stamp of a kind this crate does not interpret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawStamp {
    pub kind: String,
    pub value: serde_json::Value,
}

/// A single metadata record.
#[derive(Debug, Clone, PartialEq)]
pub enum Stamp {
    MessageId(MessageIdStamp),
    MessageName(MessageNameStamp),
    PartitionKey(PartitionKeyStamp),
    Delay(DelayStamp),
    Received(ReceivedStamp),
    Other(RawStamp),
}

impl Stamp {
    pub const MESSAGE_ID: &'static str = "message-id";
    pub const MESSAGE_NAME: &'static str = "message-name";
    pub const PARTITION_KEY: &'static str = "partition-key";
    pub const DELAY: &'static str = "delay";
    pub const RECEIVED: &'static str = "received";

    /// Kind tag used when the stamp is serialized.
    pub fn kind(&self) -> &str {
        match self {
            Stamp::MessageId(_) => Self::MESSAGE_ID,
            Stamp::MessageName(_) => Self::MESSAGE_NAME,
            Stamp::PartitionKey(_) => Self::PARTITION_KEY,
            Stamp::Delay(_) => Self::DELAY,
            Stamp::Received(_) => Self::RECEIVED,
            Stamp::Other(raw) => &raw.kind,
        }
    }

    /// Serialize the stamp body (without its kind) to a JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        match self {
            Stamp::MessageId(s) => serde_json::to_string(s),
            Stamp::MessageName(s) => serde_json::to_string(s),
            Stamp::PartitionKey(s) => serde_json::to_string(s),
            Stamp::Delay(s) => serde_json::to_string(s),
            Stamp::Received(s) => serde_json::to_string(s),
            Stamp::Other(raw) => serde_json::to_string(&raw.value),
        }
    }

    /// Rebuild a stamp from its kind and JSON body.
    ///
    /// Unknown kinds become [`Stamp::Other`].
    pub fn from_json(kind: &str, json: &str) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            Self::MESSAGE_ID => Stamp::MessageId(serde_json::from_str(json)?),
            Self::MESSAGE_NAME => Stamp::MessageName(serde_json::from_str(json)?),
            Self::PARTITION_KEY => Stamp::PartitionKey(serde_json::from_str(json)?),
            Self::DELAY => Stamp::Delay(serde_json::from_str(json)?),
            Self::RECEIVED => Stamp::Received(serde_json::from_str(json)?),
            other => Stamp::Other(RawStamp {
                kind: other.to_owned(),
                value: serde_json::from_str(json)?,
            }),
        })
    }
}

impl From<MessageIdStamp> for Stamp {
    fn from(value: MessageIdStamp) -> Self {
        Stamp::MessageId(value)
    }
}

impl From<MessageNameStamp> for Stamp {
    fn from(value: MessageNameStamp) -> Self {
        Stamp::MessageName(value)
    }
}

impl From<PartitionKeyStamp> for Stamp {
    fn from(value: PartitionKeyStamp) -> Self {
        Stamp::PartitionKey(value)
    }
}

impl From<DelayStamp> for Stamp {
    fn from(value: DelayStamp) -> Self {
        Stamp::Delay(value)
    }
}

impl From<ReceivedStamp> for Stamp {
    fn from(value: ReceivedStamp) -> Self {
        Stamp::Received(value)
    }
}

impl From<RawStamp> for Stamp {
    fn from(value: RawStamp) -> Self {
        Stamp::Other(value)
    }
}

/// Ordered list of stamps.
///
/// Accessors return the most recently attached stamp of a kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stamps(Vec<Stamp>);

impl Stamps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stamp: impl Into<Stamp>) {
        self.0.push(stamp.into());
    }

    pub fn with(mut self, stamp: impl Into<Stamp>) -> Self {
        self.push(stamp);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &Stamp> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn message_id(&self) -> Option<MessageId> {
        self.0.iter().rev().find_map(|s| match s {
            Stamp::MessageId(s) => Some(s.id),
            _ => None,
        })
    }

    pub fn message_name(&self) -> Option<&str> {
        self.0.iter().rev().find_map(|s| match s {
            Stamp::MessageName(s) => Some(s.name.as_str()),
            _ => None,
        })
    }

    /// Partition key, or the empty string when none was attached.
    pub fn partition_key(&self) -> &str {
        self.0
            .iter()
            .rev()
            .find_map(|s| match s {
                Stamp::PartitionKey(s) => Some(s.key.as_str()),
                _ => None,
            })
            .unwrap_or_default()
    }

    pub fn delay(&self) -> Option<std::time::Duration> {
        self.0.iter().rev().find_map(|s| match s {
            Stamp::Delay(s) => Some(std::time::Duration::from_millis(s.delay_ms)),
            _ => None,
        })
    }

    pub fn received_from(&self) -> Option<&str> {
        self.0.iter().rev().find_map(|s| match s {
            Stamp::Received(s) => Some(s.channel.as_str()),
            _ => None,
        })
    }
}

impl FromIterator<Stamp> for Stamps {
    fn from_iter<T: IntoIterator<Item = Stamp>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Stamps {
    type Item = Stamp;
    type IntoIter = std::vec::IntoIter<Stamp>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
