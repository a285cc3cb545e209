use serde::{Serialize, de::DeserializeOwned};

use crate::stamp::{Stamp, Stamps};

/// Message container used by the outbox, the dispatch pipeline and the inbox.
///
/// `Envelope` bundles a message payload together with the ordered
/// [`Stamps`] attached to it while it moves through the system.
///
/// ## Design
///
/// - `M` represents the actual message payload. Inside the pipeline this is
///   usually the type-erased [`Payload`].
/// - `stamps` carries metadata (identity, semantic name, partition key,
///   provenance). Stamps are never business data.
///
/// ## Example
///
/// ```rust
/// use courier::{Envelope, stamp::PartitionKeyStamp};
///
/// let envelope = Envelope::new(42).with_stamp(PartitionKeyStamp { key: "order-1".into() });
/// assert_eq!(envelope.stamps.partition_key(), "order-1");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<M> {
    /// Message metadata.
    pub stamps: Stamps,
    /// Message payload.
    pub message: M,
}

impl<M> Envelope<M> {
    pub fn new(message: M) -> Self {
        Self {
            stamps: Stamps::new(),
            message,
        }
    }

    pub fn with_stamp(mut self, stamp: impl Into<Stamp>) -> Self {
        self.stamps.push(stamp);
        self
    }
}

impl<M> From<(Stamps, M)> for Envelope<M> {
    fn from(value: (Stamps, M)) -> Self {
        Envelope {
            stamps: value.0,
            message: value.1,
        }
    }
}

/// A business message that can travel through the outbox.
///
/// The semantic name is not declared here: it lives in the
/// [`MessageRegistry`](crate::registry::MessageRegistry) built at startup.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Ordering domain of this message. `None` means unordered.
    fn partition_key(&self) -> Option<String> {
        None
    }
}

/// Type-erased message body tagged with its internal type identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    type_name: String,
    data: serde_json::Value,
}

impl Payload {
    pub fn new(type_name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            type_name: type_name.into(),
            data,
        }
    }

    /// Serialize a typed message under the given internal identity.
    pub fn encode<M: Serialize>(
        type_name: impl Into<String>,
        message: &M,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(type_name, serde_json::to_value(message)?))
    }

    /// Deserialize the body into a typed message.
    pub fn decode<M: DeserializeOwned>(&self) -> Result<M, serde_json::Error> {
        M::deserialize(&self.data)
    }

    /// Internal type identity.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn data(&self) -> &serde_json::Value {
        &self.data
    }
}
