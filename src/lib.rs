#![doc = include_str!("../README.md")]

pub mod bus;
pub mod codec;
pub mod consumer;
pub mod envelope;
pub mod handler;
pub mod inbox;
pub mod outbox;
pub mod pipeline;
pub mod publisher;
pub mod registry;
pub mod routing;
pub mod stamp;
pub mod transaction;
pub mod transport;
pub mod wire;

#[doc(inline)]
pub use bus::Bus;

#[doc(inline)]
pub use consumer::{ConsumeError, ConsumeOutcome, Consumer, ConsumerHook, DefaultConsumerHook};

#[doc(inline)]
pub use envelope::{Envelope, Message, Payload};

#[doc(inline)]
pub use inbox::DeduplicationStore;

#[doc(inline)]
pub use outbox::{Outbox, OutboxError};

#[doc(inline)]
pub use pipeline::{DispatchError, Pipeline};

#[doc(inline)]
pub use publisher::{DefaultPublisherHook, OutboxPublisher, PublishError, PublisherHook};

#[doc(inline)]
pub use registry::MessageRegistry;

#[doc(inline)]
pub use routing::Router;

#[doc(inline)]
pub use stamp::{MessageId, Stamp, Stamps};

#[doc(inline)]
pub use transport::{Channels, Transport, TransportError, TransportErrorKind};

#[doc(inline)]
pub use wire::Translator;
