//! Wire format translation at the broker boundary.
//!
//! Outbound, the internal type identity in the `type` header is replaced by
//! the message's semantic name, and the identity is preserved under
//! [`MESSAGE_CLASS_HEADER`]. Inbound, the semantic name is mapped back to the
//! internal identity through the [`MessageRegistry`].
//!
//! Every stamp header passes through untouched in both directions, so a
//! consumer sees exactly the metadata the producer attached.

use std::sync::Arc;

use tracing_error::SpanTrace;

use crate::{
    Envelope,
    codec::{CodecError, Frame, NativeCodec, TYPE_HEADER},
    envelope::Payload,
    registry::MessageRegistry,
    stamp::MessageNameStamp,
};

/// Header preserving the internal type identity on the wire.
pub const MESSAGE_CLASS_HEADER: &str = "X-Message-Class";
/// Header carrying the stable message id on the wire.
pub const MESSAGE_ID_HEADER: &str = "message-id";

/// Bidirectional mapping between envelopes and wire frames.
#[derive(Debug, Clone)]
pub struct Translator {
    registry: Arc<MessageRegistry>,
    codec: NativeCodec,
}

impl Translator {
    pub fn new(registry: Arc<MessageRegistry>) -> Self {
        Self {
            registry,
            codec: NativeCodec,
        }
    }

    /// Produce the wire frame for an envelope.
    ///
    /// The envelope must already carry a message id and a semantic name.
    /// Their absence is an upstream programming error and fails loudly.
    #[tracing::instrument(skip_all)]
    pub fn encode(&self, envelope: &Envelope<Payload>) -> Result<Frame, TranslateError> {
        let name = envelope
            .stamps
            .message_name()
            .ok_or_else(|| TranslateError::missing_stamp("MessageNameStamp"))?;
        let id = envelope
            .stamps
            .message_id()
            .ok_or_else(|| TranslateError::missing_stamp("MessageIdStamp"))?;

        let mut frame = self.codec.encode(envelope)?;
        frame.headers.insert(TYPE_HEADER, name);
        frame
            .headers
            .insert(MESSAGE_CLASS_HEADER, envelope.message.type_name());
        frame.headers.insert(MESSAGE_ID_HEADER, id.to_string());
        Ok(frame)
    }

    /// Restore an envelope from a wire frame.
    ///
    /// A semantic name with no registered identity is unrecoverable for that
    /// message. A frame whose `type` is already a registered internal identity
    /// was written natively and is decoded as is.
    #[tracing::instrument(skip_all)]
    pub fn decode(&self, frame: &Frame) -> Result<Envelope<Payload>, TranslateError> {
        let wire_type = frame
            .headers
            .get(TYPE_HEADER)
            .ok_or_else(|| CodecError::missing_header(TYPE_HEADER))?;

        let (identity, name) = match self.registry.identity_for_name(wire_type) {
            Some(identity) => (identity, wire_type),
            None if self.registry.is_identity(wire_type) => {
                let name = self.registry.name_of(wire_type).unwrap_or(wire_type);
                (wire_type, name)
            }
            None => return Err(TranslateError::unknown_name(wire_type)),
        };

        let mut native = frame.clone();
        native.headers.insert(TYPE_HEADER, identity);
        native.headers.remove(MESSAGE_CLASS_HEADER);
        native.headers.remove(MESSAGE_ID_HEADER);

        let mut envelope = self.codec.decode(&native)?;
        if envelope.stamps.message_name().is_none() {
            envelope.stamps.push(MessageNameStamp {
                name: name.to_owned(),
            });
        }
        Ok(envelope)
    }
}

/// Error returned by the wire translator.
#[derive(Debug)]
pub struct TranslateError {
    context: SpanTrace,
    kind: TranslateErrorKind,
}

#[derive(Debug)]
pub enum TranslateErrorKind {
    /// A stamp required for outbound translation is absent.
    MissingStamp(&'static str),
    /// No internal type is registered for the semantic name on the wire.
    UnknownMessageName(String),
    /// The frame itself is malformed.
    Codec(CodecError),
}

impl TranslateError {
    fn missing_stamp(stamp: &'static str) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TranslateErrorKind::MissingStamp(stamp),
        }
    }

    fn unknown_name(name: &str) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TranslateErrorKind::UnknownMessageName(name.to_owned()),
        }
    }

    pub fn kind(&self) -> &TranslateErrorKind {
        &self.kind
    }
}

impl From<CodecError> for TranslateError {
    fn from(err: CodecError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TranslateErrorKind::Codec(err),
        }
    }
}

impl std::fmt::Display for TranslateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TranslateErrorKind::MissingStamp(stamp) => writeln!(f, "Missing stamp: {stamp}"),
            TranslateErrorKind::UnknownMessageName(name) => {
                writeln!(f, "No message type registered for semantic name {name:?}")
            }
            TranslateErrorKind::Codec(err) => writeln!(f, "Codec error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TranslateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TranslateErrorKind::Codec(err) => Some(err),
            _ => None,
        }
    }
}
