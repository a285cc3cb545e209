//! Native envelope serialization.
//!
//! Converts an [`Envelope<Payload>`] into a [`Frame`] (body bytes plus an
//! ordered header list) and back. The outbox stores frames and the transports
//! ship them; the [`wire`](crate::wire) translator rewrites a frame's type
//! header at the broker boundary.
//!
//! Header layout:
//!
//! - `type`: internal type identity of the payload
//! - `content-type`: always `application/json`
//! - `x-stamp-<kind>`: one entry per stamp, in attachment order, carrying the
//!   stamp body as JSON

use serde::{Deserialize, Serialize};
use tracing_error::SpanTrace;

use crate::{
    Envelope,
    envelope::Payload,
    stamp::{Stamp, Stamps},
};

pub const TYPE_HEADER: &str = "type";
pub const CONTENT_TYPE_HEADER: &str = "content-type";
pub const STAMP_HEADER_PREFIX: &str = "x-stamp-";
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Ordered header multimap. Keys may repeat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value stored under `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Append an entry, keeping existing entries with the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Replace every entry named `name` with a single entry in the position of
    /// the first one, or append when absent.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter().position(|(k, _)| k.eq_ignore_ascii_case(&name)) {
            Some(pos) => {
                self.0[pos].1 = value;
                let mut index = 0;
                self.0.retain(|(k, _)| {
                    let keep = index <= pos || !k.eq_ignore_ascii_case(&name);
                    index += 1;
                    keep
                });
            }
            None => self.0.push((name, value)),
        }
    }

    /// Remove all entries named `name`, returning the first removed value.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        let mut removed = None;
        self.0.retain(|(k, v)| {
            if k.eq_ignore_ascii_case(name) {
                removed.get_or_insert_with(|| v.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Serialized envelope: opaque body plus headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(headers: Headers, body: Vec<u8>) -> Self {
        Self { headers, body }
    }
}

/// The pipeline's own envelope codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeCodec;

impl NativeCodec {
    pub fn encode(&self, envelope: &Envelope<Payload>) -> Result<Frame, CodecError> {
        let mut headers = Headers::new();
        headers.append(TYPE_HEADER, envelope.message.type_name());
        headers.append(CONTENT_TYPE_HEADER, JSON_CONTENT_TYPE);
        for stamp in envelope.stamps.iter() {
            let value = stamp
                .to_json()
                .map_err(|e| CodecError::malformed_stamp(stamp.kind(), e))?;
            headers.append(format!("{STAMP_HEADER_PREFIX}{}", stamp.kind()), value);
        }

        let body = serde_json::to_vec(envelope.message.data()).map_err(CodecError::body)?;
        Ok(Frame { headers, body })
    }

    pub fn decode(&self, frame: &Frame) -> Result<Envelope<Payload>, CodecError> {
        let type_name = frame
            .headers
            .get(TYPE_HEADER)
            .ok_or_else(|| CodecError::missing_header(TYPE_HEADER))?;

        let mut stamps = Stamps::new();
        for (name, value) in frame.headers.iter() {
            let Some(kind) = strip_prefix_ignore_case(name, STAMP_HEADER_PREFIX) else {
                continue;
            };
            let stamp =
                Stamp::from_json(kind, value).map_err(|e| CodecError::malformed_stamp(kind, e))?;
            stamps.push(stamp);
        }

        let data = serde_json::from_slice(&frame.body).map_err(CodecError::body)?;
        Ok(Envelope {
            stamps,
            message: Payload::new(type_name, data),
        })
    }
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &value[prefix.len()..])
}

/// Error returned when a frame cannot be produced or read.
#[derive(Debug)]
pub struct CodecError {
    context: SpanTrace,
    kind: CodecErrorKind,
}

#[derive(Debug)]
pub enum CodecErrorKind {
    /// A required header is absent.
    MissingHeader(&'static str),
    /// A stamp header could not be (de)serialized.
    MalformedStamp {
        kind: String,
        source: serde_json::Error,
    },
    /// The body is not valid JSON.
    Body(serde_json::Error),
}

impl CodecError {
    pub(crate) fn missing_header(name: &'static str) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: CodecErrorKind::MissingHeader(name),
        }
    }

    fn malformed_stamp(kind: &str, source: serde_json::Error) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: CodecErrorKind::MalformedStamp {
                kind: kind.to_owned(),
                source,
            },
        }
    }

    fn body(err: serde_json::Error) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: CodecErrorKind::Body(err),
        }
    }

    pub fn kind(&self) -> &CodecErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            CodecErrorKind::MissingHeader(name) => writeln!(f, "Missing header: {name}"),
            CodecErrorKind::MalformedStamp { kind, source } => {
                writeln!(f, "Malformed stamp {kind}: {source}")
            }
            CodecErrorKind::Body(err) => writeln!(f, "Malformed body: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            CodecErrorKind::MissingHeader(_) => None,
            CodecErrorKind::MalformedStamp { source, .. } => Some(source),
            CodecErrorKind::Body(err) => Some(err),
        }
    }
}
