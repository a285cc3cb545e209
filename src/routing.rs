//! Destination resolution from semantic names.
//!
//! By convention the routing key is the semantic name verbatim and the channel
//! is derived from the name's leading segment (`order.placed` is published to
//! channel `order` with routing key `order.placed`). Per-name overrides loaded
//! at startup replace whichever fields they specify.

use std::collections::HashMap;

use serde::Deserialize;
use tracing_error::SpanTrace;

/// Resolved destination of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub channel: String,
    pub routing_key: String,
}

/// Per-name override. Unset fields fall back to the convention.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RouteOverride {
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub routing_key: Option<String>,
}

/// Derives a channel from a semantic name.
pub trait Convention: Send + Sync {
    fn channel_for(&self, name: &str) -> String;
}

/// Channel is the segment before the first `.` of the semantic name.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeadingSegment;

impl Convention for LeadingSegment {
    fn channel_for(&self, name: &str) -> String {
        name.split('.').next().unwrap_or(name).to_owned()
    }
}

/// Every message goes to the same channel.
#[derive(Debug, Clone)]
pub struct SingleChannel(pub String);

impl Convention for SingleChannel {
    fn channel_for(&self, _name: &str) -> String {
        self.0.clone()
    }
}

/// Static routing configuration, typically deserialized once at startup.
///
/// ```json
/// {
///   "default_channel": "events",
///   "overrides": { "order.placed": { "channel": "orders" } }
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutingConfig {
    /// When set, replaces the leading-segment convention.
    #[serde(default)]
    pub default_channel: Option<String>,
    #[serde(default)]
    pub overrides: HashMap<String, RouteOverride>,
}

/// Resolves `(channel, routing_key)` for semantic names.
pub struct Router {
    convention: Box<dyn Convention>,
    overrides: HashMap<String, RouteOverride>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new(LeadingSegment)
    }
}

impl Router {
    pub fn new(convention: impl Convention + 'static) -> Self {
        Self {
            convention: Box::new(convention),
            overrides: HashMap::new(),
        }
    }

    pub fn from_config(config: RoutingConfig) -> Self {
        let router = match config.default_channel {
            Some(channel) => Self::new(SingleChannel(channel)),
            None => Self::default(),
        };
        Self {
            overrides: config.overrides,
            ..router
        }
    }

    pub fn with_override(mut self, name: impl Into<String>, route: RouteOverride) -> Self {
        self.overrides.insert(name.into(), route);
        self
    }

    /// Resolve the destination of `name`.
    ///
    /// The routing key is set on the producer side of a topic exchange and
    /// must therefore be concrete: `*` and `#` are rejected.
    pub fn resolve(&self, name: &str) -> Result<Route, RoutingError> {
        if name.is_empty() {
            return Err(RoutingError::new(RoutingErrorKind::EmptyName));
        }

        let route_override = self.overrides.get(name);
        let channel = route_override
            .and_then(|o| o.channel.clone())
            .unwrap_or_else(|| self.convention.channel_for(name));
        let routing_key = route_override
            .and_then(|o| o.routing_key.clone())
            .unwrap_or_else(|| name.to_owned());

        if routing_key.contains(['*', '#']) {
            return Err(RoutingError::new(RoutingErrorKind::WildcardRoutingKey(
                routing_key,
            )));
        }

        Ok(Route {
            channel,
            routing_key,
        })
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("overrides", &self.overrides)
            .finish_non_exhaustive()
    }
}

/// Routing configuration error. Never retryable.
#[derive(Debug)]
pub struct RoutingError {
    context: SpanTrace,
    kind: RoutingErrorKind,
}

#[derive(Debug)]
pub enum RoutingErrorKind {
    /// The message carries an empty semantic name.
    EmptyName,
    /// The resolved routing key contains a wildcard.
    WildcardRoutingKey(String),
    /// No publisher is registered for the resolved channel.
    NoPublisher(String),
}

impl RoutingError {
    pub(crate) fn new(kind: RoutingErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &RoutingErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for RoutingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            RoutingErrorKind::EmptyName => writeln!(f, "Empty semantic name"),
            RoutingErrorKind::WildcardRoutingKey(key) => {
                writeln!(f, "Routing key must not contain wildcards: {key}")
            }
            RoutingErrorKind::NoPublisher(channel) => {
                writeln!(f, "No publisher registered for channel {channel}")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for RoutingError {}
