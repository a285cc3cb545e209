//! Static message registration table.
//!
//! Maps a Rust message type to its internal type identity and to its semantic
//! name, and maps semantic names back to internal identities for inbound
//! decoding. The table is built once at startup and read-only afterwards.

use std::{any::TypeId, collections::HashMap};

use tracing_error::SpanTrace;

use crate::envelope::Message;

/// One registered message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Internal type identity, stored alongside the payload.
    pub identity: String,
    /// Broker-facing semantic name, e.g. `order.placed`.
    pub name: String,
}

/// Read-only lookup table between types, internal identities and semantic names.
#[derive(Debug, Clone, Default)]
pub struct MessageRegistry {
    by_type: HashMap<TypeId, Registration>,
    by_identity: HashMap<String, Registration>,
    by_name: HashMap<String, Registration>,
}

impl MessageRegistry {
    pub fn builder() -> MessageRegistryBuilder {
        MessageRegistryBuilder::default()
    }

    /// Registration of a Rust type, if any.
    pub fn registration_of<M: Message>(&self) -> Option<&Registration> {
        self.by_type.get(&TypeId::of::<M>())
    }

    /// Internal identity of `M`. Unregistered types fall back to their type name.
    pub fn identity_of<M: Message>(&self) -> String {
        self.registration_of::<M>()
            .map(|r| r.identity.clone())
            .unwrap_or_else(|| std::any::type_name::<M>().to_owned())
    }

    /// Semantic name declared for an internal identity.
    pub fn name_of(&self, identity: &str) -> Option<&str> {
        self.by_identity.get(identity).map(|r| r.name.as_str())
    }

    /// Internal identity registered under a semantic name.
    pub fn identity_for_name(&self, name: &str) -> Option<&str> {
        self.by_name.get(name).map(|r| r.identity.as_str())
    }

    pub fn is_identity(&self, identity: &str) -> bool {
        self.by_identity.contains_key(identity)
    }
}

/// Builder for [`MessageRegistry`].
#[derive(Debug, Default)]
pub struct MessageRegistryBuilder {
    registry: MessageRegistry,
}

impl MessageRegistryBuilder {
    /// Register `M` under `name`, using its Rust type name as internal identity.
    pub fn register<M: Message>(self, name: impl Into<String>) -> Result<Self, RegistryError> {
        self.register_as::<M>(std::any::type_name::<M>(), name)
    }

    /// Register `M` under `name` with an explicit internal identity.
    pub fn register_as<M: Message>(
        mut self,
        identity: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self, RegistryError> {
        let registration = Registration {
            identity: identity.into(),
            name: name.into(),
        };
        let type_id = TypeId::of::<M>();
        if self.registry.by_type.contains_key(&type_id) {
            return Err(RegistryError::duplicate_type(std::any::type_name::<M>()));
        }
        self = self.insert(registration.clone())?;
        self.registry.by_type.insert(type_id, registration);
        Ok(self)
    }

    /// Register an identity/name pair with no local Rust type, e.g. for
    /// messages that are only ever relayed.
    pub fn register_identity(
        self,
        identity: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self, RegistryError> {
        self.insert(Registration {
            identity: identity.into(),
            name: name.into(),
        })
    }

    fn insert(mut self, registration: Registration) -> Result<Self, RegistryError> {
        if self.registry.by_name.contains_key(&registration.name) {
            return Err(RegistryError::duplicate_name(&registration.name));
        }
        if self.registry.by_identity.contains_key(&registration.identity) {
            return Err(RegistryError::duplicate_type(&registration.identity));
        }
        self.registry
            .by_name
            .insert(registration.name.clone(), registration.clone());
        self.registry
            .by_identity
            .insert(registration.identity.clone(), registration);
        Ok(self)
    }

    pub fn build(self) -> MessageRegistry {
        self.registry
    }
}

/// Error returned while building a [`MessageRegistry`].
#[derive(Debug)]
pub struct RegistryError {
    context: SpanTrace,
    kind: RegistryErrorKind,
}

#[derive(Debug)]
pub enum RegistryErrorKind {
    /// Two types claim the same semantic name.
    DuplicateName(String),
    /// The same type or identity was registered twice.
    DuplicateType(String),
}

impl RegistryError {
    fn duplicate_name(name: &str) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: RegistryErrorKind::DuplicateName(name.to_owned()),
        }
    }

    fn duplicate_type(identity: &str) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: RegistryErrorKind::DuplicateType(identity.to_owned()),
        }
    }

    pub fn kind(&self) -> &RegistryErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            RegistryErrorKind::DuplicateName(name) => {
                writeln!(f, "Semantic name registered twice: {name}")
            }
            RegistryErrorKind::DuplicateType(identity) => {
                writeln!(f, "Message type registered twice: {identity}")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for RegistryError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct OrderPlaced;
    impl Message for OrderPlaced {}

    #[derive(Debug, Serialize, Deserialize)]
    struct OrderShipped;
    impl Message for OrderShipped {}

    #[test]
    fn lookups_resolve_both_directions() {
        let registry = MessageRegistry::builder()
            .register_as::<OrderPlaced>("shop::OrderPlaced", "order.placed")
            .unwrap()
            .build();

        assert_eq!(registry.identity_of::<OrderPlaced>(), "shop::OrderPlaced");
        assert_eq!(registry.name_of("shop::OrderPlaced"), Some("order.placed"));
        assert_eq!(
            registry.identity_for_name("order.placed"),
            Some("shop::OrderPlaced")
        );
        assert!(registry.identity_for_name("order.shipped").is_none());
    }

    #[test]
    fn unregistered_type_falls_back_to_type_name() {
        let registry = MessageRegistry::default();
        assert!(registry.identity_of::<OrderShipped>().ends_with("OrderShipped"));
    }

    #[test]
    fn duplicate_semantic_name_is_rejected() {
        let err = MessageRegistry::builder()
            .register::<OrderPlaced>("order.placed")
            .unwrap()
            .register::<OrderShipped>("order.placed")
            .unwrap_err();

        assert!(matches!(err.kind(), RegistryErrorKind::DuplicateName(n) if n == "order.placed"));
    }
}
