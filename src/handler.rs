//! Inbox-side message handlers.
//!
//! A [`Handler`] works on the type-erased envelope. [`MessageHandler`] is the
//! typed variant most applications implement; [`Handlers`] decodes the
//! payload and routes it to the handler registered for its internal identity.

use std::{collections::HashMap, marker::PhantomData, sync::Arc};

use async_trait::async_trait;

use crate::{
    Envelope,
    envelope::{Message, Payload},
    registry::MessageRegistry,
    stamp::Stamps,
};

/// Handles a type-erased envelope inside the inbox transaction.
#[async_trait]
pub trait Handler<Tx: Send>: Send + Sync {
    /// Check that the payload can be handled at all, before any transaction
    /// is opened. A failure here is permanent for this payload.
    fn accepts(&self, _payload: &Payload) -> Result<(), tower::BoxError> {
        Ok(())
    }

    async fn handle(&self, envelope: &Envelope<Payload>, tx: &mut Tx)
    -> Result<(), tower::BoxError>;
}

/// Handles a decoded message of type `M`.
#[async_trait]
pub trait MessageHandler<M: Message, Tx: Send>: Send + Sync {
    async fn handle(&self, message: M, stamps: &Stamps, tx: &mut Tx)
    -> Result<(), tower::BoxError>;
}

struct Typed<H, M> {
    handler: H,
    _message: PhantomData<fn() -> M>,
}

#[async_trait]
impl<H, M, Tx> Handler<Tx> for Typed<H, M>
where
    H: MessageHandler<M, Tx>,
    M: Message,
    Tx: Send,
{
    fn accepts(&self, payload: &Payload) -> Result<(), tower::BoxError> {
        payload.decode::<M>()?;
        Ok(())
    }

    async fn handle(
        &self,
        envelope: &Envelope<Payload>,
        tx: &mut Tx,
    ) -> Result<(), tower::BoxError> {
        let message = envelope.message.decode::<M>()?;
        self.handler.handle(message, &envelope.stamps, tx).await
    }
}

/// Handler table keyed by internal type identity.
pub struct Handlers<Tx> {
    registry: Arc<MessageRegistry>,
    by_identity: HashMap<String, Arc<dyn Handler<Tx>>>,
}

impl<Tx> Clone for Handlers<Tx> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            by_identity: self.by_identity.clone(),
        }
    }
}

impl<Tx: Send + 'static> Handlers<Tx> {
    pub fn new(registry: Arc<MessageRegistry>) -> Self {
        Self {
            registry,
            by_identity: HashMap::new(),
        }
    }

    /// Register a typed handler for `M`. A later registration for the same
    /// type replaces the earlier one.
    pub fn on<M, H>(self, handler: H) -> Self
    where
        M: Message,
        H: MessageHandler<M, Tx> + 'static,
    {
        let identity = self.registry.identity_of::<M>();
        self.on_identity(
            identity,
            Typed {
                handler,
                _message: PhantomData,
            },
        )
    }

    /// Register a type-erased handler for an internal identity.
    pub fn on_identity(mut self, identity: impl Into<String>, handler: impl Handler<Tx> + 'static) -> Self {
        self.by_identity.insert(identity.into(), Arc::new(handler));
        self
    }

    pub fn get(&self, identity: &str) -> Option<&Arc<dyn Handler<Tx>>> {
        self.by_identity.get(identity)
    }
}

impl<Tx> std::fmt::Debug for Handlers<Tx> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handlers")
            .field("identities", &self.by_identity.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct OrderPlaced {
        order_id: u32,
    }
    impl Message for OrderPlaced {}

    #[derive(Default)]
    struct Recorder(Mutex<Vec<u32>>);

    #[async_trait]
    impl MessageHandler<OrderPlaced, ()> for Arc<Recorder> {
        async fn handle(
            &self,
            message: OrderPlaced,
            _stamps: &Stamps,
            _tx: &mut (),
        ) -> Result<(), tower::BoxError> {
            self.0.lock().unwrap().push(message.order_id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn typed_handler_receives_decoded_message() {
        let registry = Arc::new(
            MessageRegistry::builder()
                .register_as::<OrderPlaced>("shop::OrderPlaced", "order.placed")
                .unwrap()
                .build(),
        );
        let recorder = Arc::new(Recorder::default());
        let handlers = Handlers::<()>::new(registry).on::<OrderPlaced, _>(recorder.clone());

        let envelope =
            Envelope::new(Payload::encode("shop::OrderPlaced", &OrderPlaced { order_id: 7 }).unwrap());
        let handler = handlers.get("shop::OrderPlaced").unwrap();
        handler.handle(&envelope, &mut ()).await.unwrap();

        assert_eq!(*recorder.0.lock().unwrap(), vec![7]);
        assert!(handlers.get("shop::OrderShipped").is_none());
    }

    #[tokio::test]
    async fn undecodable_payload_is_not_accepted() {
        let recorder = Arc::new(Recorder::default());
        let handlers =
            Handlers::<()>::new(Arc::new(MessageRegistry::default())).on::<OrderPlaced, _>(recorder);
        let identity = MessageRegistry::default().identity_of::<OrderPlaced>();

        let envelope = Envelope::new(Payload::new(identity.clone(), serde_json::json!("nope")));
        let handler = handlers.get(&identity).unwrap();
        assert!(handler.accepts(&envelope.message).is_err());
        assert!(handler.handle(&envelope, &mut ()).await.is_err());
    }
}
