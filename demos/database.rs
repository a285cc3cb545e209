use std::{sync::Arc, time::Duration};

use courier::{
    Bus, Channels, Consumer, Message, MessageRegistry, Outbox, OutboxPublisher, Router, Stamps,
    Transport, Translator,
    handler::{Handlers, MessageHandler},
    inbox::sqlx::PgSqlxDeduplicationStore,
    outbox::sqlx::PgSqlxOutbox,
    transport::InMemoryBroker,
};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, PgTransaction, postgres::PgConnectOptions};
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Greeting {
    id: i32,
    message: String,
}

impl Message for Greeting {
    fn partition_key(&self) -> Option<String> {
        Some((self.id % 4).to_string())
    }
}

struct PrintGreeting;

#[async_trait::async_trait]
impl MessageHandler<Greeting, PgTransaction<'static>> for PrintGreeting {
    async fn handle(
        &self,
        message: Greeting,
        stamps: &Stamps,
        _tx: &mut PgTransaction<'static>,
    ) -> Result<(), tower::BoxError> {
        tracing::info!(id = message.id, message_id = ?stamps.message_id(), "{}", message.message);
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    // Postgres connection, configured through the PG* environment variables
    let pool = PgPool::connect_with(PgConnectOptions::new()).await.unwrap();

    let registry = Arc::new(
        MessageRegistry::builder()
            .register::<Greeting>("hello.greeting")
            .unwrap()
            .build(),
    );

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    let cancel_handle = tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        cancel_signal.cancel();
    });

    let outbox = PgSqlxOutbox::try_new(pool.clone()).await.unwrap();

    let bus = Bus::new(registry.clone(), Outbox::new(outbox.clone()));
    let pool_clone = pool.clone();
    let cancel_bus = cancel.clone();
    let bus_handle = tokio::spawn(async move {
        let mut id = 0;
        while !cancel_bus.is_cancelled() {
            let mut tx = pool_clone.begin().await.unwrap();
            bus.dispatch(
                &Greeting {
                    id,
                    message: "Hello".into(),
                },
                &mut tx,
            )
            .await
            .expect("Failed to insert message");
            tx.commit().await.unwrap();
            id += 1;
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    });

    let broker = InMemoryBroker::default();
    let publisher = OutboxPublisher::new(
        outbox,
        Translator::new(registry.clone()),
        Arc::new(Router::default()),
        Channels::new().with_channel("hello", Transport::new(broker.clone())),
    );
    let cancel_publisher = cancel.clone();
    let publisher_handle = tokio::spawn(async move {
        publisher.run(cancel_publisher).await.unwrap();
    });

    let store = Arc::new(PgSqlxDeduplicationStore::try_new(pool).await.unwrap());
    let handlers = Handlers::new(registry.clone()).on::<Greeting, _>(PrintGreeting);
    let consumer = Consumer::new(
        broker.receiver("hello"),
        store,
        Translator::new(registry),
        handlers,
    );
    let consumer_handle = tokio::spawn(async move {
        consumer.run(cancel).await.unwrap();
    });

    tokio::try_join!(cancel_handle, bus_handle, publisher_handle, consumer_handle).unwrap();
}
