use async_trait::async_trait;
use rdkafka::{
    message::{Header, OwnedHeaders},
    producer::{FutureProducer, FutureRecord},
};
use std::time::Duration;

use crate::{
    codec::{Headers, STAMP_HEADER_PREFIX},
    stamp::{PartitionKeyStamp, Stamp},
    transport::{Outgoing, Sender},
};

/// Kafka transport sender.
///
/// Publishes frames using a `FutureProducer`:
///
/// - `route.channel` → Kafka topic
/// - partition key stamp, else `route.routing_key` → record key
/// - frame headers → record headers
/// - frame body → record payload
///
/// Keying by partition key keeps one ordering domain on one Kafka partition.
#[derive(Clone)]
pub struct Kafka {
    producer: FutureProducer,
    timeout: Duration,
}

impl Kafka {
    /// Create a new Kafka sender using the given `FutureProducer`.
    ///
    /// Default timeout is 5 seconds.
    pub fn new(producer: FutureProducer) -> Self {
        Self {
            producer,
            timeout: Duration::from_secs(5),
        }
    }

    /// Set a custom timeout for sending messages.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Sender for Kafka {
    type Error = rdkafka::error::KafkaError;

    #[tracing::instrument(skip_all, fields(topic = %outgoing.route.channel))]
    async fn send(&mut self, outgoing: Outgoing) -> Result<(), Self::Error> {
        let key = record_key(&outgoing);
        let record = FutureRecord::to(&outgoing.route.channel)
            .payload(&outgoing.frame.body)
            .key(&key)
            .headers(kafka_headers(&outgoing.frame.headers));

        self.producer
            .send(record, self.timeout)
            .await
            .map_err(|(e, _)| e)?;

        Ok(())
    }
}

fn record_key(outgoing: &Outgoing) -> String {
    let header = format!("{STAMP_HEADER_PREFIX}{}", Stamp::PARTITION_KEY);
    outgoing
        .frame
        .headers
        .get_all(&header)
        .last()
        .and_then(|json| serde_json::from_str::<PartitionKeyStamp>(json).ok())
        .map(|stamp| stamp.key)
        .filter(|key| !key.is_empty())
        .unwrap_or_else(|| outgoing.route.routing_key.clone())
}

fn kafka_headers(headers: &Headers) -> OwnedHeaders {
    headers
        .iter()
        .fold(OwnedHeaders::new(), |acc, (key, value)| {
            acc.insert(Header {
                key,
                value: Some(value),
            })
        })
}
