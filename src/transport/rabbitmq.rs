use std::sync::Arc;

use async_trait::async_trait;
use futures_core::stream::BoxStream;
use lapin::{
    BasicProperties,
    options::{BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicRejectOptions},
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
};
use tokio::sync::Mutex;
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;

use crate::{
    codec::{CONTENT_TYPE_HEADER, Frame, Headers, TYPE_HEADER},
    transport::{Delivery, Outgoing, Receiver, Sender},
    wire::MESSAGE_ID_HEADER,
};

/// RabbitMQ transport sender.
///
/// Publishes frames through a shared `lapin::Channel`.
///
/// ## Mapping
///
/// - `route.channel` → exchange
/// - `route.routing_key` → AMQP routing key
/// - frame headers → AMQP message headers; repeated names become arrays
/// - `type`, `message-id` and `content-type` are also set as AMQP properties
///
/// The channel is wrapped in `Arc<Mutex<_>>` because `Sender::send` may be
/// called concurrently from clones of the sender.
#[derive(Clone)]
pub struct RabbitMq {
    channel: Arc<Mutex<lapin::Channel>>,
}

impl RabbitMq {
    pub fn new(channel: lapin::Channel) -> Self {
        Self {
            channel: Arc::new(Mutex::new(channel)),
        }
    }
}

#[async_trait]
impl Sender for RabbitMq {
    type Error = lapin::Error;

    /// Publish a frame and wait for the publisher confirm.
    #[tracing::instrument(skip_all, fields(exchange = %outgoing.route.channel))]
    async fn send(&mut self, outgoing: Outgoing) -> Result<(), Self::Error> {
        let properties = properties(&outgoing.frame.headers);

        let channel = self.channel.lock().await;
        channel
            .basic_publish(
                &outgoing.route.channel,
                &outgoing.route.routing_key,
                BasicPublishOptions::default(),
                &outgoing.frame.body,
                properties,
            )
            .await?
            .await?;

        Ok(())
    }
}

fn properties(headers: &Headers) -> BasicProperties {
    let mut grouped: Vec<(&str, Vec<&str>)> = Vec::new();
    for (name, value) in headers.iter() {
        match grouped.iter_mut().find(|(n, _)| *n == name) {
            Some((_, values)) => values.push(value),
            None => grouped.push((name, vec![value])),
        }
    }

    let mut table = FieldTable::default();
    for (name, values) in grouped {
        let value = match values.as_slice() {
            [single] => long_string(single),
            many => AMQPValue::FieldArray(FieldArray::from(
                many.iter().map(|v| long_string(v)).collect::<Vec<_>>(),
            )),
        };
        table.insert(ShortString::from(name.to_owned()), value);
    }

    let mut properties = BasicProperties::default().with_headers(table);
    if let Some(kind) = headers.get(TYPE_HEADER) {
        properties = properties.with_kind(ShortString::from(kind.to_owned()));
    }
    if let Some(id) = headers.get(MESSAGE_ID_HEADER) {
        properties = properties.with_message_id(ShortString::from(id.to_owned()));
    }
    if let Some(content_type) = headers.get(CONTENT_TYPE_HEADER) {
        properties = properties.with_content_type(ShortString::from(content_type.to_owned()));
    }
    properties
}

fn long_string(value: &str) -> AMQPValue {
    AMQPValue::LongString(LongString::from(value.to_owned()))
}

fn frame_headers(properties: &BasicProperties) -> Headers {
    let mut headers = Headers::new();
    let Some(table) = properties.headers() else {
        return headers;
    };
    for (name, value) in table.inner() {
        match value {
            AMQPValue::FieldArray(values) => {
                for value in values.as_slice() {
                    if let Some(value) = header_value(value) {
                        headers.append(name.as_str(), value);
                    }
                }
            }
            value => {
                if let Some(value) = header_value(value) {
                    headers.append(name.as_str(), value);
                }
            }
        }
    }
    headers
}

fn header_value(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_owned()),
        _ => None,
    }
}

/// RabbitMQ receiver consuming a single queue.
#[derive(Clone)]
pub struct RabbitMqReceiver {
    channel: Arc<Mutex<lapin::Channel>>,
    queue: String,
    consumer_tag: String,
}

impl RabbitMqReceiver {
    pub fn new(channel: lapin::Channel, queue: impl Into<String>) -> Self {
        Self {
            channel: Arc::new(Mutex::new(channel)),
            queue: queue.into(),
            consumer_tag: String::new(),
        }
    }

    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = tag.into();
        self
    }
}

#[async_trait]
impl Receiver for RabbitMqReceiver {
    type Error = lapin::Error;

    #[tracing::instrument(skip_all, fields(queue = %self.queue))]
    async fn deliveries(
        &self,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, Result<Delivery, Self::Error>>, Self::Error> {
        let consumer = self
            .channel
            .lock()
            .await
            .basic_consume(
                &self.queue,
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        let queue = self.queue.clone();

        let stream = async_stream::stream! {
            tokio::pin!(consumer);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = consumer.next() => match next {
                        Some(Ok(delivery)) => yield Ok(Delivery {
                            frame: Frame::new(frame_headers(&delivery.properties), delivery.data),
                            channel: queue.clone(),
                            tag: delivery.delivery_tag,
                        }),
                        Some(Err(err)) => yield Err(err),
                        None => break,
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), Self::Error> {
        self.channel
            .lock()
            .await
            .basic_ack(delivery.tag, BasicAckOptions::default())
            .await
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), Self::Error> {
        self.channel
            .lock()
            .await
            .basic_reject(delivery.tag, BasicRejectOptions { requeue })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_headers_round_trip_as_arrays() {
        let mut headers = Headers::new();
        headers.append(TYPE_HEADER, "order.placed");
        headers.append("x-trace", "a");
        headers.append("x-trace", "b");

        let properties = properties(&headers);
        assert_eq!(
            properties.kind().as_ref().map(|k| k.as_str()),
            Some("order.placed")
        );

        let restored = frame_headers(&properties);
        assert_eq!(restored.get(TYPE_HEADER), Some("order.placed"));
        assert_eq!(restored.get_all("x-trace").collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
