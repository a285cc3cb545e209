use std::{
    collections::{HashMap, VecDeque},
    convert::Infallible,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use futures_core::stream::BoxStream;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::{
    codec::Frame,
    transport::{Delivery, Outgoing, Receiver, Sender},
};

/// In-memory broker for testing or local pipelines.
///
/// Every channel doubles as a queue of the same name: a frame sent to a
/// channel is recorded and becomes deliverable to receivers of that queue.
/// Useful for:
/// - Unit and integration testing
/// - Running the outbox and inbox without a real broker
/// - Debugging message flows
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct State {
    sent: HashMap<String, Vec<Outgoing>>,
    queues: HashMap<String, VecDeque<Delivery>>,
    unsettled: HashMap<u64, Delivery>,
    rejected: Vec<Delivery>,
    next_tag: u64,
}

impl InMemoryBroker {
    /// Frames sent to `channel`, in send order.
    pub fn sent(&self, channel: &str) -> Vec<Outgoing> {
        self.lock().sent.get(channel).cloned().unwrap_or_default()
    }

    /// Put a frame on `queue` as if a remote producer had published it.
    pub fn deliver(&self, queue: &str, frame: Frame) {
        self.enqueue(queue, frame);
    }

    /// Deliveries rejected without requeue.
    pub fn rejected(&self) -> Vec<Delivery> {
        self.lock().rejected.clone()
    }

    /// Number of deliveries neither acked nor rejected.
    pub fn unsettled(&self) -> usize {
        self.lock().unsettled.len()
    }

    /// Number of frames waiting on `queue`.
    pub fn pending(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Receiver consuming `queue`.
    pub fn receiver(&self, queue: impl Into<String>) -> InMemoryReceiver {
        InMemoryReceiver {
            broker: self.clone(),
            queue: queue.into(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, queue: &str, frame: Frame) {
        {
            let mut state = self.lock();
            state.next_tag += 1;
            let delivery = Delivery {
                frame,
                channel: queue.to_owned(),
                tag: state.next_tag,
            };
            state
                .queues
                .entry(queue.to_owned())
                .or_default()
                .push_back(delivery);
        }
        self.notify.notify_waiters();
    }

    fn pop(&self, queue: &str) -> Option<Delivery> {
        let mut state = self.lock();
        let delivery = state.queues.get_mut(queue)?.pop_front()?;
        state.unsettled.insert(delivery.tag, delivery.clone());
        Some(delivery)
    }
}

#[async_trait]
impl Sender for InMemoryBroker {
    type Error = Infallible;

    /// "Send" a frame by recording it and queueing it for receivers.
    #[tracing::instrument(skip_all, fields(channel = %outgoing.route.channel))]
    async fn send(&mut self, outgoing: Outgoing) -> Result<(), Self::Error> {
        tracing::info!(
            routing_key = %outgoing.route.routing_key,
            headers = ?outgoing.frame.headers,
            "Frame sent to in-memory broker",
        );
        let channel = outgoing.route.channel.clone();
        let frame = outgoing.frame.clone();
        self.lock()
            .sent
            .entry(channel.clone())
            .or_default()
            .push(outgoing);
        self.enqueue(&channel, frame);
        Ok(())
    }
}

/// Receiver half of the [`InMemoryBroker`].
#[derive(Clone)]
pub struct InMemoryReceiver {
    broker: InMemoryBroker,
    queue: String,
}

#[async_trait]
impl Receiver for InMemoryReceiver {
    type Error = Infallible;

    async fn deliveries(
        &self,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, Result<Delivery, Self::Error>>, Self::Error> {
        let broker = self.broker.clone();
        let queue = self.queue.clone();

        let stream = async_stream::stream! {
            loop {
                let notified = broker.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if let Some(delivery) = broker.pop(&queue) {
                    yield Ok(delivery);
                    continue;
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = &mut notified => {}
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), Self::Error> {
        self.broker.lock().unsettled.remove(&delivery.tag);
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), Self::Error> {
        {
            let mut state = self.broker.lock();
            let Some(delivery) = state.unsettled.remove(&delivery.tag) else {
                return Ok(());
            };
            if requeue {
                state
                    .queues
                    .entry(delivery.channel.clone())
                    .or_default()
                    .push_front(delivery);
            } else {
                state.rejected.push(delivery);
            }
        }
        if requeue {
            self.broker.notify.notify_waiters();
        }
        Ok(())
    }
}
