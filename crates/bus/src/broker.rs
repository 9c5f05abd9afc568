//! The broker seam.
//!
//! A [`Broker`] is a topic exchange with durable queues and manual
//! acknowledgement. [`crate::memory::MemoryBroker`] implements it in-process,
//! [`crate::remote::ZmqBroker`] forwards every call to a broker daemon.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::BusError;
use crate::message::Envelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Survives consumer restarts; messages stay queued while nobody consumes.
    pub durable: bool,
    /// At most one live consumer.
    pub exclusive: bool,
}

impl QueueOptions {
    pub fn durable() -> Self {
        Self {
            durable: true,
            exclusive: false,
        }
    }

    pub fn exclusive() -> Self {
        Self {
            durable: true,
            exclusive: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeOptions {
    /// Maximum unacknowledged deliveries outstanding for this consumer.
    pub prefetch: u16,
    /// Deliveries count as acknowledged as soon as they are handed out.
    pub no_ack: bool,
}

impl ConsumeOptions {
    pub fn manual(prefetch: u16) -> Self {
        Self {
            prefetch: prefetch.max(1),
            no_ack: false,
        }
    }

    pub fn auto_ack() -> Self {
        Self {
            prefetch: u16::MAX,
            no_ack: true,
        }
    }
}

/// Settles deliveries on behalf of a [`Delivery`].
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BusError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BusError>;
}

/// A message handed to a consumer.
///
/// Clones share the settlement state: once any clone is acked or nacked,
/// further settlement calls are no-ops.
#[derive(Clone)]
pub struct Delivery {
    pub envelope: Envelope,
    pub queue: String,
    pub delivery_tag: u64,
    /// The message was handed out before and not acknowledged.
    pub redelivered: bool,
    acker: Option<Arc<dyn Acker>>,
    settled: Arc<AtomicBool>,
}

impl Delivery {
    pub fn new(
        envelope: Envelope,
        queue: impl Into<String>,
        delivery_tag: u64,
        redelivered: bool,
        acker: Option<Arc<dyn Acker>>,
    ) -> Self {
        let settled = Arc::new(AtomicBool::new(acker.is_none()));
        Self {
            envelope,
            queue: queue.into(),
            delivery_tag,
            redelivered,
            acker,
            settled,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    pub async fn ack(&self) -> Result<(), BusError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match &self.acker {
            Some(acker) => acker.ack(self.delivery_tag).await,
            None => Ok(()),
        }
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), BusError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match &self.acker {
            Some(acker) => acker.nack(self.delivery_tag, requeue).await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.envelope.routing_key)
            .field("queue", &self.queue)
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// Stream of deliveries from one queue.
///
/// Dropping the consumer cancels it; its unacknowledged deliveries go back
/// to the queue.
#[derive(Debug)]
pub struct Consumer {
    pub consumer_tag: String,
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Consumer {
    pub fn new(consumer_tag: impl Into<String>, rx: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self {
            consumer_tag: consumer_tag.into(),
            rx,
        }
    }

    /// Next delivery, `None` once the broker closed the consumer.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

/// Topic-routed pub/sub with durable queues and manual acknowledgement.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare a topic exchange. Idempotent.
    async fn declare_exchange(&self, exchange: &str) -> Result<(), BusError>;

    /// Declare a queue. Idempotent.
    async fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<(), BusError>;

    /// Route messages published on `exchange` matching `pattern` into `queue`.
    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<(), BusError>;

    /// Publish on an exchange. `Ok(false)` signals backpressure; the message
    /// was still accepted.
    async fn publish(&self, exchange: &str, envelope: Envelope) -> Result<bool, BusError>;

    /// Place a message directly into a queue (used for replies).
    async fn send_to_queue(&self, queue: &str, envelope: Envelope) -> Result<bool, BusError>;

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Consumer, BusError>;

    /// Stop the consumer named by `consumer_tag`; its unacknowledged
    /// deliveries go back to the queue. Unknown tags are ignored.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), BusError>;
}

/// Blanket implementation so `Arc<dyn Broker>` can be used directly.
#[async_trait]
impl<T: Broker + ?Sized> Broker for Arc<T> {
    async fn declare_exchange(&self, exchange: &str) -> Result<(), BusError> {
        (**self).declare_exchange(exchange).await
    }

    async fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<(), BusError> {
        (**self).declare_queue(queue, options).await
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<(), BusError> {
        (**self).bind_queue(queue, exchange, pattern).await
    }

    async fn publish(&self, exchange: &str, envelope: Envelope) -> Result<bool, BusError> {
        (**self).publish(exchange, envelope).await
    }

    async fn send_to_queue(&self, queue: &str, envelope: Envelope) -> Result<bool, BusError> {
        (**self).send_to_queue(queue, envelope).await
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Consumer, BusError> {
        (**self).consume(queue, options).await
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BusError> {
        (**self).cancel(consumer_tag).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingAcker {
        acks: AtomicU32,
        nacks: AtomicU32,
    }

    #[async_trait]
    impl Acker for CountingAcker {
        async fn ack(&self, _tag: u64) -> Result<(), BusError> {
            self.acks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn nack(&self, _tag: u64, _requeue: bool) -> Result<(), BusError> {
            self.nacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn delivery_settles_once_across_clones() {
        let acker = Arc::new(CountingAcker {
            acks: AtomicU32::new(0),
            nacks: AtomicU32::new(0),
        });
        let env = Envelope::json("a.b.c", &1).unwrap();
        let delivery = Delivery::new(env, "Q", 1, false, Some(acker.clone()));
        let clone = delivery.clone();

        assert!(!delivery.is_settled());
        clone.ack().await.unwrap();
        delivery.ack().await.unwrap();
        delivery.nack(true).await.unwrap();

        assert!(delivery.is_settled());
        assert_eq!(acker.acks.load(Ordering::SeqCst), 1);
        assert_eq!(acker.nacks.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn auto_ack_delivery_is_born_settled() {
        let env = Envelope::json("a.b.c", &1).unwrap();
        let delivery = Delivery::new(env, "Q", 1, false, None);
        assert!(delivery.is_settled());
    }

    #[test]
    fn manual_prefetch_is_at_least_one() {
        assert_eq!(ConsumeOptions::manual(0).prefetch, 1);
    }
}
