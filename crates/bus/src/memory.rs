//! In-process topic exchange.
//!
//! Semantics follow an AMQP topic exchange closely enough for the pipeline:
//! durable queues keep messages while nobody consumes, each consumer has a
//! prefetch window of unacknowledged deliveries, and deliveries of a consumer
//! that goes away are requeued and flagged as redelivered.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::broker::{Acker, Broker, ConsumeOptions, Consumer, Delivery, QueueOptions};
use crate::error::BusError;
use crate::event::topic_matches;
use crate::message::Envelope;
use crate::metrics::MetricsCollector;

/// Ready-queue length above which publishers are told to back off.
pub const DEFAULT_HIGH_WATER_MARK: usize = 10_000;

// ── State ────────────────────────────────────────────────────────────

#[derive(Default)]
struct State {
    exchanges: HashSet<String>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    next_tag: u64,
    next_consumer: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    queue: String,
    pattern: String,
}

struct Pending {
    envelope: Envelope,
    redelivered: bool,
}

struct Unacked {
    envelope: Envelope,
    consumer_id: u64,
}

struct ConsumerSlot {
    id: u64,
    tx: mpsc::UnboundedSender<Delivery>,
    options: ConsumeOptions,
    acker: Arc<dyn Acker>,
    in_flight: usize,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.options.no_ack || self.in_flight < usize::from(self.options.prefetch)
    }
}

struct QueueState {
    options: QueueOptions,
    ready: VecDeque<Pending>,
    consumers: Vec<ConsumerSlot>,
    unacked: HashMap<u64, Unacked>,
    cursor: usize,
}

impl QueueState {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            unacked: HashMap::new(),
            cursor: 0,
        }
    }

    /// Drop consumers whose receiving side is gone.
    fn reap_closed(&mut self) {
        let closed: Vec<u64> = self
            .consumers
            .iter()
            .filter(|c| c.tx.is_closed())
            .map(|c| c.id)
            .collect();
        for id in closed {
            self.remove_consumer(id);
        }
    }

    /// Remove a consumer and put its unacknowledged deliveries back in front.
    fn remove_consumer(&mut self, id: u64) {
        self.consumers.retain(|c| c.id != id);
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.consumer_id == id)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();
        for tag in tags.into_iter().rev() {
            if let Some(u) = self.unacked.remove(&tag) {
                self.ready.push_front(Pending {
                    envelope: u.envelope,
                    redelivered: true,
                });
            }
        }
        if !self.consumers.is_empty() {
            self.cursor %= self.consumers.len();
        } else {
            self.cursor = 0;
        }
    }

    /// Round-robin pick of a consumer with room in its prefetch window.
    fn next_available(&mut self) -> Option<usize> {
        let n = self.consumers.len();
        for offset in 0..n {
            let idx = (self.cursor + offset) % n;
            if self.consumers[idx].has_capacity() {
                self.cursor = (idx + 1) % n;
                return Some(idx);
            }
        }
        None
    }

    fn has_live_consumer(&self) -> bool {
        self.consumers.iter().any(|c| !c.tx.is_closed())
    }

    fn dispatch(&mut self, queue: &str, next_tag: &mut u64) {
        self.reap_closed();
        while !self.ready.is_empty() {
            let Some(idx) = self.next_available() else {
                break;
            };
            let Some(pending) = self.ready.pop_front() else {
                break;
            };

            *next_tag += 1;
            let tag = *next_tag;
            let slot = &self.consumers[idx];
            let acker = (!slot.options.no_ack).then(|| slot.acker.clone());
            let delivery = Delivery::new(
                pending.envelope.clone(),
                queue,
                tag,
                pending.redelivered,
                acker,
            );

            if slot.tx.send(delivery).is_err() {
                let id = slot.id;
                self.ready.push_front(pending);
                self.remove_consumer(id);
                continue;
            }

            let slot = &mut self.consumers[idx];
            if !slot.options.no_ack {
                slot.in_flight += 1;
                let consumer_id = slot.id;
                self.unacked.insert(
                    tag,
                    Unacked {
                        envelope: pending.envelope,
                        consumer_id,
                    },
                );
            }
        }
    }

    /// Take a delivery out of the unacknowledged set.
    fn settle(&mut self, consumer_id: u64, tag: u64) -> Result<Unacked, BusError> {
        match self.unacked.get(&tag) {
            Some(u) if u.consumer_id == consumer_id => {}
            _ => {
                return Err(BusError::Broker(format!("unknown delivery tag {tag}")));
            }
        }
        let unacked = self
            .unacked
            .remove(&tag)
            .ok_or_else(|| BusError::Broker(format!("unknown delivery tag {tag}")))?;
        if let Some(slot) = self.consumers.iter_mut().find(|c| c.id == consumer_id) {
            slot.in_flight = slot.in_flight.saturating_sub(1);
        }
        Ok(unacked)
    }
}

/// Depth of one queue, for metrics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub name: String,
    pub ready: usize,
    pub unacked: usize,
    pub consumers: usize,
}

// ── MemoryBroker ─────────────────────────────────────────────────────

/// Topic exchange living inside the current process.
///
/// Cheap to clone; clones share the same exchanges and queues.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
    high_water_mark: usize,
    metrics: Option<MetricsCollector>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            metrics: None,
        }
    }

    /// Report backpressure once any target queue holds more than `limit` ready messages.
    pub fn with_high_water_mark(mut self, limit: usize) -> Self {
        self.high_water_mark = limit;
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn queue_stats(&self) -> Vec<QueueStats> {
        let state = self.state.lock().await;
        let mut stats: Vec<QueueStats> = state
            .queues
            .iter()
            .map(|(name, q)| QueueStats {
                name: name.clone(),
                ready: q.ready.len(),
                unacked: q.unacked.len(),
                consumers: q.consumers.iter().filter(|c| !c.tx.is_closed()).count(),
            })
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    fn enqueue(&self, state: &mut State, queue: &str, envelope: Envelope) -> bool {
        let State {
            queues, next_tag, ..
        } = state;
        let Some(q) = queues.get_mut(queue) else {
            return true;
        };
        q.ready.push_back(Pending {
            envelope,
            redelivered: false,
        });
        q.dispatch(queue, next_tag);
        q.ready.len() <= self.high_water_mark
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_exchange(&self, exchange: &str) -> Result<(), BusError> {
        let mut state = self.state.lock().await;
        if state.exchanges.insert(exchange.to_string()) {
            debug!(exchange, "declared exchange");
        }
        Ok(())
    }

    async fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<(), BusError> {
        let mut state = self.state.lock().await;
        state.queues.entry(queue.to_string()).or_insert_with(|| {
            debug!(queue, ?options, "declared queue");
            QueueState::new(options)
        });
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<(), BusError> {
        let mut state = self.state.lock().await;
        if !state.exchanges.contains(exchange) {
            return Err(BusError::Broker(format!("no exchange '{exchange}'")));
        }
        if !state.queues.contains_key(queue) {
            return Err(BusError::Broker(format!("no queue '{queue}'")));
        }
        let binding = Binding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            pattern: pattern.to_string(),
        };
        if !state.bindings.contains(&binding) {
            debug!(queue, exchange, pattern, "bound queue");
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, envelope: Envelope) -> Result<bool, BusError> {
        let mut state = self.state.lock().await;
        if !state.exchanges.contains(exchange) {
            return Err(BusError::Broker(format!("no exchange '{exchange}'")));
        }

        let mut targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && topic_matches(&b.pattern, &envelope.routing_key))
            .map(|b| b.queue.clone())
            .collect();
        targets.sort();
        targets.dedup();

        if let Some(metrics) = &self.metrics {
            metrics
                .record_publish(&envelope.routing_key, envelope.body.len() as u64)
                .await;
        }

        if targets.is_empty() {
            debug!(routing_key = %envelope.routing_key, "unroutable message dropped");
            return Ok(true);
        }

        let mut accepted = true;
        for queue in &targets {
            accepted &= self.enqueue(&mut state, queue, envelope.clone());
        }
        if !accepted {
            warn!(routing_key = %envelope.routing_key, "queue above high-water mark");
        }
        Ok(accepted)
    }

    async fn send_to_queue(&self, queue: &str, envelope: Envelope) -> Result<bool, BusError> {
        let mut state = self.state.lock().await;
        if !state.queues.contains_key(queue) {
            debug!(queue, "message for unknown queue dropped");
            return Ok(true);
        }
        Ok(self.enqueue(&mut state, queue, envelope))
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Consumer, BusError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.next_consumer += 1;
        let id = state.next_consumer;

        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BusError::Broker(format!("no queue '{queue}'")))?;
        q.reap_closed();
        if q.options.exclusive && q.has_live_consumer() {
            return Err(BusError::Broker(format!("queue '{queue}' is exclusive and in use")));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let acker: Arc<dyn Acker> = Arc::new(MemoryAcker {
            state: Arc::downgrade(&self.state),
            queue: queue.to_string(),
            consumer_id: id,
        });
        q.consumers.push(ConsumerSlot {
            id,
            tx,
            options,
            acker,
            in_flight: 0,
        });
        q.dispatch(queue, &mut state.next_tag);

        debug!(queue, consumer = id, prefetch = options.prefetch, no_ack = options.no_ack, "consumer attached");
        Ok(Consumer::new(format!("ctag-{id}"), rx))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BusError> {
        let Some(id) = consumer_tag
            .strip_prefix("ctag-")
            .and_then(|id| id.parse::<u64>().ok())
        else {
            return Ok(());
        };
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        for (name, q) in state.queues.iter_mut() {
            if q.consumers.iter().any(|c| c.id == id) {
                q.remove_consumer(id);
                q.dispatch(name, &mut state.next_tag);
                debug!(queue = %name, consumer = id, "consumer cancelled");
                break;
            }
        }
        Ok(())
    }
}

// ── Acknowledgement ──────────────────────────────────────────────────

struct MemoryAcker {
    state: Weak<Mutex<State>>,
    queue: String,
    consumer_id: u64,
}

impl MemoryAcker {
    async fn settle(&self, tag: u64, requeue: Option<bool>) -> Result<(), BusError> {
        let shared = self
            .state
            .upgrade()
            .ok_or_else(|| BusError::Broker("broker is gone".into()))?;
        let mut guard = shared.lock().await;
        let state = &mut *guard;
        let q = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| BusError::Broker(format!("no queue '{}'", self.queue)))?;

        let unacked = q.settle(self.consumer_id, tag)?;
        if requeue == Some(true) {
            q.ready.push_front(Pending {
                envelope: unacked.envelope,
                redelivered: true,
            });
        }
        q.dispatch(&self.queue, &mut state.next_tag);
        Ok(())
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BusError> {
        self.settle(delivery_tag, None).await
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BusError> {
        self.settle(delivery_tag, Some(requeue)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const EXCHANGE: &str = "rrremote";

    async fn broker_with_queue(queue: &str, pattern: &str) -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.declare_exchange(EXCHANGE).await.unwrap();
        broker.declare_queue(queue, QueueOptions::durable()).await.unwrap();
        broker.bind_queue(queue, EXCHANGE, pattern).await.unwrap();
        broker
    }

    fn envelope(key: &str, n: u32) -> Envelope {
        Envelope::json(key, &n).unwrap()
    }

    async fn next(consumer: &mut Consumer) -> Delivery {
        tokio::time::timeout(Duration::from_secs(1), consumer.recv())
            .await
            .expect("delivery timed out")
            .expect("consumer closed")
    }

    async fn nothing_pending(consumer: &mut Consumer) -> bool {
        tokio::time::timeout(Duration::from_millis(50), consumer.recv())
            .await
            .is_err()
    }

    #[tokio::test]
    async fn durable_queue_buffers_until_consumed() {
        let broker = broker_with_queue("Q", "renderjob.status.update").await;
        broker.publish(EXCHANGE, envelope("renderjob.status.update", 1)).await.unwrap();

        let mut consumer = broker.consume("Q", ConsumeOptions::manual(1)).await.unwrap();
        let d = next(&mut consumer).await;
        assert_eq!(d.envelope.decode::<u32>().unwrap(), 1);
        assert!(!d.redelivered);
    }

    #[tokio::test]
    async fn prefetch_limits_outstanding_deliveries() {
        let broker = broker_with_queue("Q", "a.*.*").await;
        for n in 0..3 {
            broker.publish(EXCHANGE, envelope("a.b.c", n)).await.unwrap();
        }
        let mut consumer = broker.consume("Q", ConsumeOptions::manual(1)).await.unwrap();

        let first = next(&mut consumer).await;
        assert!(nothing_pending(&mut consumer).await);

        first.ack().await.unwrap();
        let second = next(&mut consumer).await;
        assert_eq!(second.envelope.decode::<u32>().unwrap(), 1);
    }

    #[tokio::test]
    async fn nack_with_requeue_redelivers() {
        let broker = broker_with_queue("Q", "a.b.c").await;
        broker.publish(EXCHANGE, envelope("a.b.c", 7)).await.unwrap();
        let mut consumer = broker.consume("Q", ConsumeOptions::manual(1)).await.unwrap();

        next(&mut consumer).await.nack(true).await.unwrap();
        let again = next(&mut consumer).await;
        assert!(again.redelivered);
        assert_eq!(again.envelope.decode::<u32>().unwrap(), 7);
    }

    #[tokio::test]
    async fn dropped_consumer_requeues_unacked() {
        let broker = broker_with_queue("Q", "a.b.c").await;
        broker.publish(EXCHANGE, envelope("a.b.c", 9)).await.unwrap();

        let mut first = broker.consume("Q", ConsumeOptions::manual(1)).await.unwrap();
        let _unacked = next(&mut first).await;
        drop(first);

        let mut second = broker.consume("Q", ConsumeOptions::manual(1)).await.unwrap();
        let d = next(&mut second).await;
        assert!(d.redelivered);
        assert_eq!(d.envelope.decode::<u32>().unwrap(), 9);
    }

    #[tokio::test]
    async fn competing_consumers_share_a_queue() {
        let broker = broker_with_queue("Q", "a.b.c").await;
        let mut c1 = broker.consume("Q", ConsumeOptions::manual(1)).await.unwrap();
        let mut c2 = broker.consume("Q", ConsumeOptions::manual(1)).await.unwrap();

        broker.publish(EXCHANGE, envelope("a.b.c", 1)).await.unwrap();
        broker.publish(EXCHANGE, envelope("a.b.c", 2)).await.unwrap();

        let a = next(&mut c1).await.envelope.decode::<u32>().unwrap();
        let b = next(&mut c2).await.envelope.decode::<u32>().unwrap();
        assert_eq!(a + b, 3);
    }

    #[tokio::test]
    async fn exclusive_queue_rejects_second_consumer() {
        let broker = MemoryBroker::new();
        broker.declare_queue("reply", QueueOptions::exclusive()).await.unwrap();
        let _owner = broker.consume("reply", ConsumeOptions::auto_ack()).await.unwrap();
        let err = broker.consume("reply", ConsumeOptions::auto_ack()).await.unwrap_err();
        assert!(err.to_string().contains("exclusive"));
    }

    #[tokio::test]
    async fn backpressure_reports_false_but_keeps_message() {
        let broker = broker_with_queue("Q", "a.b.c").await.with_high_water_mark(1);
        assert!(broker.publish(EXCHANGE, envelope("a.b.c", 1)).await.unwrap());
        assert!(!broker.publish(EXCHANGE, envelope("a.b.c", 2)).await.unwrap());

        let stats = broker.queue_stats().await;
        assert_eq!(stats[0].ready, 2);
    }

    #[tokio::test]
    async fn unknown_exchange_is_an_error() {
        let broker = MemoryBroker::new();
        assert!(broker.publish("missing", envelope("a.b.c", 1)).await.is_err());
    }

    #[tokio::test]
    async fn unroutable_message_is_dropped() {
        let broker = broker_with_queue("Q", "a.b.c").await;
        assert!(broker.publish(EXCHANGE, envelope("x.y.z", 1)).await.unwrap());
        assert_eq!(broker.queue_stats().await[0].ready, 0);
    }

    #[tokio::test]
    async fn auto_ack_consumer_is_not_throttled() {
        let broker = broker_with_queue("Q", "a.b.c").await;
        let mut consumer = broker.consume("Q", ConsumeOptions::auto_ack()).await.unwrap();
        for n in 0..5 {
            broker.publish(EXCHANGE, envelope("a.b.c", n)).await.unwrap();
        }
        for n in 0..5 {
            let d = next(&mut consumer).await;
            assert!(d.is_settled());
            assert_eq!(d.envelope.decode::<u32>().unwrap(), n);
        }
        assert_eq!(broker.queue_stats().await[0].unacked, 0);
    }

    #[tokio::test]
    async fn cancel_requeues_and_frees_exclusive_queue() {
        let broker = MemoryBroker::new();
        broker.declare_exchange(EXCHANGE).await.unwrap();
        broker.declare_queue("R", QueueOptions::exclusive()).await.unwrap();
        broker.bind_queue("R", EXCHANGE, "a.b.c").await.unwrap();

        let mut first = broker.consume("R", ConsumeOptions::manual(1)).await.unwrap();
        broker.publish(EXCHANGE, envelope("a.b.c", 1)).await.unwrap();
        let held = next(&mut first).await;
        assert!(!held.redelivered);

        broker.cancel(&first.consumer_tag).await.unwrap();
        assert!(first.recv().await.is_none());

        let mut second = broker.consume("R", ConsumeOptions::manual(1)).await.unwrap();
        let again = next(&mut second).await;
        assert!(again.redelivered);
        assert_eq!(again.envelope.decode::<u32>().unwrap(), 1);

        broker.cancel("ctag-9999").await.unwrap();
        broker.cancel("bogus").await.unwrap();
    }
}
