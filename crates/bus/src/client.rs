//! Request/reply and publish/subscribe over one topic exchange.
//!
//! A [`MessagingClient`] owns one broker connection, one exchange and one
//! private reply queue. Requests are published on the `rpc` routing key of
//! an event with a fresh correlation id and the client's reply queue; a
//! single reply consumer hands every reply to the matching waiter in
//! [`PendingCalls`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::broker::{Broker, ConsumeOptions, Consumer, Delivery, QueueOptions};
use crate::config::BusConfig;
use crate::error::BusError;
use crate::event::EventKey;
use crate::message::Envelope;
use crate::pending::PendingCalls;
use crate::remote::ZmqBroker;

// ── Options ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Name of the consuming service; suffix of every queue it owns.
    pub service_name: String,
    pub exchange: String,
    /// Explicit reply queue; defaults to `<service>.reply-to`.
    pub reply_queue_name: Option<String>,
    pub rpc_timeout: Duration,
    pub prefetch: u16,
}

impl ClientOptions {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            exchange: "rrremote".into(),
            reply_queue_name: None,
            rpc_timeout: Duration::from_secs(30),
            prefetch: 1,
        }
    }

    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    pub fn with_reply_queue(mut self, queue: impl Into<String>) -> Self {
        self.reply_queue_name = Some(queue.into());
        self
    }

    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn reply_queue(&self) -> String {
        self.reply_queue_name
            .clone()
            .unwrap_or_else(|| format!("{}.reply-to", self.service_name))
    }
}

// ── Handler type ─────────────────────────────────────────────────────

/// Boxed async function that handles one delivery.
pub type DeliveryHandler =
    Arc<dyn Fn(Delivery) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send>> + Send + Sync>;

// ── MessagingClient ──────────────────────────────────────────────────

/// A running consume loop and the broker consumer feeding it.
struct ConsumerTask {
    consumer_tag: String,
    handle: JoinHandle<()>,
}

pub struct MessagingClient {
    broker: Arc<dyn Broker>,
    options: ClientOptions,
    reply_queue: String,
    pending: Arc<PendingCalls>,
    tasks: Mutex<Vec<ConsumerTask>>,
}

impl MessagingClient {
    /// Connect to the broker daemon described by `config`.
    ///
    /// Fails with [`BusError::Connection`] when the broker is unreachable or
    /// rejects the credentials.
    #[instrument(skip_all, fields(service = %service_name))]
    pub async fn create(config: &BusConfig, service_name: &str) -> Result<Arc<Self>, BusError> {
        let transport = config.broker_transport()?;
        let broker = ZmqBroker::connect_with_heartbeat(
            &transport,
            config.credentials(),
            config.connect_timeout(),
            config.heartbeat_interval(),
        )
        .await?;
        Self::create_with_broker(Arc::new(broker), config.client_options(service_name)).await
    }

    /// Build a client over an already connected broker.
    pub async fn create_with_broker(
        broker: Arc<dyn Broker>,
        options: ClientOptions,
    ) -> Result<Arc<Self>, BusError> {
        broker.declare_exchange(&options.exchange).await?;

        let reply_queue = options.reply_queue();
        broker
            .declare_queue(&reply_queue, QueueOptions::exclusive())
            .await?;
        let replies = broker
            .consume(&reply_queue, ConsumeOptions::auto_ack())
            .await?;

        let pending = Arc::new(PendingCalls::new());
        let loop_pending = Arc::clone(&pending);
        let consumer_tag = replies.consumer_tag.clone();
        let reply_loop = ConsumerTask {
            consumer_tag,
            handle: tokio::spawn(async move {
                Self::reply_loop(replies, loop_pending).await;
            }),
        };

        info!(
            service = %options.service_name,
            exchange = %options.exchange,
            reply_queue = %reply_queue,
            "messaging client ready"
        );

        Ok(Arc::new(Self {
            broker,
            options,
            reply_queue,
            pending,
            tasks: Mutex::new(vec![reply_loop]),
        }))
    }

    pub fn service_name(&self) -> &str {
        &self.options.service_name
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Number of calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Shared reply consumer: resolve the waiter of each reply exactly once.
    async fn reply_loop(mut replies: Consumer, pending: Arc<PendingCalls>) {
        while let Some(delivery) = replies.recv().await {
            let Some(cid) = delivery.envelope.correlation_id else {
                warn!(routing_key = %delivery.envelope.routing_key, "reply without correlation id dropped");
                continue;
            };
            pending.resolve(cid, delivery.envelope);
        }
        debug!("reply consumer closed");
    }

    // ── Publish ──────────────────────────────────────────────────────

    /// Publish an event. `Ok(false)` signals broker backpressure.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        event: &EventKey,
        payload: &T,
    ) -> Result<bool, BusError> {
        let envelope = Envelope::json(event.routing_key(), payload)?;
        let accepted = self.broker.publish(&self.options.exchange, envelope).await?;
        if accepted {
            debug!(routing_key = %event.routing_key(), "published");
        } else {
            warn!(routing_key = %event.routing_key(), "publish hit broker backpressure");
        }
        Ok(accepted)
    }

    // ── Request/reply ────────────────────────────────────────────────

    /// Send a request and decode the reply.
    pub async fn call_json<T, R>(&self, event: &EventKey, payload: &T) -> Result<R, BusError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call(event, payload).await?.decode()
    }

    /// Send a request and wait for the first reply carrying its correlation id.
    ///
    /// Returns [`BusError::Timeout`] when no reply arrives within the
    /// configured `rpc_timeout`. The waiter is removed however the call
    /// ends, including when this future is dropped.
    #[instrument(skip_all, fields(routing_key = %event.rpc_routing_key()))]
    pub async fn call<T: Serialize + ?Sized>(
        &self,
        event: &EventKey,
        payload: &T,
    ) -> Result<Envelope, BusError> {
        let cid = Uuid::new_v4();
        let request =
            Envelope::json(event.rpc_routing_key(), payload)?.with_reply(cid, &self.reply_queue);

        let mut waiter = self.pending.register(cid);
        self.broker.publish(&self.options.exchange, request).await?;
        debug!(correlation_id = %cid, "sent request");

        match tokio::time::timeout(self.options.rpc_timeout, waiter.reply()).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(BusError::Transport("reply channel closed unexpectedly".into())),
            Err(_) => {
                warn!(correlation_id = %cid, timeout = ?self.options.rpc_timeout, "request timed out");
                Err(BusError::Timeout(self.options.rpc_timeout))
            }
        }
    }

    /// Answer requests for `event`. The handler's value is sent back to the
    /// caller's reply queue under the request's correlation id.
    pub async fn serve<F, Fut, R>(&self, event: &EventKey, handler: F) -> Result<(), BusError>
    where
        F: Fn(Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, BusError>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        let queue = event.rpc_queue_name(&self.options.service_name);
        self.bind(&queue, &event.rpc_routing_key()).await?;

        let broker = Arc::clone(&self.broker);
        let handler = Arc::new(handler);
        let wrapped: DeliveryHandler = Arc::new(move |delivery: Delivery| {
            let broker = Arc::clone(&broker);
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let envelope = &delivery.envelope;
                let (Some(reply_to), Some(cid)) = (envelope.reply_to.clone(), envelope.correlation_id)
                else {
                    return Err(BusError::Protocol(format!(
                        "request on {} without reply address",
                        envelope.routing_key
                    )));
                };

                let response = (*handler)(delivery).await?;
                let reply = Envelope::json(reply_to.clone(), &response)?.with_correlation(cid);
                broker.send_to_queue(&reply_to, reply).await?;
                debug!(correlation_id = %cid, reply_to = %reply_to, "sent reply");
                Ok(())
            })
        });

        self.start_consumer(queue, wrapped).await
    }

    // ── Subscribe ────────────────────────────────────────────────────

    /// Consume every event matching `event` from this service's durable queue.
    pub async fn listen<F, Fut>(&self, event: &EventKey, handler: F) -> Result<(), BusError>
    where
        F: Fn(Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BusError>> + Send + 'static,
    {
        let queue = event.queue_name(&self.options.service_name);
        self.bind(&queue, &event.routing_key()).await?;
        let wrapped: DeliveryHandler = Arc::new(move |delivery| Box::pin(handler(delivery)));
        self.start_consumer(queue, wrapped).await
    }

    /// Acknowledge a delivery on behalf of a handler.
    pub async fn acknowledge(&self, delivery: &Delivery) -> Result<(), BusError> {
        delivery.ack().await
    }

    /// Stop all consumers of this client and cancel them at the broker.
    /// Unacknowledged deliveries return to their queues and the reply queue
    /// is free for the next client of this service.
    pub async fn shutdown(&self) {
        let tasks: Vec<ConsumerTask> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            task.handle.abort();
            if let Err(e) = self.broker.cancel(&task.consumer_tag).await {
                warn!(consumer = %task.consumer_tag, error = %e, "failed to cancel consumer");
            }
        }
        info!(service = %self.options.service_name, "messaging client shut down");
    }

    // ── Internals ────────────────────────────────────────────────────

    async fn bind(&self, queue: &str, pattern: &str) -> Result<(), BusError> {
        self.broker
            .declare_queue(queue, QueueOptions::durable())
            .await?;
        self.broker
            .bind_queue(queue, &self.options.exchange, pattern)
            .await
    }

    async fn start_consumer(&self, queue: String, handler: DeliveryHandler) -> Result<(), BusError> {
        let consumer = self
            .broker
            .consume(&queue, ConsumeOptions::manual(self.options.prefetch))
            .await?;
        let concurrency = usize::from(self.options.prefetch);
        info!(queue = %queue, concurrency, "consuming");

        let consumer_tag = consumer.consumer_tag.clone();
        let handle = tokio::spawn(async move {
            Self::consume_loop(consumer, queue, handler, concurrency).await;
        });
        self.tasks.lock().await.push(ConsumerTask {
            consumer_tag,
            handle,
        });
        Ok(())
    }

    /// Run each delivery on its own task, at most `concurrency` at a time.
    ///
    /// A delivery the handler left unsettled is acknowledged once the handler
    /// returns `Ok`, or fails on a malformed message (never worth retrying).
    /// Any other failure leaves the delivery unacknowledged: nothing retries
    /// it here, and the broker hands it out again once this consumer goes away.
    async fn consume_loop(
        mut consumer: Consumer,
        queue: String,
        handler: DeliveryHandler,
        concurrency: usize,
    ) {
        let permits = Arc::new(Semaphore::new(concurrency.max(1)));
        while let Some(delivery) = consumer.recv().await {
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let handler = Arc::clone(&handler);
            let queue = queue.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let settle = delivery.clone();
                match handler(delivery).await {
                    Ok(()) => {}
                    Err(e) if e.is_malformed() => {
                        warn!(queue = %queue, error = %e, "malformed message dropped");
                    }
                    Err(e) => {
                        warn!(
                            queue = %queue,
                            delivery_tag = settle.delivery_tag,
                            error = %e,
                            "handler failed, leaving message unacknowledged"
                        );
                        return;
                    }
                }
                if !settle.is_settled() {
                    if let Err(e) = settle.ack().await {
                        warn!(queue = %queue, error = %e, "failed to acknowledge delivery");
                    }
                }
            });
        }
        debug!(queue = %queue, "consumer closed");
    }
}

impl Drop for MessagingClient {
    fn drop(&mut self) {
        let mut tags = Vec::new();
        for task in self.tasks.get_mut().drain(..) {
            task.handle.abort();
            tags.push(task.consumer_tag);
        }
        if tags.is_empty() {
            return;
        }
        // Release the consumers at the broker too, when a runtime is still around.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let broker = Arc::clone(&self.broker);
        runtime.spawn(async move {
            for tag in tags {
                if let Err(e) = broker.cancel(&tag).await {
                    debug!(consumer = %tag, error = %e, "cancel on drop failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_reply_queue_follows_service() {
        let opts = ClientOptions::new("Jobs");
        assert_eq!(opts.reply_queue(), "Jobs.reply-to");
        let opts = opts.with_reply_queue("renderjob.submitproxy.reply-to");
        assert_eq!(opts.reply_queue(), "renderjob.submitproxy.reply-to");
    }

    #[test]
    fn options_defaults() {
        let opts = ClientOptions::new("Files");
        assert_eq!(opts.exchange, "rrremote");
        assert_eq!(opts.rpc_timeout, Duration::from_secs(30));
        assert_eq!(opts.prefetch(0).prefetch, 1);
    }
}
