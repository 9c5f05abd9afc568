//! Metrics collection and HTTP exposure for the broker daemon.
//!
//! Tracks per-routing-key publish counts and byte totals. Queue depths are
//! read live from the [`MemoryBroker`] when `GET /metrics` is served.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;

use crate::memory::{MemoryBroker, QueueStats};

/// Accumulated stats for a single routing key.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RoutingKeyMetrics {
    pub published: u64,
    pub bytes: u64,
}

/// JSON body of `GET /metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsResponse {
    pub total_published: u64,
    pub routing_keys: HashMap<String, RoutingKeyMetrics>,
    pub queues: Vec<QueueStats>,
    pub uptime_secs: f64,
}

#[derive(Debug, Default)]
struct Inner {
    total: u64,
    routing_keys: HashMap<String, RoutingKeyMetrics>,
}

/// Thread-safe publish counter shared between the broker and the HTTP handler.
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<Inner>>,
    start: Instant,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            start: Instant::now(),
        }
    }

    pub async fn record_publish(&self, routing_key: &str, byte_size: u64) {
        let mut inner = self.inner.lock().await;
        inner.total += 1;
        let stats = inner.routing_keys.entry(routing_key.to_string()).or_default();
        stats.published += 1;
        stats.bytes += byte_size;
    }

    pub async fn total(&self) -> u64 {
        self.inner.lock().await.total
    }

    pub async fn snapshot(&self, queues: Vec<QueueStats>) -> MetricsResponse {
        let inner = self.inner.lock().await;
        MetricsResponse {
            total_published: inner.total,
            routing_keys: inner.routing_keys.clone(),
            queues,
            uptime_secs: self.start.elapsed().as_secs_f64(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// ── HTTP server ──────────────────────────────────────────────────────

#[derive(Clone)]
struct MetricsState {
    collector: MetricsCollector,
    broker: MemoryBroker,
}

/// Router serving `GET /metrics`.
pub fn router(collector: MetricsCollector, broker: MemoryBroker) -> axum::Router {
    axum::Router::new()
        .route("/metrics", axum::routing::get(metrics_handler))
        .with_state(MetricsState { collector, broker })
}

/// Spawn the metrics HTTP server on the given port.
///
/// Returns a `JoinHandle` that resolves when the server shuts down.
pub fn spawn_metrics_server(
    port: u16,
    collector: MetricsCollector,
    broker: MemoryBroker,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(collector, broker);

        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(port, error = %e, "failed to bind metrics HTTP server");
                return;
            }
        };

        tracing::info!(port, "metrics HTTP server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut rx = shutdown;
                while !*rx.borrow() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await
            .ok();

        tracing::info!("metrics HTTP server stopped");
    })
}

/// Spawn a task that logs queue depths and the publish total every `interval`.
pub fn spawn_stats_logger(
    collector: MetricsCollector,
    broker: MemoryBroker,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            log_stats(&collector, &broker).await;
        }
    })
}

async fn log_stats(collector: &MetricsCollector, broker: &MemoryBroker) {
    for q in broker.queue_stats().await {
        tracing::debug!(
            queue = %q.name,
            ready = q.ready,
            unacked = q.unacked,
            consumers = q.consumers,
            "queue stats"
        );
    }
    // Read before the macro: a lock future held across the event is not Send.
    let total = collector.total().await;
    tracing::info!(total_published = total, "broker metrics");
}

/// Axum handler: `GET /metrics` → JSON snapshot.
async fn metrics_handler(
    axum::extract::State(state): axum::extract::State<MetricsState>,
) -> axum::Json<MetricsResponse> {
    let queues = state.broker.queue_stats().await;
    axum::Json(state.collector.snapshot(queues).await)
}
