pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod memory;
pub mod message;
pub mod metrics;
pub mod pending;
pub mod remote;
pub mod transport;
pub mod worker;

pub use broker::{Acker, Broker, ConsumeOptions, Consumer, Delivery, QueueOptions};
pub use client::{ClientOptions, DeliveryHandler, MessagingClient};
pub use config::{BusConfig, Credentials};
pub use error::BusError;
pub use event::{topic_matches, EventKey};
pub use memory::{MemoryBroker, QueueStats};
pub use message::Envelope;
pub use metrics::MetricsCollector;
pub use pending::{PendingCall, PendingCalls};
pub use remote::{BrokerServer, ZmqBroker, DEFAULT_HEARTBEAT, DEFAULT_SESSION_TIMEOUT};
pub use transport::Transport;
pub use worker::{Worker, WorkerRunner};
