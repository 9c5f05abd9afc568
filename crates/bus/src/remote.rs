//! Broker daemon and its client over ZeroMQ DEALER/ROUTER sockets.
//!
//! [`BrokerServer`] hosts a [`MemoryBroker`] behind a ROUTER socket;
//! [`ZmqBroker`] is a DEALER client implementing [`Broker`] by forwarding
//! every call to the daemon.
//!
//! ## Framing (zeromq-rs 0.4)
//!
//! Every application message is a single MessagePack frame:
//! - DEALER sends: `[ClientFrame]`
//! - ROUTER receives: `[identity, ClientFrame]`
//! - ROUTER sends: `[identity, ServerFrame]`
//! - DEALER receives: `[ServerFrame]`
//!
//! Requests carry a connection-local `request_id` answered by exactly one
//! `Reply`. Deliveries arrive unsolicited as `Deliver` frames addressed to a
//! consumer id chosen by the client.
//!
//! ## Liveness
//!
//! `Heartbeat` and `Bye` are one-way: the daemon never answers them. A client
//! pings every heartbeat interval and says `Bye` when dropped. The daemon
//! closes any session silent for longer than its session timeout, which
//! cancels the session's consumers and requeues what they had not acknowledged.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use zeromq::prelude::*;
use zeromq::{DealerSocket, RouterSocket, ZmqMessage};

use crate::broker::{Acker, Broker, ConsumeOptions, Consumer, Delivery, QueueOptions};
use crate::config::Credentials;
use crate::error::BusError;
use crate::memory::MemoryBroker;
use crate::message::Envelope;
use crate::transport::Transport;

// ── Wire frames ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Request {
    Hello {
        credentials: Option<Credentials>,
    },
    DeclareExchange {
        exchange: String,
    },
    DeclareQueue {
        queue: String,
        options: QueueOptions,
    },
    Bind {
        queue: String,
        exchange: String,
        pattern: String,
    },
    Publish {
        exchange: String,
        envelope: Envelope,
    },
    SendToQueue {
        queue: String,
        envelope: Envelope,
    },
    Consume {
        consumer: u64,
        queue: String,
        options: ConsumeOptions,
    },
    Ack {
        consumer: u64,
        delivery_tag: u64,
    },
    Nack {
        consumer: u64,
        delivery_tag: u64,
        requeue: bool,
    },
    Cancel {
        consumer: u64,
    },
    Heartbeat,
    Bye,
}

impl Request {
    fn name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::DeclareExchange { .. } => "declare_exchange",
            Self::DeclareQueue { .. } => "declare_queue",
            Self::Bind { .. } => "bind",
            Self::Publish { .. } => "publish",
            Self::SendToQueue { .. } => "send_to_queue",
            Self::Consume { .. } => "consume",
            Self::Ack { .. } => "ack",
            Self::Nack { .. } => "nack",
            Self::Cancel { .. } => "cancel",
            Self::Heartbeat => "heartbeat",
            Self::Bye => "bye",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ClientFrame {
    request_id: u64,
    request: Request,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Outcome {
    Done,
    Accepted(bool),
    Failed(String),
}

#[derive(Debug, Serialize, Deserialize)]
enum ServerFrame {
    Reply {
        request_id: u64,
        outcome: Outcome,
    },
    Deliver {
        consumer: u64,
        delivery_tag: u64,
        redelivered: bool,
        queue: String,
        envelope: Envelope,
    },
}

fn encode<T: Serialize>(frame: &T) -> Result<Vec<u8>, BusError> {
    Ok(rmp_serde::to_vec_named(frame)?)
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, BusError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Interval between client pings when none is configured.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(5);

/// Silence after which the daemon drops a client session.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(15);

/// Bound on the goodbye frame a dropped client tries to send.
const BYE_TIMEOUT: Duration = Duration::from_secs(1);

// ── Client ───────────────────────────────────────────────────────────

struct ConsumerEntry {
    tx: mpsc::UnboundedSender<Delivery>,
    no_ack: bool,
}

/// Shared half of a connection, reachable from ackers and the event loop.
struct Connection {
    send_tx: mpsc::Sender<ZmqMessage>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Outcome>>>,
    consumers: Mutex<HashMap<u64, ConsumerEntry>>,
    next_id: AtomicU64,
    request_timeout: Duration,
}

impl Connection {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Encode a request that expects no reply.
    fn one_way(&self, request: Request) -> Option<ZmqMessage> {
        let name = request.name();
        let frame = ClientFrame {
            request_id: self.next_id(),
            request,
        };
        match encode(&frame) {
            Ok(bytes) => Some(ZmqMessage::from(bytes)),
            Err(e) => {
                warn!(request = name, error = %e, "failed to encode frame");
                None
            }
        }
    }

    /// Send one request and wait for its reply.
    async fn request(&self, request: Request) -> Result<Outcome, BusError> {
        let request_id = self.next_id();
        let name = request.name();
        let bytes = encode(&ClientFrame {
            request_id,
            request,
        })?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);

        if self.send_tx.send(ZmqMessage::from(bytes)).await.is_err() {
            self.pending.lock().await.remove(&request_id);
            return Err(BusError::Transport("broker connection closed".into()));
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(Outcome::Failed(reason))) => Err(BusError::Broker(reason)),
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(BusError::Transport(
                "reply channel closed unexpectedly".into(),
            )),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                warn!(request = name, "broker did not answer in time");
                Err(BusError::Timeout(self.request_timeout))
            }
        }
    }

    async fn request_done(&self, request: Request) -> Result<(), BusError> {
        self.request(request).await.map(|_| ())
    }

    async fn request_accepted(&self, request: Request) -> Result<bool, BusError> {
        match self.request(request).await? {
            Outcome::Accepted(accepted) => Ok(accepted),
            other => Err(BusError::Protocol(format!("unexpected broker answer {other:?}"))),
        }
    }
}

/// [`Broker`] backed by a remote [`BrokerServer`].
///
/// Dropping it says goodbye to the daemon, which requeues whatever its
/// consumers still held.
pub struct ZmqBroker {
    conn: Arc<Connection>,
    close: Option<oneshot::Sender<()>>,
    event_loop: JoinHandle<()>,
}

impl ZmqBroker {
    /// Connect a DEALER socket to the broker daemon and say hello.
    ///
    /// Fails with [`BusError::Connection`] when the daemon is unreachable,
    /// does not answer within `timeout`, or rejects the credentials.
    pub async fn connect(
        transport: &Transport,
        credentials: Option<Credentials>,
        timeout: Duration,
    ) -> Result<Self, BusError> {
        Self::connect_with_heartbeat(transport, credentials, timeout, DEFAULT_HEARTBEAT).await
    }

    /// Like [`connect`](Self::connect), pinging the daemon every `heartbeat`.
    #[instrument(skip_all, fields(endpoint = %transport))]
    pub async fn connect_with_heartbeat(
        transport: &Transport,
        credentials: Option<Credentials>,
        timeout: Duration,
        heartbeat: Duration,
    ) -> Result<Self, BusError> {
        let endpoint = transport.endpoint();
        let mut socket = DealerSocket::new();
        info!(endpoint = %endpoint, "connecting DEALER socket");
        socket
            .connect(&endpoint)
            .await
            .map_err(|e| BusError::Connection(format!("{endpoint}: {e}")))?;

        let (send_tx, send_rx) = mpsc::channel::<ZmqMessage>(256);
        let conn = Arc::new(Connection {
            send_tx,
            pending: Mutex::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            request_timeout: timeout,
        });

        let (close_tx, close_rx) = oneshot::channel();
        let loop_conn = Arc::clone(&conn);
        let event_loop = tokio::spawn(async move {
            Self::event_loop(socket, send_rx, close_rx, loop_conn, heartbeat).await;
        });
        let broker = Self {
            conn,
            close: Some(close_tx),
            event_loop,
        };

        match broker.conn.request(Request::Hello { credentials }).await {
            Ok(_) => {
                info!(endpoint = %endpoint, "connected to broker");
                Ok(broker)
            }
            Err(BusError::Timeout(_)) => Err(BusError::Connection(format!(
                "no answer from broker at {endpoint} within {timeout:?}"
            ))),
            Err(e) => Err(BusError::Connection(format!(
                "broker at {endpoint} refused connection: {e}"
            ))),
        }
    }

    /// Single task owning the DEALER socket.
    async fn event_loop(
        mut socket: DealerSocket,
        mut send_rx: mpsc::Receiver<ZmqMessage>,
        mut close_rx: oneshot::Receiver<()>,
        conn: Arc<Connection>,
        heartbeat: Duration,
    ) {
        let mut ticker = tokio::time::interval(heartbeat);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut close_rx => {
                    if let Some(bye) = conn.one_way(Request::Bye) {
                        if tokio::time::timeout(BYE_TIMEOUT, socket.send(bye)).await.is_err() {
                            debug!("broker did not take goodbye");
                        }
                    }
                    debug!("DEALER closed");
                    break;
                }
                _ = ticker.tick() => {
                    if let Some(ping) = conn.one_way(Request::Heartbeat) {
                        if let Err(e) = socket.send(ping).await {
                            warn!(error = %e, "heartbeat send failed");
                        }
                    }
                }
                Some(msg) = send_rx.recv() => {
                    if let Err(e) = socket.send(msg).await {
                        warn!(error = %e, "DEALER send failed");
                    }
                }
                result = socket.recv() => {
                    match result {
                        Ok(msg) => {
                            if let Some(cancel) = Self::dispatch(&conn, msg).await {
                                if let Err(e) = socket.send(cancel).await {
                                    warn!(error = %e, "failed to send consumer cancel");
                                }
                            }
                        }
                        Err(e) => {
                            debug!(error = %e, "DEALER recv loop ending");
                            break;
                        }
                    }
                }
                else => break,
            }
        }
    }

    /// Route an inbound frame. Returns a cancel frame when a delivery hit a
    /// consumer whose receiver is gone.
    async fn dispatch(conn: &Arc<Connection>, msg: ZmqMessage) -> Option<ZmqMessage> {
        let frames: Vec<_> = msg.iter().collect();
        let Some(data) = frames.iter().find(|f| !f.as_ref().is_empty()) else {
            warn!(raw_frame_count = frames.len(), "empty message on DEALER recv");
            return None;
        };

        let frame: ServerFrame = match decode(data.as_ref()) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "failed to decode broker frame");
                return None;
            }
        };

        match frame {
            ServerFrame::Reply {
                request_id,
                outcome,
            } => {
                match conn.pending.lock().await.remove(&request_id) {
                    Some(tx) => {
                        let _ = tx.send(outcome);
                    }
                    None => debug!(request_id, "reply for unknown request"),
                }
                None
            }
            ServerFrame::Deliver {
                consumer,
                delivery_tag,
                redelivered,
                queue,
                envelope,
            } => {
                let mut consumers = conn.consumers.lock().await;
                let entry = consumers.get(&consumer)?;
                let acker: Option<Arc<dyn Acker>> = if entry.no_ack {
                    None
                } else {
                    Some(Arc::new(RemoteAcker {
                        conn: Arc::downgrade(conn),
                        consumer,
                    }))
                };
                let delivery = Delivery::new(envelope, queue, delivery_tag, redelivered, acker);
                if entry.tx.send(delivery).is_ok() {
                    return None;
                }

                consumers.remove(&consumer);
                debug!(consumer, "consumer dropped, cancelling");
                conn.one_way(Request::Cancel { consumer })
            }
        }
    }
}

impl Drop for ZmqBroker {
    fn drop(&mut self) {
        let said_bye = self
            .close
            .take()
            .map(|close| close.send(()).is_ok())
            .unwrap_or(false);
        if !said_bye {
            self.event_loop.abort();
        }
    }
}

#[async_trait]
impl Broker for ZmqBroker {
    async fn declare_exchange(&self, exchange: &str) -> Result<(), BusError> {
        self.conn
            .request_done(Request::DeclareExchange {
                exchange: exchange.to_string(),
            })
            .await
    }

    async fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<(), BusError> {
        self.conn
            .request_done(Request::DeclareQueue {
                queue: queue.to_string(),
                options,
            })
            .await
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<(), BusError> {
        self.conn
            .request_done(Request::Bind {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                pattern: pattern.to_string(),
            })
            .await
    }

    async fn publish(&self, exchange: &str, envelope: Envelope) -> Result<bool, BusError> {
        self.conn
            .request_accepted(Request::Publish {
                exchange: exchange.to_string(),
                envelope,
            })
            .await
    }

    async fn send_to_queue(&self, queue: &str, envelope: Envelope) -> Result<bool, BusError> {
        self.conn
            .request_accepted(Request::SendToQueue {
                queue: queue.to_string(),
                envelope,
            })
            .await
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Consumer, BusError> {
        let consumer = self.conn.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.conn.consumers.lock().await.insert(
            consumer,
            ConsumerEntry {
                tx,
                no_ack: options.no_ack,
            },
        );

        let result = self
            .conn
            .request_done(Request::Consume {
                consumer,
                queue: queue.to_string(),
                options,
            })
            .await;
        if let Err(e) = result {
            self.conn.consumers.lock().await.remove(&consumer);
            return Err(e);
        }
        Ok(Consumer::new(format!("remote-{consumer}"), rx))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BusError> {
        let Some(consumer) = consumer_tag
            .strip_prefix("remote-")
            .and_then(|id| id.parse::<u64>().ok())
        else {
            return Ok(());
        };
        if self.conn.consumers.lock().await.remove(&consumer).is_none() {
            return Ok(());
        }
        self.conn.request_done(Request::Cancel { consumer }).await
    }
}

struct RemoteAcker {
    conn: Weak<Connection>,
    consumer: u64,
}

impl RemoteAcker {
    fn conn(&self) -> Result<Arc<Connection>, BusError> {
        self.conn
            .upgrade()
            .ok_or_else(|| BusError::Transport("broker connection closed".into()))
    }
}

#[async_trait]
impl Acker for RemoteAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BusError> {
        self.conn()?
            .request_done(Request::Ack {
                consumer: self.consumer,
                delivery_tag,
            })
            .await
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BusError> {
        self.conn()?
            .request_done(Request::Nack {
                consumer: self.consumer,
                delivery_tag,
                requeue,
            })
            .await
    }
}

// ── Server ───────────────────────────────────────────────────────────

/// A delivery leaving a hosted consumer, on its way to a remote peer.
struct Outbound {
    identity: Vec<u8>,
    consumer: u64,
    delivery: Delivery,
}

/// A hosted consumer pumping deliveries towards a remote peer.
struct Forwarder {
    consumer_tag: String,
    handle: JoinHandle<()>,
}

/// State the daemon keeps per connected DEALER.
struct Session {
    authenticated: bool,
    last_seen: Instant,
    forwarders: HashMap<u64, Forwarder>,
    unacked: HashMap<(u64, u64), Delivery>,
}

impl Session {
    fn new() -> Self {
        Self {
            authenticated: false,
            last_seen: Instant::now(),
            forwarders: HashMap::new(),
            unacked: HashMap::new(),
        }
    }

    fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    fn is_idle(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }

    /// Stop a consumer and requeue everything it had not acknowledged.
    async fn cancel(&mut self, broker: &MemoryBroker, consumer: u64) {
        if let Some(forwarder) = self.forwarders.remove(&consumer) {
            forwarder.handle.abort();
            let _ = forwarder.handle.await;
            if let Err(e) = broker.cancel(&forwarder.consumer_tag).await {
                debug!(consumer, error = %e, "hosted consumer cancel failed");
            }
        }
        // The hosted consumer is gone, so its deliveries are already requeued.
        self.unacked.retain(|(c, _), _| *c != consumer);
    }

    async fn close(&mut self, broker: &MemoryBroker) {
        let consumers: Vec<u64> = self.forwarders.keys().copied().collect();
        for consumer in consumers {
            self.cancel(broker, consumer).await;
        }
    }
}

/// Broker daemon: a [`MemoryBroker`] served over a ROUTER socket.
pub struct BrokerServer {
    socket: RouterSocket,
    transport: Transport,
    broker: MemoryBroker,
    credentials: Option<Credentials>,
    session_timeout: Duration,
    shutdown: Arc<Notify>,
}

impl BrokerServer {
    /// Bind the ROUTER socket. Requests are served once [`run`](Self::run) is awaited.
    #[instrument(skip_all, fields(endpoint = %transport))]
    pub async fn bind(
        transport: &Transport,
        broker: MemoryBroker,
        credentials: Option<Credentials>,
    ) -> Result<Self, BusError> {
        transport
            .prepare_bind()
            .map_err(|e| BusError::Transport(e.to_string()))?;
        let mut socket = RouterSocket::new();
        let endpoint = transport.endpoint();
        info!(endpoint = %endpoint, auth = credentials.is_some(), "binding ROUTER socket");
        socket.bind(&endpoint).await?;
        Ok(Self {
            socket,
            transport: transport.clone(),
            broker,
            credentials,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Close sessions that send nothing, heartbeats included, for `timeout`.
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    /// Handle that stops [`run`](Self::run) when notified.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Serve until the shutdown handle is notified.
    pub async fn run(self) -> Result<(), BusError> {
        let Self {
            mut socket,
            transport,
            broker,
            credentials,
            session_timeout,
            shutdown,
        } = self;

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
        let mut sessions: HashMap<Vec<u8>, Session> = HashMap::new();
        let mut sweep = tokio::time::interval((session_timeout / 3).max(Duration::from_millis(10)));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(endpoint = %transport, session_timeout_ms = session_timeout.as_millis() as u64, "broker serving");

        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("broker shutting down");
                    break;
                }
                _ = sweep.tick() => {
                    Self::expire_idle(&broker, &mut sessions, session_timeout).await;
                }
                Some(out) = out_rx.recv() => {
                    Self::forward(&broker, &mut socket, &mut sessions, out).await;
                }
                result = socket.recv() => {
                    let msg = match result {
                        Ok(msg) => msg,
                        Err(e) => {
                            warn!(error = %e, "ROUTER recv error");
                            continue;
                        }
                    };
                    let Some((identity, frame)) = Self::split(msg) else {
                        continue;
                    };
                    match frame.request {
                        Request::Heartbeat => {
                            if let Some(session) = sessions.get_mut(&identity) {
                                session.touch();
                            }
                            continue;
                        }
                        Request::Bye => {
                            if let Some(mut session) = sessions.remove(&identity) {
                                debug!(consumers = session.forwarders.len(), "client said goodbye");
                                session.close(&broker).await;
                            }
                            continue;
                        }
                        _ => {}
                    }
                    let session = sessions.entry(identity.clone()).or_insert_with(Session::new);
                    session.touch();
                    let outcome = Self::handle(
                        &broker,
                        credentials.as_ref(),
                        session,
                        &identity,
                        frame.request,
                        &out_tx,
                    )
                    .await;
                    let reply = ServerFrame::Reply {
                        request_id: frame.request_id,
                        outcome,
                    };
                    if let Err(e) = Self::send(&mut socket, &identity, &reply).await {
                        warn!(error = %e, "failed to send reply");
                    }
                }
            }
        }

        for session in sessions.values_mut() {
            session.close(&broker).await;
        }
        info!("broker stopped");
        Ok(())
    }

    /// Close every session that has been silent for longer than `timeout`.
    async fn expire_idle(
        broker: &MemoryBroker,
        sessions: &mut HashMap<Vec<u8>, Session>,
        timeout: Duration,
    ) {
        let idle: Vec<Vec<u8>> = sessions
            .iter()
            .filter(|(_, s)| s.is_idle(timeout))
            .map(|(identity, _)| identity.clone())
            .collect();
        for identity in idle {
            if let Some(mut session) = sessions.remove(&identity) {
                info!(
                    consumers = session.forwarders.len(),
                    unacked = session.unacked.len(),
                    "client session expired"
                );
                session.close(broker).await;
            }
        }
    }

    /// ROUTER recv frames: `[identity, ...data_frames]`.
    fn split(msg: ZmqMessage) -> Option<(Vec<u8>, ClientFrame)> {
        let frames: Vec<_> = msg.iter().collect();
        if frames.len() < 2 {
            warn!(frame_count = frames.len(), "short message on ROUTER recv");
            return None;
        }
        let identity = frames[0].as_ref().to_vec();
        let data = frames[1..].iter().find(|f| !f.as_ref().is_empty())?;
        match decode::<ClientFrame>(data.as_ref()) {
            Ok(frame) => Some((identity, frame)),
            Err(e) => {
                warn!(error = %e, "failed to decode client frame");
                None
            }
        }
    }

    async fn send(
        socket: &mut RouterSocket,
        identity: &[u8],
        frame: &ServerFrame,
    ) -> Result<(), BusError> {
        let bytes = encode(frame)?;
        let mut msg = ZmqMessage::from(identity.to_vec());
        msg.push_back(bytes.into());
        socket.send(msg).await?;
        Ok(())
    }

    /// Hand a hosted delivery to its peer; a peer that cannot be reached
    /// loses its session and its deliveries are requeued.
    async fn forward(
        broker: &MemoryBroker,
        socket: &mut RouterSocket,
        sessions: &mut HashMap<Vec<u8>, Session>,
        out: Outbound,
    ) {
        let Outbound {
            identity,
            consumer,
            delivery,
        } = out;

        let Some(session) = sessions.get_mut(&identity) else {
            let _ = delivery.nack(true).await;
            return;
        };
        if !session.forwarders.contains_key(&consumer) {
            // Consumer was cancelled while this delivery was in flight.
            let _ = delivery.nack(true).await;
            return;
        }

        let frame = ServerFrame::Deliver {
            consumer,
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            queue: delivery.queue.clone(),
            envelope: delivery.envelope.clone(),
        };
        if !delivery.is_settled() {
            session
                .unacked
                .insert((consumer, delivery.delivery_tag), delivery);
        }

        if let Err(e) = Self::send(socket, &identity, &frame).await {
            warn!(consumer, error = %e, "peer unreachable, closing session");
            if let Some(mut session) = sessions.remove(&identity) {
                session.close(broker).await;
            }
        }
    }

    async fn handle(
        broker: &MemoryBroker,
        credentials: Option<&Credentials>,
        session: &mut Session,
        identity: &[u8],
        request: Request,
        out_tx: &mpsc::UnboundedSender<Outbound>,
    ) -> Outcome {
        if let Request::Hello {
            credentials: offered,
        } = &request
        {
            return match credentials {
                Some(expected) if offered.as_ref() != Some(expected) => {
                    warn!("rejected client with invalid credentials");
                    Outcome::Failed("invalid credentials".into())
                }
                _ => {
                    session.authenticated = true;
                    debug!("client said hello");
                    Outcome::Done
                }
            };
        }
        if credentials.is_some() && !session.authenticated {
            return Outcome::Failed("not authenticated".into());
        }

        let name = request.name();
        let result = match request {
            Request::Hello { .. } => Ok(Outcome::Done),
            Request::DeclareExchange { exchange } => broker
                .declare_exchange(&exchange)
                .await
                .map(|_| Outcome::Done),
            Request::DeclareQueue { queue, options } => broker
                .declare_queue(&queue, options)
                .await
                .map(|_| Outcome::Done),
            Request::Bind {
                queue,
                exchange,
                pattern,
            } => broker
                .bind_queue(&queue, &exchange, &pattern)
                .await
                .map(|_| Outcome::Done),
            Request::Publish { exchange, envelope } => {
                broker.publish(&exchange, envelope).await.map(Outcome::Accepted)
            }
            Request::SendToQueue { queue, envelope } => broker
                .send_to_queue(&queue, envelope)
                .await
                .map(Outcome::Accepted),
            Request::Consume {
                consumer,
                queue,
                options,
            } => match broker.consume(&queue, options).await {
                Ok(hosted) => {
                    session.cancel(broker, consumer).await;
                    let consumer_tag = hosted.consumer_tag.clone();
                    let handle =
                        Self::spawn_forwarder(hosted, identity.to_vec(), consumer, out_tx.clone());
                    session.forwarders.insert(
                        consumer,
                        Forwarder {
                            consumer_tag,
                            handle,
                        },
                    );
                    Ok(Outcome::Done)
                }
                Err(e) => Err(e),
            },
            Request::Ack {
                consumer,
                delivery_tag,
            } => match session.unacked.remove(&(consumer, delivery_tag)) {
                Some(delivery) => delivery.ack().await.map(|_| Outcome::Done),
                None => Err(BusError::Broker(format!(
                    "unknown delivery tag {delivery_tag}"
                ))),
            },
            Request::Nack {
                consumer,
                delivery_tag,
                requeue,
            } => match session.unacked.remove(&(consumer, delivery_tag)) {
                Some(delivery) => delivery.nack(requeue).await.map(|_| Outcome::Done),
                None => Err(BusError::Broker(format!(
                    "unknown delivery tag {delivery_tag}"
                ))),
            },
            Request::Cancel { consumer } => {
                session.cancel(broker, consumer).await;
                Ok(Outcome::Done)
            }
            Request::Heartbeat | Request::Bye => Ok(Outcome::Done),
        };

        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(request = name, error = %e, "request failed");
                Outcome::Failed(e.to_string())
            }
        }
    }

    fn spawn_forwarder(
        mut hosted: Consumer,
        identity: Vec<u8>,
        consumer: u64,
        out_tx: mpsc::UnboundedSender<Outbound>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(delivery) = hosted.recv().await {
                let out = Outbound {
                    identity: identity.clone(),
                    consumer,
                    delivery,
                };
                if out_tx.send(out).is_err() {
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frame_survives_encoding() {
        let frame = ClientFrame {
            request_id: 7,
            request: Request::Publish {
                exchange: "rrremote".into(),
                envelope: Envelope::json("renderjob.status.update", &"x").unwrap(),
            },
        };
        let back: ClientFrame = decode(&encode(&frame).unwrap()).unwrap();
        assert_eq!(back.request_id, 7);
        match back.request {
            Request::Publish { exchange, envelope } => {
                assert_eq!(exchange, "rrremote");
                assert_eq!(envelope.routing_key, "renderjob.status.update");
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(decode::<ServerFrame>(b"\xc1\xc1").is_err());
    }
}
