//! Realtime delta stream.
//!
//! ```text
//!   Idle ──connect──► Connecting ──handshake ok──► Connected
//!                        │                            │
//!                        └──error──► Disconnected ◄───┘ socket closed
//!                                        │
//!                                        └──connect (Reconnect)──► Connecting
//! ```
//!
//! The first connect uses whatever endpoints discovery has cached. Every
//! later connect invalidates the discovery cache before reading it, so a
//! reconnect never reuses the socket URL or session token that just failed.
//! The connector never retries on its own.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use crate::discovery::EndpointDiscovery;
use crate::error::{DriverError, Result};
use crate::policies::DriverPolicies;
use crate::protocol::{
    ClientDescriptor, ConnectRequest, ConnectedDetails, ConnectionMode, DocumentMessage, Nack,
    StreamMessage,
};
use crate::rest::SequencedOp;
use crate::token::TokenProvider;
use crate::transport::{SocketChannel, SocketTransport, CHANNEL_CAPACITY};

/// Connector state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

/// Which transition into `Connecting` is being taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectAttempt {
    First,
    /// Discovery is invalidated before endpoints are read.
    Reconnect,
}

/// Events delivered to the owner of a [`DeltaConnection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaStreamEvent {
    Op(Vec<SequencedOp>),
    Nack(Vec<Nack>),
    Signal {
        client_id: Option<String>,
        content: Vec<u8>,
    },
    /// Always the last event of a connection.
    Disconnected { reason: String },
}

/// State tagged with the connect generation that set it.
#[derive(Debug, Clone, Copy)]
struct Tracked {
    epoch: u64,
    state: ConnectionState,
}

/// Opens delta-stream connections for one document service.
///
/// Created once per document service so the "has attempted" flag spans
/// every reconnect.
pub struct DeltaStreamConnector {
    discovery: Arc<EndpointDiscovery>,
    transport: Arc<dyn SocketTransport>,
    tokens: Arc<dyn TokenProvider>,
    policies: Arc<DriverPolicies>,
    attempted: AtomicBool,
    state: Arc<RwLock<Tracked>>,
}

impl DeltaStreamConnector {
    pub fn new(
        discovery: Arc<EndpointDiscovery>,
        transport: Arc<dyn SocketTransport>,
        tokens: Arc<dyn TokenProvider>,
        policies: Arc<DriverPolicies>,
    ) -> Self {
        Self {
            discovery,
            transport,
            tokens,
            policies,
            attempted: AtomicBool::new(false),
            state: Arc::new(RwLock::new(Tracked {
                epoch: 0,
                state: ConnectionState::Idle,
            })),
        }
    }

    /// Current connector state.
    pub async fn connection_state(&self) -> ConnectionState {
        self.state.read().await.state
    }

    /// Whether any connect has been attempted yet.
    pub fn has_attempted(&self) -> bool {
        self.attempted.load(Ordering::SeqCst)
    }

    /// Open a new connection to the document's delta stream.
    pub async fn connect(&self, client: ClientDescriptor) -> Result<DeltaConnection> {
        let attempt = if self.attempted.swap(true, Ordering::SeqCst) {
            ConnectAttempt::Reconnect
        } else {
            ConnectAttempt::First
        };

        let epoch = {
            let mut tracked = self.state.write().await;
            tracked.epoch += 1;
            tracked.state = ConnectionState::Connecting;
            tracked.epoch
        };

        match self.open(attempt, client, epoch).await {
            Ok(connection) => {
                set_state(&self.state, epoch, ConnectionState::Connected).await;
                log::info!(
                    "Delta stream connected as {} ({:?})",
                    connection.client_id(),
                    attempt
                );
                Ok(connection)
            }
            Err(e) => {
                set_state(&self.state, epoch, ConnectionState::Disconnected).await;
                log::warn!("Delta stream connect failed ({attempt:?}): {e}");
                Err(e)
            }
        }
    }

    async fn open(
        &self,
        attempt: ConnectAttempt,
        client: ClientDescriptor,
        epoch: u64,
    ) -> Result<DeltaConnection> {
        if attempt == ConnectAttempt::Reconnect {
            self.discovery.invalidate();
        }
        let endpoints = self.discovery.current_endpoints().await?;

        let token = match &endpoints.socket_token {
            Some(token) => Some(token.clone()),
            None => {
                self.tokens
                    .websocket_token(&endpoints.tenant_id, Some(&endpoints.document_id))
                    .await?
            }
        };
        let request = ConnectRequest::new(
            endpoints.tenant_id.clone(),
            endpoints.document_id.clone(),
            token.map(|t| t.as_str().to_string()),
            client,
        );
        let correlation_id = request.correlation_id;

        let deadline = self.policies.connect_timeout();
        let opening = async {
            let mut channel = self.transport.open(&endpoints.delta_stream_url).await?;
            let details = handshake(&mut channel, request).await?;
            Ok::<_, DriverError>((channel, details))
        };
        let (channel, details) = tokio::time::timeout(deadline, opening)
            .await
            .map_err(|_| {
                DriverError::Transport(format!(
                    "delta stream handshake timed out after {}ms ({correlation_id})",
                    deadline.as_millis()
                ))
            })??;

        Ok(DeltaConnection::spawn(
            channel,
            details,
            endpoints.document_id.clone(),
            self.state.clone(),
            epoch,
        ))
    }
}

impl std::fmt::Debug for DeltaStreamConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaStreamConnector")
            .field("attempted", &self.has_attempted())
            .field("discovery", &self.discovery)
            .finish()
    }
}

async fn set_state(state: &RwLock<Tracked>, epoch: u64, next: ConnectionState) {
    let mut tracked = state.write().await;
    if tracked.epoch == epoch {
        tracked.state = next;
    }
}

async fn handshake(channel: &mut SocketChannel, request: ConnectRequest) -> Result<ConnectedDetails> {
    channel
        .outgoing
        .send(StreamMessage::ConnectDocument(request))
        .await
        .map_err(|_| DriverError::Transport("socket closed before handshake".to_string()))?;

    loop {
        match channel.incoming.recv().await {
            Some(Ok(StreamMessage::ConnectDocumentSuccess(details))) => return Ok(details),
            Some(Ok(StreamMessage::ConnectDocumentError { code, message })) => {
                return Err(DriverError::Protocol(format!(
                    "connect_document rejected ({code}): {message}"
                )))
            }
            Some(Ok(other)) => {
                log::debug!("Ignoring {} frame during handshake", other.kind());
            }
            Some(Err(e)) => return Err(DriverError::Protocol(format!("handshake: {e}"))),
            None => {
                return Err(DriverError::Transport(
                    "socket closed during handshake".to_string(),
                ))
            }
        }
    }
}

/// A live delta-stream connection.
///
/// Dropping the connection (or calling [`close`](Self::close)) closes the
/// socket.
#[derive(Debug)]
pub struct DeltaConnection {
    details: ConnectedDetails,
    document_id: String,
    outgoing: Option<mpsc::Sender<StreamMessage>>,
    event_rx: Option<mpsc::Receiver<DeltaStreamEvent>>,
    events_taken: Arc<AtomicBool>,
    dropped_events: Arc<AtomicU64>,
    open: Arc<AtomicBool>,
}

impl DeltaConnection {
    fn spawn(
        channel: SocketChannel,
        details: ConnectedDetails,
        document_id: String,
        state: Arc<RwLock<Tracked>>,
        epoch: u64,
    ) -> Self {
        let SocketChannel {
            outgoing,
            mut incoming,
        } = channel;
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let open = Arc::new(AtomicBool::new(true));
        let events_taken = Arc::new(AtomicBool::new(false));
        let dropped_events = Arc::new(AtomicU64::new(0));

        let pump_open = open.clone();
        let pump_taken = events_taken.clone();
        let pump_dropped = dropped_events.clone();
        let client_id = details.client_id.clone();
        tokio::spawn(async move {
            let mut reason = "socket closed".to_string();
            while let Some(frame) = incoming.recv().await {
                let event = match frame {
                    Ok(StreamMessage::Op { ops, .. }) => DeltaStreamEvent::Op(ops),
                    Ok(StreamMessage::Nack {
                        client_id: target,
                        nacks,
                    }) => {
                        if target != client_id {
                            continue;
                        }
                        DeltaStreamEvent::Nack(nacks)
                    }
                    Ok(StreamMessage::Signal { client_id, content }) => {
                        DeltaStreamEvent::Signal { client_id, content }
                    }
                    Ok(StreamMessage::Pong) => {
                        log::trace!("pong");
                        continue;
                    }
                    Ok(other) => {
                        log::debug!("Ignoring unexpected {} frame", other.kind());
                        continue;
                    }
                    Err(e) => {
                        reason = format!("undecodable frame: {e}");
                        break;
                    }
                };
                if pump_taken.load(Ordering::SeqCst) {
                    // receiver dropped: keep draining so the socket is noticed closing
                    let _ = event_tx.send(event).await;
                } else if event_tx.capacity() > 1 {
                    let _ = event_tx.try_send(event);
                } else {
                    // nobody is reading; the last slot is kept for Disconnected
                    if pump_dropped.fetch_add(1, Ordering::Relaxed) == 0 {
                        log::warn!("Delta stream events for {client_id} are not consumed; dropping");
                    }
                }
            }

            pump_open.store(false, Ordering::SeqCst);
            set_state(&state, epoch, ConnectionState::Disconnected).await;
            log::info!("Delta stream for {client_id} disconnected: {reason}");
            let closing = DeltaStreamEvent::Disconnected { reason };
            if pump_taken.load(Ordering::SeqCst) {
                let _ = event_tx.send(closing).await;
            } else {
                let _ = event_tx.try_send(closing);
            }
        });

        Self {
            details,
            document_id,
            outgoing: Some(outgoing),
            event_rx: Some(event_rx),
            events_taken,
            dropped_events,
            open,
        }
    }

    /// Id the orderer assigned to this client.
    pub fn client_id(&self) -> &str {
        &self.details.client_id
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Whether the document had state before this connection.
    pub fn existing(&self) -> bool {
        self.details.existing
    }

    pub fn mode(&self) -> ConnectionMode {
        self.details.mode
    }

    pub fn max_message_size(&self) -> u64 {
        self.details.max_message_size
    }

    /// Ops the orderer sent with the handshake.
    pub fn initial_ops(&self) -> &[SequencedOp] {
        &self.details.initial_ops
    }

    /// Take the event receiver (can only be called once).
    ///
    /// Until it is taken, events are buffered up to the channel capacity and
    /// then dropped, so an unread connection never stalls the socket.
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<DeltaStreamEvent>> {
        let rx = self.event_rx.take();
        if rx.is_some() {
            self.events_taken.store(true, Ordering::SeqCst);
        }
        rx
    }

    /// Events discarded because no receiver had been taken.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Whether the socket is still up.
    pub fn is_connected(&self) -> bool {
        self.outgoing.is_some() && self.open.load(Ordering::SeqCst)
    }

    /// Submit ops for sequencing.
    pub async fn submit(&self, ops: Vec<DocumentMessage>) -> Result<()> {
        if self.details.mode == ConnectionMode::Read {
            return Err(DriverError::UnsupportedOperation(
                "submit on a read-only connection",
            ));
        }
        self.send(StreamMessage::SubmitOp {
            client_id: self.details.client_id.clone(),
            ops,
        })
        .await
    }

    /// Broadcast a transient signal to the other clients.
    pub async fn submit_signal(&self, content: Vec<u8>) -> Result<()> {
        self.send(StreamMessage::SubmitSignal {
            client_id: self.details.client_id.clone(),
            content,
        })
        .await
    }

    /// Keep-alive probe; the answer is consumed internally.
    pub async fn ping(&self) -> Result<()> {
        self.send(StreamMessage::Ping).await
    }

    /// Close the socket. The event stream ends with `Disconnected`.
    pub fn close(&mut self) {
        if self.outgoing.take().is_some() {
            log::debug!("Closing delta stream for {}", self.details.client_id);
        }
    }

    async fn send(&self, frame: StreamMessage) -> Result<()> {
        let outgoing = match &self.outgoing {
            Some(tx) if self.open.load(Ordering::SeqCst) => tx,
            _ => return Err(DriverError::Transport("connection closed".to_string())),
        };
        outgoing
            .send(frame)
            .await
            .map_err(|_| DriverError::Transport("connection closed".to_string()))
    }
}
