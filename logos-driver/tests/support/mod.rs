//! Shared fixtures: a local WebSocket orderer and an in-memory REST backend.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;

use logos_driver::protocol::ConnectedDetails;
use logos_driver::rest::{
    CreateDocumentRequest, CreateTreeEntry, GitTree, RestTarget, SessionResponse, SessionTokens,
    Version, WholeSummaryUpload,
};
use logos_driver::{
    AuthToken, DriverError, OrdererApi, Result, SequencedOp, StorageApi, StreamMessage,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Clone)]
enum RoomFrame {
    Broadcast(StreamMessage),
    Kick,
}

/// Minimal ordering service: one document room, sequences every submitted
/// op and broadcasts it to all connected clients.
pub struct TestOrderer {
    port: u16,
    room: broadcast::Sender<RoomFrame>,
    connections: Arc<AtomicUsize>,
}

impl TestOrderer {
    /// Bind on a free port. Handshakes carrying a token other than
    /// `required_token` are rejected.
    pub async fn start(required_token: Option<&str>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (room, _) = broadcast::channel(64);
        let connections = Arc::new(AtomicUsize::new(0));
        let sequence = Arc::new(AtomicU64::new(0));
        let required = required_token.map(str::to_string);

        let accept_room = room.clone();
        let accept_connections = connections.clone();
        tokio::spawn(async move {
            let mut next_client = 0u64;
            while let Ok((stream, addr)) = listener.accept().await {
                next_client += 1;
                log::debug!("Test orderer: connection {next_client} from {addr}");
                accept_connections.fetch_add(1, Ordering::SeqCst);
                let room = accept_room.clone();
                let sequence = sequence.clone();
                let required = required.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve(stream, next_client, room, sequence, required).await {
                        log::debug!("Test orderer connection ended: {e}");
                    }
                });
            }
        });

        Self {
            port,
            room,
            connections,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://127.0.0.1:{}/", self.port)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Close every open socket from the server side.
    pub fn kick_all(&self) {
        let _ = self.room.send(RoomFrame::Kick);
    }
}

async fn serve(
    stream: TcpStream,
    client_number: u64,
    room: broadcast::Sender<RoomFrame>,
    sequence: Arc<AtomicU64>,
    required: Option<String>,
) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let mut room_rx = room.subscribe();
    let client_id = format!("client-{client_number}");

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                let data = match msg {
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                };
                let reply = match StreamMessage::decode(&data)? {
                    StreamMessage::ConnectDocument(request) => {
                        if required.is_some() && request.token != required {
                            Some(StreamMessage::ConnectDocumentError {
                                code: 403,
                                message: "invalid token".to_string(),
                            })
                        } else {
                            Some(StreamMessage::ConnectDocumentSuccess(ConnectedDetails {
                                client_id: client_id.clone(),
                                existing: sequence.load(Ordering::SeqCst) > 0,
                                max_message_size: 16 * 1024,
                                mode: request.client.mode,
                                version: request.versions[0].clone(),
                                initial_ops: Vec::new(),
                            }))
                        }
                    }
                    StreamMessage::SubmitOp { client_id, ops } => {
                        let sequenced = ops
                            .into_iter()
                            .map(|message| SequencedOp {
                                sequence_number: sequence.fetch_add(1, Ordering::SeqCst) + 1,
                                minimum_sequence_number: 0,
                                client_id: Some(client_id.clone()),
                                client_sequence_number: message.client_sequence_number,
                                reference_sequence_number: message.reference_sequence_number,
                                op_type: message.op_type,
                                timestamp: 0,
                                contents: message.contents,
                            })
                            .collect();
                        let _ = room.send(RoomFrame::Broadcast(StreamMessage::Op {
                            document_id: "doc".to_string(),
                            ops: sequenced,
                        }));
                        None
                    }
                    StreamMessage::SubmitSignal { client_id, content } => {
                        let _ = room.send(RoomFrame::Broadcast(StreamMessage::Signal {
                            client_id: Some(client_id),
                            content,
                        }));
                        None
                    }
                    StreamMessage::Ping => Some(StreamMessage::Pong),
                    _ => None,
                };
                if let Some(reply) = reply {
                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                }
            }
            frame = room_rx.recv() => {
                match frame {
                    Ok(RoomFrame::Broadcast(message)) => {
                        ws_sender.send(Message::Binary(message.encode()?.into())).await?;
                    }
                    Ok(RoomFrame::Kick) | Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        }
    }

    let _ = ws_sender.close().await;
    Ok(())
}

/// REST backend double pointing session discovery at a [`TestOrderer`].
pub struct MemoryBackend {
    stream_url: String,
    socket_token: Option<String>,
    assigned_id: String,
    create_calls: AtomicUsize,
    session_calls: AtomicUsize,
    delta_calls: AtomicUsize,
    storage_calls: AtomicUsize,
    created: Mutex<Vec<CreateDocumentRequest>>,
}

impl MemoryBackend {
    pub fn new(stream_url: impl Into<String>) -> Self {
        Self {
            stream_url: stream_url.into(),
            socket_token: Some("socket-token".to_string()),
            assigned_id: "abc123".to_string(),
            create_calls: AtomicUsize::new(0),
            session_calls: AtomicUsize::new(0),
            delta_calls: AtomicUsize::new(0),
            storage_calls: AtomicUsize::new(0),
            created: Mutex::new(Vec::new()),
        }
    }

    /// Session token handed to the delta stream.
    pub fn with_socket_token(mut self, token: Option<&str>) -> Self {
        self.socket_token = token.map(str::to_string);
        self
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn session_calls(&self) -> usize {
        self.session_calls.load(Ordering::SeqCst)
    }

    pub fn delta_calls(&self) -> usize {
        self.delta_calls.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.create_calls() + self.session_calls() + self.delta_calls()
            + self.storage_calls.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> Vec<CreateDocumentRequest> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl OrdererApi for MemoryBackend {
    async fn create_document(
        &self,
        _target: &RestTarget,
        request: &CreateDocumentRequest,
    ) -> Result<String> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.created.lock().unwrap().push(request.clone());
        Ok(self.assigned_id.clone())
    }

    async fn locate_session(&self, target: &RestTarget) -> Result<SessionResponse> {
        self.session_calls.fetch_add(1, Ordering::SeqCst);
        let document_id = target
            .document_id
            .clone()
            .ok_or_else(|| DriverError::Api {
                status: 400,
                message: "no document id".to_string(),
            })?;
        Ok(SessionResponse {
            delta_storage_url: format!("http://deltas.local/{}/{document_id}", target.tenant_id),
            delta_stream_url: self.stream_url.clone(),
            tenant_id: target.tenant_id.clone(),
            document_id,
            tokens: SessionTokens {
                storage: None,
                socket: self.socket_token.as_deref().map(AuthToken::new),
            },
        })
    }

    async fn fetch_deltas(&self, _target: &RestTarget, from: u64, to: u64) -> Result<Vec<SequencedOp>> {
        self.delta_calls.fetch_add(1, Ordering::SeqCst);
        Ok((from..to)
            .map(|sequence_number| SequencedOp {
                sequence_number,
                minimum_sequence_number: 0,
                client_id: None,
                client_sequence_number: 0,
                reference_sequence_number: 0,
                op_type: "op".to_string(),
                timestamp: 0,
                contents: Vec::new(),
            })
            .collect())
    }
}

#[async_trait]
impl StorageApi for MemoryBackend {
    async fn get_versions(&self, _target: &RestTarget, _count: u32) -> Result<Vec<Version>> {
        self.storage_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }

    async fn get_tree(&self, _target: &RestTarget, tree_id: &str) -> Result<GitTree> {
        self.storage_calls.fetch_add(1, Ordering::SeqCst);
        Ok(GitTree {
            sha: tree_id.to_string(),
            tree: Vec::new(),
        })
    }

    async fn read_blob(&self, _target: &RestTarget, blob_id: &str) -> Result<Vec<u8>> {
        self.storage_calls.fetch_add(1, Ordering::SeqCst);
        Err(DriverError::Api {
            status: 404,
            message: format!("no blob {blob_id}"),
        })
    }

    async fn create_blob(&self, _target: &RestTarget, _content: &[u8]) -> Result<String> {
        self.storage_calls.fetch_add(1, Ordering::SeqCst);
        Ok("blob".to_string())
    }

    async fn create_tree(&self, _target: &RestTarget, _entries: &[CreateTreeEntry]) -> Result<String> {
        self.storage_calls.fetch_add(1, Ordering::SeqCst);
        Ok("tree".to_string())
    }

    async fn upload_summary(&self, _target: &RestTarget, upload: &WholeSummaryUpload) -> Result<String> {
        self.storage_calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("summary-{}", upload.sequence_number))
    }
}
