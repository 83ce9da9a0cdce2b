//! In-memory backend and socket doubles shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use url::Url;

use crate::error::{DriverError, Result};
use crate::locator::ResolvedLocator;
use crate::protocol::{ConnectedDetails, StreamMessage};
use crate::rest::{
    CreateDocumentRequest, CreateTreeEntry, GitTree, OrdererApi, RestTarget, SequencedOp,
    SessionResponse, SessionTokens, StorageApi, Version, WholeSummaryUpload,
};
use crate::token::{AuthToken, TokenProvider};
use crate::transport::{SocketChannel, SocketTransport};

/// Locator of an existing document `t1/{document_id}` with every endpoint.
pub(crate) fn existing_locator(document_id: &str) -> ResolvedLocator {
    ResolvedLocator::new(format!("fluid://localhost/t1/{document_id}"))
        .with_tenant_id("t1")
        .with_orderer_url("https://orderer.test")
        .with_storage_url("https://storage.test")
        .with_delta_storage_url(format!("https://deltas.test/t1/{document_id}"))
}

/// Locator for a document that does not exist yet.
pub(crate) fn new_document_locator() -> ResolvedLocator {
    existing_locator("new")
}

fn op(sequence_number: u64) -> SequencedOp {
    SequencedOp {
        sequence_number,
        minimum_sequence_number: 0,
        client_id: None,
        client_sequence_number: 0,
        reference_sequence_number: sequence_number.saturating_sub(1),
        op_type: "op".to_string(),
        timestamp: 0,
        contents: Vec::new(),
    }
}

/// Counting stand-in for the orderer, storage and token issuer.
pub(crate) struct StubBackend {
    create_calls: AtomicUsize,
    create_delay_ms: AtomicU64,
    create_result: Mutex<Result<String>>,
    created_requests: Mutex<Vec<CreateDocumentRequest>>,
    creates: InFlight,
    session_calls: AtomicUsize,
    sessions: InFlight,
    session_delay_ms: AtomicU64,
    failing_sessions: AtomicUsize,
    delta_requests: Mutex<Vec<(u64, u64)>>,
    delta_delay_ms: AtomicU64,
    delta_shift: AtomicU64,
    delta_head: AtomicU64,
    last_delta_token: Mutex<Option<String>>,
    storage_calls: AtomicUsize,
    last_storage_token: Mutex<Option<String>>,
    versions: Mutex<Vec<Version>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    trees: Mutex<Vec<Vec<CreateTreeEntry>>>,
    websocket_tokens: AtomicUsize,
}

impl StubBackend {
    pub(crate) fn new() -> Self {
        Self {
            create_calls: AtomicUsize::new(0),
            create_delay_ms: AtomicU64::new(0),
            create_result: Mutex::new(Ok("abc123".to_string())),
            created_requests: Mutex::new(Vec::new()),
            creates: InFlight::default(),
            session_calls: AtomicUsize::new(0),
            sessions: InFlight::default(),
            session_delay_ms: AtomicU64::new(0),
            failing_sessions: AtomicUsize::new(0),
            delta_requests: Mutex::new(Vec::new()),
            delta_delay_ms: AtomicU64::new(0),
            delta_shift: AtomicU64::new(0),
            delta_head: AtomicU64::new(u64::MAX),
            last_delta_token: Mutex::new(None),
            storage_calls: AtomicUsize::new(0),
            last_storage_token: Mutex::new(None),
            versions: Mutex::new(vec![Version {
                id: "commit-1".to_string(),
                tree_id: "tree-1".to_string(),
                date: None,
            }]),
            blobs: Mutex::new(HashMap::new()),
            trees: Mutex::new(Vec::new()),
            websocket_tokens: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set_create_result(&self, result: Result<String>) {
        *self.create_result.lock().unwrap() = result;
    }

    pub(crate) fn set_create_delay_ms(&self, ms: u64) {
        self.create_delay_ms.store(ms, Ordering::SeqCst);
    }

    pub(crate) fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn created_requests(&self) -> Vec<CreateDocumentRequest> {
        self.created_requests.lock().unwrap().clone()
    }

    /// Most create calls ever running at the same time.
    pub(crate) fn peak_concurrent_creates(&self) -> usize {
        self.creates.peak()
    }

    pub(crate) fn set_session_delay_ms(&self, ms: u64) {
        self.session_delay_ms.store(ms, Ordering::SeqCst);
    }

    pub(crate) fn fail_next_sessions(&self, n: usize) {
        self.failing_sessions.store(n, Ordering::SeqCst);
    }

    pub(crate) fn session_calls(&self) -> usize {
        self.session_calls.load(Ordering::SeqCst)
    }

    /// Most session lookups ever running at the same time.
    pub(crate) fn peak_concurrent_sessions(&self) -> usize {
        self.sessions.peak()
    }

    pub(crate) fn set_delta_delay_ms(&self, ms: u64) {
        self.delta_delay_ms.store(ms, Ordering::SeqCst);
    }

    /// Answer every delta request with ops shifted past the asked span.
    pub(crate) fn shift_deltas_by(&self, shift: u64) {
        self.delta_shift.store(shift, Ordering::SeqCst);
    }

    /// Highest sequence number (exclusive) the stub has ops for.
    pub(crate) fn set_delta_head(&self, head: u64) {
        self.delta_head.store(head, Ordering::SeqCst);
    }

    pub(crate) fn delta_requests(&self) -> Vec<(u64, u64)> {
        self.delta_requests.lock().unwrap().clone()
    }

    pub(crate) fn last_delta_token(&self) -> Option<String> {
        self.last_delta_token.lock().unwrap().clone()
    }

    pub(crate) fn storage_calls(&self) -> usize {
        self.storage_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn last_storage_token(&self) -> Option<String> {
        self.last_storage_token.lock().unwrap().clone()
    }

    pub(crate) fn clear_versions(&self) {
        self.versions.lock().unwrap().clear();
    }

    pub(crate) fn created_trees(&self) -> Vec<Vec<CreateTreeEntry>> {
        self.trees.lock().unwrap().clone()
    }

    pub(crate) fn websocket_token_calls(&self) -> usize {
        self.websocket_tokens.load(Ordering::SeqCst)
    }

    /// Every orderer and storage call issued so far.
    pub(crate) fn total_calls(&self) -> usize {
        self.create_calls() + self.session_calls() + self.delta_requests().len() + self.storage_calls()
    }

    fn storage_call(&self, target: &RestTarget) {
        self.storage_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_storage_token.lock().unwrap() =
            target.token.as_ref().map(|t| t.as_str().to_string());
    }
}

/// Tracks how many calls of one kind overlap.
#[derive(Default)]
struct InFlight {
    now: AtomicUsize,
    peak: AtomicUsize,
}

struct InFlightGuard<'a>(&'a InFlight);

impl InFlight {
    fn enter(&self) -> InFlightGuard<'_> {
        let now = self.now.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlightGuard(self)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.now.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn delay(ms: &AtomicU64) {
    let ms = ms.load(Ordering::SeqCst);
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

#[async_trait]
impl OrdererApi for StubBackend {
    async fn create_document(
        &self,
        _target: &RestTarget,
        request: &CreateDocumentRequest,
    ) -> Result<String> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let _running = self.creates.enter();
        self.created_requests.lock().unwrap().push(request.clone());
        delay(&self.create_delay_ms).await;
        self.create_result.lock().unwrap().clone()
    }

    async fn locate_session(&self, target: &RestTarget) -> Result<SessionResponse> {
        self.session_calls.fetch_add(1, Ordering::SeqCst);
        let _running = self.sessions.enter();
        delay(&self.session_delay_ms).await;
        let failing = self
            .failing_sessions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DriverError::Transport("stub: session unavailable".to_string()));
        }
        let document_id = target.document_id.clone().unwrap_or_default();
        Ok(SessionResponse {
            tenant_id: target.tenant_id.clone(),
            delta_storage_url: format!("https://deltas.test/{}/{document_id}", target.tenant_id),
            delta_stream_url: "wss://stream.test/socket".to_string(),
            document_id,
            tokens: SessionTokens {
                storage: Some(AuthToken::new("storage-token")),
                socket: Some(AuthToken::new("socket-token")),
            },
        })
    }

    async fn fetch_deltas(
        &self,
        target: &RestTarget,
        from: u64,
        to: u64,
    ) -> Result<Vec<SequencedOp>> {
        self.delta_requests.lock().unwrap().push((from, to));
        *self.last_delta_token.lock().unwrap() =
            target.token.as_ref().map(|t| t.as_str().to_string());
        delay(&self.delta_delay_ms).await;
        let shift = self.delta_shift.load(Ordering::SeqCst);
        let head = self.delta_head.load(Ordering::SeqCst);
        Ok((from..to.min(head)).map(|seq| op(seq + shift)).collect())
    }
}

#[async_trait]
impl StorageApi for StubBackend {
    async fn get_versions(&self, target: &RestTarget, count: u32) -> Result<Vec<Version>> {
        self.storage_call(target);
        let versions = self.versions.lock().unwrap();
        Ok(versions.iter().take(count as usize).cloned().collect())
    }

    async fn get_tree(&self, target: &RestTarget, tree_id: &str) -> Result<GitTree> {
        self.storage_call(target);
        Ok(GitTree {
            sha: tree_id.to_string(),
            tree: Vec::new(),
        })
    }

    async fn read_blob(&self, target: &RestTarget, blob_id: &str) -> Result<Vec<u8>> {
        self.storage_call(target);
        self.blobs
            .lock()
            .unwrap()
            .get(blob_id)
            .cloned()
            .ok_or_else(|| DriverError::Api {
                status: 404,
                message: format!("no blob {blob_id}"),
            })
    }

    async fn create_blob(&self, target: &RestTarget, content: &[u8]) -> Result<String> {
        self.storage_call(target);
        let mut blobs = self.blobs.lock().unwrap();
        let id = format!("blob-{}", blobs.len() + 1);
        blobs.insert(id.clone(), content.to_vec());
        Ok(id)
    }

    async fn create_tree(&self, target: &RestTarget, entries: &[CreateTreeEntry]) -> Result<String> {
        self.storage_call(target);
        let mut trees = self.trees.lock().unwrap();
        trees.push(entries.to_vec());
        Ok(format!("tree-{}", trees.len()))
    }

    async fn upload_summary(
        &self,
        target: &RestTarget,
        upload: &WholeSummaryUpload,
    ) -> Result<String> {
        self.storage_call(target);
        Ok(format!("summary-{}", upload.sequence_number))
    }
}

#[async_trait]
impl TokenProvider for StubBackend {
    async fn storage_token(
        &self,
        _tenant_id: &str,
        _document_id: Option<&str>,
    ) -> Result<Option<AuthToken>> {
        Ok(Some(AuthToken::new("storage-token")))
    }

    async fn websocket_token(
        &self,
        _tenant_id: &str,
        _document_id: Option<&str>,
    ) -> Result<Option<AuthToken>> {
        self.websocket_tokens.fetch_add(1, Ordering::SeqCst);
        Ok(Some(AuthToken::new("ws-token")))
    }
}

/// Socket double: each open spawns a fake orderer task.
pub(crate) struct StubTransport {
    opened: Mutex<Vec<String>>,
    tokens: Arc<Mutex<Vec<Option<String>>>>,
    failing_opens: AtomicUsize,
    rejected_token: Mutex<Option<String>>,
    silent: AtomicBool,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl StubTransport {
    pub(crate) fn new() -> Self {
        Self {
            opened: Mutex::new(Vec::new()),
            tokens: Arc::new(Mutex::new(Vec::new())),
            failing_opens: AtomicUsize::new(0),
            rejected_token: Mutex::new(None),
            silent: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn opened_urls(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }

    pub(crate) fn seen_tokens(&self) -> Vec<Option<String>> {
        self.tokens.lock().unwrap().clone()
    }

    pub(crate) fn fail_next_opens(&self, n: usize) {
        self.failing_opens.store(n, Ordering::SeqCst);
    }

    pub(crate) fn reject_token(&self, token: &str) {
        *self.rejected_token.lock().unwrap() = Some(token.to_string());
    }

    /// Never answer the handshake.
    pub(crate) fn go_silent(&self) {
        self.silent.store(true, Ordering::SeqCst);
    }

    pub(crate) fn sever_all(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    pub(crate) fn sever_first(&self) {
        if let Some(task) = self.tasks.lock().unwrap().first() {
            task.abort();
        }
    }
}

#[async_trait]
impl SocketTransport for StubTransport {
    async fn open(&self, url: &Url) -> Result<SocketChannel> {
        let failing = self
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DriverError::Transport("stub: connection refused".to_string()));
        }
        self.opened.lock().unwrap().push(url.to_string());

        let (out_tx, mut out_rx) = mpsc::channel::<StreamMessage>(16);
        let (in_tx, in_rx) = mpsc::channel::<Result<StreamMessage>>(16);
        let rejected = self.rejected_token.lock().unwrap().clone();
        let silent = self.silent.load(Ordering::SeqCst);
        let connection_number = self.opened.lock().unwrap().len();

        let tokens = self.tokens.clone();
        let task = tokio::spawn(async move {
            let client_id = format!("client-{connection_number}");
            let mut sequence_number = 0;
            while let Some(frame) = out_rx.recv().await {
                let reply = match frame {
                    StreamMessage::ConnectDocument(request) => {
                        tokens.lock().unwrap().push(request.token.clone());
                        if silent {
                            continue;
                        }
                        if request.token.is_some() && request.token == rejected {
                            StreamMessage::ConnectDocumentError {
                                code: 403,
                                message: "token rejected".to_string(),
                            }
                        } else {
                            StreamMessage::ConnectDocumentSuccess(ConnectedDetails {
                                client_id: client_id.clone(),
                                existing: true,
                                max_message_size: 16 * 1024,
                                mode: request.client.mode,
                                version: request.versions[0].clone(),
                                initial_ops: Vec::new(),
                            })
                        }
                    }
                    StreamMessage::SubmitOp { client_id, ops } => StreamMessage::Op {
                        document_id: "doc".to_string(),
                        ops: ops
                            .into_iter()
                            .map(|message| {
                                sequence_number += 1;
                                SequencedOp {
                                    sequence_number,
                                    minimum_sequence_number: 0,
                                    client_id: Some(client_id.clone()),
                                    client_sequence_number: message.client_sequence_number,
                                    reference_sequence_number: message.reference_sequence_number,
                                    op_type: message.op_type,
                                    timestamp: 0,
                                    contents: message.contents,
                                }
                            })
                            .collect(),
                    },
                    StreamMessage::SubmitSignal { client_id, content } => StreamMessage::Signal {
                        client_id: Some(client_id),
                        content,
                    },
                    StreamMessage::Ping => StreamMessage::Pong,
                    _ => continue,
                };
                if in_tx.send(Ok(reply)).await.is_err() {
                    break;
                }
            }
        });
        self.tasks.lock().unwrap().push(task.abort_handle());

        Ok(SocketChannel {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}
