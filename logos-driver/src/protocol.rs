//! Binary frames exchanged on the delta-stream socket.
//!
//! Every WebSocket binary frame carries exactly one bincode-encoded
//! [`StreamMessage`]:
//!
//! ```text
//! client                                   orderer
//!   │ ── ConnectDocument ───────────────────► │
//!   │ ◄────────────── ConnectDocumentSuccess ─ │   (or ConnectDocumentError)
//!   │ ── SubmitOp / SubmitSignal / Ping ────► │
//!   │ ◄──────────── Op / Nack / Signal / Pong ─ │
//! ```
//!
//! The driver never looks inside op or signal contents.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DriverError, Result};
use crate::rest::SequencedOp;

/// Protocol versions this driver speaks, most preferred first.
pub const PROTOCOL_VERSIONS: &[&str] = &["^0.4.0", "^0.3.0"];

/// Read-only clients never submit ops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionMode {
    Read,
    #[default]
    Write,
}

/// Who is connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDescriptor {
    pub mode: ConnectionMode,
    /// Whether a human is behind this client (false for bots/summarizers)
    pub interactive: bool,
    pub user_id: Option<String>,
    /// Host-defined details, opaque to the driver
    pub details: Vec<u8>,
}

impl ClientDescriptor {
    pub fn new(mode: ConnectionMode) -> Self {
        Self {
            mode,
            interactive: true,
            user_id: None,
            details: Vec::new(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn non_interactive(mut self) -> Self {
        self.interactive = false;
        self
    }
}

impl Default for ClientDescriptor {
    fn default() -> Self {
        Self::new(ConnectionMode::Write)
    }
}

/// First frame sent on a fresh socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub tenant_id: String,
    pub document_id: String,
    pub token: Option<String>,
    pub client: ClientDescriptor,
    pub versions: Vec<String>,
    /// Echoed back in logs on both sides
    pub correlation_id: Uuid,
}

impl ConnectRequest {
    pub fn new(
        tenant_id: impl Into<String>,
        document_id: impl Into<String>,
        token: Option<String>,
        client: ClientDescriptor,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            document_id: document_id.into(),
            token,
            client,
            versions: PROTOCOL_VERSIONS.iter().map(|v| v.to_string()).collect(),
            correlation_id: Uuid::new_v4(),
        }
    }
}

/// Orderer's answer to a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedDetails {
    pub client_id: String,
    /// The document already had state before this connection
    pub existing: bool,
    pub max_message_size: u64,
    pub mode: ConnectionMode,
    pub version: String,
    /// Ops sequenced between the caller's snapshot and the handshake
    pub initial_ops: Vec<SequencedOp>,
}

/// An op as submitted by a client, before sequencing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMessage {
    pub client_sequence_number: u64,
    pub reference_sequence_number: u64,
    pub op_type: String,
    pub contents: Vec<u8>,
}

/// Rejection of a submitted op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nack {
    /// Client sequence number of the rejected op, when known
    pub operation_csn: Option<u64>,
    pub sequence_number: u64,
    pub code: u16,
    pub message: String,
}

/// Top-level socket frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamMessage {
    ConnectDocument(ConnectRequest),
    ConnectDocumentSuccess(ConnectedDetails),
    ConnectDocumentError { code: u16, message: String },
    SubmitOp { client_id: String, ops: Vec<DocumentMessage> },
    Op { document_id: String, ops: Vec<SequencedOp> },
    Nack { client_id: String, nacks: Vec<Nack> },
    SubmitSignal { client_id: String, content: Vec<u8> },
    Signal { client_id: Option<String>, content: Vec<u8> },
    Ping,
    Pong,
}

impl StreamMessage {
    /// Frame name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectDocument(_) => "connect_document",
            Self::ConnectDocumentSuccess(_) => "connect_document_success",
            Self::ConnectDocumentError { .. } => "connect_document_error",
            Self::SubmitOp { .. } => "submitOp",
            Self::Op { .. } => "op",
            Self::Nack { .. } => "nack",
            Self::SubmitSignal { .. } => "submitSignal",
            Self::Signal { .. } => "signal",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| DriverError::Codec(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (msg, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| DriverError::Codec(e.to_string()))?;
        if read != bytes.len() {
            return Err(DriverError::Codec(format!(
                "{} trailing bytes after frame",
                bytes.len() - read
            )));
        }
        Ok(msg)
    }
}
