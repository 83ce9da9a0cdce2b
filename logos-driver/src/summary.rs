//! Summary trees and the creation summary.
//!
//! A new document is created from a summary tree with two subtrees:
//!
//! ```text
//! (root)
//! ├── .protocol
//! │   ├── attributes     JSON {"sequenceNumber", "minimumSequenceNumber"}
//! │   └── quorumValues   JSON [[key, value], ...]
//! └── .app               application state, opaque to the driver
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{DriverError, Result};

pub const PROTOCOL_TREE: &str = ".protocol";
pub const APP_TREE: &str = ".app";
pub const ATTRIBUTES_BLOB: &str = "attributes";
pub const QUORUM_VALUES_BLOB: &str = "quorumValues";

/// Blob payload: text or raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BlobContent {
    Text(String),
    Binary(Vec<u8>),
}

impl BlobContent {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }
}

/// One node of a summary tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SummaryObject {
    Tree(SummaryTree),
    Blob { content: BlobContent },
    /// Reference to an object already stored by the backend.
    Handle { handle: String },
}

/// A directory of named summary objects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryTree {
    #[serde(default)]
    pub tree: BTreeMap<String, SummaryObject>,
}

impl SummaryTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tree(mut self, name: impl Into<String>, tree: SummaryTree) -> Self {
        self.tree.insert(name.into(), SummaryObject::Tree(tree));
        self
    }

    pub fn with_blob(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.tree.insert(
            name.into(),
            SummaryObject::Blob {
                content: BlobContent::Text(content.into()),
            },
        );
        self
    }

    pub fn with_binary_blob(mut self, name: impl Into<String>, content: Vec<u8>) -> Self {
        self.tree.insert(
            name.into(),
            SummaryObject::Blob {
                content: BlobContent::Binary(content),
            },
        );
        self
    }

    pub fn with_handle(mut self, name: impl Into<String>, handle: impl Into<String>) -> Self {
        self.tree.insert(
            name.into(),
            SummaryObject::Handle {
                handle: handle.into(),
            },
        );
        self
    }

    pub fn subtree(&self, name: &str) -> Option<&SummaryTree> {
        match self.tree.get(name) {
            Some(SummaryObject::Tree(tree)) => Some(tree),
            _ => None,
        }
    }

    pub fn blob(&self, name: &str) -> Option<&BlobContent> {
        match self.tree.get(name) {
            Some(SummaryObject::Blob { content }) => Some(content),
            _ => None,
        }
    }

    /// Total number of blobs in this tree and all subtrees.
    pub fn blob_count(&self) -> usize {
        self.tree
            .values()
            .map(|object| match object {
                SummaryObject::Tree(tree) => tree.blob_count(),
                SummaryObject::Blob { .. } => 1,
                SummaryObject::Handle { .. } => 0,
            })
            .sum()
    }

    /// Build the root tree for a new document.
    pub fn for_creation(
        attributes: &DocumentAttributes,
        quorum_values: &[QuorumValue],
        app: SummaryTree,
    ) -> Result<Self> {
        let attributes = serde_json::to_string(attributes)
            .map_err(|e| DriverError::Codec(e.to_string()))?;
        let quorum = serde_json::to_string(quorum_values)
            .map_err(|e| DriverError::Codec(e.to_string()))?;
        let protocol = SummaryTree::new()
            .with_blob(ATTRIBUTES_BLOB, attributes)
            .with_blob(QUORUM_VALUES_BLOB, quorum);
        Ok(SummaryTree::new()
            .with_tree(PROTOCOL_TREE, protocol)
            .with_tree(APP_TREE, app))
    }
}

/// Document attributes recorded in the protocol subtree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentAttributes {
    pub sequence_number: u64,
    #[serde(default)]
    pub minimum_sequence_number: u64,
}

/// One agreed-upon quorum entry: `(key, value)`.
pub type QuorumValue = (String, serde_json::Value);

/// Validated view of a creation summary.
#[derive(Debug, Clone, PartialEq)]
pub struct CreationSummary {
    pub attributes: DocumentAttributes,
    pub quorum_values: Vec<QuorumValue>,
    pub app: SummaryTree,
}

impl CreationSummary {
    /// Split a root summary into its protocol facts and app subtree.
    ///
    /// A missing subtree is a configuration error; malformed blobs are
    /// parse errors. A missing quorum blob means an empty quorum.
    pub fn from_tree(root: &SummaryTree) -> Result<Self> {
        let protocol = root.subtree(PROTOCOL_TREE).ok_or_else(|| {
            DriverError::Configuration(format!("missing summary: no {PROTOCOL_TREE} subtree"))
        })?;
        let app = root.subtree(APP_TREE).ok_or_else(|| {
            DriverError::Configuration(format!("missing summary: no {APP_TREE} subtree"))
        })?;

        let attributes = protocol.blob(ATTRIBUTES_BLOB).ok_or_else(|| {
            DriverError::Parse(format!("{PROTOCOL_TREE} has no {ATTRIBUTES_BLOB} blob"))
        })?;
        let attributes: DocumentAttributes = serde_json::from_slice(attributes.as_bytes())
            .map_err(|e| DriverError::Parse(format!("{ATTRIBUTES_BLOB}: {e}")))?;

        let quorum_values = match protocol.blob(QUORUM_VALUES_BLOB) {
            Some(blob) => serde_json::from_slice(blob.as_bytes())
                .map_err(|e| DriverError::Parse(format!("{QUORUM_VALUES_BLOB}: {e}")))?,
            None => Vec::new(),
        };

        Ok(Self {
            attributes,
            quorum_values,
            app: app.clone(),
        })
    }
}
