//! Summary storage for one document.
//!
//! Every call goes through the storage limiter and carries a storage token
//! fetched from the token provider. Summaries upload either as one
//! whole-summary request or tree by tree, depending on
//! `enable_whole_summary_upload`.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::{try_join_all, BoxFuture};
use futures_util::FutureExt;

use crate::error::{DriverError, Result};
use crate::locator::{DocumentLocator, EndpointKind};
use crate::policies::DriverPolicies;
use crate::rate_limiter::RateLimiter;
use crate::rest::{CreateTreeEntry, GitTree, RestTarget, StorageApi, Version, WholeSummaryUpload};
use crate::summary::{SummaryObject, SummaryTree};
use crate::token::TokenProvider;

const BLOB_MODE: &str = "100644";
const TREE_MODE: &str = "040000";

/// A stored snapshot, rebuilt from the backend's flat tree listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotTree {
    pub id: Option<String>,
    /// Blob name to blob id
    pub blobs: BTreeMap<String, String>,
    pub trees: BTreeMap<String, SnapshotTree>,
}

impl SnapshotTree {
    /// Fold a recursive listing (`a/b/c` paths) into nested trees.
    pub fn from_git_tree(listing: &GitTree) -> Self {
        let mut root = SnapshotTree {
            id: Some(listing.sha.clone()),
            ..Default::default()
        };
        for entry in &listing.tree {
            let mut parts: Vec<&str> = entry.path.split('/').filter(|p| !p.is_empty()).collect();
            let Some(name) = parts.pop() else { continue };
            let parent = parts.into_iter().fold(&mut root, |node, part| {
                node.trees.entry(part.to_string()).or_default()
            });
            match entry.entry_type.as_str() {
                "tree" => {
                    parent.trees.entry(name.to_string()).or_default().id = Some(entry.sha.clone());
                }
                "blob" => {
                    parent.blobs.insert(name.to_string(), entry.sha.clone());
                }
                other => log::trace!("Skipping {other} entry {}", entry.path),
            }
        }
        root
    }

    pub fn subtree(&self, path: &str) -> Option<&SnapshotTree> {
        path.split('/')
            .filter(|p| !p.is_empty())
            .try_fold(self, |node, part| node.trees.get(part))
    }
}

/// Storage access for one document.
pub struct DocumentStorageService {
    locator: Arc<DocumentLocator>,
    api: Arc<dyn StorageApi>,
    limiter: Arc<RateLimiter>,
    tokens: Arc<dyn TokenProvider>,
    policies: Arc<DriverPolicies>,
}

impl DocumentStorageService {
    pub fn new(
        locator: Arc<DocumentLocator>,
        api: Arc<dyn StorageApi>,
        limiter: Arc<RateLimiter>,
        tokens: Arc<dyn TokenProvider>,
        policies: Arc<DriverPolicies>,
    ) -> Self {
        Self {
            locator,
            api,
            limiter,
            tokens,
            policies,
        }
    }

    async fn target(&self) -> Result<RestTarget> {
        let base = self.locator.require(EndpointKind::Storage)?.clone();
        let tenant_id = self.locator.tenant_id();
        let document_id = self.locator.require_document_id()?;
        let token = self
            .tokens
            .storage_token(tenant_id, Some(document_id))
            .await?;
        Ok(RestTarget::new(base, tenant_id)
            .with_document_id(document_id)
            .with_token(token))
    }

    /// Most recent versions first, at most `count`.
    pub async fn get_versions(&self, count: u32) -> Result<Vec<Version>> {
        let target = self.target().await?;
        self.limiter
            .schedule(self.api.get_versions(&target, count))
            .await
    }

    /// Snapshot tree of `version`, or of the latest version when `None`.
    ///
    /// `Ok(None)` when the document has no stored versions.
    pub async fn get_snapshot_tree(&self, version: Option<&Version>) -> Result<Option<SnapshotTree>> {
        let target = self.target().await?;
        let tree_id = match version {
            Some(version) => version.tree_id.clone(),
            None => {
                let latest = self
                    .limiter
                    .schedule(self.api.get_versions(&target, 1))
                    .await?;
                match latest.into_iter().next() {
                    Some(version) => version.tree_id,
                    None => return Ok(None),
                }
            }
        };
        let listing = self
            .limiter
            .schedule(self.api.get_tree(&target, &tree_id))
            .await?;
        Ok(Some(SnapshotTree::from_git_tree(&listing)))
    }

    pub async fn read_blob(&self, blob_id: &str) -> Result<Vec<u8>> {
        let target = self.target().await?;
        self.limiter
            .schedule(self.api.read_blob(&target, blob_id))
            .await
    }

    /// Store an attachment blob and return its id.
    pub async fn create_blob(&self, content: &[u8]) -> Result<String> {
        let target = self.target().await?;
        self.limiter
            .schedule(self.api.create_blob(&target, content))
            .await
    }

    /// Upload a summary and return the handle of its root.
    pub async fn upload_summary(&self, summary: &SummaryTree, sequence_number: u64) -> Result<String> {
        let target = self.target().await?;
        if self.policies.enable_whole_summary_upload {
            let upload = WholeSummaryUpload {
                summary_type: "container".to_string(),
                message: format!("Summary @{sequence_number}"),
                sequence_number,
                tree: summary.clone(),
            };
            log::debug!(
                "Uploading whole summary @{sequence_number} ({} blobs)",
                summary.blob_count()
            );
            return self
                .limiter
                .schedule(self.api.upload_summary(&target, &upload))
                .await;
        }

        log::debug!(
            "Uploading summary @{sequence_number} tree by tree ({} blobs)",
            summary.blob_count()
        );
        self.write_tree(&target, summary).await
    }

    /// Branching is not offered by this backend.
    pub fn create_branch(&self, _name: &str) -> Result<String> {
        Err(DriverError::UnsupportedOperation("create_branch"))
    }

    fn write_tree<'a>(
        &'a self,
        target: &'a RestTarget,
        tree: &'a SummaryTree,
    ) -> BoxFuture<'a, Result<String>> {
        async move {
            let entries = try_join_all(tree.tree.iter().map(|(name, object)| async move {
                let (sha, mode, entry_type) = match object {
                    SummaryObject::Tree(subtree) => {
                        (self.write_tree(target, subtree).await?, TREE_MODE, "tree")
                    }
                    SummaryObject::Blob { content } => {
                        let sha = self
                            .limiter
                            .schedule(self.api.create_blob(target, content.as_bytes()))
                            .await?;
                        (sha, BLOB_MODE, "blob")
                    }
                    // handles point at subtrees of the previous summary
                    SummaryObject::Handle { handle } => (handle.clone(), TREE_MODE, "tree"),
                };
                Ok::<_, DriverError>(CreateTreeEntry {
                    path: name.clone(),
                    mode: mode.to_string(),
                    sha,
                    entry_type: entry_type.to_string(),
                })
            }))
            .await?;

            self.limiter
                .schedule(self.api.create_tree(target, &entries))
                .await
        }
        .boxed()
    }
}

impl std::fmt::Debug for DocumentStorageService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStorageService")
            .field("storage_url", &self.locator.endpoint(EndpointKind::Storage))
            .field("whole_summary_upload", &self.policies.enable_whole_summary_upload)
            .finish()
    }
}
