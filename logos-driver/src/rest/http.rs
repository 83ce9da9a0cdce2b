//! reqwest-backed implementation of the backend REST traits.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::header::ACCEPT;
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use super::{
    CreateDocumentRequest, CreateDocumentResponse, CreateTreeEntry, GitTree, OrdererApi,
    RestTarget, SequencedOp, SessionResponse, StorageApi, Version, WholeSummaryUpload,
};
use crate::error::{DriverError, Result};
use crate::policies::DriverPolicies;
use crate::token::AuthToken;

/// HTTP client for orderer and storage endpoints.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct GitCommitRef {
    sha: String,
}

#[derive(Deserialize)]
struct GitAuthor {
    #[serde(default)]
    date: Option<String>,
}

#[derive(Deserialize)]
struct GitCommitDetails {
    tree: GitCommitRef,
    #[serde(default)]
    author: Option<GitAuthor>,
}

#[derive(Deserialize)]
struct GitCommit {
    sha: String,
    commit: GitCommitDetails,
}

#[derive(Deserialize)]
struct BlobResponse {
    content: String,
    encoding: String,
}

#[derive(Serialize)]
struct CreateBlobRequest {
    content: String,
    encoding: &'static str,
}

#[derive(Serialize)]
struct CreateTreeRequest<'a> {
    tree: &'a [CreateTreeEntry],
}

#[derive(Deserialize)]
struct ShaResponse {
    sha: String,
}

#[derive(Deserialize)]
struct IdResponse {
    id: String,
}

impl HttpBackend {
    /// Build a client honouring the request timeout policy.
    pub fn new(policies: &DriverPolicies) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("logos-driver/", env!("CARGO_PKG_VERSION")));
        if let Some(timeout) = policies.request_timeout() {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| DriverError::Configuration(format!("http client: {e}")))?;
        Ok(Self { client })
    }

    /// Wrap an existing client (shared connection pool, custom TLS).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn request(&self, method: Method, url: Url, token: Option<&AuthToken>) -> RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header(ACCEPT, "application/json");
        match token {
            Some(token) => builder.bearer_auth(token.as_str()),
            None => builder,
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = if body.is_empty() {
                status.canonical_reason().unwrap_or("request failed").to_string()
            } else {
                body
            };
            return Err(DriverError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json::<T>().await?)
    }

    fn repo_url(target: &RestTarget, rest: &[&str]) -> Result<Url> {
        let mut segments = vec!["repos", target.tenant_id.as_str()];
        segments.extend_from_slice(rest);
        endpoint_url(&target.base_url, &segments)
    }
}

#[async_trait]
impl OrdererApi for HttpBackend {
    async fn create_document(
        &self,
        target: &RestTarget,
        request: &CreateDocumentRequest,
    ) -> Result<String> {
        let url = endpoint_url(&target.base_url, &["documents", target.tenant_id.as_str()])?;
        log::debug!("POST {url} (id: {:?})", request.id);
        let response: CreateDocumentResponse = self
            .send(self.request(Method::POST, url, target.token.as_ref()).json(request))
            .await?;
        Ok(response.into_document_id())
    }

    async fn locate_session(&self, target: &RestTarget) -> Result<SessionResponse> {
        let document_id = target.document_id.as_deref().ok_or_else(|| {
            DriverError::Configuration("session discovery needs a document id".to_string())
        })?;
        let url = endpoint_url(
            &target.base_url,
            &["documents", target.tenant_id.as_str(), "session", document_id],
        )?;
        log::debug!("GET {url}");
        self.send(self.request(Method::GET, url, target.token.as_ref()))
            .await
    }

    async fn fetch_deltas(
        &self,
        target: &RestTarget,
        from: u64,
        to: u64,
    ) -> Result<Vec<SequencedOp>> {
        let mut url = target.base_url.clone();
        url.query_pairs_mut()
            .append_pair("from", &from.to_string())
            .append_pair("to", &to.to_string());
        log::trace!("GET {url}");
        self.send(self.request(Method::GET, url, target.token.as_ref()))
            .await
    }
}

#[async_trait]
impl StorageApi for HttpBackend {
    async fn get_versions(&self, target: &RestTarget, count: u32) -> Result<Vec<Version>> {
        let document_id = target.document_id.as_deref().ok_or_else(|| {
            DriverError::Configuration("version listing needs a document id".to_string())
        })?;
        let mut url = Self::repo_url(target, &["commits"])?;
        url.query_pairs_mut()
            .append_pair("sha", document_id)
            .append_pair("count", &count.to_string());
        let commits: Vec<GitCommit> = self
            .send(self.request(Method::GET, url, target.token.as_ref()))
            .await?;
        Ok(commits
            .into_iter()
            .map(|c| Version {
                id: c.sha,
                tree_id: c.commit.tree.sha,
                date: c.commit.author.and_then(|a| a.date),
            })
            .collect())
    }

    async fn get_tree(&self, target: &RestTarget, tree_id: &str) -> Result<GitTree> {
        let mut url = Self::repo_url(target, &["git", "trees", tree_id])?;
        url.query_pairs_mut().append_pair("recursive", "1");
        self.send(self.request(Method::GET, url, target.token.as_ref()))
            .await
    }

    async fn read_blob(&self, target: &RestTarget, blob_id: &str) -> Result<Vec<u8>> {
        let url = Self::repo_url(target, &["git", "blobs", blob_id])?;
        let blob: BlobResponse = self
            .send(self.request(Method::GET, url, target.token.as_ref()))
            .await?;
        decode_blob(&blob.content, &blob.encoding)
    }

    async fn create_blob(&self, target: &RestTarget, content: &[u8]) -> Result<String> {
        let url = Self::repo_url(target, &["git", "blobs"])?;
        let body = CreateBlobRequest {
            content: BASE64.encode(content),
            encoding: "base64",
        };
        let created: ShaResponse = self
            .send(self.request(Method::POST, url, target.token.as_ref()).json(&body))
            .await?;
        Ok(created.sha)
    }

    async fn create_tree(
        &self,
        target: &RestTarget,
        entries: &[CreateTreeEntry],
    ) -> Result<String> {
        let url = Self::repo_url(target, &["git", "trees"])?;
        let created: ShaResponse = self
            .send(
                self.request(Method::POST, url, target.token.as_ref())
                    .json(&CreateTreeRequest { tree: entries }),
            )
            .await?;
        Ok(created.sha)
    }

    async fn upload_summary(
        &self,
        target: &RestTarget,
        upload: &WholeSummaryUpload,
    ) -> Result<String> {
        let url = Self::repo_url(target, &["git", "summaries"])?;
        let created: IdResponse = self
            .send(self.request(Method::POST, url, target.token.as_ref()).json(upload))
            .await?;
        Ok(created.id)
    }
}

/// Append path segments to `base`, dropping a trailing empty segment.
pub(crate) fn endpoint_url(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| DriverError::Parse(format!("cannot append a path to {base}")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn decode_blob(content: &str, encoding: &str) -> Result<Vec<u8>> {
    match encoding {
        "base64" => BASE64
            .decode(content.trim())
            .map_err(|e| DriverError::Parse(format!("blob content: {e}"))),
        "utf-8" | "utf8" => Ok(content.as_bytes().to_vec()),
        other => Err(DriverError::Parse(format!("unknown blob encoding '{other}'"))),
    }
}
