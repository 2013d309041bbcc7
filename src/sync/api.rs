//! Remote Client - HTTP communication with the Applitrack cloud API
//!
//! Wraps the remote endpoint contract behind the `RemoteEndpoint` trait so
//! the processor can be driven by scripted fakes in tests:
//! - Push a single outbox entry (accepted / conflict / rejected)
//! - Fetch the current remote record (accept-remote resolutions)
//! - Connectivity probe

use super::models::{EntityKind, Operation};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// One push of an outbox entry to the remote.
#[derive(Debug, Clone, Serialize)]
pub struct PushRequest {
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub operation: Operation,
    pub payload: Option<serde_json::Value>,
    /// Remote version this mutation was based on.
    pub base_version: i64,
    /// True when a conflict was resolved in favor of local; the remote
    /// accepts the payload regardless of version.
    pub force: bool,
    pub device_id: String,
}

/// Remote verdict on a push.
#[derive(Debug, Clone)]
pub enum PushOutcome {
    Accepted {
        new_version: i64,
    },
    Conflict {
        remote_version: i64,
        remote_payload: Option<serde_json::Value>,
    },
    /// Permanent rejection (validation and the like); never retried.
    Rejected {
        reason: String,
    },
}

/// Current remote state of one record.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteRecord {
    pub version: i64,
    pub payload: Option<serde_json::Value>,
}

/// Transport-level failures. Every variant is transient and retried with
/// backoff; permanent rejections arrive as `PushOutcome::Rejected` instead.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Invalid response from server")]
    InvalidResponse,
}

/// Abstract remote endpoint, implemented over HTTP in production and by
/// scripted fakes in tests.
#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
    async fn push(&self, req: &PushRequest) -> Result<PushOutcome, RemoteError>;

    async fn fetch(
        &self,
        entity_kind: EntityKind,
        entity_id: &str,
    ) -> Result<Option<RemoteRecord>, RemoteError>;

    /// Cheap connectivity check; false means unreachable.
    async fn probe(&self) -> bool;
}

// ============================================================================
// HTTP implementation
// ============================================================================

/// reqwest-backed client for the Applitrack sync API.
pub struct HttpRemote {
    client: Client,
    base_url: String,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>) -> Result<Self, RemoteError> {
        Self::with_timeout(base_url, std::time::Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// The request timeout bounds every push so a hung remote cannot stall
    /// a drain; it is distinct from any shutdown deadline.
    pub fn with_timeout(
        base_url: impl Into<String>,
        timeout: std::time::Duration,
    ) -> Result<Self, RemoteError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl RemoteEndpoint for HttpRemote {
    async fn push(&self, req: &PushRequest) -> Result<PushOutcome, RemoteError> {
        let response = self
            .client
            .post(format!("{}/sync/push", self.base_url))
            .json(req)
            .send()
            .await?;

        let status = response.status();

        if status.is_success() {
            let body: AcceptedBody = response
                .json()
                .await
                .map_err(|_| RemoteError::InvalidResponse)?;
            return Ok(PushOutcome::Accepted {
                new_version: body.new_version,
            });
        }

        if status == StatusCode::CONFLICT {
            let body: ConflictBody = response
                .json()
                .await
                .map_err(|_| RemoteError::InvalidResponse)?;
            return Ok(PushOutcome::Conflict {
                remote_version: body.remote_version,
                remote_payload: body.remote_payload,
            });
        }

        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(transient_error(response).await);
        }

        // Remaining 4xx: the payload itself was rejected; never retried.
        let reason = match response.json::<RejectedBody>().await {
            Ok(body) => body.reason,
            Err(_) => format!("rejected with status {}", status),
        };
        Ok(PushOutcome::Rejected { reason })
    }

    async fn fetch(
        &self,
        entity_kind: EntityKind,
        entity_id: &str,
    ) -> Result<Option<RemoteRecord>, RemoteError> {
        let response = self
            .client
            .get(format!(
                "{}/sync/{}/{}",
                self.base_url,
                entity_kind.as_str(),
                entity_id
            ))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if response.status().is_success() {
            let record: RemoteRecord = response
                .json()
                .await
                .map_err(|_| RemoteError::InvalidResponse)?;
            return Ok(Some(record));
        }

        Err(transient_error(response).await)
    }

    async fn probe(&self) -> bool {
        match self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                log::warn!("Connectivity probe failed: {}", e);
                false
            }
        }
    }
}

// ============================================================================
// Wire types & error mapping
// ============================================================================

#[derive(Debug, Deserialize)]
struct AcceptedBody {
    new_version: i64,
}

#[derive(Debug, Deserialize)]
struct ConflictBody {
    remote_version: i64,
    #[serde(default)]
    remote_payload: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RejectedBody {
    reason: String,
}

/// Map a non-success status to a transient error.
async fn transient_error(response: reqwest::Response) -> RemoteError {
    let status = response.status();

    if status == StatusCode::TOO_MANY_REQUESTS {
        return RemoteError::RateLimited;
    }

    let msg = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    RemoteError::Server(format!("{}: {}", status, msg))
}

// ============================================================================
// Tests
// ============================================================================
