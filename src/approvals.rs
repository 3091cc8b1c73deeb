//! Human-approval collaborator.
//!
//! Sensitive tool calls are gated on an external approval queue. The queue's
//! storage and UI are out of scope; the gateway creates a request, then
//! polls on a fixed interval until a terminal status or a timeout.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ApprovalError;
use crate::identity::AgentIdentity;

/// Status of an approval action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    Cancelled,
}

impl ApprovalStatus {
    /// Whether the status ends the polling loop.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// An approval request created before a gated tool call executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub provider_id: String,
    pub tool: String,
    /// Call arguments, pre-redacted by the gateway.
    pub args: Value,
    pub requested_by: AgentIdentity,
}

/// Handle to a created approval action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalTicket {
    pub action_id: String,
    pub status: ApprovalStatus,
}

/// Contract the gateway consumes from the external approval service.
#[async_trait]
pub trait ApprovalService: Send + Sync {
    /// Create a new approval action.
    async fn create(&self, request: ApprovalRequest) -> Result<ApprovalTicket, ApprovalError>;

    /// Fetch the current status of an action.
    async fn poll(&self, action_id: &str) -> Result<ApprovalStatus, ApprovalError>;
}

/// HTTP client for a remote approval service.
///
/// Endpoints: `POST {base}/approvals` and `GET {base}/approvals/{id}`.
pub struct HttpApprovalService {
    client: reqwest::Client,
    base_url: String,
    token: Option<SecretString>,
}

impl HttpApprovalService {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            token: None,
        }
    }

    /// Attach a bearer token for the approval API.
    pub fn with_token(mut self, token: SecretString) -> Self {
        self.token = Some(token);
        self
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token.expose_secret()),
            None => req,
        }
    }
}

#[derive(Deserialize)]
struct PollBody {
    status: ApprovalStatus,
}

#[async_trait]
impl ApprovalService for HttpApprovalService {
    async fn create(&self, request: ApprovalRequest) -> Result<ApprovalTicket, ApprovalError> {
        let url = format!("{}/approvals", self.base_url);
        let response = self
            .authorize(self.client.post(&url))
            .json(&request)
            .send()
            .await
            .map_err(|e| ApprovalError::Request(e.to_string()))?
            .error_for_status()
            .map_err(|e| ApprovalError::Request(e.to_string()))?;
        response
            .json()
            .await
            .map_err(|e| ApprovalError::Request(e.to_string()))
    }

    async fn poll(&self, action_id: &str) -> Result<ApprovalStatus, ApprovalError> {
        let url = format!("{}/approvals/{}", self.base_url, action_id);
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| ApprovalError::Request(e.to_string()))?
            .error_for_status()
            .map_err(|e| ApprovalError::Request(e.to_string()))?;
        let body: PollBody = response
            .json()
            .await
            .map_err(|e| ApprovalError::Request(e.to_string()))?;
        Ok(body.status)
    }
}

/// In-memory approval queue. Actions start pending and are resolved by a
/// separate caller (tests, or an embedding application).
#[derive(Default)]
pub struct InMemoryApprovalQueue {
    actions: Mutex<HashMap<String, ApprovalStatus>>,
    /// When set, new actions are created in this status instead of pending.
    auto_status: Mutex<Option<ApprovalStatus>>,
}

impl InMemoryApprovalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a queue that resolves every action immediately.
    pub fn auto(status: ApprovalStatus) -> Self {
        Self {
            actions: Mutex::new(HashMap::new()),
            auto_status: Mutex::new(Some(status)),
        }
    }

    /// Resolve a pending action.
    pub fn resolve(&self, action_id: &str, status: ApprovalStatus) {
        let mut actions = self.actions.lock().unwrap_or_else(|e| e.into_inner());
        actions.insert(action_id.to_string(), status);
    }
}

#[async_trait]
impl ApprovalService for InMemoryApprovalQueue {
    async fn create(&self, _request: ApprovalRequest) -> Result<ApprovalTicket, ApprovalError> {
        let action_id = Uuid::new_v4().to_string();
        let status = self
            .auto_status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .unwrap_or(ApprovalStatus::Pending);
        self.actions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(action_id.clone(), status);
        Ok(ApprovalTicket { action_id, status })
    }

    async fn poll(&self, action_id: &str) -> Result<ApprovalStatus, ApprovalError> {
        let actions = self.actions.lock().unwrap_or_else(|e| e.into_inner());
        actions
            .get(action_id)
            .copied()
            .ok_or_else(|| ApprovalError::UnknownAction(action_id.to_string()))
    }
}
