//! Budget ledger collaborator.
//!
//! The ledger tracks spend against a per-run limit. Its storage engine is
//! external; this module only defines the request/response contract, an
//! HTTP client for a remote ledger, and an in-memory implementation used
//! as an embedded default and in tests.
//!
//! Spend atomicity lives in the ledger itself. From the gateway's side,
//! reads and settlements are best-effort.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

/// Budget standing for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub spent: Decimal,
    pub limit: Decimal,
    pub remaining: Decimal,
}

/// Contract the gateway consumes from the external budget ledger.
#[async_trait]
pub trait BudgetLedger: Send + Sync {
    /// Current standing for a run.
    async fn get_status(&self, run_id: &str) -> Result<BudgetStatus, LedgerError>;

    /// Record spend atomically and return the new standing.
    async fn spend(&self, run_id: &str, amount: Decimal) -> Result<BudgetStatus, LedgerError>;

    /// Whether the run could afford `amount` right now.
    async fn can_spend(&self, run_id: &str, amount: Decimal) -> Result<bool, LedgerError> {
        let status = self.get_status(run_id).await?;
        Ok(status.remaining >= amount)
    }
}

/// HTTP client for a remote budget ledger.
///
/// Endpoints: `GET {base}/runs/{run_id}/budget` and
/// `POST {base}/runs/{run_id}/spend` with `{"amount": "..."}`.
pub struct HttpBudgetLedger {
    client: reqwest::Client,
    base_url: String,
    token: Option<SecretString>,
}

impl HttpBudgetLedger {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            token: None,
        }
    }

    /// Attach a bearer token for the ledger API.
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

#[derive(Serialize)]
struct SpendBody {
    amount: Decimal,
}

#[async_trait]
impl BudgetLedger for HttpBudgetLedger {
    async fn get_status(&self, run_id: &str) -> Result<BudgetStatus, LedgerError> {
        let url = format!("{}/runs/{}/budget", self.base_url, run_id);
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| LedgerError::Request(e.to_string()))?
            .error_for_status()
            .map_err(|e| LedgerError::Request(e.to_string()))?;
        response
            .json()
            .await
            .map_err(|e| LedgerError::Request(e.to_string()))
    }

    async fn spend(&self, run_id: &str, amount: Decimal) -> Result<BudgetStatus, LedgerError> {
        let url = format!("{}/runs/{}/spend", self.base_url, run_id);
        let response = self
            .authorize(self.client.post(&url))
            .json(&SpendBody { amount })
            .send()
            .await
            .map_err(|e| LedgerError::Request(e.to_string()))?
            .error_for_status()
            .map_err(|e| LedgerError::Request(e.to_string()))?;
        response
            .json()
            .await
            .map_err(|e| LedgerError::Request(e.to_string()))
    }
}

/// In-memory ledger keyed by run id.
#[derive(Default)]
pub struct InMemoryLedger {
    runs: Mutex<HashMap<String, (Decimal, Decimal)>>, // (limit, spent)
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (or replace) the budget limit for a run.
    pub fn set_limit(&self, run_id: impl Into<String>, limit: Decimal) {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        let entry = runs.entry(run_id.into()).or_insert((limit, Decimal::ZERO));
        entry.0 = limit;
    }
}

#[async_trait]
impl BudgetLedger for InMemoryLedger {
    async fn get_status(&self, run_id: &str) -> Result<BudgetStatus, LedgerError> {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        let (limit, spent) = runs
            .get(run_id)
            .copied()
            .ok_or_else(|| LedgerError::UnknownRun(run_id.to_string()))?;
        Ok(BudgetStatus {
            spent,
            limit,
            remaining: limit - spent,
        })
    }

    async fn spend(&self, run_id: &str, amount: Decimal) -> Result<BudgetStatus, LedgerError> {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        let entry = runs
            .get_mut(run_id)
            .ok_or_else(|| LedgerError::UnknownRun(run_id.to_string()))?;
        entry.1 += amount;
        Ok(BudgetStatus {
            spent: entry.1,
            limit: entry.0,
            remaining: entry.0 - entry.1,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    use super::*;

    #[tokio::test]
    async fn test_in_memory_spend_and_status() {
        let ledger = InMemoryLedger::new();
        ledger.set_limit("run-1", dec!(10));

        let status = ledger.spend("run-1", dec!(3)).await.unwrap();
        assert_eq!(status.spent, dec!(3));
        assert_eq!(status.remaining, dec!(7));

        assert!(ledger.can_spend("run-1", dec!(7)).await.unwrap());
        assert!(!ledger.can_spend("run-1", dec!(8)).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_run_is_an_error() {
        let ledger = InMemoryLedger::new();
        assert!(matches!(
            ledger.get_status("nope").await,
            Err(LedgerError::UnknownRun(_))
        ));
    }
}
