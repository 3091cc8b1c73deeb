//! The invocation gateway: the single public call surface.
//!
//! `invoke()` composes the permission engine, the server manager, bounded
//! retry with exponential backoff, budget settlement, and secret redaction.
//! Governance failures (permission, budget, approval) short-circuit before
//! any execution and are never retried; only transient execution failures
//! enter the retry loop.
//!
//! There is no global registry: a gateway is an explicit context object
//! constructed once per process and passed to its collaborators, so tests
//! can run several gateways side by side.

use std::future::Future;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::approvals::ApprovalService;
use crate::config::{BudgetLimit, GatewaySettings, ProviderRegistry};
use crate::error::{ClientError, InvokeError, PermissionError};
use crate::identity::AgentIdentity;
use crate::ledger::BudgetLedger;
use crate::manager::{GatewayEvent, GatewayStats, ServerHealth, ServerManager};
use crate::permissions::PermissionEngine;
use crate::protocol::{ToolDescriptor, ToolResult};
use crate::safety::SecretRedactor;

/// Failure messages that qualify for a retry.
static TRANSIENT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)timeout|network|connection|unavailable|temporary|rate limit")
        .expect("Invalid transient-error pattern")
});

/// Whether a failure message looks transient.
fn is_transient(message: &str) -> bool {
    TRANSIENT_PATTERN.is_match(message)
}

/// Delay before retry number `attempt` (zero-based): `base * 2^attempt`,
/// capped at `max`.
fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    base.checked_mul(factor).map_or(max, |d| d.min(max))
}

/// Public entry point for governed tool invocation.
pub struct InvocationGateway {
    manager: Arc<ServerManager>,
    permissions: PermissionEngine,
    ledger: Arc<dyn BudgetLedger>,
    redactor: SecretRedactor,
    settings: GatewaySettings,
}

impl InvocationGateway {
    /// Wire a gateway from its collaborators.
    pub fn new(
        registry: ProviderRegistry,
        settings: GatewaySettings,
        ledger: Arc<dyn BudgetLedger>,
        approvals: Arc<dyn ApprovalService>,
    ) -> Self {
        let manager = ServerManager::new(registry.clone(), settings.clone());
        let permissions = PermissionEngine::new(
            registry,
            Arc::clone(&ledger),
            approvals,
            settings.approval_poll_interval,
            settings.approval_timeout,
        );
        Self {
            manager,
            permissions,
            ledger,
            redactor: SecretRedactor::new(),
            settings,
        }
    }

    /// The server manager behind this gateway.
    pub fn manager(&self) -> &Arc<ServerManager> {
        &self.manager
    }

    /// Start all auto-start providers.
    pub async fn start(&self) {
        self.manager.start().await;
    }

    /// Stop every provider.
    pub async fn shutdown(&self) {
        self.manager.stop().await;
    }

    /// Invoke one tool on one provider on behalf of a caller.
    pub async fn invoke(
        &self,
        provider_id: &str,
        tool: &str,
        args: Value,
        identity: &AgentIdentity,
    ) -> Result<ToolResult, InvokeError> {
        let started = std::time::Instant::now();
        tracing::info!(
            provider = provider_id,
            tool,
            caller = %identity.caller_type,
            run = %identity.run_id,
            args = %self.redactor.redact(&args),
            "Tool invocation requested"
        );

        // Governance first; a denial has no side effects beyond logs and
        // statistics.
        if let Err(e) = self
            .permissions
            .enforce(provider_id, tool, &args, identity)
            .await
        {
            tracing::warn!(provider = provider_id, tool, "Invocation denied: {}", e);
            self.record(false, started);
            return Err(e.into());
        }

        // Pre-check the estimated cost against the ledger before spending
        // provider time. The ledger being down fails open, as in the
        // budget permission layer.
        let estimate = self.cost_estimate(provider_id, tool);
        if let Some(limit) = &estimate {
            match self.ledger.can_spend(&identity.run_id, limit.amount).await {
                Ok(true) => {}
                Ok(false) => {
                    let reason = format!(
                        "run '{}' cannot afford estimated cost {} {} for tool '{}'",
                        identity.run_id, limit.amount, limit.currency, tool
                    );
                    tracing::warn!(provider = provider_id, tool, "Invocation denied: {}", reason);
                    self.record(false, started);
                    return Err(PermissionError::BudgetExceeded(reason).into());
                }
                Err(e) => {
                    tracing::warn!(
                        provider = provider_id,
                        tool,
                        "Budget ledger unreachable for pre-check, allowing call: {}",
                        e
                    );
                }
            }
        }

        let client = match self.manager.client(provider_id).await {
            Ok(client) => client,
            Err(e) => {
                self.record(false, started);
                return Err(e.into());
            }
        };

        let outcome = self
            .execute_with_retry(|| client.call_tool(tool, args.clone()))
            .await;

        match outcome {
            Ok(result) => {
                if result.success {
                    self.settle(identity, &result, estimate.as_ref()).await;
                }
                self.manager
                    .record_tool_call(result.success, result.execution_time_ms);
                Ok(result)
            }
            Err(e) => {
                self.record(false, started);
                Err(e.into())
            }
        }
    }

    /// Run the call with bounded retry. Only failures whose message
    /// matches the transient pattern are retried; each retry waits
    /// `min(base * 2^attempt, max)`.
    async fn execute_with_retry<F, Fut>(&self, mut call: F) -> Result<ToolResult, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<ToolResult, ClientError>>,
    {
        let max_retries = self.settings.max_retries;
        let mut attempt = 0u32;
        loop {
            let failure = match call().await {
                Ok(result) if result.success => return Ok(result),
                Ok(result) => {
                    let message = result.error.clone().unwrap_or_default();
                    if attempt >= max_retries || !is_transient(&message) {
                        return Ok(result);
                    }
                    message
                }
                Err(e) => {
                    let message = e.to_string();
                    if attempt >= max_retries || !is_transient(&message) {
                        return Err(e);
                    }
                    message
                }
            };

            let delay = backoff_delay(
                attempt,
                self.settings.retry_base_delay,
                self.settings.retry_max_delay,
            );
            tracing::warn!(
                attempt = attempt + 1,
                max = max_retries,
                "Transient failure, retrying in {:?}: {}",
                delay,
                failure
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Settle the ledger with the measured cost, or the estimate when the
    /// provider reports none. Settlement failures are logged, not fatal:
    /// the call already happened.
    async fn settle(
        &self,
        identity: &AgentIdentity,
        result: &ToolResult,
        estimate: Option<&BudgetLimit>,
    ) {
        let amount = result
            .cost
            .as_ref()
            .map(|c| c.amount)
            .or_else(|| estimate.map(|l| l.amount));
        let Some(amount) = amount else {
            return;
        };
        if amount <= rust_decimal::Decimal::ZERO {
            return;
        }
        match self.ledger.spend(&identity.run_id, amount).await {
            Ok(status) => {
                tracing::debug!(
                    run = %identity.run_id,
                    spent = %status.spent,
                    remaining = %status.remaining,
                    "Budget settled"
                );
            }
            Err(e) => {
                tracing::warn!(run = %identity.run_id, "Failed to settle budget: {}", e);
            }
        }
    }

    fn cost_estimate(&self, provider_id: &str, tool: &str) -> Option<BudgetLimit> {
        self.manager
            .registry()
            .get(provider_id)?
            .permissions
            .tool_permissions
            .get(tool)?
            .budget_limit
            .clone()
    }

    fn record(&self, success: bool, started: std::time::Instant) {
        self.manager
            .record_tool_call(success, started.elapsed().as_millis() as u64);
    }

    // ── read passthroughs ────────────────────────────────────────────────

    pub async fn list_tools(&self, provider_id: Option<&str>) -> Vec<ToolDescriptor> {
        self.manager.list_tools(provider_id).await
    }

    pub async fn get_tool(&self, provider_id: &str, name: &str) -> Option<ToolDescriptor> {
        self.manager.get_tool(provider_id, name).await
    }

    pub async fn get_server_health(&self, provider_id: &str) -> Option<ServerHealth> {
        self.manager.get_server_health(provider_id).await
    }

    pub fn get_stats(&self) -> GatewayStats {
        self.manager.get_stats()
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.manager.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use rust_decimal_macros::dec;
    use serde_json::json;

    use super::*;
    use crate::approvals::InMemoryApprovalQueue;
    use crate::config::ProviderConfig;
    use crate::error::ManagerError;
    use crate::ledger::InMemoryLedger;

    fn registry() -> ProviderRegistry {
        let config: ProviderConfig = serde_json::from_str(
            r#"{
                "id": "github",
                "name": "GitHub",
                "type": "binary",
                "binary": "/nonexistent/github-tools",
                "transport": "stdio",
                "permissions": {
                    "allowedCallerTypes": ["agent"],
                    "toolPermissions": {
                        "create_pull_request": {
                            "allowed": true,
                            "budgetLimit": {"amount": "5", "currency": "USD"}
                        }
                    }
                }
            }"#,
        )
        .unwrap();
        ProviderRegistry::from_configs(vec![config]).unwrap()
    }

    fn gateway_with_ledger(ledger: Arc<InMemoryLedger>) -> InvocationGateway {
        InvocationGateway::new(
            registry(),
            GatewaySettings::default(),
            ledger,
            Arc::new(InMemoryApprovalQueue::new()),
        )
    }

    fn gateway() -> InvocationGateway {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.set_limit("run-1", dec!(100));
        gateway_with_ledger(ledger)
    }

    #[test]
    fn test_backoff_delays_double_and_cap() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(30);
        assert_eq!(backoff_delay(0, base, max), Duration::from_secs(1));
        assert_eq!(backoff_delay(1, base, max), Duration::from_secs(2));
        assert_eq!(backoff_delay(2, base, max), Duration::from_secs(4));
        assert_eq!(backoff_delay(4, base, max), Duration::from_secs(16));
        assert_eq!(backoff_delay(5, base, max), Duration::from_secs(30));
        assert_eq!(backoff_delay(20, base, max), Duration::from_secs(30));
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient("connection timeout"));
        assert!(is_transient("Network unreachable"));
        assert!(is_transient("service temporarily unavailable"));
        assert!(is_transient("Rate Limit exceeded"));
        assert!(!is_transient("invalid argument"));
        assert!(!is_transient("permission denied"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_loop_retries_transient_failures() {
        let gateway = gateway();
        let attempts = AtomicU32::new(0);
        let begin = tokio::time::Instant::now();

        let result = gateway
            .execute_with_retry(|| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Ok(ToolResult::failure("connection timeout", 5))
                    } else {
                        Ok(ToolResult::success(json!({"ok": true}), 5))
                    }
                }
            })
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // Two retries: 1s then 2s of backoff.
        assert_eq!(begin.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_loop_gives_up_after_bound() {
        let gateway = gateway();
        let attempts = AtomicU32::new(0);

        let result = gateway
            .execute_with_retry(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Ok(ToolResult::failure("network error", 5)) }
            })
            .await
            .unwrap();

        assert!(!result.success);
        // 1 initial + 3 retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_non_transient_failure_not_retried() {
        let gateway = gateway();
        let attempts = AtomicU32::new(0);

        let result = gateway
            .execute_with_retry(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Ok(ToolResult::failure("invalid argument", 5)) }
            })
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_errors_follow_the_same_rules() {
        let gateway = gateway();
        let attempts = AtomicU32::new(0);

        let err = gateway
            .execute_with_retry(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(ClientError::Timeout(Duration::from_secs(30))) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Timeout(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_invoke_denies_before_touching_manager() {
        let gateway = gateway();
        let mut identity = AgentIdentity::agent("run-1", "proj-1");
        identity.caller_type = crate::identity::CallerType::Human;

        let err = gateway
            .invoke("github", "create_pull_request", json!({}), &identity)
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Permission(PermissionError::Denied(_))));
        // The denial is still visible in the statistics.
        assert_eq!(gateway.get_stats().failures, 1);
    }

    #[tokio::test]
    async fn test_invoke_pre_checks_estimated_cost() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.set_limit("run-1", dec!(10));
        ledger.spend("run-1", dec!(7)).await.unwrap(); // remaining 3 < estimate 5
        let gateway = gateway_with_ledger(ledger);
        let identity = AgentIdentity::agent("run-1", "proj-1");

        let err = gateway
            .invoke("github", "create_pull_request", json!({}), &identity)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InvokeError::Permission(PermissionError::BudgetExceeded(_))
        ));
    }

    #[tokio::test]
    async fn test_invoke_requires_running_provider() {
        let gateway = gateway();
        let identity = AgentIdentity::agent("run-1", "proj-1");

        // Permitted, affordable, but the provider was never started.
        let err = gateway
            .invoke("github", "list_issues", json!({}), &identity)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InvokeError::Manager(ManagerError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_two_gateways_are_isolated() {
        // Explicit context objects: no hidden global registry.
        let a = gateway();
        let b = gateway();
        a.manager().record_tool_call(true, 10);
        assert_eq!(a.get_stats().total_calls, 1);
        assert_eq!(b.get_stats().total_calls, 0);
    }
}
