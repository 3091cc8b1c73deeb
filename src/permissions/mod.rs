//! Layered permission engine.
//!
//! Every invocation passes through a fixed sequence of checks, short-
//! circuiting on the first failing layer: provider exists, caller-type
//! allowlist, tool-level policy, budget, custom rule, rate limit, and
//! finally the approval flag. Budget checks fail open when the ledger is
//! unreachable; availability wins over strict enforcement when the
//! dependency is down.

pub mod rate_limit;
pub mod rules;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::approvals::{ApprovalRequest, ApprovalService, ApprovalStatus};
use crate::config::{ProviderRegistry, ToolPermission};
use crate::error::PermissionError;
use crate::identity::AgentIdentity;
use crate::ledger::BudgetLedger;
use crate::safety::SecretRedactor;

pub use rate_limit::RateLimiter;

/// Outcome of evaluating the permission layers for one call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub requires_approval: bool,
}

impl PermissionDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            requires_approval: false,
        }
    }

    fn allow_with_approval() -> Self {
        Self {
            allowed: true,
            reason: None,
            requires_approval: true,
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            requires_approval: false,
        }
    }
}

/// Which layer denied a call. Internal to the engine; the public decision
/// only carries the reason text.
enum Denial {
    Governance(String),
    Budget(String),
}

/// The layered allow/deny/approval decision function.
pub struct PermissionEngine {
    registry: ProviderRegistry,
    ledger: Arc<dyn BudgetLedger>,
    approvals: Arc<dyn ApprovalService>,
    rate_limiter: RateLimiter,
    redactor: SecretRedactor,
    approval_poll_interval: Duration,
    approval_timeout: Duration,
}

impl PermissionEngine {
    pub fn new(
        registry: ProviderRegistry,
        ledger: Arc<dyn BudgetLedger>,
        approvals: Arc<dyn ApprovalService>,
        approval_poll_interval: Duration,
        approval_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            ledger,
            approvals,
            rate_limiter: RateLimiter::new(),
            redactor: SecretRedactor::new(),
            approval_poll_interval,
            approval_timeout,
        }
    }

    /// Evaluate the layers for one call.
    pub async fn check(
        &self,
        provider_id: &str,
        tool: &str,
        args: &Value,
        identity: &AgentIdentity,
    ) -> PermissionDecision {
        match self.check_inner(provider_id, tool, args, identity).await {
            Ok(requires_approval) if requires_approval => PermissionDecision::allow_with_approval(),
            Ok(_) => PermissionDecision::allow(),
            Err(Denial::Governance(reason)) | Err(Denial::Budget(reason)) => {
                PermissionDecision::deny(reason)
            }
        }
    }

    /// The ordered layers. Returns whether approval is required.
    async fn check_inner(
        &self,
        provider_id: &str,
        tool: &str,
        args: &Value,
        identity: &AgentIdentity,
    ) -> Result<bool, Denial> {
        // 1. Provider exists.
        let Some(config) = self.registry.get(provider_id) else {
            return Err(Denial::Governance(format!(
                "unknown provider '{}'",
                provider_id
            )));
        };
        let policy = &config.permissions;

        // 2. Caller-type allowlist.
        if !policy.allowed_caller_types.contains(&identity.caller_type) {
            return Err(Denial::Governance(format!(
                "caller type '{}' is not allowed on provider '{}'",
                identity.caller_type, provider_id
            )));
        }

        // 3. Tool-level policy. Absent entry defaults to allow.
        let tool_permission: Option<&ToolPermission> = policy.tool_permissions.get(tool);
        if let Some(p) = tool_permission {
            if !p.allowed {
                return Err(Denial::Governance(format!(
                    "tool '{}' is disabled on provider '{}'",
                    tool, provider_id
                )));
            }
        }

        // 4. Budget. Ledger unreachable => fail open with a warning.
        if let Some(limit) = tool_permission.and_then(|p| p.budget_limit.as_ref()) {
            match self.ledger.get_status(&identity.run_id).await {
                Ok(status) => {
                    if status.remaining < limit.amount {
                        return Err(Denial::Budget(format!(
                            "insufficient budget for tool '{}': remaining {} {} < required {} {}",
                            tool, status.remaining, limit.currency, limit.amount, limit.currency
                        )));
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        provider = provider_id,
                        tool,
                        run = %identity.run_id,
                        "Budget ledger unreachable, allowing call: {}",
                        e
                    );
                }
            }
        }

        // 5. Custom rule. Evaluation errors are denials, not crashes.
        if let Some(rule) = tool_permission.and_then(|p| p.custom_policy.as_ref()) {
            match rules::evaluate(rule, args) {
                Ok(true) => {}
                Ok(false) => {
                    return Err(Denial::Governance(format!(
                        "custom policy rejected call to tool '{}'",
                        tool
                    )));
                }
                Err(e) => {
                    tracing::warn!(provider = provider_id, tool, "Custom rule failed: {}", e);
                    return Err(Denial::Governance(format!(
                        "custom policy could not be evaluated: {}",
                        e
                    )));
                }
            }
        }

        // 6. Rate limit. Recorded only once every prior layer has passed.
        if let Some(rate_limit) = &policy.rate_limit {
            if let Err(e) = self
                .rate_limiter
                .try_acquire(&identity.run_id, provider_id, rate_limit)
            {
                return Err(Denial::Governance(e.to_string()));
            }
        }

        // 7. Approval flag.
        Ok(tool_permission.is_some_and(|p| p.requires_approval))
    }

    /// Evaluate the layers and, when approval is required, wait for a human
    /// decision: create an approval action, poll until a terminal status or
    /// the timeout, and fail on anything but `approved`.
    pub async fn enforce(
        &self,
        provider_id: &str,
        tool: &str,
        args: &Value,
        identity: &AgentIdentity,
    ) -> Result<(), PermissionError> {
        let requires_approval = match self.check_inner(provider_id, tool, args, identity).await {
            Ok(flag) => flag,
            Err(Denial::Budget(reason)) => return Err(PermissionError::BudgetExceeded(reason)),
            Err(Denial::Governance(reason)) => return Err(PermissionError::Denied(reason)),
        };
        if !requires_approval {
            return Ok(());
        }

        let request = ApprovalRequest {
            provider_id: provider_id.to_string(),
            tool: tool.to_string(),
            args: self.redactor.redact(args),
            requested_by: identity.clone(),
        };
        let ticket = self.approvals.create(request).await?;
        tracing::info!(
            provider = provider_id,
            tool,
            action = %ticket.action_id,
            "Waiting for approval"
        );

        let deadline = tokio::time::Instant::now() + self.approval_timeout;
        let mut status = ticket.status;
        while !status.is_terminal() {
            if tokio::time::Instant::now() >= deadline {
                return Err(PermissionError::ApprovalTimeout(self.approval_timeout));
            }
            tokio::time::sleep(self.approval_poll_interval).await;
            status = self.approvals.poll(&ticket.action_id).await?;
        }

        match status {
            ApprovalStatus::Approved => Ok(()),
            other => Err(PermissionError::Approval {
                status: other,
                reason: format!("approval for tool '{}' ended as {}", tool, other),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use serde_json::json;

    use super::*;
    use crate::approvals::InMemoryApprovalQueue;
    use crate::config::ProviderConfig;
    use crate::error::LedgerError;
    use crate::identity::CallerType;
    use crate::ledger::{BudgetStatus, InMemoryLedger};

    const POLL: Duration = Duration::from_millis(50);
    const TIMEOUT: Duration = Duration::from_secs(10);

    fn registry() -> ProviderRegistry {
        let config: ProviderConfig = serde_json::from_str(
            r#"{
                "id": "github",
                "name": "GitHub",
                "type": "binary",
                "binary": "/usr/bin/github-tools",
                "transport": "stdio",
                "permissions": {
                    "allowedCallerTypes": ["agent"],
                    "toolPermissions": {
                        "create_pull_request": {
                            "allowed": true,
                            "budgetLimit": {"amount": "5", "currency": "USD"}
                        },
                        "delete_repository": {"allowed": false},
                        "merge": {"allowed": true, "requiresApproval": true},
                        "comment": {
                            "allowed": true,
                            "customPolicy": {"kind": "maxArgSize", "limit": 64}
                        }
                    },
                    "rateLimit": {"maxCallsPerMinute": 30, "maxCallsPerHour": 1000}
                }
            }"#,
        )
        .unwrap();
        ProviderRegistry::from_configs(vec![config]).unwrap()
    }

    fn engine_with(ledger: Arc<dyn BudgetLedger>, approvals: Arc<dyn ApprovalService>) -> PermissionEngine {
        PermissionEngine::new(registry(), ledger, approvals, POLL, TIMEOUT)
    }

    fn engine() -> PermissionEngine {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.set_limit("run-1", dec!(100));
        engine_with(ledger, Arc::new(InMemoryApprovalQueue::new()))
    }

    fn agent() -> AgentIdentity {
        AgentIdentity::agent("run-1", "proj-1")
    }

    #[tokio::test]
    async fn test_unknown_provider_denied() {
        let decision = engine().check("gitlab", "x", &json!({}), &agent()).await;
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("gitlab"));
    }

    #[tokio::test]
    async fn test_caller_type_outside_allowlist_denied() {
        let mut identity = agent();
        identity.caller_type = CallerType::Human;
        // The denial names the offending caller type, whatever the tool.
        for tool in ["create_pull_request", "comment", "anything"] {
            let decision = engine().check("github", tool, &json!({}), &identity).await;
            assert!(!decision.allowed);
            assert!(decision.reason.unwrap().contains("human"));
        }
    }

    #[tokio::test]
    async fn test_absent_tool_entry_defaults_to_allow() {
        let decision = engine()
            .check("github", "list_issues", &json!({}), &agent())
            .await;
        assert!(decision.allowed);
        assert!(!decision.requires_approval);
    }

    #[tokio::test]
    async fn test_disabled_tool_denied_unconditionally() {
        let decision = engine()
            .check("github", "delete_repository", &json!({}), &agent())
            .await;
        assert!(!decision.allowed);
    }

    #[tokio::test]
    async fn test_budget_layer_denies_when_remaining_below_limit() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.set_limit("run-1", dec!(10));
        ledger.spend("run-1", dec!(7)).await.unwrap(); // remaining = 3
        let engine = engine_with(ledger, Arc::new(InMemoryApprovalQueue::new()));

        let decision = engine
            .check("github", "create_pull_request", &json!({}), &agent())
            .await;
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("insufficient budget"));
    }

    struct DownLedger;

    #[async_trait]
    impl BudgetLedger for DownLedger {
        async fn get_status(&self, _run_id: &str) -> Result<BudgetStatus, LedgerError> {
            Err(LedgerError::Request("connection refused".into()))
        }
        async fn spend(&self, _run_id: &str, _amount: rust_decimal::Decimal) -> Result<BudgetStatus, LedgerError> {
            Err(LedgerError::Request("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_unreachable_ledger_fails_open() {
        let engine = engine_with(Arc::new(DownLedger), Arc::new(InMemoryApprovalQueue::new()));
        let decision = engine
            .check("github", "create_pull_request", &json!({}), &agent())
            .await;
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn test_custom_rule_denies() {
        let huge = "x".repeat(200);
        let decision = engine()
            .check("github", "comment", &json!({"body": huge}), &agent())
            .await;
        assert!(!decision.allowed);

        let decision = engine()
            .check("github", "comment", &json!({"body": "ok"}), &agent())
            .await;
        assert!(decision.allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_layer() {
        let engine = engine();
        for _ in 0..30 {
            let decision = engine
                .check("github", "list_issues", &json!({}), &agent())
                .await;
            assert!(decision.allowed);
        }
        let decision = engine
            .check("github", "list_issues", &json!({}), &agent())
            .await;
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("rate limit"));
    }

    #[tokio::test]
    async fn test_approval_flag_returns_soft_allow() {
        let decision = engine().check("github", "merge", &json!({}), &agent()).await;
        assert!(decision.allowed);
        assert!(decision.requires_approval);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enforce_waits_for_approval() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.set_limit("run-1", dec!(100));
        let queue = Arc::new(InMemoryApprovalQueue::auto(ApprovalStatus::Approved));
        let engine = engine_with(ledger, queue);

        engine
            .enforce("github", "merge", &json!({}), &agent())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_enforce_fails_on_rejection() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.set_limit("run-1", dec!(100));
        let queue = Arc::new(InMemoryApprovalQueue::auto(ApprovalStatus::Rejected));
        let engine = engine_with(ledger, queue);

        let err = engine
            .enforce("github", "merge", &json!({}), &agent())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PermissionError::Approval {
                status: ApprovalStatus::Rejected,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_enforce_times_out_on_silent_queue() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.set_limit("run-1", dec!(100));
        let queue = Arc::new(InMemoryApprovalQueue::new()); // stays pending
        let engine = PermissionEngine::new(
            registry(),
            ledger,
            queue,
            Duration::from_millis(100),
            Duration::from_secs(2),
        );

        let err = engine
            .enforce("github", "merge", &json!({}), &agent())
            .await
            .unwrap_err();
        assert!(matches!(err, PermissionError::ApprovalTimeout(_)));
    }

    #[tokio::test]
    async fn test_enforce_maps_budget_denial() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.set_limit("run-1", dec!(3));
        let engine = engine_with(ledger, Arc::new(InMemoryApprovalQueue::new()));

        let err = engine
            .enforce("github", "create_pull_request", &json!({}), &agent())
            .await
            .unwrap_err();
        assert!(matches!(err, PermissionError::BudgetExceeded(_)));
    }
}
