//! Provider registry configuration.
//!
//! Providers are declared in a JSON document (one entry per provider) and
//! loaded once at startup; the registry is immutable after load. Invalid
//! entries are fatal: a provider that fails validation is never registered.
//!
//! Runtime tuning (timeouts, retry bounds, poll intervals) comes from the
//! environment via [`GatewaySettings::from_env`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::identity::CallerType;
use crate::permissions::rules::CustomRule;

/// Transport used to talk to a provider process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Newline-delimited JSON-RPC over stdin/stdout. The only transport
    /// implemented here.
    Stdio,
    /// Server-sent events. Accepted by the schema, rejected at start.
    Sse,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdio => write!(f, "stdio"),
            Self::Sse => write!(f, "sse"),
        }
    }
}

/// How to launch the provider process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SpawnSpec {
    /// An npm package run through `npx -y <package>`.
    Npm { package: String },
    /// A python module run through `python -m <module>`.
    Python {
        #[serde(rename = "pythonPackage")]
        python_package: String,
    },
    /// A binary invoked directly.
    Binary { binary: String },
}

/// A monetary amount with its currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetLimit {
    pub amount: Decimal,
    pub currency: String,
}

/// Per-tool permission entry.
///
/// A tool with no entry defaults to allowed. `allowed: false` denies the
/// tool unconditionally, even for otherwise-privileged callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolPermission {
    pub allowed: bool,
    /// Require human approval before executing this tool.
    #[serde(default)]
    pub requires_approval: bool,
    /// Minimum remaining budget required to call this tool. Also used as
    /// the cost estimate for the pre-execution ledger check.
    #[serde(default)]
    pub budget_limit: Option<BudgetLimit>,
    /// Additional rule evaluated against the call arguments.
    #[serde(default)]
    pub custom_policy: Option<CustomRule>,
}

/// Sliding-window rate limit ceilings per (run id, provider).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub max_calls_per_minute: u32,
    pub max_calls_per_hour: u32,
}

/// Permission policy for one provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionPolicy {
    /// Caller types allowed to use this provider at all.
    #[serde(default)]
    pub allowed_caller_types: Vec<CallerType>,
    /// Per-tool overrides. Tools without an entry are allowed.
    #[serde(default)]
    pub tool_permissions: HashMap<String, ToolPermission>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

/// Periodic health-check policy for one provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    pub enabled: bool,
    /// Milliseconds between probes.
    pub interval: u64,
    /// Milliseconds allowed per probe.
    pub timeout: u64,
}

impl HealthCheckConfig {
    pub fn interval_duration(&self) -> Duration {
        Duration::from_millis(self.interval)
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }
}

/// Static configuration for one tool provider. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub spawn: SpawnSpec,
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment merged over the host environment at spawn.
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub transport: Transport,
    #[serde(default)]
    pub permissions: PermissionPolicy,
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub auto_restart: bool,
}

impl ProviderConfig {
    /// Validate a single provider entry.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::Invalid {
                id: self.id.clone(),
                reason: "provider id must not be empty".into(),
            });
        }
        if let Some(hc) = &self.health_check {
            if hc.enabled && (hc.interval == 0 || hc.timeout == 0) {
                return Err(ConfigError::Invalid {
                    id: self.id.clone(),
                    reason: "health check interval and timeout must be non-zero".into(),
                });
            }
        }
        if let Some(rl) = &self.permissions.rate_limit {
            if rl.max_calls_per_minute == 0 || rl.max_calls_per_hour == 0 {
                return Err(ConfigError::Invalid {
                    id: self.id.clone(),
                    reason: "rate limit ceilings must be non-zero".into(),
                });
            }
        }
        match &self.spawn {
            SpawnSpec::Npm { package } if package.trim().is_empty() => Err(ConfigError::Invalid {
                id: self.id.clone(),
                reason: "npm package must not be empty".into(),
            }),
            SpawnSpec::Python { python_package } if python_package.trim().is_empty() => {
                Err(ConfigError::Invalid {
                    id: self.id.clone(),
                    reason: "python package must not be empty".into(),
                })
            }
            SpawnSpec::Binary { binary } if binary.trim().is_empty() => Err(ConfigError::Invalid {
                id: self.id.clone(),
                reason: "binary path must not be empty".into(),
            }),
            _ => Ok(()),
        }
    }
}

/// Immutable set of provider configurations, keyed by provider id.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<ProviderConfig>>,
}

impl ProviderRegistry {
    /// Build a registry from parsed configs, validating each entry.
    pub fn from_configs(configs: Vec<ProviderConfig>) -> Result<Self, ConfigError> {
        let mut providers = HashMap::new();
        for config in configs {
            config.validate()?;
            if providers.contains_key(&config.id) {
                return Err(ConfigError::DuplicateId(config.id));
            }
            providers.insert(config.id.clone(), Arc::new(config));
        }
        Ok(Self { providers })
    }

    /// Load a registry from a JSON file containing an array of providers.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let configs: Vec<ProviderConfig> = serde_json::from_str(&raw)?;
        Self::from_configs(configs)
    }

    /// Look up a provider by id.
    pub fn get(&self, id: &str) -> Option<Arc<ProviderConfig>> {
        self.providers.get(id).cloned()
    }

    /// Iterate all provider configs.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ProviderConfig>> {
        self.providers.values()
    }

    /// All providers flagged for automatic start.
    pub fn auto_start_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .providers
            .values()
            .filter(|c| c.auto_start)
            .map(|c| c.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Runtime tuning for the gateway, read from the environment.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Per-request deadline on the wire protocol.
    pub request_timeout: Duration,
    /// Maximum additional execution attempts after the first.
    pub max_retries: u32,
    /// Base delay for retry backoff.
    pub retry_base_delay: Duration,
    /// Ceiling for retry backoff.
    pub retry_max_delay: Duration,
    /// Interval between approval-status polls.
    pub approval_poll_interval: Duration,
    /// Give up waiting for an approval after this long.
    pub approval_timeout: Duration,
    /// Base delay before restarting a provider that disconnected.
    pub restart_delay: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            approval_poll_interval: Duration::from_secs(2),
            approval_timeout: Duration::from_secs(300),
            restart_delay: Duration::from_secs(5),
        }
    }
}

impl GatewaySettings {
    /// Load settings from the environment, falling back to defaults.
    ///
    /// Reads `.env` if present (dotenv convention). Recognized variables:
    /// `TOOLGATE_REQUEST_TIMEOUT_SECS`, `TOOLGATE_MAX_RETRIES`,
    /// `TOOLGATE_APPROVAL_POLL_SECS`, `TOOLGATE_APPROVAL_TIMEOUT_SECS`,
    /// `TOOLGATE_RESTART_DELAY_SECS`.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let mut settings = Self::default();
        if let Some(v) = env_u64("TOOLGATE_REQUEST_TIMEOUT_SECS") {
            settings.request_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("TOOLGATE_MAX_RETRIES") {
            settings.max_retries = v as u32;
        }
        if let Some(v) = env_u64("TOOLGATE_APPROVAL_POLL_SECS") {
            settings.approval_poll_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("TOOLGATE_APPROVAL_TIMEOUT_SECS") {
            settings.approval_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("TOOLGATE_RESTART_DELAY_SECS") {
            settings.restart_delay = Duration::from_secs(v);
        }
        settings
    }
}

fn env_u64(name: &str) -> Option<u64> {
    match std::env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!("Ignoring invalid value for {}: {:?}", name, raw);
                None
            }
        },
        Err(_) => None,
    }
}
