//! toolgate: a governed gateway between autonomous agents and external
//! tool providers.
//!
//! Providers are subprocesses speaking newline-delimited JSON-RPC 2.0 over
//! stdio. The gateway supervises their lifecycles, discovers their tools,
//! and routes every invocation through a layered permission check (caller
//! allowlist, per-tool policy, budget, custom rules, rate limits, human
//! approval) before execution with bounded retry and budget settlement.
//!
//! Entry points:
//! - [`config::ProviderRegistry`] loads and validates provider definitions.
//! - [`manager::ServerManager`] owns provider processes and health loops.
//! - [`gateway::InvocationGateway`] is the call surface agents talk to.

pub mod approvals;
pub mod config;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod ledger;
pub mod manager;
pub mod permissions;
pub mod protocol;
pub mod safety;

pub use config::{GatewaySettings, ProviderConfig, ProviderRegistry};
pub use error::{InvokeError, ManagerError, PermissionError};
pub use gateway::InvocationGateway;
pub use identity::{AgentIdentity, CallerType};
pub use manager::{GatewayEvent, ProviderState, ServerManager};
pub use protocol::{ToolDescriptor, ToolResult};
