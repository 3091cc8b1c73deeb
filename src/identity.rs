//! Caller identity supplied with every invocation.
//!
//! The identity is always provided by the caller and never inferred by the
//! gateway; the permission engine treats it as ground truth for allowlist
//! and rate-limit decisions.

use serde::{Deserialize, Serialize};

/// Closed enumeration of caller types the gateway recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallerType {
    /// An autonomous agent executing a task.
    Agent,
    /// The orchestrator sequencing multi-step work.
    Orchestrator,
    /// A human operator acting directly.
    Human,
    /// Internal system maintenance (health checks, migrations).
    System,
}

impl std::fmt::Display for CallerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Agent => "agent",
            Self::Orchestrator => "orchestrator",
            Self::Human => "human",
            Self::System => "system",
        };
        write!(f, "{}", s)
    }
}

/// Identity of the caller requesting a tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    /// What kind of caller this is.
    pub caller_type: CallerType,
    /// The run this call is billed and rate-limited against.
    pub run_id: String,
    /// The project the run belongs to.
    pub project_id: String,
    /// The phase of the run (e.g. "plan", "execute", "review").
    pub phase: String,
}

impl AgentIdentity {
    /// Create an identity for an agent run.
    pub fn agent(run_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            caller_type: CallerType::Agent,
            run_id: run_id.into(),
            project_id: project_id.into(),
            phase: "execute".to_string(),
        }
    }

    /// Set the phase.
    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = phase.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_type_serde_roundtrip() {
        let json = serde_json::to_string(&CallerType::Orchestrator).unwrap();
        assert_eq!(json, "\"orchestrator\"");
        let back: CallerType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, CallerType::Orchestrator);
    }

    #[test]
    fn test_display_matches_wire_name() {
        assert_eq!(CallerType::Agent.to_string(), "agent");
        assert_eq!(CallerType::System.to_string(), "system");
    }
}
