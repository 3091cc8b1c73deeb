//! Declarative custom policy rules.
//!
//! Instead of free-form callbacks stored in configuration, custom policies
//! are a small tagged-variant rule language interpreted by a fixed
//! evaluator. A rule that fails to evaluate (bad pattern, unexpected
//! argument shape) is treated as a denial by the permission engine, never
//! as a crash.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RuleError;

/// One custom policy rule attached to a tool permission entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CustomRule {
    /// Deny when the serialized arguments exceed `limit` bytes.
    MaxArgSize { limit: usize },
    /// Deny when the named top-level argument is absent.
    RequiredArg { field: String },
    /// Deny when the named string argument matches `pattern`.
    DenyArgPattern { field: String, pattern: String },
    /// All sub-rules must pass.
    AllOf { rules: Vec<CustomRule> },
}

/// Evaluate a rule against the call arguments.
///
/// Returns `Ok(true)` when the call is allowed by this rule.
pub fn evaluate(rule: &CustomRule, args: &Value) -> Result<bool, RuleError> {
    match rule {
        CustomRule::MaxArgSize { limit } => {
            let serialized = serde_json::to_string(args)
                .map_err(|e| RuleError::Inspect(e.to_string()))?;
            Ok(serialized.len() <= *limit)
        }
        CustomRule::RequiredArg { field } => {
            Ok(args.get(field).is_some())
        }
        CustomRule::DenyArgPattern { field, pattern } => {
            let regex = Regex::new(pattern).map_err(|e| RuleError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
            match args.get(field).and_then(Value::as_str) {
                Some(text) => Ok(!regex.is_match(text)),
                // Absent or non-string field: nothing to match, allowed.
                None => Ok(true),
            }
        }
        CustomRule::AllOf { rules } => {
            for sub in rules {
                if !evaluate(sub, args)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
    }
}
