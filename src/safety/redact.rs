//! Recursive secret redaction for log output.

use aho_corasick::AhoCorasick;
use serde_json::Value;

/// Replacement for redacted values.
pub const REDACTED: &str = "***REDACTED***";

/// Field-name fragments that mark a value as a credential.
const SECRET_KEYWORDS: &[&str] = &[
    "password",
    "token",
    "secret",
    "apikey",
    "accesstoken",
    "privatekey",
    "credential",
];

/// Masks credential-shaped fields before anything is logged.
///
/// A field is redacted when its name contains any keyword from the fixed
/// list, matched case-insensitively, and its value is a string. Redaction
/// recurses into nested objects and arrays.
pub struct SecretRedactor {
    matcher: AhoCorasick,
}

impl SecretRedactor {
    /// Build a redactor with the default keyword list.
    pub fn new() -> Self {
        let matcher = AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .build(SECRET_KEYWORDS)
            .expect("Failed to build secret keyword matcher");
        Self { matcher }
    }

    /// Whether a field name looks like a credential.
    pub fn is_sensitive_key(&self, key: &str) -> bool {
        self.matcher.is_match(key)
    }

    /// Return a copy of `value` with credential-shaped string fields
    /// replaced by [`REDACTED`].
    pub fn redact(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let redacted = map
                    .iter()
                    .map(|(key, v)| {
                        let new_value = if self.is_sensitive_key(key) && v.is_string() {
                            Value::String(REDACTED.to_string())
                        } else {
                            self.redact(v)
                        };
                        (key.clone(), new_value)
                    })
                    .collect();
                Value::Object(redacted)
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact(v)).collect()),
            other => other.clone(),
        }
    }
}

impl Default for SecretRedactor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_redacts_api_key() {
        let redactor = SecretRedactor::new();
        let args = json!({"apiKey": "sk-test-123", "repo": "octo/repo"});
        assert_eq!(
            redactor.redact(&args),
            json!({"apiKey": REDACTED, "repo": "octo/repo"})
        );
    }

    #[test]
    fn test_redacts_nested_objects() {
        let redactor = SecretRedactor::new();
        let args = json!({
            "config": {
                "auth": {"accessToken": "abc", "user": "dev"},
                "privateKeyPem": "-----BEGIN-----"
            }
        });
        assert_eq!(
            redactor.redact(&args),
            json!({
                "config": {
                    "auth": {"accessToken": REDACTED, "user": "dev"},
                    "privateKeyPem": REDACTED
                }
            })
        );
    }

    #[test]
    fn test_keyword_match_is_case_insensitive() {
        let redactor = SecretRedactor::new();
        assert!(redactor.is_sensitive_key("GITHUB_TOKEN"));
        assert!(redactor.is_sensitive_key("Password"));
        assert!(redactor.is_sensitive_key("clientSecretValue"));
        assert!(!redactor.is_sensitive_key("title"));
    }

    #[test]
    fn test_non_string_values_untouched() {
        let redactor = SecretRedactor::new();
        // Only string values are masked; a numeric "token_count" style
        // field passes through.
        let args = json!({"tokenCount": 42, "password": 1234});
        assert_eq!(redactor.redact(&args), args);
    }

    #[test]
    fn test_redacts_inside_arrays() {
        let redactor = SecretRedactor::new();
        let args = json!([{"token": "t1"}, {"token": "t2"}]);
        assert_eq!(
            redactor.redact(&args),
            json!([{"token": REDACTED}, {"token": REDACTED}])
        );
    }
}
