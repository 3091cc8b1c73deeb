//! Safety layer: keeping credentials out of logs.
//!
//! Everything the gateway logs about call arguments goes through
//! [`SecretRedactor`] first, so credential-shaped fields never reach the
//! log stream even at debug level.

mod redact;

pub use redact::{REDACTED, SecretRedactor};
