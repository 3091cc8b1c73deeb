//! A minimal stdio tool provider used by the integration tests.
//!
//! Speaks newline-delimited JSON-RPC 2.0 on stdin/stdout and exposes three
//! tools:
//! - `echo`: returns its arguments, with a fixed reported cost
//! - `flaky`: fails with "connection timeout" on its first call, then
//!   succeeds
//! - `reject`: always fails with "invalid argument"
//!
//! Fault injection: when `STUB_FAIL_LIST_AT=<n>` is set, the nth
//! `tools/list` request (1-based) returns a JSON-RPC error. When
//! `STUB_FAIL_FLAG=<path>` is also set, the failure fires only if that file
//! does not exist yet and creates it when it fires, so the fault happens
//! exactly once across process restarts. This lets health-check tests force
//! a single failed probe.

use std::io::Write as _;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};

fn tool_descriptors() -> Value {
    json!([
        {
            "name": "echo",
            "description": "Return the arguments unchanged",
            "inputSchema": {"type": "object"}
        },
        {
            "name": "flaky",
            "description": "Fail once with a transient error, then succeed",
            "inputSchema": {"type": "object"}
        },
        {
            "name": "reject",
            "description": "Always fail with a non-transient error",
            "inputSchema": {"type": "object"}
        }
    ])
}

struct Stub {
    list_calls: u64,
    flaky_calls: u64,
    fail_list_at: Option<u64>,
    fail_flag: Option<String>,
}

impl Stub {
    fn new() -> Self {
        let fail_list_at = std::env::var("STUB_FAIL_LIST_AT")
            .ok()
            .and_then(|v| v.parse().ok());
        let fail_flag = std::env::var("STUB_FAIL_FLAG").ok();
        Self {
            list_calls: 0,
            flaky_calls: 0,
            fail_list_at,
            fail_flag,
        }
    }

    fn should_fail_list(&self) -> bool {
        if self.fail_list_at != Some(self.list_calls) {
            return false;
        }
        match &self.fail_flag {
            Some(path) => {
                if std::path::Path::new(path).exists() {
                    return false;
                }
                let _ = std::fs::write(path, b"fired");
                true
            }
            None => true,
        }
    }

    fn handle(&mut self, request: &Value) -> Value {
        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let method = request.get("method").and_then(Value::as_str).unwrap_or("");
        match method {
            "tools/list" => {
                self.list_calls += 1;
                if self.should_fail_list() {
                    return error_response(id, -32000, "injected tools/list failure");
                }
                result_response(id, json!({"tools": tool_descriptors()}))
            }
            "tools/call" => {
                let name = request
                    .pointer("/params/name")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let args = request
                    .pointer("/params/arguments")
                    .cloned()
                    .unwrap_or(Value::Null);
                self.call(id, name, args)
            }
            _ => error_response(id, -32601, format!("method not found: {}", method)),
        }
    }

    fn call(&mut self, id: Value, name: &str, args: Value) -> Value {
        match name {
            "echo" => result_response(
                id,
                json!({
                    "echo": args,
                    "cost": {"amount": "0.01", "currency": "USD"}
                }),
            ),
            "flaky" => {
                self.flaky_calls += 1;
                if self.flaky_calls == 1 {
                    error_response(id, -32000, "connection timeout")
                } else {
                    result_response(id, json!({"attempts": self.flaky_calls}))
                }
            }
            "reject" => error_response(id, -32602, "invalid argument"),
            other => error_response(id, -32601, format!("unknown tool: {}", other)),
        }
    }
}

fn result_response(id: Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn error_response(id: Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message.into()}
    })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut stub = Stub::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let stdout = std::io::stdout();

    tracing::info!("Stub provider ready");
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Value>(&line) {
            Ok(request) => stub.handle(&request),
            Err(e) => error_response(Value::Null, -32700, format!("parse error: {}", e)),
        };
        let mut out = stdout.lock();
        serde_json::to_writer(&mut out, &response)?;
        out.write_all(b"\n")?;
        out.flush()?;
    }
    tracing::info!("Stdin closed, exiting");
    Ok(())
}
