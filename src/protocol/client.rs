//! Per-provider protocol client.
//!
//! Owns one provider subprocess and the request/response correlation table.
//! Writes to the provider's stdin are serialized behind a mutex, but any
//! number of requests may be outstanding at once; responses are matched by
//! correlation id, so completion order is not FIFO.
//!
//! stdout is read line by line (the buffered reader reassembles partial
//! lines across chunks); stderr is logged for diagnostics and never treated
//! as protocol data.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::config::{ProviderConfig, SpawnSpec};
use crate::error::ClientError;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse, ToolDescriptor, ToolResult};

/// Grace period between SIGTERM and SIGKILL at disconnect.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Default per-request deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Events emitted by a client outside the request/response flow.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The provider process exited or closed its stdout while connected.
    Disconnected {
        provider_id: String,
        exit_code: Option<i32>,
        /// Signal that terminated the process, when there was one.
        signal: Option<i32>,
    },
    /// A non-fatal protocol anomaly (malformed frame, unmatched id).
    Error {
        provider_id: String,
        message: String,
    },
}

type PendingSender = oneshot::Sender<Result<Value, ClientError>>;

/// State shared between the client handle and its reader task.
struct Shared {
    provider_id: String,
    pending: StdMutex<HashMap<u64, PendingSender>>,
    connected: AtomicBool,
    shutting_down: AtomicBool,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl Shared {
    /// Reject every outstanding request with a connection-closed error.
    fn fail_all_pending(&self) {
        let drained: Vec<PendingSender> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.drain().map(|(_, tx)| tx).collect()
        };
        for tx in drained {
            let _ = tx.send(Err(ClientError::ConnectionClosed));
        }
    }

    /// Route one stdout line to its pending request, if any.
    fn dispatch_line(&self, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }

        let response: JsonRpcResponse = match serde_json::from_str(trimmed) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(
                    provider = %self.provider_id,
                    "Ignoring malformed frame from provider: {}",
                    e
                );
                let _ = self.events.send(ClientEvent::Error {
                    provider_id: self.provider_id.clone(),
                    message: format!("malformed frame: {}", e),
                });
                return;
            }
        };

        let Some(id) = response.id.as_ref().and_then(Value::as_u64) else {
            tracing::warn!(
                provider = %self.provider_id,
                "Ignoring response without a numeric id"
            );
            return;
        };

        let sender = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.remove(&id)
        };
        let Some(tx) = sender else {
            // The caller timed out or never existed; drop the frame.
            tracing::warn!(
                provider = %self.provider_id,
                id,
                "Dropping response for unknown or expired request id"
            );
            return;
        };

        let outcome = match response.error {
            Some(err) => Err(ClientError::Rpc {
                code: err.code,
                message: err.message,
            }),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        let _ = tx.send(outcome);
    }
}

/// Client for one provider subprocess.
pub struct ProtocolClient {
    config: Arc<ProviderConfig>,
    request_timeout: Duration,
    next_id: AtomicU64,
    shared: Arc<Shared>,
    stdin: Mutex<Option<ChildStdin>>,
    child: Arc<Mutex<Option<Child>>>,
}

impl ProtocolClient {
    /// Create a client for the given provider. Does not spawn anything
    /// until [`connect`](Self::connect) is called.
    ///
    /// `events` receives [`ClientEvent`]s; the server manager listens on
    /// the other end to drive restart decisions.
    pub fn new(
        config: Arc<ProviderConfig>,
        request_timeout: Duration,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Self {
        let shared = Arc::new(Shared {
            provider_id: config.id.clone(),
            pending: StdMutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            events,
        });
        Self {
            config,
            request_timeout,
            next_id: AtomicU64::new(0),
            shared,
            stdin: Mutex::new(None),
            child: Arc::new(Mutex::new(None)),
        }
    }

    /// Provider id this client serves.
    pub fn provider_id(&self) -> &str {
        &self.config.id
    }

    /// Whether the subprocess is believed to be alive and speaking.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Resolve the spawn command from the provider's spawn spec.
    fn build_command(&self) -> Command {
        let mut command = match &self.config.spawn {
            SpawnSpec::Npm { package } => {
                let mut c = Command::new("npx");
                c.arg("-y").arg(package);
                c
            }
            SpawnSpec::Python { python_package } => {
                let mut c = Command::new("python3");
                c.arg("-m").arg(python_package);
                c
            }
            SpawnSpec::Binary { binary } => Command::new(binary),
        };
        command
            .args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    /// Spawn the provider process and start the reader tasks.
    ///
    /// A spawn failure is returned directly; nothing is retried here.
    pub async fn connect(&self) -> Result<(), ClientError> {
        if self.is_connected() {
            tracing::warn!(provider = %self.config.id, "connect() on an already-connected client");
            return Ok(());
        }

        let mut child = self
            .build_command()
            .spawn()
            .map_err(|source| ClientError::Spawn {
                id: self.config.id.clone(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or_else(|| ClientError::Protocol(
            "provider stdout was not captured".into(),
        ))?;
        let stderr = child.stderr.take();
        let stdin = child.stdin.take().ok_or_else(|| ClientError::Protocol(
            "provider stdin was not captured".into(),
        ))?;

        *self.stdin.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);
        self.shared.shutting_down.store(false, Ordering::SeqCst);
        self.shared.connected.store(true, Ordering::SeqCst);

        // stderr is diagnostics only.
        if let Some(stderr) = stderr {
            let provider_id = self.config.id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(provider = %provider_id, "provider stderr: {}", line);
                }
            });
        }

        // Reader task: dispatch responses until EOF, then flag disconnect.
        let shared = Arc::clone(&self.shared);
        let child_slot = Arc::clone(&self.child);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => shared.dispatch_line(&line),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(provider = %shared.provider_id, "stdout read error: {}", e);
                        break;
                    }
                }
            }

            let was_connected = shared.connected.swap(false, Ordering::SeqCst);
            shared.fail_all_pending();

            if was_connected && !shared.shutting_down.load(Ordering::SeqCst) {
                let status = {
                    let mut slot = child_slot.lock().await;
                    let mut status = None;
                    if let Some(child) = slot.as_mut() {
                        // The exit status can trail the stdout EOF slightly.
                        for _ in 0..10 {
                            if let Ok(Some(s)) = child.try_wait() {
                                status = Some(s);
                                break;
                            }
                            tokio::time::sleep(Duration::from_millis(20)).await;
                        }
                    }
                    status
                };
                let exit_code = status.as_ref().and_then(|s| s.code());
                #[cfg(unix)]
                let signal = status
                    .as_ref()
                    .and_then(std::os::unix::process::ExitStatusExt::signal);
                #[cfg(not(unix))]
                let signal = None;
                tracing::warn!(
                    provider = %shared.provider_id,
                    exit_code = ?exit_code,
                    signal = ?signal,
                    "Provider process disconnected"
                );
                let _ = shared.events.send(ClientEvent::Disconnected {
                    provider_id: shared.provider_id.clone(),
                    exit_code,
                    signal,
                });
            }
        });

        tracing::info!(provider = %self.config.id, "Connected to provider");
        Ok(())
    }

    /// Issue a JSON-RPC request and await its correlated response.
    ///
    /// The request carries the next correlation id; if no response arrives
    /// within the client's timeout, only this call fails and any response
    /// that arrives later is dropped as unmatched.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected(self.config.id.clone()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.insert(id, tx);
        }

        let request = JsonRpcRequest::new(id, method, params);
        let mut line = serde_json::to_string(&request)
            .map_err(|e| ClientError::Protocol(format!("failed to serialize request: {}", e)))?;
        line.push('\n');

        // One writer at a time; the frame goes out as a single line.
        {
            let mut stdin = self.stdin.lock().await;
            let Some(stdin) = stdin.as_mut() else {
                self.remove_pending(id);
                return Err(ClientError::NotConnected(self.config.id.clone()));
            };
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                self.remove_pending(id);
                return Err(ClientError::Write(e));
            }
            if let Err(e) = stdin.flush().await {
                self.remove_pending(id);
                return Err(ClientError::Write(e));
            }
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without a value: the connection went away.
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                self.remove_pending(id);
                Err(ClientError::Timeout(self.request_timeout))
            }
        }
    }

    fn remove_pending(&self, id: u64) {
        let mut pending = self.shared.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.remove(&id);
    }

    /// Ask the provider for its tool set.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ClientError> {
        let result = self.request("tools/list", json!({})).await?;
        let raw = result.get("tools").cloned().unwrap_or(result);
        let mut tools: Vec<ToolDescriptor> = serde_json::from_value(raw)
            .map_err(|e| ClientError::Protocol(format!("invalid tools/list result: {}", e)))?;
        for tool in &mut tools {
            tool.provider_id = self.config.id.clone();
        }
        Ok(tools)
    }

    /// Invoke one tool and wrap the outcome with latency and cost.
    ///
    /// Provider-reported errors become a failed [`ToolResult`]; transport
    /// failures (timeout, closed connection) are returned as errors.
    pub async fn call_tool(&self, name: &str, args: Value) -> Result<ToolResult, ClientError> {
        let start = std::time::Instant::now();
        let outcome = self
            .request("tools/call", json!({"name": name, "arguments": args}))
            .await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => {
                let cost = result
                    .get("cost")
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok());
                let mut tool_result = ToolResult::success(result, elapsed_ms);
                tool_result.cost = cost;
                Ok(tool_result)
            }
            Err(ClientError::Rpc { message, .. }) => {
                Ok(ToolResult::failure(message, elapsed_ms))
            }
            Err(e) => Err(e),
        }
    }

    /// Tear the connection down: reject all pending requests, SIGTERM the
    /// process, and escalate to SIGKILL after a grace period. Idempotent.
    pub async fn disconnect(&self) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.fail_all_pending();

        // Closing stdin lets well-behaved providers exit on their own.
        self.stdin.lock().await.take();

        let child = self.child.lock().await.take();
        let Some(mut child) = child else {
            return;
        };

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }

        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(
                    provider = %self.config.id,
                    status = ?status.code(),
                    "Provider exited after disconnect"
                );
            }
            Ok(Err(e)) => {
                tracing::warn!(provider = %self.config.id, "Error waiting for provider exit: {}", e);
            }
            Err(_) => {
                tracing::warn!(
                    provider = %self.config.id,
                    "Provider did not exit within {:?}, killing",
                    SHUTDOWN_GRACE
                );
                let _ = child.kill().await;
            }
        }
    }
}
