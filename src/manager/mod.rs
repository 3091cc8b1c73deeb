//! Multi-provider server manager.
//!
//! Owns the set of live provider instances: starts and stops subprocesses,
//! runs per-provider health-check loops, caches each provider's tool list,
//! and aggregates call statistics. One instance per provider id at any
//! time; starting a running provider is a warning no-op.
//!
//! Lifecycle is an explicit state machine
//! (`Stopped -> Starting -> Running -> Unhealthy -> Restarting`) driven
//! only by explicit signals: health-check results, process-exit events,
//! and manual start/stop/restart commands. Start/stop transactions are
//! serialized behind a lifecycle mutex so a concurrent stop and start
//! cannot race the registry into an inconsistent state.

mod stats;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::{GatewaySettings, HealthCheckConfig, ProviderRegistry, Transport};
use crate::error::ManagerError;
use crate::protocol::{ClientEvent, ProtocolClient, ToolDescriptor};

pub use stats::{CallStats, GatewayStats};

/// Maximum jitter added to the disconnect-restart delay.
const RESTART_JITTER_MS: u64 = 1000;

/// Lifecycle state of one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderState {
    Stopped,
    Starting,
    Running,
    Unhealthy,
    Restarting,
}

impl std::fmt::Display for ProviderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Unhealthy => "unhealthy",
            Self::Restarting => "restarting",
        };
        write!(f, "{}", s)
    }
}

/// Lifecycle events emitted on the manager's broadcast channel.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// The manager finished its initial auto-start pass.
    Started,
    ServerStarted {
        provider_id: String,
    },
    ServerStopped {
        provider_id: String,
    },
    ServerRestarted {
        provider_id: String,
        restart_count: u32,
    },
    ServerUnhealthy {
        provider_id: String,
        reason: String,
    },
    ServerError {
        provider_id: String,
        message: String,
    },
}

/// A live provider registered with the manager.
struct ProviderInstance {
    client: Arc<ProtocolClient>,
    state: ProviderState,
    healthy: bool,
    started_at: DateTime<Utc>,
    last_health_check: Option<DateTime<Utc>>,
    restart_count: u32,
    /// Tool cache, replaced wholesale on every successful (re)connect.
    tools: Vec<ToolDescriptor>,
    health_task: Option<JoinHandle<()>>,
}

/// Health snapshot for one provider, as returned by `get_server_health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerHealth {
    pub provider_id: String,
    pub state: ProviderState,
    pub healthy: bool,
    pub started_at: DateTime<Utc>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub restart_count: u32,
}

/// Owns the registry of live providers and their health.
pub struct ServerManager {
    registry: ProviderRegistry,
    settings: GatewaySettings,
    servers: RwLock<HashMap<String, ProviderInstance>>,
    /// Restart counters survive the stop/start cycle of a restart.
    restart_counts: StdMutex<HashMap<String, u32>>,
    /// Serializes start/stop/restart transactions.
    lifecycle: Mutex<()>,
    stats: CallStats,
    events_tx: broadcast::Sender<GatewayEvent>,
    client_events_tx: mpsc::UnboundedSender<ClientEvent>,
    client_events_rx: StdMutex<Option<mpsc::UnboundedReceiver<ClientEvent>>>,
    running: AtomicBool,
}

impl ServerManager {
    /// Create a manager over a provider registry. Nothing is started until
    /// [`start`](Self::start) or [`start_server`](Self::start_server).
    pub fn new(registry: ProviderRegistry, settings: GatewaySettings) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(64);
        let (client_events_tx, client_events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            registry,
            settings,
            servers: RwLock::new(HashMap::new()),
            restart_counts: StdMutex::new(HashMap::new()),
            lifecycle: Mutex::new(()),
            stats: CallStats::new(),
            events_tx,
            client_events_tx,
            client_events_rx: StdMutex::new(Some(client_events_rx)),
            running: AtomicBool::new(false),
        })
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events_tx.subscribe()
    }

    /// The registry this manager serves.
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    fn emit(&self, event: GatewayEvent) {
        // No subscribers is fine.
        let _ = self.events_tx.send(event);
    }

    /// Start all `auto_start` providers, continuing past individual
    /// failures: one bad provider must not block the others.
    pub async fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        self.spawn_event_loop();

        for id in self.registry.auto_start_ids() {
            if let Err(e) = self.start_server(&id).await {
                tracing::error!(provider = %id, "Failed to auto-start provider: {}", e);
                self.emit(GatewayEvent::ServerError {
                    provider_id: id.clone(),
                    message: e.to_string(),
                });
            }
        }
        self.emit(GatewayEvent::Started);
    }

    /// Stop every running provider and the event loop.
    pub async fn stop(self: &Arc<Self>) {
        self.running.store(false, Ordering::SeqCst);
        let ids: Vec<String> = self.servers.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop_server(&id).await {
                tracing::error!(provider = %id, "Error stopping provider: {}", e);
            }
        }
    }

    /// Start one provider: spawn, discover tools, register, begin health
    /// checks. A no-op with a warning if the provider is already running.
    pub async fn start_server(self: &Arc<Self>, id: &str) -> Result<(), ManagerError> {
        let config = self
            .registry
            .get(id)
            .ok_or_else(|| ManagerError::UnknownProvider(id.to_string()))?;
        if config.transport != Transport::Stdio {
            return Err(ManagerError::UnsupportedTransport {
                id: id.to_string(),
                transport: config.transport.to_string(),
            });
        }

        // Disconnect handling must be live even when providers are driven
        // through start_server alone, without the auto-start pass.
        self.running.store(true, Ordering::SeqCst);
        self.spawn_event_loop();

        let _guard = self.lifecycle.lock().await;

        if self.servers.read().await.contains_key(id) {
            tracing::warn!(provider = %id, "Provider already running, ignoring start");
            return Ok(());
        }

        tracing::info!(provider = %id, "Starting provider");
        let client = Arc::new(ProtocolClient::new(
            Arc::clone(&config),
            self.settings.request_timeout,
            self.client_events_tx.clone(),
        ));
        client.connect().await?;

        // Tool discovery is part of startup; a provider that cannot list
        // its tools is not registered.
        let tools = match client.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                client.disconnect().await;
                return Err(ManagerError::Client(e));
            }
        };

        let restart_count = {
            let counts = self.restart_counts.lock().unwrap_or_else(|e| e.into_inner());
            counts.get(id).copied().unwrap_or(0)
        };
        let health_task = config
            .health_check
            .filter(|hc| hc.enabled)
            .map(|hc| self.spawn_health_task(id.to_string(), hc, Arc::clone(&client)));

        let instance = ProviderInstance {
            client,
            state: ProviderState::Running,
            healthy: true,
            started_at: Utc::now(),
            last_health_check: None,
            restart_count,
            tools,
            health_task,
        };
        self.servers.write().await.insert(id.to_string(), instance);

        tracing::info!(provider = %id, "Provider started");
        self.emit(GatewayEvent::ServerStarted {
            provider_id: id.to_string(),
        });
        Ok(())
    }

    /// Stop one provider and drop its registry entries. A no-op if the
    /// provider is not running.
    pub async fn stop_server(self: &Arc<Self>, id: &str) -> Result<(), ManagerError> {
        let _guard = self.lifecycle.lock().await;

        let instance = self.servers.write().await.remove(id);
        let Some(instance) = instance else {
            tracing::debug!(provider = %id, "stop_server on a provider that is not running");
            return Ok(());
        };

        if let Some(task) = instance.health_task {
            task.abort();
        }
        instance.client.disconnect().await;

        tracing::info!(provider = %id, "Provider stopped");
        self.emit(GatewayEvent::ServerStopped {
            provider_id: id.to_string(),
        });
        Ok(())
    }

    /// Restart one provider, bumping its restart counter.
    pub async fn restart_server(self: &Arc<Self>, id: &str) -> Result<(), ManagerError> {
        let restart_count = {
            let mut counts = self.restart_counts.lock().unwrap_or_else(|e| e.into_inner());
            let entry = counts.entry(id.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        tracing::info!(provider = %id, restart_count, "Restarting provider");

        self.stop_server(id).await?;
        self.start_server(id).await?;

        self.emit(GatewayEvent::ServerRestarted {
            provider_id: id.to_string(),
            restart_count,
        });
        Ok(())
    }

    /// Spawn the periodic health-check loop for one provider.
    ///
    /// The probe is `tools/list` under the configured timeout. A failed
    /// probe marks the provider unhealthy and, when `auto_restart` is set,
    /// triggers a restart from a detached task (the restart tears down this
    /// loop along with the instance).
    fn spawn_health_task(
        self: &Arc<Self>,
        id: String,
        hc: HealthCheckConfig,
        client: Arc<ProtocolClient>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(hc.interval_duration());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // the immediate first tick

            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };

                let probe =
                    tokio::time::timeout(hc.timeout_duration(), client.list_tools()).await;
                match probe {
                    Ok(Ok(_)) => manager.mark_healthy(&id).await,
                    Ok(Err(e)) => {
                        manager.on_health_failure(&id, e.to_string()).await;
                    }
                    Err(_) => {
                        manager
                            .on_health_failure(&id, "health check timed out".to_string())
                            .await;
                    }
                }
            }
        })
    }

    async fn mark_healthy(&self, id: &str) {
        let mut servers = self.servers.write().await;
        if let Some(instance) = servers.get_mut(id) {
            instance.healthy = true;
            instance.state = ProviderState::Running;
            instance.last_health_check = Some(Utc::now());
        }
    }

    /// A health probe failed: flag the instance and kick off a restart if
    /// the provider is configured for it.
    async fn on_health_failure(self: &Arc<Self>, id: &str, reason: String) {
        tracing::warn!(provider = %id, "Health check failed: {}", reason);
        {
            let mut servers = self.servers.write().await;
            let Some(instance) = servers.get_mut(id) else {
                return;
            };
            instance.healthy = false;
            instance.state = ProviderState::Unhealthy;
            instance.last_health_check = Some(Utc::now());
        }
        self.emit(GatewayEvent::ServerUnhealthy {
            provider_id: id.to_string(),
            reason,
        });

        let auto_restart = self
            .registry
            .get(id)
            .map(|c| c.auto_restart)
            .unwrap_or(false);
        if auto_restart && self.running.load(Ordering::SeqCst) {
            // Detached: restarting tears down the health task that found
            // the failure.
            let weak = Arc::downgrade(self);
            let id = id.to_string();
            tokio::spawn(async move {
                if let Some(manager) = weak.upgrade() {
                    if let Err(e) = manager.restart_server(&id).await {
                        tracing::error!(provider = %id, "Restart after failed health check failed: {}", e);
                    }
                }
            });
        }
    }

    /// Consume client events (unsolicited disconnects, protocol anomalies).
    fn spawn_event_loop(self: &Arc<Self>) {
        let receiver = {
            let mut slot = self
                .client_events_rx
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        let Some(mut receiver) = receiver else {
            return; // already consuming
        };

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                match event {
                    ClientEvent::Disconnected {
                        provider_id,
                        exit_code,
                        signal,
                    } => {
                        manager
                            .handle_disconnect(&provider_id, exit_code, signal)
                            .await;
                    }
                    ClientEvent::Error {
                        provider_id,
                        message,
                    } => {
                        manager.emit(GatewayEvent::ServerError {
                            provider_id,
                            message,
                        });
                    }
                }
            }
        });
    }

    /// The provider process died outside a health-check failure. Mark it
    /// unhealthy and schedule a delayed restart; the delay (base plus
    /// jitter) keeps a crash-looping provider from restarting in a tight
    /// storm.
    async fn handle_disconnect(
        self: &Arc<Self>,
        id: &str,
        exit_code: Option<i32>,
        signal: Option<i32>,
    ) {
        {
            let mut servers = self.servers.write().await;
            let Some(instance) = servers.get_mut(id) else {
                return; // stopped deliberately; nothing to do
            };
            if instance.client.is_connected() {
                // A fresh instance already replaced the one that died.
                return;
            }
            instance.healthy = false;
            instance.state = ProviderState::Unhealthy;
        }

        tracing::warn!(
            provider = %id,
            exit_code = ?exit_code,
            signal = ?signal,
            "Provider disconnected unexpectedly"
        );
        self.emit(GatewayEvent::ServerUnhealthy {
            provider_id: id.to_string(),
            reason: match signal {
                Some(sig) => format!("process killed by signal {}", sig),
                None => format!("process exited (code {:?})", exit_code),
            },
        });

        let auto_restart = self
            .registry
            .get(id)
            .map(|c| c.auto_restart)
            .unwrap_or(false);
        if !(auto_restart && self.running.load(Ordering::SeqCst)) {
            return;
        }

        let jitter = rand::thread_rng().gen_range(0..RESTART_JITTER_MS);
        let delay = self.settings.restart_delay + Duration::from_millis(jitter);
        let weak = Arc::downgrade(self);
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(manager) = weak.upgrade() else {
                return;
            };
            if !manager.running.load(Ordering::SeqCst) {
                return;
            }
            // Only restart if the dead instance is still the registered one.
            let still_unhealthy = {
                let servers = manager.servers.read().await;
                servers
                    .get(&id)
                    .map(|i| i.state == ProviderState::Unhealthy)
                    .unwrap_or(false)
            };
            if still_unhealthy {
                if let Err(e) = manager.restart_server(&id).await {
                    tracing::error!(provider = %id, "Restart after disconnect failed: {}", e);
                }
            }
        });
    }

    // ── read accessors ───────────────────────────────────────────────────

    /// Whether a provider is registered and running.
    pub async fn is_server_running(&self, id: &str) -> bool {
        self.servers.read().await.contains_key(id)
    }

    /// Cached tools, for one provider or all of them.
    pub async fn list_tools(&self, provider_id: Option<&str>) -> Vec<ToolDescriptor> {
        let servers = self.servers.read().await;
        match provider_id {
            Some(id) => servers
                .get(id)
                .map(|i| i.tools.clone())
                .unwrap_or_default(),
            None => servers.values().flat_map(|i| i.tools.clone()).collect(),
        }
    }

    /// Look up one cached tool descriptor.
    pub async fn get_tool(&self, provider_id: &str, name: &str) -> Option<ToolDescriptor> {
        let servers = self.servers.read().await;
        servers
            .get(provider_id)?
            .tools
            .iter()
            .find(|t| t.name == name)
            .cloned()
    }

    /// Health snapshot for one provider, if it is registered.
    pub async fn get_server_health(&self, id: &str) -> Option<ServerHealth> {
        let servers = self.servers.read().await;
        servers.get(id).map(|i| ServerHealth {
            provider_id: id.to_string(),
            state: i.state,
            healthy: i.healthy,
            started_at: i.started_at,
            last_health_check: i.last_health_check,
            restart_count: i.restart_count,
        })
    }

    /// The live client for a provider, for the invocation path.
    pub async fn client(&self, id: &str) -> Result<Arc<ProtocolClient>, ManagerError> {
        let servers = self.servers.read().await;
        servers
            .get(id)
            .map(|i| Arc::clone(&i.client))
            .ok_or_else(|| ManagerError::NotRunning(id.to_string()))
    }

    /// Record one tool-call outcome into the aggregate statistics.
    pub fn record_tool_call(&self, success: bool, latency_ms: u64) {
        self.stats.record(success, latency_ms);
    }

    /// Aggregate call statistics.
    pub fn get_stats(&self) -> GatewayStats {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(raw: &str) -> ProviderRegistry {
        let configs: Vec<crate::config::ProviderConfig> = serde_json::from_str(raw).unwrap();
        ProviderRegistry::from_configs(configs).unwrap()
    }

    fn manager(raw: &str) -> Arc<ServerManager> {
        ServerManager::new(registry_with(raw), GatewaySettings::default())
    }

    #[tokio::test]
    async fn test_start_unknown_provider() {
        let manager = manager("[]");
        let err = manager.start_server("ghost").await.unwrap_err();
        assert!(matches!(err, ManagerError::UnknownProvider(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_sse_transport_rejected() {
        let manager = manager(
            r#"[{"id": "events", "name": "E", "type": "binary", "binary": "/bin/true",
                 "transport": "sse"}]"#,
        );
        let err = manager.start_server("events").await.unwrap_err();
        assert!(matches!(err, ManagerError::UnsupportedTransport { .. }));
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_registry_empty() {
        let manager = manager(
            r#"[{"id": "bad", "name": "B", "type": "binary",
                 "binary": "/nonexistent/provider", "transport": "stdio"}]"#,
        );
        assert!(manager.start_server("bad").await.is_err());
        assert!(!manager.is_server_running("bad").await);
        assert!(manager.get_server_health("bad").await.is_none());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let manager = manager(
            r#"[{"id": "p", "name": "P", "type": "binary",
                 "binary": "/nonexistent/provider", "transport": "stdio"}]"#,
        );
        manager.stop_server("p").await.unwrap();
        manager.stop_server("p").await.unwrap();
    }

    #[tokio::test]
    async fn test_auto_start_continues_past_failures() {
        // Both providers fail to spawn; start() must not bail on the first.
        let manager = manager(
            r#"[
                {"id": "a", "name": "A", "type": "binary",
                 "binary": "/nonexistent/a", "transport": "stdio", "autoStart": true},
                {"id": "b", "name": "B", "type": "binary",
                 "binary": "/nonexistent/b", "transport": "stdio", "autoStart": true}
            ]"#,
        );
        let mut events = manager.subscribe();
        manager.start().await;

        let mut errors = 0;
        let mut started = false;
        while let Ok(event) = events.try_recv() {
            match event {
                GatewayEvent::ServerError { .. } => errors += 1,
                GatewayEvent::Started => started = true,
                _ => {}
            }
        }
        assert_eq!(errors, 2);
        assert!(started);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_disconnect_is_observed_without_full_start() {
        // The script answers discovery, lingers briefly, then exits. The
        // exit must be handled even when the provider was brought up with
        // start_server alone, never via the auto-start pass.
        let manager = manager(
            r#"[{"id": "oneshot", "name": "O", "type": "binary", "binary": "/bin/sh",
                 "args": ["-c", "read line; echo '{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"tools\":[]}}'; sleep 0.2"],
                 "transport": "stdio", "autoRestart": true}]"#,
        );
        manager.start_server("oneshot").await.unwrap();
        assert!(manager.is_server_running("oneshot").await);

        tokio::time::sleep(Duration::from_millis(800)).await;

        let health = manager.get_server_health("oneshot").await.unwrap();
        assert!(!health.healthy);
        assert_eq!(health.state, ProviderState::Unhealthy);
    }

    #[tokio::test]
    async fn test_read_accessors_on_empty_registry() {
        let manager = manager("[]");
        assert!(manager.list_tools(None).await.is_empty());
        assert!(manager.get_tool("x", "y").await.is_none());
        assert!(manager.client("x").await.is_err());

        manager.record_tool_call(true, 10);
        manager.record_tool_call(false, 30);
        let stats = manager.get_stats();
        assert_eq!(stats.total_calls, 2);
        assert_eq!(stats.failures, 1);
    }
}
