//! C12: the facade that binds every other component together and owns
//! their lifecycle (spec.md §4 "Gateway facade", §9 "cyclic references").
//!
//! `Gateway` is constructed once at startup from a [`GatewayConfig`] and
//! handed to the router as shared state. Components that do not need the
//! whole facade (RequestTracker, CapturePipeline) are constructed with
//! only the narrow dependencies they require, per the documented design
//! note on breaking cyclic references.

use std::sync::Arc;

use dashmap::DashMap;
use secrecy::SecretString;
use serde_json::Value;
use tracing::{info, warn};
use turbomcp_protocol::MessageId;
use turbomcp_protocol::jsonrpc::{JsonRpcRequest, JsonRpcVersion};

use crate::auth::AuthState;
use crate::capture::CapturePipeline;
use crate::config::{GatewayConfig, ServerConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::health::HealthMonitor;
use crate::http_upstream::{HttpUpstream, UpstreamResponse};
use crate::session::{RequestTracker, STATELESS_SESSION_ID, SessionInfoCache};
use crate::stdio::StdioSessionManager;
use crate::storage::memory::InMemoryBackend;
use crate::storage::sqlite::SqliteBackend;
use crate::storage::{ServerRuntimeView, StorageBackend, StorageManager};

/// Outcome of dispatching one proxied request to its target server,
/// handed back to the HTTP layer for response framing (spec.md §4.10).
pub enum DispatchOutcome {
    Json { body: Value, http_status: u16 },
    Sse { response: reqwest::Response, http_status: u16 },
    /// The upstream's body could not be parsed as JSON; carried through
    /// unparsed so the proxy layer can pass the original status/body to the
    /// client rather than collapsing it into a synthesized error response.
    Raw { http_status: u16, content_type: Option<String>, body: Vec<u8> },
}

/// Owns every long-lived component and the per-server registries that the
/// proxy, management, and health subsystems read from.
pub struct Gateway {
    config: GatewayConfig,
    storage: Arc<StorageManager>,
    tracker: Arc<RequestTracker>,
    info_cache: Arc<SessionInfoCache>,
    capture: Arc<CapturePipeline>,
    http_upstreams: Arc<DashMap<String, Arc<HttpUpstream>>>,
    stdio_managers: Arc<DashMap<String, Arc<StdioSessionManager>>>,
    health: Arc<HealthMonitor>,
    auth: AuthState,
}

impl Gateway {
    /// Build the gateway from configuration: opens (or falls back from) the
    /// sqlite storage backend, restores any previously registered servers,
    /// and spawns the background sweep and health-probe tasks.
    pub async fn init(config: GatewayConfig) -> GatewayResult<Arc<Self>> {
        let backend: Arc<dyn StorageBackend> = match SqliteBackend::new(&config.storage_dir) {
            Ok(backend) => Arc::new(backend),
            Err(e) => {
                warn!(error = %e, "failed to open sqlite storage; falling back to in-memory backend");
                Arc::new(InMemoryBackend::new())
            }
        };
        let storage = Arc::new(StorageManager::new(vec![backend]));
        let tracker = Arc::new(RequestTracker::new());
        let info_cache = Arc::new(SessionInfoCache::new());
        let capture = Arc::new(CapturePipeline::new(tracker.clone(), info_cache.clone(), storage.clone()));
        let http_upstreams = Arc::new(DashMap::new());
        let stdio_managers = Arc::new(DashMap::new());
        let health = Arc::new(HealthMonitor::new(storage.clone(), stdio_managers.clone()));
        let auth = AuthState::new(config.auth_token.clone());

        let gateway = Arc::new(Self {
            config,
            storage,
            tracker,
            info_cache,
            capture,
            http_upstreams,
            stdio_managers,
            health,
            auth,
        });

        gateway.restore_registered_servers().await?;

        gateway.tracker.clone().spawn_sweep_task();
        gateway.health.clone().spawn(std::time::Duration::from_secs(30));

        Ok(gateway)
    }

    /// Build per-server runtime handles (HttpUpstream / StdioSessionManager)
    /// for every server already persisted in storage, e.g. across restarts.
    async fn restore_registered_servers(&self) -> GatewayResult<()> {
        for view in self.storage.get_servers().await? {
            if let Err(e) = self.bring_up(&view.config).await {
                warn!(server = view.config.name(), error = %e, "failed to bring up registered server at startup");
            }
        }
        Ok(())
    }

    /// Construct the runtime handle for one server configuration without
    /// touching storage. Used both at startup restore and by
    /// [`Self::add_server`].
    async fn bring_up(&self, config: &ServerConfig) -> GatewayResult<()> {
        match config {
            ServerConfig::Http { name, url, headers } => {
                let upstream = HttpUpstream::new(url.clone(), headers.clone())?;
                self.http_upstreams.insert(name.clone(), Arc::new(upstream));
            }
            ServerConfig::Stdio { name, .. } => {
                let manager = StdioSessionManager::new(config, self.config.isolated_session_cap)?;
                manager.initialize().await?;
                self.stdio_managers.insert(name.clone(), Arc::new(manager));
            }
        }
        Ok(())
    }

    fn tear_down(&self, name: &str) {
        self.http_upstreams.remove(name);
        self.stdio_managers.remove(name);
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn auth(&self) -> &AuthState {
        &self.auth
    }

    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }

    pub fn capture(&self) -> &Arc<CapturePipeline> {
        &self.capture
    }

    pub fn tracker(&self) -> &Arc<RequestTracker> {
        &self.tracker
    }

    pub fn info_cache(&self) -> &Arc<SessionInfoCache> {
        &self.info_cache
    }

    /// Register a new server (ManagementMCP `add_server`, spec.md §4.11):
    /// validates, persists, then brings the runtime handle up. If bringing
    /// the handle up fails (e.g. the stdio command can't spawn), the
    /// registration is rolled back so storage never names a server with no
    /// usable handle.
    pub async fn add_server(&self, config: ServerConfig) -> GatewayResult<()> {
        self.storage.add_server(config.clone()).await?;
        if let Err(e) = self.bring_up(&config).await {
            let _ = self.storage.remove_server(config.name()).await;
            return Err(e);
        }
        Ok(())
    }

    /// Deregister a server (ManagementMCP `remove_server`): tears down its
    /// runtime handle (terminating any stdio subprocess) and removes it
    /// from storage.
    pub async fn remove_server(&self, name: &str) -> GatewayResult<()> {
        self.storage.remove_server(name).await?;
        if let Some((_, manager)) = self.stdio_managers.remove(name) {
            manager.shutdown().await;
        }
        self.http_upstreams.remove(name);
        Ok(())
    }

    pub async fn list_servers(&self) -> GatewayResult<Vec<ServerRuntimeView>> {
        self.storage.get_servers().await
    }

    /// Dispatch one proxied request to its target (spec.md §4.10 steps
    /// 1-5). The caller is responsible for persisting the request record
    /// via [`Self::capture`] before calling this, and for persisting the
    /// response/SSE records after.
    pub async fn dispatch(
        &self,
        name: &str,
        session_id: &str,
        request: &Value,
    ) -> GatewayResult<DispatchOutcome> {
        if let Some(upstream) = self.http_upstreams.get(name) {
            let session = if session_id == STATELESS_SESSION_ID { None } else { Some(session_id) };
            let response = upstream.forward(request, session, None).await?;
            return Ok(match response {
                UpstreamResponse::Json { body, http_status, adopted_session_id } => {
                    if let Some(adopted) = adopted_session_id {
                        if session.is_none() && adopted != STATELESS_SESSION_ID {
                            if let Some(id) = request.get("id").and_then(value_to_message_id) {
                                self.capture
                                    .adopt_session_id(name, STATELESS_SESSION_ID, &adopted, &id)
                                    .await;
                            }
                        }
                    }
                    DispatchOutcome::Json { body, http_status }
                }
                UpstreamResponse::Sse { response, http_status } => {
                    DispatchOutcome::Sse { response, http_status }
                }
                UpstreamResponse::Raw { http_status, content_type, body } => {
                    DispatchOutcome::Raw { http_status, content_type, body }
                }
            });
        }

        if let Some(manager) = self.stdio_managers.get(name) {
            let rpc_request = value_to_jsonrpc_request(request)?;
            let session = if session_id == STATELESS_SESSION_ID { None } else { Some(session_id) };
            let response = manager.send(session, rpc_request).await?;
            let body = serde_json::to_value(&response)?;
            return Ok(DispatchOutcome::Json { body, http_status: 200 });
        }

        Err(GatewayError::unknown_server(name))
    }

    pub fn has_server(&self, name: &str) -> bool {
        self.http_upstreams.contains_key(name) || self.stdio_managers.contains_key(name)
    }

    pub fn stdio_manager(&self, name: &str) -> Option<Arc<StdioSessionManager>> {
        self.stdio_managers.get(name).map(|entry| entry.clone())
    }

    /// Restart a shared-mode stdio server (ManagementMCP extension point).
    pub async fn restart_stdio_server(&self, name: &str) -> GatewayResult<()> {
        let manager = self.stdio_manager(name).ok_or_else(|| GatewayError::unknown_server(name))?;
        manager.restart().await
    }

    /// Ordered shutdown: terminate every stdio subprocess, then drop the
    /// storage handle (spec.md §6 CLI surface: SIGTERM/SIGINT sequence).
    pub async fn close(&self) {
        info!("shutting down gateway: terminating stdio subprocesses");
        let names: Vec<String> = self.stdio_managers.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, manager)) = self.stdio_managers.remove(&name) {
                manager.shutdown().await;
            }
        }
        self.info_cache.clear();
    }

    pub fn bind_addr(&self) -> GatewayResult<std::net::SocketAddr> {
        format!("{}:{}", self.config.bind, self.config.port)
            .parse()
            .map_err(|e| GatewayError::configuration(format!("invalid bind address: {e}")))
    }
}

fn value_to_message_id(value: &Value) -> Option<MessageId> {
    match value {
        Value::String(s) => Some(MessageId::String(s.clone())),
        Value::Number(n) => n.as_i64().map(MessageId::Number),
        _ => None,
    }
}

fn value_to_jsonrpc_request(value: &Value) -> GatewayResult<JsonRpcRequest> {
    let method = value
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::invalid_request("missing method"))?
        .to_string();
    let id = value
        .get("id")
        .and_then(value_to_message_id)
        .ok_or_else(|| GatewayError::invalid_request("missing or invalid id"))?;
    Ok(JsonRpcRequest { jsonrpc: JsonRpcVersion, method, params: value.get("params").cloned(), id })
}

/// Bearer token resolution: honor `MCP_GATEWAY_TOKEN` if set, otherwise
/// generate and log a fresh one (spec.md §6).
pub fn resolve_auth_token() -> SecretString {
    match std::env::var("MCP_GATEWAY_TOKEN") {
        Ok(token) if !token.is_empty() => SecretString::from(token),
        _ => {
            let token = generate_token();
            info!(token = %token, "MCP_GATEWAY_TOKEN not set; generated a bearer token for this run");
            SecretString::from(token)
        }
    }
}

fn generate_token() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";
    (0..32).map(|_| ALPHABET[fastrand::usize(..ALPHABET.len())] as char).collect()
}
