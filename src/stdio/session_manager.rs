//! C5: multiplexes MCP sessions onto one or many [`StdioProcess`]
//! instances (spec.md §4.5).

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{info, warn};
use turbomcp_protocol::MessageId;
use turbomcp_protocol::jsonrpc::{JsonRpcRequest, JsonRpcResponse, ResponseId};

use crate::config::ServerConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::stdio::process::{ProcessState, StdioProcess};

fn message_id_to_wire_string(id: &MessageId) -> String {
    match id {
        MessageId::String(s) => format!("s:{s}"),
        MessageId::Number(n) => format!("n:{n}"),
    }
}

struct SharedSpawnArgs {
    command: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: HashMap<String, String>,
    request_timeout: Duration,
}

impl SharedSpawnArgs {
    fn from_config(config: &ServerConfig) -> GatewayResult<Self> {
        match config {
            ServerConfig::Stdio { command, args, cwd, env, .. } => Ok(Self {
                command: command.clone(),
                args: args.clone(),
                cwd: cwd.clone(),
                env: env.clone(),
                request_timeout: config.request_timeout(),
            }),
            ServerConfig::Http { .. } => {
                Err(GatewayError::configuration("not a stdio server configuration"))
            }
        }
    }

    async fn spawn(&self) -> GatewayResult<StdioProcess> {
        StdioProcess::spawn(
            &self.command,
            &self.args,
            self.cwd.as_ref(),
            &self.env,
            self.request_timeout,
        )
        .await
    }
}

/// Ceiling for the synthesized `initialize` call when bringing a shared
/// subprocess up (spec.md §4.5).
const SHARED_INITIALIZE_CEILING: Duration = Duration::from_secs(60);

struct SharedState {
    process: Option<StdioProcess>,
    crash_reason: Option<String>,
}

struct IsolatedEntry {
    process: StdioProcess,
    last_activity: Mutex<Instant>,
}

enum Mode {
    Shared(Mutex<SharedState>),
    Isolated { sessions: DashMap<String, IsolatedEntry>, cap: usize },
}

/// One manager per stdio-backed server registration.
pub struct StdioSessionManager {
    spawn_args: SharedSpawnArgs,
    mode: Mode,
}

impl StdioSessionManager {
    pub fn new(config: &ServerConfig, isolated_session_cap: usize) -> GatewayResult<Self> {
        let spawn_args = SharedSpawnArgs::from_config(config)?;
        let mode = match config {
            ServerConfig::Stdio { session_mode, .. } => match session_mode {
                crate::config::SessionMode::Shared => {
                    Mode::Shared(Mutex::new(SharedState { process: None, crash_reason: None }))
                }
                crate::config::SessionMode::Isolated => {
                    Mode::Isolated { sessions: DashMap::new(), cap: isolated_session_cap }
                }
            },
            ServerConfig::Http { .. } => unreachable!("validated by from_config"),
        };
        Ok(Self { spawn_args, mode })
    }

    /// Bring the shared subprocess up by sending a synthesized
    /// `initialize`. No-op for isolated mode (each session initializes on
    /// first use).
    pub async fn initialize(&self) -> GatewayResult<()> {
        let Mode::Shared(state) = &self.mode else { return Ok(()) };

        let process = self.spawn_args.spawn().await?;
        let init_request = JsonRpcRequest {
            jsonrpc: turbomcp_protocol::jsonrpc::JsonRpcVersion,
            method: "initialize".to_string(),
            params: Some(serde_json::json!({
                "protocolVersion": crate::MCP_PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": "mcp-gateway", "version": crate::VERSION},
            })),
            id: MessageId::Number(0),
        };

        let outcome = tokio::time::timeout(SHARED_INITIALIZE_CEILING, process.send(init_request)).await;
        match outcome {
            Ok(Ok(_response)) => {
                let mut guard = state.lock();
                guard.process = Some(process);
                guard.crash_reason = None;
                info!("shared stdio process ready");
                Ok(())
            }
            Ok(Err(e)) => {
                process.terminate().await;
                let mut guard = state.lock();
                guard.process = None;
                guard.crash_reason = Some(e.to_string());
                Err(GatewayError::process_crashed(format!("initialize failed: {e}")))
            }
            Err(_) => {
                process.terminate().await;
                let mut guard = state.lock();
                guard.process = None;
                guard.crash_reason = Some("initialize timed out".to_string());
                Err(GatewayError::timeout("stdio initialize", SHARED_INITIALIZE_CEILING.as_millis() as u64))
            }
        }
    }

    /// Send a request for the given session. `session_id` is `None` only
    /// for requests with no session identity at all, which is invalid in
    /// isolated mode (spec.md §4.5).
    pub async fn send(
        &self,
        session_id: Option<&str>,
        mut request: JsonRpcRequest,
    ) -> GatewayResult<JsonRpcResponse> {
        match &self.mode {
            Mode::Shared(state) => {
                let process = {
                    let guard = state.lock();
                    guard.process.clone()
                };
                let Some(process) = process else {
                    return Err(GatewayError::process_crashed(
                        "shared stdio process crashed; use the restart control",
                    ));
                };
                if process.state() != ProcessState::Running {
                    return Err(GatewayError::process_crashed(
                        "shared stdio process crashed; use the restart control",
                    ));
                }

                let session_id = session_id.unwrap_or(crate::session::STATELESS_SESSION_ID);
                let original_id = request.id.clone();
                let wire_id = MessageId::String(format!(
                    "{session_id}:{}",
                    message_id_to_wire_string(&original_id)
                ));
                request.id = wire_id;

                let mut response = process.send(request).await?;
                response.id = ResponseId(Some(original_id));
                Ok(response)
            }
            Mode::Isolated { sessions, cap } => {
                let Some(session_id) = session_id else {
                    return Err(GatewayError::invalid_request(
                        "isolated stdio servers require a session id",
                    ));
                };

                if let Some(entry) = sessions.get(session_id) {
                    if entry.process.state() != ProcessState::Running {
                        drop(entry);
                        sessions.remove(session_id);
                        return Err(GatewayError::session_crashed(session_id));
                    }
                    *entry.last_activity.lock() = Instant::now();
                    return entry.process.send(request).await;
                }

                if request.method != "initialize" {
                    return Err(GatewayError::session_not_found(session_id));
                }

                if sessions.len() >= *cap {
                    self.evict_lru(sessions).await;
                }

                let process = self.spawn_args.spawn().await?;
                let response = process.send(request).await?;
                sessions.insert(
                    session_id.to_string(),
                    IsolatedEntry { process, last_activity: Mutex::new(Instant::now()) },
                );
                Ok(response)
            }
        }
    }

    async fn evict_lru(&self, sessions: &DashMap<String, IsolatedEntry>) {
        let oldest = sessions
            .iter()
            .map(|e| (e.key().clone(), *e.value().last_activity.lock()))
            .min_by_key(|(_, last_activity)| *last_activity)
            .map(|(key, _)| key);

        if let Some(key) = oldest {
            if let Some((_, entry)) = sessions.remove(&key) {
                warn!(session_id = %key, "evicting LRU isolated session");
                entry.process.terminate().await;
            }
        }
    }

    /// Terminate the current process (if any), clear state, and
    /// `initialize()` again. Only supported in shared mode.
    pub async fn restart(&self) -> GatewayResult<()> {
        match &self.mode {
            Mode::Shared(state) => {
                let previous = {
                    let mut guard = state.lock();
                    guard.process.take()
                };
                if let Some(process) = previous {
                    process.terminate().await;
                }
                self.initialize().await
            }
            Mode::Isolated { .. } => Err(GatewayError::RestartNotSupported),
        }
    }

    pub fn session_count(&self) -> Option<usize> {
        match &self.mode {
            Mode::Shared(_) => None,
            Mode::Isolated { sessions, .. } => Some(sessions.len()),
        }
    }

    /// Shared-mode process state, or `None` if no process has been spawned
    /// yet ("stopped") or this manager runs in isolated mode (spec.md §4.9).
    pub fn shared_state(&self) -> Option<ProcessState> {
        match &self.mode {
            Mode::Shared(state) => state.lock().process.as_ref().map(StdioProcess::state),
            Mode::Isolated { .. } => None,
        }
    }

    /// Whether any isolated-mode session currently has a running subprocess.
    pub fn has_running_isolated_session(&self) -> bool {
        match &self.mode {
            Mode::Shared(_) => false,
            Mode::Isolated { sessions, .. } => {
                sessions.iter().any(|e| e.process.state() == ProcessState::Running)
            }
        }
    }

    pub fn is_isolated(&self) -> bool {
        matches!(self.mode, Mode::Isolated { .. })
    }

    pub async fn shutdown(&self) {
        match &self.mode {
            Mode::Shared(state) => {
                let process = state.lock().process.take();
                if let Some(process) = process {
                    process.terminate().await;
                }
            }
            Mode::Isolated { sessions, .. } => {
                let keys: Vec<String> = sessions.iter().map(|e| e.key().clone()).collect();
                for key in keys {
                    if let Some((_, entry)) = sessions.remove(&key) {
                        entry.process.terminate().await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn shared_config() -> ServerConfig {
        ServerConfig::Stdio {
            name: "demo".to_string(),
            command: "cat".to_string(),
            args: vec![],
            cwd: None,
            env: Map::new(),
            session_mode: crate::config::SessionMode::Shared,
            request_timeout_secs: None,
            health_interval_secs: None,
        }
    }

    fn isolated_config() -> ServerConfig {
        ServerConfig::Stdio {
            name: "demo".to_string(),
            command: "cat".to_string(),
            args: vec![],
            cwd: None,
            env: Map::new(),
            session_mode: crate::config::SessionMode::Isolated,
            request_timeout_secs: None,
            health_interval_secs: None,
        }
    }

    #[tokio::test]
    async fn isolated_send_without_session_id_is_invalid() {
        let manager = StdioSessionManager::new(&isolated_config(), 100).unwrap();
        let req = JsonRpcRequest {
            jsonrpc: turbomcp_protocol::jsonrpc::JsonRpcVersion,
            method: "tools/list".to_string(),
            params: None,
            id: MessageId::Number(1),
        };
        let err = manager.send(None, req).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn isolated_unknown_session_non_initialize_is_not_found() {
        let manager = StdioSessionManager::new(&isolated_config(), 100).unwrap();
        let req = JsonRpcRequest {
            jsonrpc: turbomcp_protocol::jsonrpc::JsonRpcVersion,
            method: "tools/list".to_string(),
            params: None,
            id: MessageId::Number(1),
        };
        let err = manager.send(Some("s1"), req).await.unwrap_err();
        assert!(matches!(err, GatewayError::SessionNotFound { .. }));
    }

    #[tokio::test]
    async fn restart_not_supported_in_isolated_mode() {
        let manager = StdioSessionManager::new(&isolated_config(), 100).unwrap();
        assert!(matches!(manager.restart().await, Err(GatewayError::RestartNotSupported)));
    }

    #[tokio::test]
    async fn shared_send_before_initialize_reports_crashed() {
        let manager = StdioSessionManager::new(&shared_config(), 100).unwrap();
        let req = JsonRpcRequest {
            jsonrpc: turbomcp_protocol::jsonrpc::JsonRpcVersion,
            method: "tools/list".to_string(),
            params: None,
            id: MessageId::Number(1),
        };
        let err = manager.send(Some("s1"), req).await.unwrap_err();
        assert!(matches!(err, GatewayError::ProcessCrashed { .. }));
    }
}
