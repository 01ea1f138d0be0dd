//! In-memory [`StorageBackend`] used for tests and as a fallback primary
//! when no `--storage-dir` database can be opened.

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::ServerConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::storage::backend::{RecordQuery, StorageBackend};
use crate::storage::record::{CaptureRecord, ServerRuntimeView};

#[derive(Default)]
struct State {
    records: Vec<CaptureRecord>,
    servers: Vec<ServerRuntimeView>,
}

pub struct InMemoryBackend {
    state: Mutex<State>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self { state: Mutex::new(State::default()) }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn write(&self, record: CaptureRecord) -> GatewayResult<()> {
        self.state.lock().records.push(record);
        Ok(())
    }

    async fn update_server_info_for_initialize_request(
        &self,
        session_id: &str,
        id: &turbomcp_protocol::MessageId,
        server_info: crate::session::info_cache::PeerInfo,
    ) -> GatewayResult<()> {
        let mut state = self.state.lock();
        for record in state.records.iter_mut() {
            if let CaptureRecord::Request(req) = record {
                if req.session_id == session_id && req.id.as_ref() == Some(id) {
                    req.server_info = Some(server_info);
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn rekey_session_id(
        &self,
        server_name: &str,
        id: &turbomcp_protocol::MessageId,
        old_session_id: &str,
        new_session_id: &str,
    ) -> GatewayResult<()> {
        let mut state = self.state.lock();
        for record in state.records.iter_mut() {
            if let CaptureRecord::Request(req) = record {
                if req.server_name == server_name
                    && req.session_id == old_session_id
                    && req.id.as_ref() == Some(id)
                {
                    req.session_id = new_session_id.to_string();
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn query_records(&self, query: RecordQuery) -> GatewayResult<Vec<CaptureRecord>> {
        let state = self.state.lock();
        let mut matched: Vec<CaptureRecord> = state
            .records
            .iter()
            .rev()
            .filter(|r| {
                query.server_name.as_deref().is_none_or(|n| r.server_name() == n)
                    && query.session_id.as_deref().is_none_or(|s| r.session_id() == s)
                    && query.method.as_deref().is_none_or(|m| record_method(r).as_deref() == Some(m))
            })
            .cloned()
            .collect();
        if query.limit > 0 {
            matched.truncate(query.limit);
        }
        Ok(matched)
    }

    async fn add_server(&self, config: ServerConfig) -> GatewayResult<()> {
        let mut state = self.state.lock();
        if state.servers.iter().any(|s| s.config.name() == config.name()) {
            return Err(GatewayError::duplicate_server(config.name()));
        }
        state.servers.push(ServerRuntimeView::new(config));
        Ok(())
    }

    async fn remove_server(&self, name: &str) -> GatewayResult<()> {
        let mut state = self.state.lock();
        let before = state.servers.len();
        state.servers.retain(|s| s.config.name() != name);
        if state.servers.len() == before {
            return Err(GatewayError::unknown_server(name));
        }
        Ok(())
    }

    async fn get_servers(&self) -> GatewayResult<Vec<ServerRuntimeView>> {
        Ok(self.state.lock().servers.clone())
    }

    async fn get_server(&self, name: &str) -> GatewayResult<Option<ServerRuntimeView>> {
        Ok(self.state.lock().servers.iter().find(|s| s.config.name() == name).cloned())
    }

    async fn update_server_view(&self, view: ServerRuntimeView) -> GatewayResult<()> {
        let mut state = self.state.lock();
        match state.servers.iter_mut().find(|s| s.config.name() == view.config.name()) {
            Some(slot) => *slot = view,
            None => return Err(GatewayError::unknown_server(view.config.name())),
        }
        Ok(())
    }

    async fn clear_all(&self) -> GatewayResult<()> {
        let mut state = self.state.lock();
        state.records.clear();
        state.servers.clear();
        Ok(())
    }
}

fn record_method(record: &CaptureRecord) -> Option<String> {
    match record {
        CaptureRecord::Request(r) => Some(r.method.clone()),
        CaptureRecord::Response(r) => Some(r.method.clone()),
        CaptureRecord::SseEvent(r) => r.method.clone(),
        CaptureRecord::Error(r) => r.method.clone(),
    }
}
