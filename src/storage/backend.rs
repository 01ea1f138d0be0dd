//! C8 storage backend capability interface (spec.md §4.8, §9 "Dynamic
//! dispatch over backends").

use async_trait::async_trait;

use crate::config::ServerConfig;
use crate::error::GatewayResult;
use crate::storage::record::{CaptureRecord, ServerRuntimeView};

/// A query over persisted capture records, used by `search_records`
/// (ManagementMCP, spec.md §4.11).
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub server_name: Option<String>,
    pub session_id: Option<String>,
    pub method: Option<String>,
    pub limit: usize,
}

/// Capability interface implemented by every storage backend. Grounded on
/// `SqliteStorage` (xzatoma) for the shape of a backend that owns its own
/// connection lifecycle and CRUD surface.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Persist one capture record. Called for every variant of
    /// [`CaptureRecord`]; backends must not reorder records relative to
    /// the order they were handed.
    async fn write(&self, record: CaptureRecord) -> GatewayResult<()>;

    /// The one permitted mutation of an already-persisted record: backfill
    /// `serverInfo` onto the request record matching `(session_id, id)`
    /// once the paired `initialize` response is observed (spec.md §4.7).
    async fn update_server_info_for_initialize_request(
        &self,
        session_id: &str,
        id: &turbomcp_protocol::MessageId,
        server_info: crate::session::info_cache::PeerInfo,
    ) -> GatewayResult<()>;

    /// Rekey an already-persisted request record from `old_session_id` to
    /// `new_session_id`, matched by `(server_name, id)`. The one other
    /// permitted mutation of an append-only record, used when a session id
    /// is adopted from an upstream `initialize` response for a request that
    /// was persisted under the stateless sentinel (spec.md §9 Open
    /// Question; see `DESIGN.md`).
    async fn rekey_session_id(
        &self,
        server_name: &str,
        id: &turbomcp_protocol::MessageId,
        old_session_id: &str,
        new_session_id: &str,
    ) -> GatewayResult<()>;

    async fn query_records(&self, query: RecordQuery) -> GatewayResult<Vec<CaptureRecord>>;

    async fn add_server(&self, config: ServerConfig) -> GatewayResult<()>;

    async fn remove_server(&self, name: &str) -> GatewayResult<()>;

    async fn get_servers(&self) -> GatewayResult<Vec<ServerRuntimeView>>;

    async fn get_server(&self, name: &str) -> GatewayResult<Option<ServerRuntimeView>>;

    /// Update the computed runtime attributes of a registered server
    /// (health, stdio status, activity timestamp, exchange count).
    async fn update_server_view(&self, view: ServerRuntimeView) -> GatewayResult<()>;

    /// Drop all persisted state. Used by tests and explicit operator reset.
    async fn clear_all(&self) -> GatewayResult<()>;
}
