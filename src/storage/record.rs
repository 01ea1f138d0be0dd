//! Capture record and server runtime view data model (spec.md §3).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::info_cache::PeerInfo;

/// One observed JSON-RPC message or transport event, tagged by kind.
/// Append-only except for the narrow `serverInfo` backfill performed by
/// [`crate::capture::CapturePipeline::on_response`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "direction")]
pub enum CaptureRecord {
    #[serde(rename = "request")]
    Request(RequestRecord),
    #[serde(rename = "response")]
    Response(ResponseRecord),
    #[serde(rename = "sse-event")]
    SseEvent(SseEventRecord),
    #[serde(rename = "error")]
    Error(ErrorRecord),
}

impl CaptureRecord {
    pub fn server_name(&self) -> &str {
        match self {
            Self::Request(r) => &r.server_name,
            Self::Response(r) => &r.server_name,
            Self::SseEvent(r) => &r.server_name,
            Self::Error(r) => &r.server_name,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Self::Request(r) => &r.session_id,
            Self::Response(r) => &r.session_id,
            Self::SseEvent(r) => &r.session_id,
            Self::Error(r) => &r.session_id,
        }
    }

    pub fn timestamp(&self) -> chrono::DateTime<chrono::Utc> {
        match self {
            Self::Request(r) => r.timestamp,
            Self::Response(r) => r.timestamp,
            Self::SseEvent(r) => r.timestamp,
            Self::Error(r) => r.timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub server_name: String,
    pub session_id: String,
    pub method: String,
    pub id: Option<turbomcp_protocol::MessageId>,
    pub request: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_info: Option<PeerInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_info: Option<PeerInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub server_name: String,
    pub session_id: String,
    pub method: String,
    pub id: Option<turbomcp_protocol::MessageId>,
    pub response: Value,
    pub http_status: Option<u16>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_info: Option<PeerInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_info: Option<PeerInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SseEventRecord {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub server_name: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<turbomcp_protocol::MessageId>,
    pub event: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sse_event_id: Option<String>,
    /// Set when this event's `data` is a JSON-RPC response with a known
    /// id, making it a duration terminator like an ordinary response
    /// record (spec.md §3: "same fields as response... plus sseEventId").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub server_name: String,
    pub session_id: String,
    pub method: Option<String>,
    pub id: Option<turbomcp_protocol::MessageId>,
    pub error: Value,
    pub http_status: Option<u16>,
    pub duration_ms: u64,
}

/// Liveness classification maintained by [`crate::health::HealthMonitor`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Up,
    Down,
    Unknown,
}

/// Stdio-specific process status, mirrored from [`crate::stdio::ProcessState`]
/// plus the session-manager-level `isolated` classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StdioStatus {
    Stopped,
    Running,
    Crashed,
    Isolated,
}

/// Server configuration plus computed runtime attributes (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRuntimeView {
    pub config: crate::config::ServerConfig,
    pub health: Health,
    pub last_health_check: Option<chrono::DateTime<chrono::Utc>>,
    pub last_activity: Option<chrono::DateTime<chrono::Utc>>,
    pub exchange_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<StdioStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub stderr_logs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_count: Option<usize>,
}

impl ServerRuntimeView {
    pub fn new(config: crate::config::ServerConfig) -> Self {
        Self {
            config,
            health: Health::Unknown,
            last_health_check: None,
            last_activity: None,
            exchange_count: 0,
            status: None,
            pid: None,
            last_error: None,
            stderr_logs: Vec::new(),
            session_count: None,
        }
    }
}
