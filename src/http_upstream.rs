//! C6: forwards a prepared JSON-RPC request to an HTTP MCP server, honoring
//! SSE vs JSON response framing (spec.md §4.6).

use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;

use crate::error::{GatewayError, GatewayResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Session identity header exchanged with HTTP MCP servers (spec.md §6).
pub const SESSION_HEADER: &str = "mcp-session-id";
const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

/// Outcome of forwarding a request, branched on the upstream's
/// `Content-Type` (spec.md §4.6).
pub enum UpstreamResponse {
    Json { body: Value, http_status: u16, adopted_session_id: Option<String> },
    /// `reqwest::Response` is handed back whole so the caller can consume
    /// `bytes_stream()` and tee it through the SSE Framer without buffering.
    Sse { response: reqwest::Response, http_status: u16 },
    /// The upstream's body was not valid JSON (a non-2xx error page from an
    /// intermediary, for instance). The original status, content type, and
    /// raw bytes are carried through unparsed for pass-through to the client
    /// (spec.md §4.6: "pass-through of the original status/body").
    Raw { http_status: u16, content_type: Option<String>, body: Vec<u8> },
}

/// Forwards JSON-RPC requests to one configured HTTP MCP server.
pub struct HttpUpstream {
    client: reqwest::Client,
    url: String,
    headers: HashMap<String, String>,
}

impl HttpUpstream {
    pub fn new(url: String, headers: HashMap<String, String>) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_idle_timeout(Some(IDLE_TIMEOUT))
            .build()
            .map_err(|e| GatewayError::configuration(format!("failed to build http client: {e}")))?;
        Ok(Self { client, url, headers })
    }

    /// Forward `request_body` to the upstream, passing through the
    /// server's static headers plus `MCP-Protocol-Version` and
    /// `Mcp-Session-Id` (case-insensitive on the wire).
    pub async fn forward(
        &self,
        request_body: &Value,
        session_id: Option<&str>,
        protocol_version: Option<&str>,
    ) -> GatewayResult<UpstreamResponse> {
        let mut req = self.client.post(&self.url).header("content-type", "application/json").json(request_body);

        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }
        if let Some(version) = protocol_version {
            req = req.header(PROTOCOL_VERSION_HEADER, version);
        }
        if let Some(session_id) = session_id {
            req = req.header(SESSION_HEADER, session_id);
        }

        let response = req.send().await?;
        let http_status = response.status().as_u16();

        let is_sse = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        if is_sse {
            return Ok(UpstreamResponse::Sse { response, http_status });
        }

        let adopted_session_id = session_header(response.headers());
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await?;

        match serde_json::from_slice::<Value>(&bytes) {
            Ok(body) => Ok(UpstreamResponse::Json { body, http_status, adopted_session_id }),
            Err(_) => Ok(UpstreamResponse::Raw { http_status, content_type, body: bytes.to_vec() }),
        }
    }
}

fn session_header(headers: &HeaderMap) -> Option<String> {
    let name = HeaderName::from_static(SESSION_HEADER);
    headers.get(name).and_then(|v: &HeaderValue| v.to_str().ok()).map(str::to_string)
}
