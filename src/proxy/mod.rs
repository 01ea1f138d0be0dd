//! C10: the per-request HTTP surface that forwards MCP traffic to a
//! registered server while the capture pipeline observes every exchange
//! (spec.md §4.10, §6 "External Interfaces").

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tracing::warn;

use crate::capture::value_to_message_id;
use crate::error::GatewayError;
use crate::gateway::{DispatchOutcome, Gateway};
use crate::session::STATELESS_SESSION_ID;

const SESSION_HEADER: &str = "mcp-session-id";

/// Shared state handed to every proxy route.
#[derive(Clone)]
pub struct ProxyState {
    pub gateway: Arc<Gateway>,
}

fn session_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .unwrap_or(STATELESS_SESSION_ID)
        .to_string()
}

fn parse_error_response(id: Option<Value>) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": -32700, "message": "Parse error" }
    })
}

/// `POST /servers/{name}/mcp` and its `/s/{name}/mcp` alias (spec.md §6):
/// the per-request algorithm that forwards one JSON-RPC exchange to a
/// registered server, capturing the request, response, and any SSE
/// events along the way.
pub async fn handle_mcp_request(
    State(state): State<ProxyState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !state.gateway.has_server(&name) {
        return GatewayError::unknown_server(&name).into_response();
    }

    let request: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        // The body failed to parse as JSON at all, so there is no `id` to
        // recover from it either; a parse-error `id` of `null` is correct
        // per JSON-RPC 2.0.
        Err(_) => return (StatusCode::BAD_REQUEST, Json(parse_error_response(None))).into_response(),
    };

    let session_id = session_id_from_headers(&headers);
    let method = request.get("method").and_then(Value::as_str).unwrap_or_default().to_string();

    state.gateway.capture().on_request(&name, &session_id, &request).await;

    match state.gateway.dispatch(&name, &session_id, &request).await {
        Ok(DispatchOutcome::Json { body, http_status }) => {
            state
                .gateway
                .capture()
                .on_response(&name, &session_id, &body, Some(&method), Some(http_status))
                .await;
            let status = StatusCode::from_u16(http_status).unwrap_or(StatusCode::OK);
            (status, Json(body)).into_response()
        }
        Ok(DispatchOutcome::Sse { response, http_status }) => {
            stream_sse_response(state, name, session_id, response, http_status)
        }
        Ok(DispatchOutcome::Raw { http_status, content_type, body }) => {
            // The upstream replied with a body that is not JSON-RPC (e.g. an
            // HTML error page from an intermediary proxy). Pass the original
            // status and bytes through to the client untouched rather than
            // collapsing it into a synthesized 502 (spec.md §4.6, §6).
            let synthetic = GatewayError::upstream_transport(format!(
                "upstream returned a non-json body (status {http_status})"
            ));
            state.gateway.capture().on_error(&name, &session_id, &request, &synthetic, Some(http_status)).await;

            let status = StatusCode::from_u16(http_status).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut response = Response::builder().status(status);
            if let Some(content_type) = content_type {
                response = response.header("content-type", content_type);
            }
            response
                .body(axum::body::Body::from(body))
                .unwrap_or_else(|_| GatewayError::storage("failed to build passthrough response").into_response())
        }
        Err(e) => {
            state.gateway.capture().on_error(&name, &session_id, &request, &e, None).await;
            e.into_response()
        }
    }
}

/// Tee an upstream SSE body through the incremental framer, persisting
/// each parsed JSON-RPC message as it arrives, then proxy the raw bytes
/// through unmodified (spec.md §4.3, §4.10 step 7).
///
/// A framed message whose `id` matches a request still outstanding for this
/// session is itself the response to that request and is persisted via
/// `on_response` (terminating the duration measurement and running the
/// `initialize` server-info backfill like any other response); only
/// id-less or non-matching messages (progress notifications, and the like)
/// are persisted as `sse-event` records (spec.md §4.7, §8 scenario 5).
fn stream_sse_response(
    state: ProxyState,
    server_name: String,
    session_id: String,
    upstream: reqwest::Response,
    http_status: u16,
) -> Response {
    use crate::sse::SseFramer;

    let status = StatusCode::from_u16(http_status).unwrap_or(StatusCode::OK);
    let seed = (upstream.bytes_stream(), SseFramer::new(), state.gateway.clone(), server_name, session_id, http_status);

    let body_stream = stream::unfold(seed, |(mut byte_stream, mut framer, gateway, server_name, session_id, http_status)| async move {
        match byte_stream.next().await {
            Some(Ok(bytes)) => {
                for event in framer.feed(&bytes) {
                    if let Some(message) = event.data_as_json() {
                        let capture = gateway.capture();
                        let message_id = message.get("id").and_then(value_to_message_id);
                        let is_response = message_id
                            .as_ref()
                            .is_some_and(|id| capture.is_outstanding_response(&session_id, id));

                        if is_response {
                            capture.on_response(&server_name, &session_id, &message, None, Some(http_status)).await;
                        } else {
                            capture.on_sse_event(&server_name, &session_id, &message, event.id.clone()).await;
                        }
                    }
                }
                let item = Ok::<_, std::io::Error>(bytes);
                Some((item, (byte_stream, framer, gateway, server_name, session_id, http_status)))
            }
            Some(Err(e)) => {
                warn!(server = %server_name, error = %e, "sse upstream stream error");
                None
            }
            None => None,
        }
    });

    Response::builder()
        .status(status)
        .header("content-type", "text/event-stream")
        .body(axum::body::Body::from_stream(body_stream))
        .unwrap_or_else(|_| GatewayError::storage("failed to build sse response").into_response())
}

impl IntoResponse for &GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error = self.to_jsonrpc_error();
        (status, Json(serde_json::json!({ "jsonrpc": "2.0", "id": Value::Null, "error": error }))).into_response()
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (&self).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use std::collections::HashMap;

    fn config(storage_dir: std::path::PathBuf) -> GatewayConfig {
        GatewayConfig {
            storage_dir,
            bind: "127.0.0.1".to_string(),
            port: 0,
            auth_token: secrecy::SecretString::from("test-token".to_string()),
            isolated_session_cap: GatewayConfig::DEFAULT_ISOLATED_CAP,
            max_body_bytes: GatewayConfig::DEFAULT_MAX_BODY_BYTES,
        }
    }

    #[tokio::test]
    async fn unknown_server_returns_unknown_server_status() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::init(config(dir.path().to_path_buf())).await.unwrap();
        let state = ProxyState { gateway };

        let response = handle_mcp_request(
            State(state),
            Path("nope".to_string()),
            HeaderMap::new(),
            Bytes::from_static(b"{}"),
        )
        .await;

        assert_eq!(response.status(), GatewayError::unknown_server("nope").status_code());
    }

    #[tokio::test]
    async fn malformed_body_returns_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::init(config(dir.path().to_path_buf())).await.unwrap();
        gateway
            .add_server(crate::config::ServerConfig::Http {
                name: "demo".into(),
                url: "http://127.0.0.1:1/mcp".into(),
                headers: HashMap::new(),
            })
            .await
            .unwrap();
        let state = ProxyState { gateway };

        let response = handle_mcp_request(
            State(state),
            Path("demo".to_string()),
            HeaderMap::new(),
            Bytes::from_static(b"not json"),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn session_id_from_headers_falls_back_to_stateless() {
        let headers = HeaderMap::new();
        assert_eq!(session_id_from_headers(&headers), STATELESS_SESSION_ID);
    }

    #[test]
    fn session_id_from_headers_reads_mcp_session_id() {
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_HEADER, "s1".parse().unwrap());
        assert_eq!(session_id_from_headers(&headers), "s1");
    }

    #[tokio::test]
    async fn sse_response_is_captured_as_response_not_sse_event() {
        use crate::storage::{CaptureRecord, RecordQuery};

        async fn handler() -> Response {
            let body = concat!(
                "data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n\n",
                "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\",\"params\":{}}\n\n",
                "data: done\n\n",
            );
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/event-stream")
                .body(axum::body::Body::from(body))
                .unwrap()
        }
        let app = axum::Router::new().route("/mcp", axum::routing::post(handler));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::init(config(dir.path().to_path_buf())).await.unwrap();
        gateway
            .add_server(crate::config::ServerConfig::Http {
                name: "demo".into(),
                url: format!("http://{addr}/mcp"),
                headers: HashMap::new(),
            })
            .await
            .unwrap();
        let state = ProxyState { gateway: gateway.clone() };

        let request_body = serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call"});
        let response = handle_mcp_request(
            State(state),
            Path("demo".to_string()),
            HeaderMap::new(),
            Bytes::from(serde_json::to_vec(&request_body).unwrap()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        // Capture side effects run as the framer sees each chunk, so
        // draining the body fully drives them to completion.
        let _ = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();

        let records = gateway.storage().query_records(RecordQuery::default()).await.unwrap();
        let responses = records.iter().filter(|r| matches!(r, CaptureRecord::Response(_))).count();
        let sse_events = records.iter().filter(|r| matches!(r, CaptureRecord::SseEvent(_))).count();
        assert_eq!(responses, 1, "the id=1 message should be captured as a response, not an sse-event");
        assert_eq!(sse_events, 1, "only the id-less notification should be captured as an sse-event");
    }

    #[tokio::test]
    async fn non_json_upstream_body_passes_through_status_and_bytes() {
        async fn handler() -> Response {
            Response::builder()
                .status(StatusCode::SERVICE_UNAVAILABLE)
                .header("content-type", "text/html")
                .body(axum::body::Body::from("<html>upstream down</html>"))
                .unwrap()
        }
        let app = axum::Router::new().route("/mcp", axum::routing::post(handler));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::init(config(dir.path().to_path_buf())).await.unwrap();
        gateway
            .add_server(crate::config::ServerConfig::Http {
                name: "demo".into(),
                url: format!("http://{addr}/mcp"),
                headers: HashMap::new(),
            })
            .await
            .unwrap();
        let state = ProxyState { gateway };

        let request_body = serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call"});
        let response = handle_mcp_request(
            State(state),
            Path("demo".to_string()),
            HeaderMap::new(),
            Bytes::from(serde_json::to_vec(&request_body).unwrap()),
        )
        .await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"<html>upstream down</html>");
    }
}
