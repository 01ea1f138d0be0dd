//! OAuth discovery document passthrough for proxied HTTP servers (spec.md
//! §6). The gateway does not issue or validate tokens itself: it fetches
//! the upstream server's own discovery document and republishes it with
//! only the `resource` field rewritten to the gateway's own public URL,
//! preserving every other key byte-for-byte. Grounded on
//! `protected_resource_metadata_router`'s RFC 9728 field shape, adapted
//! from serving static metadata to proxying an upstream's own document.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use tracing::warn;

use crate::config::ServerConfig;
use crate::gateway::Gateway;

const RESOURCE_FIELD: &str = "resource";

#[derive(Clone)]
pub struct OauthState {
    pub gateway: Arc<Gateway>,
    pub public_url: String,
}

async fn fetch_and_rewrite(state: &OauthState, server_name: &str, doc_name: &str, mcp_path: &str) -> Response {
    let view = match state.gateway.storage().get_server(server_name).await {
        Ok(Some(view)) => view,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            warn!(server = server_name, error = %e, "failed to look up server for oauth discovery");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let ServerConfig::Http { url, .. } = &view.config else {
        // stdio servers have no upstream HTTP discovery document to proxy.
        return StatusCode::NOT_FOUND.into_response();
    };
    let origin = match reqwest::Url::parse(url) {
        Ok(parsed) => format!("{}://{}", parsed.scheme(), parsed.authority()),
        Err(_) => return StatusCode::BAD_GATEWAY.into_response(),
    };
    let discovery_url = format!("{origin}/.well-known/{doc_name}{mcp_path}");

    let response = match reqwest::get(&discovery_url).await {
        Ok(response) => response,
        Err(e) => {
            warn!(server = server_name, error = %e, "failed to fetch upstream discovery document");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };
    let mut document: Value = match response.json().await {
        Ok(document) => document,
        Err(e) => {
            warn!(server = server_name, error = %e, "upstream discovery document was not valid json");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    if let Some(map) = document.as_object_mut() {
        map.insert(RESOURCE_FIELD.to_string(), Value::String(format!("{}{mcp_path}", state.public_url)));
    }

    Json(document).into_response()
}

/// `/.well-known/oauth-protected-resource/servers/{name}/mcp` and its
/// `/s/{name}/mcp` alias.
pub async fn protected_resource(State(state): State<OauthState>, Path(name): Path<String>) -> Response {
    let mcp_path = format!("/servers/{name}/mcp");
    fetch_and_rewrite(&state, &name, "oauth-protected-resource", &mcp_path).await
}

/// `/.well-known/oauth-authorization-server/servers/{name}/mcp` and alias.
pub async fn authorization_server(State(state): State<OauthState>, Path(name): Path<String>) -> Response {
    let mcp_path = format!("/servers/{name}/mcp");
    fetch_and_rewrite(&state, &name, "oauth-authorization-server", &mcp_path).await
}

/// `/.well-known/openid-configuration/servers/{name}/mcp` and alias.
pub async fn openid_configuration_prefixed(State(state): State<OauthState>, Path(name): Path<String>) -> Response {
    let mcp_path = format!("/servers/{name}/mcp");
    fetch_and_rewrite(&state, &name, "openid-configuration", &mcp_path).await
}

/// `/servers/{name}/mcp/.well-known/openid-configuration`: the suffix-form
/// alias spec.md lists alongside the prefix forms above.
pub async fn openid_configuration_suffixed(state: State<OauthState>, name: Path<String>) -> Response {
    openid_configuration_prefixed(state, name).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use axum::Router;
    use axum::routing::get;
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

    async fn spawn_discovery_server() -> std::net::SocketAddr {
        async fn handler() -> Json<Value> {
            Json(serde_json::json!({
                "resource": "https://upstream.example/should-be-overwritten",
                "authorization_servers": ["https://auth.example/"],
                "scopes_supported": ["mcp:tools"]
            }))
        }
        let app = Router::new().route(
            "/.well-known/oauth-protected-resource/servers/demo/mcp",
            get(handler),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        addr
    }

    #[tokio::test]
    async fn protected_resource_rewrites_only_the_resource_field() {
        let addr = spawn_discovery_server().await;
        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::init(config(dir.path().to_path_buf())).await.unwrap();
        gateway
            .add_server(ServerConfig::Http { name: "demo".into(), url: format!("http://{addr}/mcp"), headers: HashMap::new() })
            .await
            .unwrap();
        let state = OauthState { gateway, public_url: "https://gateway.example".to_string() };

        let response = protected_resource(State(state), Path("demo".to_string())).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let document: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(document["resource"], "https://gateway.example/servers/demo/mcp");
        assert_eq!(document["scopes_supported"], serde_json::json!(["mcp:tools"]));
    }

    #[tokio::test]
    async fn unknown_server_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::init(config(dir.path().to_path_buf())).await.unwrap();
        let state = OauthState { gateway, public_url: "https://gateway.example".to_string() };

        let response = protected_resource(State(state), Path("nope".to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stdio_server_has_no_discovery_document() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::init(config(dir.path().to_path_buf())).await.unwrap();
        gateway
            .add_server(ServerConfig::Stdio {
                name: "demo".into(),
                command: "cat".into(),
                args: vec![],
                cwd: None,
                env: HashMap::new(),
                session_mode: crate::config::SessionMode::Shared,
                request_timeout_secs: None,
                health_interval_secs: None,
            })
            .await
            .unwrap();
        let state = OauthState { gateway, public_url: "https://gateway.example".to_string() };

        let response = protected_resource(State(state), Path("demo".to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
