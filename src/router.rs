//! Top-level `axum::Router` assembly: wires the proxy, management, and
//! OAuth discovery surfaces together with the ambient `tower-http` layers
//! (spec.md §6). Grounded on `turbomcp-transport`'s axum router builder for
//! layer ordering (trace outermost, then timeout, then body limit).

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::middleware;
use axum::routing::post;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{AuthState, require_bearer_token};
use crate::gateway::Gateway;
use crate::management::{ManagementState, handle_management_request};
use crate::oauth::{self, OauthState};
use crate::proxy::{ProxyState, handle_mcp_request};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Build the full gateway router. `public_url` is the gateway's own
/// externally-reachable base URL, used to rewrite OAuth discovery
/// documents (spec.md §6).
pub fn build(gateway: Arc<Gateway>, public_url: String) -> Router {
    let max_body_bytes = gateway.config().max_body_bytes;
    let auth = gateway.auth().clone();
    let proxy_state = ProxyState { gateway: gateway.clone() };
    let management_state = ManagementState { gateway: gateway.clone() };
    let oauth_state = OauthState { gateway, public_url };

    let proxy_routes = Router::new()
        .route("/servers/{name}/mcp", post(handle_mcp_request))
        .route("/s/{name}/mcp", post(handle_mcp_request))
        .with_state(proxy_state);

    let management_routes = Router::new()
        .route("/gateway/mcp", post(handle_management_request))
        .route("/g/mcp", post(handle_management_request))
        .with_state(management_state)
        .layer(middleware::from_fn_with_state(auth, require_bearer_token));

    let oauth_routes = Router::new()
        .route("/.well-known/oauth-protected-resource/servers/{name}/mcp", axum::routing::get(oauth::protected_resource))
        .route("/.well-known/oauth-protected-resource/s/{name}/mcp", axum::routing::get(oauth::protected_resource))
        .route("/.well-known/oauth-authorization-server/servers/{name}/mcp", axum::routing::get(oauth::authorization_server))
        .route("/.well-known/oauth-authorization-server/s/{name}/mcp", axum::routing::get(oauth::authorization_server))
        .route("/.well-known/openid-configuration/servers/{name}/mcp", axum::routing::get(oauth::openid_configuration_prefixed))
        .route("/.well-known/openid-configuration/s/{name}/mcp", axum::routing::get(oauth::openid_configuration_prefixed))
        .route("/servers/{name}/mcp/.well-known/openid-configuration", axum::routing::get(oauth::openid_configuration_suffixed))
        .route("/s/{name}/mcp/.well-known/openid-configuration", axum::routing::get(oauth::openid_configuration_suffixed))
        .with_state(oauth_state);

    Router::new()
        .merge(proxy_routes)
        .merge(management_routes)
        .merge(oauth_routes)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

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
    async fn management_route_rejects_missing_bearer_token() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::init(config(dir.path().to_path_buf())).await.unwrap();
        let app = build(gateway, "https://gateway.example".to_string());

        let request = Request::builder()
            .method("POST")
            .uri("/gateway/mcp")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn management_route_accepts_valid_bearer_token() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::init(config(dir.path().to_path_buf())).await.unwrap();
        let app = build(gateway, "https://gateway.example".to_string());

        let request = Request::builder()
            .method("POST")
            .uri("/gateway/mcp")
            .header("content-type", "application/json")
            .header("authorization", "Bearer test-token")
            .body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn proxy_route_for_unknown_server_is_unknown_server_status() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::init(config(dir.path().to_path_buf())).await.unwrap();
        let app = build(gateway, "https://gateway.example".to_string());

        let request = Request::builder()
            .method("POST")
            .uri("/servers/nope/mcp")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), crate::error::GatewayError::unknown_server("nope").status_code());
    }
}
