use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::AppState;

pub async fn require_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    // 1. Internal token bypass (the daemon calling itself)
    if let Some(header) = req.headers().get("x-steward-internal-token") {
        if let Ok(val) = header.to_str() {
            if val == state.internal_token {
                return next.run(req).await;
            }
        }
    }

    // 2. No API token configured → allow open access only on loopback (safe for local dev)
    if state.api_token.is_empty() {
        let is_loopback = state.api_host == "127.0.0.1"
            || state.api_host == "::1"
            || state.api_host == "localhost";
        if is_loopback {
            return next.run(req).await;
        }
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "error": "No API token configured. Set api.api_token in steward.toml before exposing on a non-loopback address."
            })),
        )
            .into_response();
    }

    // 3. Extract and check the bearer token
    let raw_token = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.to_string());

    match raw_token {
        Some(token) if token == state.api_token => next.run(req).await,
        Some(_) => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "Invalid API token" })),
        )
            .into_response(),
        None => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "Missing or invalid Authorization header. Use: Bearer <token>" })),
        )
            .into_response(),
    }
}

/// The user a request acts as. Local deployments run single-user; hosted
/// fronts set the header per authenticated session.
pub fn user_id(headers: &axum::http::HeaderMap) -> String {
    headers
        .get("x-steward-user")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .unwrap_or("local")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, middleware, routing::get};
    use tower::util::ServiceExt;

    fn test_state(api_host: &str, api_token: &str) -> AppState {
        use crate::core::credentials::InMemoryCredentialStore;
        use crate::core::device::{DeviceChannel, StaticTokenVerifier};
        use crate::core::generation::{GenerationManager, GenerationSettings};
        use std::sync::Arc;
        use std::time::Duration;

        struct NoFactory;
        #[async_trait::async_trait]
        impl crate::core::generation::BackendFactory for NoFactory {
            async fn acquire(
                &self,
                _user_id: &str,
            ) -> Result<
                Arc<dyn crate::core::sandbox::ExecutionBackend>,
                crate::core::sandbox::BackendError,
            > {
                Err(crate::core::sandbox::BackendError::Offline)
            }
        }

        let devices = Arc::new(DeviceChannel::new(
            Arc::new(StaticTokenVerifier::new(std::collections::HashMap::new())),
            Duration::from_secs(20),
        ));
        let generations = GenerationManager::new(
            Arc::new(InMemoryCredentialStore::new()),
            Arc::new(NoFactory),
            GenerationSettings::default(),
        );
        let (log_tx, _) = tokio::sync::broadcast::channel(16);

        AppState {
            generations,
            devices,
            log_tx,
            api_host: api_host.to_string(),
            api_port: 4270,
            api_token: api_token.to_string(),
            internal_token: "test-internal-token".to_string(),
        }
    }

    fn protected_app(state: AppState) -> Router {
        Router::new()
            .route("/protected", get(|| async { "ok" }))
            .layer(middleware::from_fn_with_state(state.clone(), require_auth))
            .with_state(state)
    }

    async fn status_for(app: Router, headers: &[(&str, &str)]) -> StatusCode {
        let mut builder = Request::builder().method("GET").uri("/protected");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let resp = app.oneshot(builder.body(Body::empty()).unwrap()).await.unwrap();
        resp.status()
    }

    #[tokio::test]
    async fn loopback_without_token_is_open() {
        let app = protected_app(test_state("127.0.0.1", ""));
        assert_eq!(status_for(app, &[]).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn non_loopback_without_token_is_refused() {
        let app = protected_app(test_state("0.0.0.0", ""));
        assert_eq!(status_for(app, &[]).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn bearer_token_grants_access() {
        let state = test_state("127.0.0.1", "secret");
        let app = protected_app(state);
        assert_eq!(
            status_for(app.clone(), &[("authorization", "Bearer secret")]).await,
            StatusCode::OK
        );
        assert_eq!(
            status_for(app.clone(), &[("authorization", "Bearer wrong")]).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(status_for(app, &[]).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn internal_token_bypasses_bearer_auth() {
        let app = protected_app(test_state("0.0.0.0", "secret"));
        assert_eq!(
            status_for(app, &[("x-steward-internal-token", "test-internal-token")]).await,
            StatusCode::OK
        );
    }

    #[test]
    fn user_header_defaults_to_local() {
        let mut headers = axum::http::HeaderMap::new();
        assert_eq!(user_id(&headers), "local");
        headers.insert("x-steward-user", "u42".parse().unwrap());
        assert_eq!(user_id(&headers), "u42");
    }
}
