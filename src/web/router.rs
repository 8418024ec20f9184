use axum::Router;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::{Query, State};
use axum::http::{Request, StatusCode};
use axum::middleware::{Next, from_fn_with_state};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, body::Body};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::routes;
use super::state::AppState;
use crate::relay::stats::Counter;

pub(crate) fn build_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/", get(routes::status::index))
        .route("/api/domains", get(routes::domains::api_domains))
        .route(
            "/api/update-domains",
            get(routes::domains::api_update_domains),
        )
        .route("/api/health", get(routes::domains::api_health))
        .route("/api/health/latest", get(routes::domains::api_health_latest))
        .route("/api/clear-cache", get(routes::domains::api_clear_cache))
        .route("/api/stats", get(routes::traffic::api_stats))
        .route("/api/stats/reset", get(routes::traffic::api_stats_reset))
        .route("/api/proxy", get(routes::links::api_proxy))
        .route("/api/url", get(routes::links::api_url))
        .route("/api/clone", get(routes::links::api_clone))
        .route("/api/download", get(routes::download::api_download))
        .route(
            "/api/multi-download",
            get(routes::download::api_multi_download),
        )
        .route("/api/releases", get(routes::releases::api_releases))
        .fallback(routes::gateway::relay);

    router
        .layer(from_fn_with_state(state.clone(), auth_and_log_mw))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

async fn auth_and_log_mw(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    let method = req.method().to_string();
    let ip = req
        .extensions()
        .get::<ConnectInfo<std::net::SocketAddr>>()
        .map(|c| c.0)
        .map(|a| a.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    // 只有 /api 下的管理接口需要 token；转发入口与状态页不需要。
    if path == "/api" || path.starts_with("/api/") {
        let provided = Query::<TokenQuery>::try_from_uri(req.uri())
            .ok()
            .and_then(|Query(q)| q.token)
            .filter(|t| !t.is_empty());

        let denied = match (&state.auth, provided) {
            (None, _) => Some((StatusCode::FORBIDDEN, "management api is disabled")),
            (Some(_), None) => Some((StatusCode::UNAUTHORIZED, "missing token")),
            (Some(auth), Some(token)) if !auth.verify(&token) => {
                Some((StatusCode::FORBIDDEN, "invalid token"))
            }
            _ => None,
        };

        if let Some((status, msg)) = denied {
            info!(target: "web_access", ip = %ip, method = %method, path = %path, status = status.as_u16(), "denied");
            return (status, Json(json!({ "ok": false, "error": msg }))).into_response();
        }

        state
            .services
            .stats
            .increment(Counter::ApiRequests, 1, None);
    }

    let resp = next.run(req).await;
    info!(target: "web_access", ip = %ip, method = %method, path = %path, status = %resp.status().as_u16(), "ok");
    resp
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use reqwest::Client;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::base_system::context::Config;
    use crate::relay::chunk::fakes::FixedHead;
    use crate::relay::pool::fakes::ScriptedSource;
    use crate::relay::prober::fakes::ScriptedProber;
    use crate::relay::strategy::StrategyKind;
    use crate::relay::test_support::spawn_mock_relay;
    use crate::web::state::Services;

    const TOKEN: &str = "s3cret";

    struct TestApp {
        router: Router,
        state: AppState,
        _dir: tempfile::TempDir,
    }

    fn test_app(token: &str, relays: &[&str], scheme: &str) -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.safe_token = token.to_string();
        config.proxy_strategy = StrategyKind::RoundRobin;
        config.relay_scheme = scheme.to_string();
        config.set_data_dir(Some(dir.path()));

        let services = Services::assemble(
            config,
            Client::new(),
            Arc::new(ScriptedSource::ok("fresh-a.com\nfresh-b.com")),
            Arc::new(ScriptedProber::default()),
            Arc::new(FixedHead::new(Some(250), "application/zip")),
        );
        services.pool.replace_for_test(relays);
        let state = AppState::new(Vec::new(), services);
        TestApp {
            router: build_router(state.clone()),
            state,
            _dir: dir,
        }
    }

    async fn call(router: &Router, uri: &str) -> (StatusCode, Value) {
        let resp = router
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn status_page_needs_no_token() {
        let app = test_app(TOKEN, &["a.com"], "https");
        let (status, body) = call(&app.router, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["pool_size"], 1);
        assert_eq!(body["strategy"], "round-robin");
        assert_eq!(body["monitor_phase"], "idle");
    }

    #[tokio::test]
    async fn api_distinguishes_missing_and_wrong_token() {
        let app = test_app(TOKEN, &["a.com"], "https");

        let (status, body) = call(&app.router, "/api/domains").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["ok"], false);

        let (status, body) = call(&app.router, "/api/domains?token=nope").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(!body.to_string().contains(TOKEN));

        let (status, body) = call(&app.router, "/api/domains?token=s3cret").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["domains"], json!(["a.com"]));
    }

    #[tokio::test]
    async fn empty_token_locks_management_api() {
        let app = test_app("", &["a.com"], "https");
        let (status, _) = call(&app.router, "/api/domains?token=").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = call(&app.router, "/api/stats?token=anything").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn authorized_calls_are_counted() {
        let app = test_app(TOKEN, &["a.com"], "https");
        call(&app.router, "/api/domains?token=s3cret").await;
        call(&app.router, "/api/domains").await;

        let (_, body) = call(&app.router, "/api/stats?token=s3cret").await;
        assert_eq!(body["stats"]["api_requests"], 2);

        call(&app.router, "/api/stats/reset?token=s3cret").await;
        assert_eq!(app.state.services.stats.snapshot().api_requests, 0);
    }

    #[tokio::test]
    async fn update_domains_replaces_pool() {
        let app = test_app(TOKEN, &["a.com"], "https");
        let (status, body) = call(&app.router, "/api/update-domains?token=s3cret").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["domains"], json!(["fresh-a.com", "fresh-b.com"]));
        assert_eq!(app.state.services.pool.list(), ["fresh-a.com", "fresh-b.com"]);
    }

    #[tokio::test]
    async fn health_endpoints_report_sweeps() {
        let app = test_app(TOKEN, &["a.com", "b.com"], "https");

        let (_, latest) = call(&app.router, "/api/health/latest?token=s3cret").await;
        assert!(latest["report"].is_null());

        let (status, body) = call(&app.router, "/api/health?token=s3cret").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["report"]["total"], 2);
        // 全部测速失败，触发刷新
        assert_eq!(body["report"]["refreshed"], true);

        let (_, latest) = call(&app.router, "/api/health/latest?token=s3cret").await;
        assert_eq!(latest["report"]["total"], 2);
    }

    #[tokio::test]
    async fn links_use_selected_relay_and_allow_list() {
        let app = test_app(TOKEN, &["a.com", "b.com"], "https");

        let (_, body) = call(&app.router, "/api/proxy?token=s3cret").await;
        assert_eq!(body["domain"], "a.com");

        let (status, body) = call(
            &app.router,
            "/api/url?token=s3cret&url=https://github.com/o/r/archive/main.zip",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body["proxied_url"],
            "https://b.com/https://github.com/o/r/archive/main.zip"
        );

        let (status, _) = call(&app.router, "/api/url?token=s3cret&url=https://evil.org/x").await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(&app.router, "/api/url?token=s3cret").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = call(&app.router, "/api/clone?token=s3cret&repo=o/r").await;
        assert_eq!(body["command"], "git clone https://a.com/o/r.git");
    }

    #[tokio::test]
    async fn download_endpoints_describe_and_plan() {
        let app = test_app(TOKEN, &["a.com", "b.com", "c.com"], "https");

        let (status, body) = call(
            &app.router,
            "/api/download?token=s3cret&url=https://github.com/o/r/releases/download/v1/a.zip",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["size"], 250);
        assert_eq!(body["content_type"], "application/zip");

        let (status, body) = call(
            &app.router,
            "/api/multi-download?token=s3cret&count=3&url=https://github.com/o/r/releases/download/v1/a.zip",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let shards = body["plan"]["shards"].as_array().unwrap();
        assert_eq!(shards.len(), 3);
        assert_eq!(shards[0]["end_byte"], 83);
        assert_eq!(shards[2]["size"], 82);

        let (status, _) = call(
            &app.router,
            "/api/multi-download?token=s3cret&count=zero&url=https://github.com/o/r",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn releases_requires_repo() {
        let app = test_app(TOKEN, &["a.com"], "https");
        let (status, body) = call(&app.router, "/api/releases?token=s3cret").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], false);
    }

    #[tokio::test]
    async fn clear_cache_empties_result_cache() {
        let app = test_app(TOKEN, &["a.com"], "https");
        app.state.services.cache.set("releases:o/r", json!([]));
        let (_, body) = call(&app.router, "/api/clear-cache?token=s3cret").await;
        assert_eq!(body["cleared"], 1);
        assert!(app.state.services.cache.is_empty());
    }

    #[tokio::test]
    async fn fallback_relays_allowed_hosts_only() {
        let relay = spawn_mock_relay().await;
        let app = test_app(TOKEN, &[relay.authority.as_str()], "http");

        let (status, body) = call(&app.router, "/https://evil.org/payload").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["ok"], false);
        assert_eq!(relay.hits(), 0);

        let resp = app
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/https://github.com/o/r/raw/main/README.md")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"relayed:/https://github.com/o/r/raw/main/README.md");
    }

    #[tokio::test]
    async fn fallback_with_empty_pool_is_unavailable() {
        let app = test_app(TOKEN, &[], "https");
        let (status, _) = call(&app.router, "/https://github.com/o/r").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
