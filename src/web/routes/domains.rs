use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};
use tracing::info;

use crate::relay::error::RelayError;
use crate::web::state::AppState;

pub(crate) async fn api_domains(State(state): State<AppState>) -> Json<Value> {
    let domains = state.services.pool.list();
    Json(json!({
        "ok": true,
        "count": domains.len(),
        "domains": domains,
    }))
}

pub(crate) async fn api_update_domains(
    State(state): State<AppState>,
) -> Result<Json<Value>, RelayError> {
    let domains = state.services.pool.refresh().await?;
    info!(target: "web", count = domains.len(), "手动刷新代理域名列表");
    Ok(Json(json!({
        "ok": true,
        "count": domains.len(),
        "domains": domains,
    })))
}

/// 立即执行一次健康巡检（与定时任务规则相同，可能触发列表刷新）。
pub(crate) async fn api_health(State(state): State<AppState>) -> Json<Value> {
    let report = state.services.monitor.run_once().await;
    Json(json!({
        "ok": true,
        "healthy_fraction": report.healthy_fraction(),
        "report": report,
        "domains": state.services.pool.list(),
    }))
}

pub(crate) async fn api_health_latest(State(state): State<AppState>) -> Json<Value> {
    let services = &state.services;
    Json(json!({
        "ok": true,
        "phase": services.monitor.phase(),
        "report": services.monitor.latest(),
        "records": services.pool.records(),
    }))
}

pub(crate) async fn api_clear_cache(State(state): State<AppState>) -> Json<Value> {
    let cleared = state.services.cache.len();
    state.services.cache.clear();
    info!(target: "web", cleared, "缓存已清空");
    Json(json!({ "ok": true, "cleared": cleared }))
}
