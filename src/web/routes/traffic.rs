use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};
use tracing::info;

use crate::web::state::AppState;

pub(crate) async fn api_stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "stats": state.services.stats.snapshot(),
    }))
}

pub(crate) async fn api_stats_reset(State(state): State<AppState>) -> Json<Value> {
    state.services.stats.reset();
    info!(target: "web", "统计数据已重置");
    Json(json!({ "ok": true }))
}
