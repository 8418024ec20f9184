use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

use crate::relay::stats::format_duration;
use crate::web::state::AppState;

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub(crate) async fn index(State(state): State<AppState>) -> Json<Value> {
    let services = &state.services;
    Json(json!({
        "ok": true,
        "name": env!("CARGO_PKG_NAME"),
        "version": VERSION,
        "strategy": services.selector.kind(),
        "pool_size": services.pool.len(),
        "pool_generation": services.pool.generation(),
        "monitor_phase": services.monitor.phase(),
        "multi_proxy": services.config.enable_multi_proxy,
        "uptime": format_duration(services.started.elapsed()),
        "bind_addrs": state.bind_addrs.iter().map(ToString::to_string).collect::<Vec<_>>(),
        "locked": state.auth.is_none(),
    }))
}
