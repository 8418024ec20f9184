use axum::Json;
use axum::extract::{Query, State};
use serde::Deserialize;
use serde_json::{Value, json};

use super::required;
use crate::relay::error::RelayError;
use crate::relay::proxied_url;
use crate::relay::stats::format_bytes;
use crate::web::state::AppState;

#[derive(Debug, Deserialize)]
pub(crate) struct DownloadQuery {
    pub(crate) url: Option<String>,
    pub(crate) count: Option<String>,
}

/// 单一代理下载：经选中的代理发 HEAD，返回大小、类型与代理地址。
pub(crate) async fn api_download(
    State(state): State<AppState>,
    Query(q): Query<DownloadQuery>,
) -> Result<Json<Value>, RelayError> {
    let services = &state.services;
    let target = services
        .gateway
        .allow_list()
        .resolve(required(&q.url, "url")?)?;
    let original = target.url();

    let domain = services.selector.select().await?;
    let meta = services.planner.describe(&domain, &original).await?;
    let recommended = meta
        .content_length
        .map(|len| services.planner.tiers().shard_count_for_size(len))
        .unwrap_or(1);

    Ok(Json(json!({
        "ok": true,
        "domain": &domain,
        "proxied_url": proxied_url(&services.config.relay_scheme, &domain, &original),
        "original_url": original,
        "size": meta.content_length,
        "size_human": meta.content_length.map(format_bytes),
        "content_type": meta.content_type,
        "recommended_shards": recommended,
    })))
}

pub(crate) async fn api_multi_download(
    State(state): State<AppState>,
    Query(q): Query<DownloadQuery>,
) -> Result<Json<Value>, RelayError> {
    let services = &state.services;
    let target = services
        .gateway
        .allow_list()
        .resolve(required(&q.url, "url")?)?;

    let count = match q.count.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        None => None,
        Some(raw) => match raw.parse::<usize>() {
            Ok(n) if n > 0 => Some(n),
            _ => {
                return Err(RelayError::InvalidInput(format!(
                    "`count` must be a positive integer, got {raw}"
                )));
            }
        },
    };

    let plan = services.planner.plan(&target.url(), count).await?;
    Ok(Json(json!({
        "ok": true,
        "size_human": plan.total_size.map(format_bytes),
        "plan": plan,
    })))
}
