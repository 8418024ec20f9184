use axum::Json;
use axum::extract::{Query, State};
use serde::Deserialize;
use serde_json::{Value, json};

use super::required;
use crate::relay::error::RelayError;
use crate::relay::proxied_url;
use crate::relay::releases::clone_command;
use crate::web::state::AppState;

#[derive(Debug, Deserialize)]
pub(crate) struct UrlQuery {
    pub(crate) url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RepoQuery {
    pub(crate) repo: Option<String>,
}

pub(crate) async fn api_proxy(State(state): State<AppState>) -> Result<Json<Value>, RelayError> {
    let selector = &state.services.selector;
    let domain = selector.select().await?;
    Ok(Json(json!({
        "ok": true,
        "domain": domain,
        "strategy": selector.kind(),
    })))
}

pub(crate) async fn api_url(
    State(state): State<AppState>,
    Query(q): Query<UrlQuery>,
) -> Result<Json<Value>, RelayError> {
    let services = &state.services;
    let target = services
        .gateway
        .allow_list()
        .resolve(required(&q.url, "url")?)?;
    let domain = services.selector.select().await?;
    let original = target.url();
    Ok(Json(json!({
        "ok": true,
        "domain": &domain,
        "proxied_url": proxied_url(&services.config.relay_scheme, &domain, &original),
        "original_url": original,
    })))
}

pub(crate) async fn api_clone(
    State(state): State<AppState>,
    Query(q): Query<RepoQuery>,
) -> Result<Json<Value>, RelayError> {
    let repo = required(&q.repo, "repo")?;
    let domain = state.services.selector.select().await?;
    let cmd = clone_command(repo, &domain)?;
    Ok(Json(json!({
        "ok": true,
        "domain": domain,
        "original_url": cmd.original_url,
        "proxied_url": cmd.proxied_url,
        "command": cmd.command,
    })))
}
