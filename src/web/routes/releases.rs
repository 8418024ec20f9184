use axum::Json;
use axum::extract::{Query, State};
use serde_json::{Value, json};

use super::links::RepoQuery;
use super::required;
use crate::relay::error::RelayError;
use crate::relay::releases::RepoRef;
use crate::web::state::AppState;

pub(crate) async fn api_releases(
    State(state): State<AppState>,
    Query(q): Query<RepoQuery>,
) -> Result<Json<Value>, RelayError> {
    let repo = RepoRef::parse(required(&q.repo, "repo")?)?;
    let releases = state.services.releases.list(&repo).await?;
    Ok(Json(json!({
        "ok": true,
        "repo": repo.full_name(),
        "count": releases.len(),
        "releases": releases,
    })))
}
