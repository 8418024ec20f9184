use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::response::{IntoResponse, Response};

use crate::web::state::AppState;

/// 路由兜底：`/{protocol}://{host}/{path}` 经代理转发。
pub(crate) async fn relay(State(state): State<AppState>, req: Request<Body>) -> Response {
    match state
        .services
        .gateway
        .forward(req, state.shutdown.child_token())
        .await
    {
        Ok(resp) => resp,
        Err(e) => e.into_response(),
    }
}
