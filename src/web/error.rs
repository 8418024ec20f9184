use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::warn;

use crate::relay::error::RelayError;

impl RelayError {
    pub(crate) fn status_code(&self) -> StatusCode {
        match self {
            RelayError::Fetch(_) => StatusCode::BAD_GATEWAY,
            RelayError::NoDomainAvailable => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::AccessDenied { .. } => StatusCode::FORBIDDEN,
            RelayError::Upstream { status, .. } => status
                .and_then(|s| StatusCode::from_u16(s).ok())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            RelayError::NotFound(_) => StatusCode::NOT_FOUND,
            RelayError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// 返回给客户端的说明；上游错误不带内部细节。
    fn public_message(&self) -> String {
        match self {
            RelayError::Upstream { status: None, .. } => "upstream request failed".to_string(),
            RelayError::Upstream {
                status: Some(s), ..
            } => format!("upstream returned HTTP {s}"),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!(target: "web", status = status.as_u16(), error = %self, "request failed");
        }
        (
            status,
            Json(json!({ "ok": false, "error": self.public_message() })),
        )
            .into_response()
    }
}
