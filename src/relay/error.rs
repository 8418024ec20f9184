use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    /// 远程域名列表不可达或为空。
    #[error("fetch proxy domain list failed: {0}")]
    Fetch(String),
    #[error("no proxy domain available")]
    NoDomainAvailable,
    #[error("host not allowed: {host}")]
    AccessDenied { host: String },
    /// 经代理访问上游失败；`status` 为 None 表示连响应都没有拿到。
    #[error("upstream request failed: {message}")]
    Upstream {
        status: Option<u16>,
        message: String,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl RelayError {
    pub(crate) fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream {
            status: None,
            message: message.into(),
        }
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
