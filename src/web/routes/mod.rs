pub(crate) mod domains;
pub(crate) mod download;
pub(crate) mod gateway;
pub(crate) mod links;
pub(crate) mod releases;
pub(crate) mod status;
pub(crate) mod traffic;

use crate::relay::error::RelayError;

/// 取必填的查询参数；缺失或为空时返回 400。
pub(crate) fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, RelayError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| RelayError::InvalidInput(format!("missing `{name}` parameter")))
}
