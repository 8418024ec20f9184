//! 代理域名池、选择策略与流式转发。

pub mod cache;
pub mod chunk;
pub mod error;
pub mod gateway;
pub mod health;
pub mod pool;
pub mod prober;
pub mod releases;
pub mod stats;
pub mod strategy;

/// 经代理访问上游资源的地址：`{scheme}://{relay}/{target}`，其中 target 是完整的上游 URL。
pub fn proxied_url(scheme: &str, relay: &str, target: &str) -> String {
    format!("{scheme}://{relay}/{}", target.trim_start_matches('/'))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxied_url_keeps_full_target() {
        assert_eq!(
            proxied_url("https", "gh.example.com", "https://github.com/o/r/archive/main.zip"),
            "https://gh.example.com/https://github.com/o/r/archive/main.zip"
        );
        assert_eq!(
            proxied_url("http", "127.0.0.1:9", "/https://github.com/x"),
            "http://127.0.0.1:9/https://github.com/x"
        );
    }
}
