//! 全局配置结构（Config）与默认值。
//!
//! 该模块同时提供生成 `config.yml` 的字段元信息，以及环境变量覆盖与启动时校验。

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::{ConfigError, ConfigSpec, FieldMeta};
use crate::relay::chunk::SizeTiers;
use crate::relay::strategy::StrategyKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // 服务配置
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub safe_token: String,

    // 代理策略
    #[serde(default)]
    pub proxy_strategy: StrategyKind,
    #[serde(default = "default_proxy_domains_url")]
    pub proxy_domains_url: String,
    #[serde(default = "default_proxy_domains_file")]
    pub proxy_domains_file: String,
    #[serde(default = "default_relay_scheme")]
    pub relay_scheme: String,
    #[serde(default = "default_allowed_hosts")]
    pub allowed_hosts: Vec<String>,

    // 测速与健康检查
    #[serde(default = "default_probe_path")]
    pub probe_path: String,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    // 缓存
    #[serde(default = "default_cache_duration_secs")]
    pub cache_duration_secs: u64,
    #[serde(default = "default_proxy_cache_duration_ms")]
    pub proxy_cache_duration_ms: u64,

    // 上游请求
    #[serde(default = "default_upstream_connect_timeout_secs")]
    pub upstream_connect_timeout_secs: u64,
    #[serde(default = "default_upstream_header_timeout_secs")]
    pub upstream_header_timeout_secs: u64,
    #[serde(default = "default_upstream_idle_timeout_secs")]
    pub upstream_idle_timeout_secs: u64,
    #[serde(default = "default_github_api_base")]
    pub github_api_base: String,

    // 多域名分块下载
    #[serde(default)]
    pub enable_multi_proxy: bool,
    #[serde(default = "default_small_file_threshold")]
    pub small_file_threshold_mb: u64,
    #[serde(default = "default_medium_file_threshold")]
    pub medium_file_threshold_mb: u64,
    #[serde(default = "default_large_file_threshold")]
    pub large_file_threshold_mb: u64,
    #[serde(default = "default_shard_count")]
    pub default_shard_count: usize,

    #[serde(skip)]
    data_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            safe_token: String::new(),
            proxy_strategy: StrategyKind::default(),
            proxy_domains_url: default_proxy_domains_url(),
            proxy_domains_file: default_proxy_domains_file(),
            relay_scheme: default_relay_scheme(),
            allowed_hosts: default_allowed_hosts(),
            probe_path: default_probe_path(),
            probe_timeout_ms: default_probe_timeout_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            cache_duration_secs: default_cache_duration_secs(),
            proxy_cache_duration_ms: default_proxy_cache_duration_ms(),
            upstream_connect_timeout_secs: default_upstream_connect_timeout_secs(),
            upstream_header_timeout_secs: default_upstream_header_timeout_secs(),
            upstream_idle_timeout_secs: default_upstream_idle_timeout_secs(),
            github_api_base: default_github_api_base(),
            enable_multi_proxy: false,
            small_file_threshold_mb: default_small_file_threshold(),
            medium_file_threshold_mb: default_medium_file_threshold(),
            large_file_threshold_mb: default_large_file_threshold(),
            default_shard_count: default_shard_count(),
            data_dir: None,
        }
    }
}

impl ConfigSpec for Config {
    const FILE_NAME: &'static str = "config.yml";

    fn fields() -> &'static [FieldMeta] {
        static FIELDS: [FieldMeta; 21] = [
            FieldMeta {
                name: "bind_addr",
                description: "监听地址，多个地址用逗号分隔，例如 0.0.0.0:3000,[::]:3000",
            },
            FieldMeta {
                name: "safe_token",
                description: "管理 API 的访问 token（留空表示禁用全部 /api 接口）",
            },
            FieldMeta {
                name: "proxy_strategy",
                description: "代理域名选择策略, 可选: [fastest, random, round-robin]",
            },
            FieldMeta {
                name: "proxy_domains_url",
                description: "远程代理域名列表地址（纯文本，每行一个域名）",
            },
            FieldMeta {
                name: "proxy_domains_file",
                description: "本地代理域名列表路径（相对路径基于数据目录）",
            },
            FieldMeta {
                name: "relay_scheme",
                description: "访问代理域名使用的协议, 可选: [https, http]",
            },
            FieldMeta {
                name: "allowed_hosts",
                description: "允许代理的上游域名（含其子域名）",
            },
            FieldMeta {
                name: "probe_path",
                description: "测速使用的资源路径（拼接在代理域名之后）",
            },
            FieldMeta {
                name: "probe_timeout_ms",
                description: "单次测速超时时间, 单位ms",
            },
            FieldMeta {
                name: "health_check_interval_ms",
                description: "定时健康检查间隔, 单位ms",
            },
            FieldMeta {
                name: "cache_duration_secs",
                description: "元数据缓存时间（如发布列表）, 单位秒",
            },
            FieldMeta {
                name: "proxy_cache_duration_ms",
                description: "最快代理域名的缓存时间, 单位ms",
            },
            FieldMeta {
                name: "upstream_connect_timeout_secs",
                description: "连接代理域名的超时时间, 单位秒",
            },
            FieldMeta {
                name: "upstream_header_timeout_secs",
                description: "等待上游响应头的超时时间, 单位秒",
            },
            FieldMeta {
                name: "upstream_idle_timeout_secs",
                description: "响应体两次数据之间允许的最长空闲时间, 单位秒",
            },
            FieldMeta {
                name: "github_api_base",
                description: "GitHub API 地址（获取发布列表）",
            },
            FieldMeta {
                name: "enable_multi_proxy",
                description: "是否按文件大小启用多域名并行下载",
            },
            FieldMeta {
                name: "small_file_threshold_mb",
                description: "小文件阈值（MB），低于该值使用单一代理",
            },
            FieldMeta {
                name: "medium_file_threshold_mb",
                description: "中等文件阈值（MB），低于该值使用 3 个代理",
            },
            FieldMeta {
                name: "large_file_threshold_mb",
                description: "大文件阈值（MB），低于该值使用 5 个代理，否则使用 10 个",
            },
            FieldMeta {
                name: "default_shard_count",
                description: "未指定分块数时 multi-download 使用的默认分块数",
            },
        ];
        &FIELDS
    }
}

impl Config {
    /// 用进程环境变量覆盖配置文件中的值。
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// 与 [`Config::apply_env_overrides`] 相同，但从任意来源取值，便于测试。
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get("GH_RELAY_ADDR") {
            self.bind_addr = v;
        } else if let Some(port) = get("PORT").and_then(|p| p.parse::<u16>().ok()) {
            self.bind_addr = format!("0.0.0.0:{port}");
        }
        if let Some(v) = get("SAFE_TOKEN") {
            self.safe_token = v;
        }
        if let Some(kind) = get("PROXY_STRATEGY").and_then(|v| v.parse().ok()) {
            self.proxy_strategy = kind;
        }
        if let Some(v) = get("ENABLE_MULTI_PROXY") {
            self.enable_multi_proxy = v.eq_ignore_ascii_case("true") || v == "1";
        }
        if let Some(v) = get("SMALL_FILE_THRESHOLD").and_then(|v| v.parse().ok()) {
            self.small_file_threshold_mb = v;
        }
        if let Some(v) = get("MEDIUM_FILE_THRESHOLD").and_then(|v| v.parse().ok()) {
            self.medium_file_threshold_mb = v;
        }
        if let Some(v) = get("LARGE_FILE_THRESHOLD").and_then(|v| v.parse().ok()) {
            self.large_file_threshold_mb = v;
        }
        if let Some(v) = get("CACHE_DURATION").and_then(|v| v.parse().ok()) {
            self.cache_duration_secs = v;
        }
        if let Some(v) = get("PROXY_CACHE_DURATION").and_then(|v| v.parse().ok()) {
            self.proxy_cache_duration_ms = v;
        }
        if let Some(v) = get("HEALTH_CHECK_INTERVAL").and_then(|v| v.parse().ok()) {
            self.health_check_interval_ms = v;
        }
        if let Some(v) = get("PROXY_DOMAINS_URL") {
            self.proxy_domains_url = v;
        }
        if let Some(v) = get("PROXY_DOMAINS_FILE") {
            self.proxy_domains_file = v;
        }
    }

    /// 启动时调用一次；之后各组件直接信任字段取值。
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::Validation(msg.to_string()));

        if self.bind_addr.trim().is_empty() {
            return fail("bind_addr 不能为空");
        }
        if !matches!(self.relay_scheme.as_str(), "http" | "https") {
            return fail("relay_scheme 只能是 http 或 https");
        }
        if self.allowed_hosts.iter().all(|h| h.trim().is_empty()) {
            return fail("allowed_hosts 至少需要一个域名");
        }
        if self.proxy_domains_url.trim().is_empty() {
            return fail("proxy_domains_url 不能为空");
        }
        if self.probe_timeout_ms == 0
            || self.health_check_interval_ms == 0
            || self.upstream_connect_timeout_secs == 0
            || self.upstream_header_timeout_secs == 0
            || self.upstream_idle_timeout_secs == 0
        {
            return fail("超时与间隔配置必须大于 0");
        }
        if !(self.small_file_threshold_mb < self.medium_file_threshold_mb
            && self.medium_file_threshold_mb < self.large_file_threshold_mb)
        {
            return fail("文件大小阈值必须满足 small < medium < large");
        }
        if self.default_shard_count == 0 {
            return fail("default_shard_count 必须大于 0");
        }
        Ok(())
    }

    pub fn set_data_dir(&mut self, dir: Option<&Path>) {
        self.data_dir = dir.map(Path::to_path_buf);
    }

    /// 本地域名列表文件的实际路径（相对路径挂在数据目录下）。
    pub fn domains_file_path(&self) -> PathBuf {
        let raw = PathBuf::from(self.proxy_domains_file.trim());
        match &self.data_dir {
            Some(base) if raw.is_relative() => base.join(raw),
            _ => raw,
        }
    }

    pub fn size_tiers(&self) -> SizeTiers {
        SizeTiers {
            enabled: self.enable_multi_proxy,
            small_mb: self.small_file_threshold_mb,
            medium_mb: self.medium_file_threshold_mb,
            large_mb: self.large_file_threshold_mb,
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_duration_secs)
    }

    pub fn fastest_ttl(&self) -> Duration {
        Duration::from_millis(self.proxy_cache_duration_ms)
    }

    pub fn management_locked(&self) -> bool {
        self.safe_token.trim().is_empty()
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_proxy_domains_url() -> String {
    "https://raw.githubusercontent.com/rdone4425/qita/refs/heads/main/proxy.txt".to_string()
}

fn default_proxy_domains_file() -> String {
    "data/proxy.txt".to_string()
}

fn default_relay_scheme() -> String {
    "https".to_string()
}

fn default_allowed_hosts() -> Vec<String> {
    vec![
        "github.com".to_string(),
        "githubusercontent.com".to_string(),
        "githubassets.com".to_string(),
    ]
}

fn default_probe_path() -> String {
    "raw.githubusercontent.com/rdone4425/qita/refs/heads/main/test.txt".to_string()
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_health_check_interval_ms() -> u64 {
    3_600_000
}

fn default_cache_duration_secs() -> u64 {
    300
}

fn default_proxy_cache_duration_ms() -> u64 {
    60_000
}

fn default_upstream_connect_timeout_secs() -> u64 {
    10
}

fn default_upstream_header_timeout_secs() -> u64 {
    30
}

fn default_upstream_idle_timeout_secs() -> u64 {
    60
}

fn default_github_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_small_file_threshold() -> u64 {
    5
}

fn default_medium_file_threshold() -> u64 {
    50
}

fn default_large_file_threshold() -> u64 {
    100
}

fn default_shard_count() -> usize {
    5
}
