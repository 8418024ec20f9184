//! 请求与流量统计。

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    ProxyRequests,
    ProxyBytes,
    ApiRequests,
    Errors,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DomainStats {
    pub requests: u64,
    pub bytes: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RankedDomain {
    pub domain: String,
    #[serde(flatten)]
    pub stats: DomainStats,
    pub bytes_human: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub started_at: String,
    pub uptime_secs: u64,
    pub uptime_human: String,
    pub proxy_requests: u64,
    pub proxy_bytes: u64,
    pub proxy_bytes_human: String,
    pub api_requests: u64,
    pub errors: u64,
    pub requests_per_second: f64,
    pub bytes_per_second: f64,
    pub domains: Vec<RankedDomain>,
}

struct StatsInner {
    started_at: OffsetDateTime,
    started: Instant,
    proxy_requests: u64,
    proxy_bytes: u64,
    api_requests: u64,
    errors: u64,
    domains: HashMap<String, DomainStats>,
}

impl StatsInner {
    fn fresh() -> Self {
        Self {
            started_at: OffsetDateTime::now_utc(),
            started: Instant::now(),
            proxy_requests: 0,
            proxy_bytes: 0,
            api_requests: 0,
            errors: 0,
            domains: HashMap::new(),
        }
    }
}

pub struct StatsCollector {
    inner: Mutex<StatsInner>,
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StatsInner::fresh()),
        }
    }

    /// 累加计数器；给出 `domain` 时同时累加该代理域名的分项（API 请求没有分项）。
    pub fn increment(&self, counter: Counter, value: u64, domain: Option<&str>) {
        let mut inner = self.lock();
        match counter {
            Counter::ProxyRequests => inner.proxy_requests += value,
            Counter::ProxyBytes => inner.proxy_bytes += value,
            Counter::ApiRequests => inner.api_requests += value,
            Counter::Errors => inner.errors += value,
        }

        let Some(domain) = domain else { return };
        if counter == Counter::ApiRequests {
            return;
        }
        let entry = inner.domains.entry(domain.to_string()).or_default();
        match counter {
            Counter::ProxyRequests => entry.requests += value,
            Counter::ProxyBytes => entry.bytes += value,
            Counter::Errors => entry.errors += value,
            Counter::ApiRequests => {}
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.lock();
        let uptime = inner.started.elapsed();
        let secs = uptime.as_secs_f64();
        let rate = |v: u64| if secs > 0.0 { v as f64 / secs } else { 0.0 };

        let mut domains: Vec<RankedDomain> = inner
            .domains
            .iter()
            .map(|(domain, stats)| RankedDomain {
                domain: domain.clone(),
                stats: stats.clone(),
                bytes_human: format_bytes(stats.bytes),
            })
            .collect();
        domains.sort_by(|a, b| {
            b.stats
                .requests
                .cmp(&a.stats.requests)
                .then_with(|| a.domain.cmp(&b.domain))
        });

        StatsSnapshot {
            started_at: inner.started_at.format(&Rfc3339).unwrap_or_default(),
            uptime_secs: uptime.as_secs(),
            uptime_human: format_duration(uptime),
            proxy_requests: inner.proxy_requests,
            proxy_bytes: inner.proxy_bytes,
            proxy_bytes_human: format_bytes(inner.proxy_bytes),
            api_requests: inner.api_requests,
            errors: inner.errors,
            requests_per_second: rate(inner.proxy_requests),
            bytes_per_second: rate(inner.proxy_bytes),
            domains,
        }
    }

    pub fn reset(&self) {
        *self.lock() = StatsInner::fresh();
    }

    fn lock(&self) -> MutexGuard<'_, StatsInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;

    let mut out = String::new();
    if days > 0 {
        out.push_str(&format!("{days}天"));
    }
    if hours > 0 {
        out.push_str(&format!("{hours}小时"));
    }
    if minutes > 0 {
        out.push_str(&format!("{minutes}分钟"));
    }
    if seconds > 0 || out.is_empty() {
        out.push_str(&format!("{seconds}秒"));
    }
    out
}
