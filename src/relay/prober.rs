//! 代理域名测速。
//!
//! 每个域名发一次 GET 拉取一个很小的测试资源，记录耗时；失败是返回值而不是错误。

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::join_all;
use reqwest::Client;
use reqwest::header::USER_AGENT;
use serde::Serialize;
use tracing::debug;

pub(crate) const PROBE_USER_AGENT: &str = "GitHub-Proxy-Service";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeOutcome {
    pub domain: String,
    pub success: bool,
    pub latency_ms: Option<u64>,
    /// 上游 HTTP 状态码；网络错误/超时时为 None。
    pub status: Option<u16>,
    pub reason: Option<String>,
}

impl ProbeOutcome {
    pub fn ok(domain: impl Into<String>, latency_ms: u64, status: u16) -> Self {
        Self {
            domain: domain.into(),
            success: true,
            latency_ms: Some(latency_ms),
            status: Some(status),
            reason: None,
        }
    }

    pub fn failed(domain: impl Into<String>, status: Option<u16>, reason: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            success: false,
            latency_ms: None,
            status,
            reason: Some(reason.into()),
        }
    }
}

#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, domain: &str) -> ProbeOutcome;
}

/// 并发测速所有域名并等待全部完成（而不是取第一个成功的）。结果与输入顺序一致。
pub async fn probe_all(prober: &dyn Prober, domains: &[String]) -> Vec<ProbeOutcome> {
    join_all(domains.iter().map(|d| prober.probe(d))).await
}

pub struct HttpProber {
    client: Client,
    scheme: String,
    probe_path: String,
    timeout: Duration,
}

impl HttpProber {
    pub fn new(
        client: Client,
        scheme: impl Into<String>,
        probe_path: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            scheme: scheme.into(),
            probe_path: probe_path.into().trim_start_matches('/').to_string(),
            timeout,
        }
    }

    fn probe_url(&self, domain: &str) -> String {
        format!("{}://{}/{}", self.scheme, domain, self.probe_path)
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, domain: &str) -> ProbeOutcome {
        let url = self.probe_url(domain);
        let started = Instant::now();

        let result = self
            .client
            .get(&url)
            .header(USER_AGENT, PROBE_USER_AGENT)
            .timeout(self.timeout)
            .send()
            .await;

        let outcome = match result {
            Ok(resp) if resp.status().is_success() => {
                let status = resp.status().as_u16();
                // 把 body 读完才算一次完整的下载耗时。
                match resp.bytes().await {
                    Ok(_) => {
                        ProbeOutcome::ok(domain, started.elapsed().as_millis() as u64, status)
                    }
                    Err(e) => ProbeOutcome::failed(domain, None, describe(&e)),
                }
            }
            Ok(resp) => {
                let status = resp.status();
                ProbeOutcome::failed(domain, Some(status.as_u16()), format!("HTTP {status}"))
            }
            Err(e) => ProbeOutcome::failed(domain, e.status().map(|s| s.as_u16()), describe(&e)),
        };

        debug!(
            target: "relay",
            domain,
            success = outcome.success,
            latency_ms = ?outcome.latency_ms,
            "probe finished"
        );
        outcome
    }
}

fn describe(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        "timeout".to_string()
    } else if err.is_connect() {
        "connect error".to_string()
    } else {
        err.to_string()
    }
}
