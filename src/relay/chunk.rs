//! 多代理分块下载计划。
//!
//! 先经第一个代理发 HEAD 拿到资源大小，再把 `[0, size)` 均分成若干连续区间，
//! 每个区间分配一个不同的代理域名。拼接由客户端负责。

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, USER_AGENT};
use serde::Serialize;
use tracing::debug;

use super::error::{RelayError, RelayResult};
use super::pool::DomainPool;
use super::prober::PROBE_USER_AGENT;
use super::proxied_url;

const MB: u64 = 1024 * 1024;
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// 按文件大小决定分块数的阈值（单位 MB）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeTiers {
    pub enabled: bool,
    pub small_mb: u64,
    pub medium_mb: u64,
    pub large_mb: u64,
}

impl SizeTiers {
    /// 关闭多代理时恒为 1；否则按 small/medium/large 依次为 1/3/5，超过 large 为 10。
    pub fn shard_count_for_size(&self, size: u64) -> usize {
        if !self.enabled {
            return 1;
        }
        if size < self.small_mb * MB {
            1
        } else if size < self.medium_mb * MB {
            3
        } else if size < self.large_mb * MB {
            5
        } else {
            10
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceMeta {
    pub content_length: Option<u64>,
    pub content_type: String,
}

#[async_trait]
pub trait HeadProbe: Send + Sync {
    async fn head(&self, url: &str) -> RelayResult<ResourceMeta>;
}

pub struct HttpHeadProbe {
    client: Client,
}

impl HttpHeadProbe {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HeadProbe for HttpHeadProbe {
    async fn head(&self, url: &str) -> RelayResult<ResourceMeta> {
        let resp = self
            .client
            .head(url)
            .header(USER_AGENT, PROBE_USER_AGENT)
            .send()
            .await
            .map_err(|e| RelayError::upstream(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(RelayError::Upstream {
                status: Some(status.as_u16()),
                message: format!("HEAD {url}: HTTP {status}"),
            });
        }

        // HEAD 响应没有 body，reqwest 的 content_length() 会给 0，这里直接读头。
        let headers = resp.headers();
        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();

        Ok(ResourceMeta {
            content_length,
            content_type,
        })
    }
}

/// 闭区间 `[start, end]`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Shard {
    pub index: usize,
    pub domain: String,
    pub proxied_url: String,
    pub start_byte: Option<u64>,
    pub end_byte: Option<u64>,
    pub size: Option<u64>,
    /// 下载该分块时应携带的 `Range` 头；大小未知时为 None。
    pub range: Option<String>,
}

impl Shard {
    fn new(index: usize, domain: &str, url: String, range: Option<ByteRange>) -> Self {
        Self {
            index,
            domain: domain.to_string(),
            proxied_url: url,
            start_byte: range.map(|r| r.start),
            end_byte: range.map(|r| r.end),
            size: range.map(|r| r.size()),
            range: range.map(|r| r.header_value()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkPlan {
    pub target: String,
    pub total_size: Option<u64>,
    pub content_type: String,
    pub shard_count: usize,
    pub shards: Vec<Shard>,
}

/// 把 `[0, total)` 切成最多 `n` 个连续区间，每段 `ceil(total / n)` 字节，末段截到 `total - 1`。
/// 向上取整后起点已越过末尾的区间不生成，因此区间数可能少于 `n`。
pub fn partition(total: u64, n: usize) -> Vec<ByteRange> {
    if total == 0 || n == 0 {
        return Vec::new();
    }
    let chunk = total.div_ceil(n as u64);
    (0..n as u64)
        .map(|i| i * chunk)
        .take_while(|&start| start < total)
        .map(|start| ByteRange {
            start,
            end: (start + chunk - 1).min(total - 1),
        })
        .collect()
}

pub struct ChunkPlanner {
    pool: Arc<DomainPool>,
    head: Arc<dyn HeadProbe>,
    scheme: String,
    tiers: SizeTiers,
    default_count: usize,
}

impl ChunkPlanner {
    pub fn new(
        pool: Arc<DomainPool>,
        head: Arc<dyn HeadProbe>,
        scheme: impl Into<String>,
        tiers: SizeTiers,
        default_count: usize,
    ) -> Self {
        Self {
            pool,
            head,
            scheme: scheme.into(),
            tiers,
            default_count: default_count.max(1),
        }
    }

    pub fn tiers(&self) -> SizeTiers {
        self.tiers
    }

    /// 经指定代理读取资源元数据。
    pub async fn describe(&self, relay: &str, target: &str) -> RelayResult<ResourceMeta> {
        self.head.head(&proxied_url(&self.scheme, relay, target)).await
    }

    /// 生成分块计划。`requested` 为 None 时按文件大小分级；未启用分级时用默认分块数。
    pub async fn plan(&self, target: &str, requested: Option<usize>) -> RelayResult<ChunkPlan> {
        let ranked = self.pool.ranked();
        let Some(first) = ranked.first() else {
            return Err(RelayError::NoDomainAvailable);
        };

        let meta = self.describe(first, target).await?;

        let Some(total) = meta.content_length else {
            debug!(target: "relay", url = target, "资源大小未知，使用单一代理");
            let shard = Shard::new(0, first, proxied_url(&self.scheme, first, target), None);
            return Ok(ChunkPlan {
                target: target.to_string(),
                total_size: None,
                content_type: meta.content_type,
                shard_count: 1,
                shards: vec![shard],
            });
        };

        let wanted = match requested {
            Some(n) => n.max(1),
            None if self.tiers.enabled => self.tiers.shard_count_for_size(total),
            None => self.default_count,
        };
        let n = wanted.min(ranked.len());

        let shards: Vec<Shard> = partition(total, n)
            .into_iter()
            .zip(ranked.iter())
            .enumerate()
            .map(|(i, (range, domain))| {
                Shard::new(i, domain, proxied_url(&self.scheme, domain, target), Some(range))
            })
            .collect();

        debug!(
            target: "relay",
            url = target,
            total,
            shards = shards.len(),
            "生成分块下载计划"
        );

        Ok(ChunkPlan {
            target: target.to_string(),
            total_size: Some(total),
            content_type: meta.content_type,
            shard_count: shards.len(),
            shards,
        })
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use std::sync::Mutex;

    use super::*;

    /// 返回固定元数据并记录请求地址的 HEAD 探测。
    pub(crate) struct FixedHead {
        meta: ResourceMeta,
        pub(crate) urls: Mutex<Vec<String>>,
    }

    impl FixedHead {
        pub(crate) fn new(content_length: Option<u64>, content_type: &str) -> Self {
            Self {
                meta: ResourceMeta {
                    content_length,
                    content_type: content_type.to_string(),
                },
                urls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl HeadProbe for FixedHead {
        async fn head(&self, url: &str) -> RelayResult<ResourceMeta> {
            self.urls.lock().unwrap().push(url.to_string());
            Ok(self.meta.clone())
        }
    }
}
