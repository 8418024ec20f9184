//! 代理域名池：启动时从本地文件加载，可从远程列表刷新，并记录各域名的测速结果。
//!
//! 列表、轮询游标与测速记录放在同一把读写锁里；刷新时整体替换，
//! 读者只会看到刷新前或刷新后的完整列表。每次刷新递增 `generation`，
//! 旧一代的测速结果（包括缓存的最快域名）不会带到新列表上。

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use serde::Serialize;
use tracing::{info, warn};

use super::error::{RelayError, RelayResult};
use super::prober::ProbeOutcome;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainRecord {
    pub domain: String,
    /// None 表示不可达（或尚未测速）。
    pub last_latency_ms: Option<u64>,
    pub last_checked_ms: u64,
    pub healthy: bool,
}

/// 远程域名列表来源。
#[async_trait]
pub trait DomainSource: Send + Sync {
    async fn fetch(&self) -> RelayResult<String>;
}

pub struct HttpDomainSource {
    client: Client,
    url: String,
}

impl HttpDomainSource {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl DomainSource for HttpDomainSource {
    async fn fetch(&self) -> RelayResult<String> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| RelayError::Fetch(format!("{}: {e}", self.url)))?;
        resp.text()
            .await
            .map_err(|e| RelayError::Fetch(format!("read body: {e}")))
    }
}

/// 本地持久化的域名列表（纯文本，每行一个域名）。
#[derive(Debug, Clone)]
pub struct DomainFile {
    path: PathBuf,
}

impl DomainFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 文件不存在时返回 `Ok(None)`。
    pub fn load(&self) -> io::Result<Option<Vec<String>>> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => Ok(Some(parse_domain_list(&raw))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn save(&self, domains: &[String]) -> io::Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        // 先写临时文件再 rename，避免进程中途退出留下半截列表。
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, domains.join("\n"))?;
        fs::rename(&tmp, &self.path)
    }
}

/// 解析换行分隔的域名列表：去掉首尾空白，忽略空行与 `#` 注释，去重保序。
pub fn parse_domain_list(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for line in raw.lines() {
        let d = line.trim();
        if d.is_empty() || d.starts_with('#') {
            continue;
        }
        let d = d.trim_end_matches('/');
        if !out.iter().any(|x| x == d) {
            out.push(d.to_string());
        }
    }
    out
}

#[derive(Debug, Default)]
struct PoolState {
    domains: Arc<[String]>,
    cursor: usize,
    generation: u64,
    records: HashMap<String, DomainRecord>,
}

impl PoolState {
    fn replace(&mut self, domains: Vec<String>) {
        self.domains = domains.into();
        self.cursor = 0;
        self.generation += 1;
        self.records.clear();
    }
}

pub struct DomainPool {
    state: RwLock<PoolState>,
    source: Arc<dyn DomainSource>,
    store: DomainFile,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl DomainPool {
    pub fn new(source: Arc<dyn DomainSource>, store: DomainFile) -> Self {
        Self {
            state: RwLock::new(PoolState::default()),
            source,
            store,
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// 启动加载：优先本地文件，不存在或为空时从远程刷新。
    pub async fn load(&self) -> RelayResult<Vec<String>> {
        match self.store.load() {
            Ok(Some(domains)) if !domains.is_empty() => {
                info!(
                    target: "relay",
                    count = domains.len(),
                    path = %self.store.path().display(),
                    "从本地文件加载了代理域名"
                );
                self.write().replace(domains.clone());
                return Ok(domains);
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    target: "relay",
                    path = %self.store.path().display(),
                    error = %e,
                    "读取本地代理域名文件失败，改为远程获取"
                );
            }
        }
        self.refresh().await
    }

    /// 从远程列表刷新。失败时保持原列表不变；不做内部重试。
    pub async fn refresh(&self) -> RelayResult<Vec<String>> {
        let _serial = self.refresh_lock.lock().await;

        let raw = self.source.fetch().await?;
        let domains = parse_domain_list(&raw);
        if domains.is_empty() {
            return Err(RelayError::Fetch("remote domain list is empty".to_string()));
        }

        self.write().replace(domains.clone());

        if let Err(e) = self.store.save(&domains) {
            warn!(
                target: "relay",
                path = %self.store.path().display(),
                error = %e,
                "代理域名列表持久化失败（内存中的列表已更新）"
            );
        }

        info!(target: "relay", count = domains.len(), "更新了代理域名列表");
        Ok(domains)
    }

    /// 当前列表的拷贝。
    pub fn list(&self) -> Vec<String> {
        self.read().domains.to_vec()
    }

    /// 当前代数与列表（共享同一份不可变切片，开销很小）。
    pub fn snapshot(&self) -> (u64, Arc<[String]>) {
        let state = self.read();
        (state.generation, state.domains.clone())
    }

    pub fn len(&self) -> usize {
        self.read().domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn generation(&self) -> u64 {
        self.read().generation
    }

    /// 取游标处的域名并前进一格；读取与前进在同一把写锁内完成。
    pub fn next_round_robin(&self) -> Option<String> {
        let mut state = self.write();
        let len = state.domains.len();
        if len == 0 {
            return None;
        }
        let idx = state.cursor % len;
        state.cursor = (idx + 1) % len;
        Some(state.domains[idx].clone())
    }

    pub fn random(&self) -> Option<String> {
        let state = self.read();
        if state.domains.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..state.domains.len());
        Some(state.domains[idx].clone())
    }

    /// 写入一轮测速结果。`generation` 与当前不一致时整批丢弃（测速期间列表已被刷新）。
    pub fn record_probes(&self, generation: u64, outcomes: &[ProbeOutcome]) -> bool {
        let mut state = self.write();
        if state.generation != generation {
            return false;
        }
        let now = now_ms();
        for outcome in outcomes {
            if !state.domains.iter().any(|d| d == &outcome.domain) {
                continue;
            }
            state.records.insert(
                outcome.domain.clone(),
                DomainRecord {
                    domain: outcome.domain.clone(),
                    last_latency_ms: outcome.latency_ms.filter(|_| outcome.success),
                    last_checked_ms: now,
                    healthy: outcome.success,
                },
            );
        }
        true
    }

    /// 按池顺序返回已有的测速记录。
    pub fn records(&self) -> Vec<DomainRecord> {
        let state = self.read();
        state
            .domains
            .iter()
            .filter_map(|d| state.records.get(d).cloned())
            .collect()
    }

    /// 分块下载用的域名顺序：健康的按延迟升序，其次未测速的，最后不健康的；同类保持池顺序。
    pub fn ranked(&self) -> Vec<String> {
        let state = self.read();
        let mut ranked: Vec<(usize, u8, u64, String)> = state
            .domains
            .iter()
            .enumerate()
            .map(|(idx, d)| {
                let (class, latency) = match state.records.get(d) {
                    Some(r) if r.healthy => (0, r.last_latency_ms.unwrap_or(u64::MAX)),
                    Some(_) => (2, u64::MAX),
                    None => (1, u64::MAX),
                };
                (idx, class, latency, d.clone())
            })
            .collect();
        ranked.sort_by_key(|(idx, class, latency, _)| (*class, *latency, *idx));
        ranked.into_iter().map(|(_, _, _, d)| d).collect()
    }

    #[cfg(test)]
    pub(crate) fn replace_for_test(&self, domains: &[&str]) {
        self.write()
            .replace(domains.iter().map(|d| d.to_string()).collect());
    }

    fn read(&self) -> RwLockReadGuard<'_, PoolState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, PoolState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
