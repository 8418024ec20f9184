//! 代理域名选择策略。

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::cache::ResultCache;
use super::error::{RelayError, RelayResult};
use super::pool::DomainPool;
use super::prober::{Prober, probe_all};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    #[default]
    Fastest,
    Random,
    RoundRobin,
}

impl StrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::Fastest => "fastest",
            StrategyKind::Random => "random",
            StrategyKind::RoundRobin => "round-robin",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fastest" => Ok(StrategyKind::Fastest),
            "random" => Ok(StrategyKind::Random),
            "round-robin" | "round_robin" | "roundrobin" => Ok(StrategyKind::RoundRobin),
            other => Err(format!("unknown proxy strategy: {other}")),
        }
    }
}

fn fastest_key(generation: u64) -> String {
    format!("fastest-domain:{generation}")
}

pub struct DomainSelector {
    kind: StrategyKind,
    pool: Arc<DomainPool>,
    prober: Arc<dyn Prober>,
    cache: Arc<ResultCache<Value>>,
    fastest_ttl: Duration,
    // 同一时刻只跑一轮全量测速，其余调用等它写入缓存。
    sweep: Mutex<()>,
}

impl DomainSelector {
    pub fn new(
        kind: StrategyKind,
        pool: Arc<DomainPool>,
        prober: Arc<dyn Prober>,
        cache: Arc<ResultCache<Value>>,
        fastest_ttl: Duration,
    ) -> Self {
        Self {
            kind,
            pool,
            prober,
            cache,
            fastest_ttl,
            sweep: Mutex::new(()),
        }
    }

    pub fn kind(&self) -> StrategyKind {
        self.kind
    }

    pub async fn select(&self) -> RelayResult<String> {
        self.select_with(self.kind).await
    }

    pub async fn select_with(&self, kind: StrategyKind) -> RelayResult<String> {
        match kind {
            StrategyKind::Fastest => self.pick_fastest().await,
            StrategyKind::Random => self.pool.random().ok_or(RelayError::NoDomainAvailable),
            StrategyKind::RoundRobin => self
                .pool
                .next_round_robin()
                .ok_or(RelayError::NoDomainAvailable),
        }
    }

    /// 全部测速后取最低延迟；延迟相同按池顺序。全部失败时退回随机。
    pub async fn pick_fastest(&self) -> RelayResult<String> {
        let (generation, domains) = self.pool.snapshot();
        if domains.is_empty() {
            return Err(RelayError::NoDomainAvailable);
        }

        let key = fastest_key(generation);
        if let Some(cached) = self.cached_fastest(&key, &domains) {
            return Ok(cached);
        }

        let _sweep = self.sweep.lock().await;
        if let Some(cached) = self.cached_fastest(&key, &domains) {
            return Ok(cached);
        }

        let outcomes = probe_all(self.prober.as_ref(), &domains).await;
        self.pool.record_probes(generation, &outcomes);

        let winner = outcomes
            .iter()
            .filter(|o| o.success)
            .filter_map(|o| o.latency_ms.map(|ms| (ms, o.domain.as_str())))
            // min_by_key 在相等时保留第一个，即池中靠前的域名。
            .min_by_key(|(ms, _)| *ms);

        match winner {
            Some((ms, domain)) => {
                debug!(target: "relay", domain, latency_ms = ms, "selected fastest proxy");
                self.cache
                    .set_with_ttl(key, Value::String(domain.to_string()), self.fastest_ttl);
                Ok(domain.to_string())
            }
            None => {
                warn!(target: "relay", "所有代理域名测速均失败，随机选择一个");
                self.pool.random().ok_or(RelayError::NoDomainAvailable)
            }
        }
    }

    fn cached_fastest(&self, key: &str, domains: &[String]) -> Option<String> {
        match self.cache.get(key) {
            Some(Value::String(cached)) if domains.iter().any(|d| d == &cached) => Some(cached),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::relay::pool::fakes::{ScriptedSource, pool_with};
    use crate::relay::prober::fakes::ScriptedProber;

    fn selector(
        kind: StrategyKind,
        pool: Arc<DomainPool>,
        prober: Arc<ScriptedProber>,
    ) -> (DomainSelector, Arc<ResultCache<Value>>) {
        let cache = Arc::new(ResultCache::new(Duration::from_secs(300)));
        let sel = DomainSelector::new(kind, pool, prober, cache.clone(), Duration::from_secs(60));
        (sel, cache)
    }

    #[test]
    fn parses_strategy_names() {
        assert_eq!("round-robin".parse::<StrategyKind>(), Ok(StrategyKind::RoundRobin));
        assert_eq!(" Fastest ".parse::<StrategyKind>(), Ok(StrategyKind::Fastest));
        assert!("slowest".parse::<StrategyKind>().is_err());
        assert_eq!(StrategyKind::RoundRobin.to_string(), "round-robin");
    }

    #[tokio::test]
    async fn fastest_picks_lowest_latency_among_successes() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _) = pool_with(ScriptedSource::unreachable(), dir.path());
        pool.replace_for_test(&["a.com", "b.com", "c.com"]);
        let prober = Arc::new(ScriptedProber::new(&[("a.com", Some(120)), ("c.com", Some(80))]));
        let (sel, _) = selector(StrategyKind::Fastest, pool.clone(), prober);

        assert_eq!(sel.select().await.unwrap(), "c.com");
        let records = pool.records();
        assert_eq!(records.len(), 3);
        assert!(!records[1].healthy);
    }

    #[tokio::test]
    async fn fastest_with_single_success_returns_it() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _) = pool_with(ScriptedSource::unreachable(), dir.path());
        pool.replace_for_test(&["a.com", "b.com", "c.com"]);
        let prober = Arc::new(ScriptedProber::new(&[("b.com", Some(300))]));
        let (sel, _) = selector(StrategyKind::Fastest, pool, prober);

        assert_eq!(sel.select().await.unwrap(), "b.com");
    }

    #[tokio::test]
    async fn fastest_ties_go_to_pool_order() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _) = pool_with(ScriptedSource::unreachable(), dir.path());
        pool.replace_for_test(&["a.com", "b.com", "c.com"]);
        let prober = Arc::new(ScriptedProber::new(&[
            ("a.com", Some(90)),
            ("b.com", Some(50)),
            ("c.com", Some(50)),
        ]));
        let (sel, _) = selector(StrategyKind::Fastest, pool, prober);

        assert_eq!(sel.select().await.unwrap(), "b.com");
    }

    #[tokio::test]
    async fn fastest_result_is_cached_until_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _) = pool_with(ScriptedSource::ok("a.com\nc.com"), dir.path());
        pool.replace_for_test(&["a.com", "c.com"]);
        let prober = Arc::new(ScriptedProber::new(&[("a.com", Some(120)), ("c.com", Some(80))]));
        let (sel, _) = selector(StrategyKind::Fastest, pool.clone(), prober.clone());

        assert_eq!(sel.select().await.unwrap(), "c.com");
        assert_eq!(sel.select().await.unwrap(), "c.com");
        assert_eq!(prober.calls(), 2);

        pool.refresh().await.unwrap();
        assert_eq!(sel.select().await.unwrap(), "c.com");
        assert_eq!(prober.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_fastest_callers_share_one_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _) = pool_with(ScriptedSource::unreachable(), dir.path());
        pool.replace_for_test(&["a.com", "b.com", "c.com"]);
        let prober = Arc::new(
            ScriptedProber::new(&[("a.com", Some(90)), ("b.com", Some(40)), ("c.com", Some(70))])
                .with_delay(Duration::from_millis(500)),
        );
        let (sel, _) = selector(StrategyKind::Fastest, pool, prober.clone());

        let picks = futures_util::future::join_all((0..8).map(|_| sel.select())).await;
        for pick in picks {
            assert_eq!(pick.unwrap(), "b.com");
        }
        assert_eq!(prober.calls(), 3);
    }

    #[tokio::test]
    async fn fastest_falls_back_to_random_when_all_probes_fail() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _) = pool_with(ScriptedSource::unreachable(), dir.path());
        pool.replace_for_test(&["a.com", "b.com"]);
        let prober = Arc::new(ScriptedProber::default());
        let (sel, cache) = selector(StrategyKind::Fastest, pool, prober);

        let picked = sel.select().await.unwrap();
        assert!(picked == "a.com" || picked == "b.com");
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn random_stays_inside_pool_without_probing() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _) = pool_with(ScriptedSource::unreachable(), dir.path());
        pool.replace_for_test(&["a.com", "b.com", "c.com"]);
        let prober = Arc::new(ScriptedProber::default());
        let (sel, _) = selector(StrategyKind::Random, pool, prober.clone());

        for _ in 0..20 {
            let d = sel.select().await.unwrap();
            assert!(["a.com", "b.com", "c.com"].contains(&d.as_str()));
        }
        assert_eq!(prober.calls(), 0);
    }

    #[tokio::test]
    async fn round_robin_repeats_after_full_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _) = pool_with(ScriptedSource::unreachable(), dir.path());
        pool.replace_for_test(&["a.com", "b.com", "c.com"]);
        let (sel, _) = selector(StrategyKind::RoundRobin, pool, Arc::new(ScriptedProber::default()));

        let mut picks = Vec::new();
        for _ in 0..4 {
            picks.push(sel.select().await.unwrap());
        }
        assert_eq!(picks, ["a.com", "b.com", "c.com", "a.com"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_round_robin_visits_each_domain_once_per_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _) = pool_with(ScriptedSource::unreachable(), dir.path());
        let names: Vec<String> = (0..8).map(|i| format!("r{i}.com")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        pool.replace_for_test(&refs);
        let (sel, _) = selector(StrategyKind::RoundRobin, pool, Arc::new(ScriptedProber::default()));
        let sel = Arc::new(sel);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sel = sel.clone();
                tokio::spawn(async move { sel.select().await.unwrap() })
            })
            .collect();
        let mut seen = HashSet::new();
        for h in handles {
            seen.insert(h.await.unwrap());
        }
        assert_eq!(seen.len(), 8);
    }

    #[tokio::test]
    async fn empty_pool_fails_every_strategy() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _) = pool_with(ScriptedSource::unreachable(), dir.path());
        let prober = Arc::new(ScriptedProber::default());
        let (sel, _) = selector(StrategyKind::Fastest, pool, prober.clone());

        for kind in [StrategyKind::Fastest, StrategyKind::Random, StrategyKind::RoundRobin] {
            assert!(matches!(
                sel.select_with(kind).await,
                Err(RelayError::NoDomainAvailable)
            ));
        }
        assert_eq!(prober.calls(), 0);
    }
}
