use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::Client;
use reqwest::redirect::Policy;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::base_system::context::Config;
use crate::base_system::scheduler::PeriodicTask;
use crate::relay::cache::ResultCache;
use crate::relay::chunk::{ChunkPlanner, HeadProbe, HttpHeadProbe};
use crate::relay::gateway::{AllowList, GatewayOptions, RelayGateway};
use crate::relay::health::HealthMonitor;
use crate::relay::pool::{DomainFile, DomainPool, DomainSource, HttpDomainSource};
use crate::relay::prober::{HttpProber, Prober};
use crate::relay::releases::ReleaseClient;
use crate::relay::stats::StatsCollector;
use crate::relay::strategy::DomainSelector;

const MAX_REDIRECTS: usize = 5;
const CACHE_SWEEP_PERIOD: Duration = Duration::from_secs(60);

/// 运行期共享的服务对象；各自内部加锁，外层只需 `Arc`。
pub(crate) struct Services {
    pub(crate) config: Config,
    pub(crate) pool: Arc<DomainPool>,
    pub(crate) selector: Arc<DomainSelector>,
    pub(crate) monitor: Arc<HealthMonitor>,
    pub(crate) cache: Arc<ResultCache<Value>>,
    pub(crate) stats: Arc<StatsCollector>,
    pub(crate) gateway: RelayGateway,
    pub(crate) planner: ChunkPlanner,
    pub(crate) releases: ReleaseClient,
    pub(crate) started: Instant,
}

impl Services {
    pub(crate) fn build(config: Config) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.upstream_connect_timeout_secs))
            .redirect(Policy::limited(MAX_REDIRECTS))
            .build()
            .context("build http client")?;

        let source = Arc::new(HttpDomainSource::new(
            client.clone(),
            config.proxy_domains_url.clone(),
        ));
        let prober = Arc::new(HttpProber::new(
            client.clone(),
            config.relay_scheme.clone(),
            config.probe_path.clone(),
            config.probe_timeout(),
        ));
        let head = Arc::new(HttpHeadProbe::new(client.clone()));

        Ok(Self::assemble(config, client, source, prober, head))
    }

    /// 按给定的外部依赖组装服务；测试用它注入假的域名来源与测速器。
    pub(crate) fn assemble(
        config: Config,
        client: Client,
        source: Arc<dyn DomainSource>,
        prober: Arc<dyn Prober>,
        head: Arc<dyn HeadProbe>,
    ) -> Self {
        let pool = Arc::new(DomainPool::new(
            source,
            DomainFile::new(config.domains_file_path()),
        ));
        let cache = Arc::new(ResultCache::new(config.cache_ttl()));
        let stats = Arc::new(StatsCollector::new());

        let selector = Arc::new(DomainSelector::new(
            config.proxy_strategy,
            pool.clone(),
            prober.clone(),
            cache.clone(),
            config.fastest_ttl(),
        ));
        let monitor = Arc::new(HealthMonitor::new(pool.clone(), prober));

        let gateway = RelayGateway::new(
            client.clone(),
            selector.clone(),
            AllowList::new(&config.allowed_hosts),
            stats.clone(),
            GatewayOptions {
                relay_scheme: config.relay_scheme.clone(),
                header_timeout: Duration::from_secs(config.upstream_header_timeout_secs),
                idle_timeout: Duration::from_secs(config.upstream_idle_timeout_secs),
            },
        );
        let planner = ChunkPlanner::new(
            pool.clone(),
            head,
            config.relay_scheme.clone(),
            config.size_tiers(),
            config.default_shard_count,
        );
        let releases = ReleaseClient::new(client, config.github_api_base.clone(), cache.clone());

        Self {
            config,
            pool,
            selector,
            monitor,
            cache,
            stats,
            gateway,
            planner,
            releases,
            started: Instant::now(),
        }
    }

    /// 启动后台任务：健康巡检与缓存清理。
    pub(crate) fn spawn_background(&self) -> Vec<PeriodicTask> {
        let health = self
            .monitor
            .spawn(self.config.health_check_interval());

        let cache = self.cache.clone();
        let sweep = PeriodicTask::spawn("cache-sweep", CACHE_SWEEP_PERIOD, false, move || {
            let cache = cache.clone();
            async move {
                let purged = cache.purge_expired();
                if purged > 0 {
                    debug!(target: "relay", purged, "清理过期缓存");
                }
            }
        });

        vec![health, sweep]
    }
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) bind_addrs: Arc<Vec<SocketAddr>>,
    pub(crate) services: Arc<Services>,
    pub(crate) auth: Option<AuthState>,
    /// 服务关停时取消，进行中的转发随之中断。
    pub(crate) shutdown: CancellationToken,
}

impl AppState {
    pub(crate) fn new(bind_addrs: Vec<SocketAddr>, services: Services) -> Self {
        let auth = AuthState::from_token(&services.config.safe_token);
        Self {
            bind_addrs: Arc::new(bind_addrs),
            services: Arc::new(services),
            auth,
            shutdown: CancellationToken::new(),
        }
    }
}

/// 管理 API 的 token；只保存摘要，比较时也只比较摘要。
#[derive(Clone)]
pub(crate) struct AuthState {
    pub(crate) token_sha256: [u8; 32],
}

impl AuthState {
    /// token 为空时返回 None，表示管理 API 被锁定。
    pub(crate) fn from_token(token: &str) -> Option<Self> {
        let token = token.trim();
        if token.is_empty() {
            return None;
        }
        Some(Self {
            token_sha256: digest(token),
        })
    }

    pub(crate) fn verify(&self, provided: &str) -> bool {
        digest(provided) == self.token_sha256
    }
}

fn digest(s: &str) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(s.as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(&h.finalize());
    out
}
