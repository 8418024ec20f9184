//! 定时健康巡检：测速全部代理域名，可用比例过低时刷新域名列表。

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{info, warn};

use super::pool::DomainPool;
use super::prober::{ProbeOutcome, Prober, probe_all};
use crate::base_system::scheduler::PeriodicTask;

/// 可用比例低于该值时触发列表刷新。
pub const REFRESH_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorPhase {
    Idle,
    Probing,
    Refreshing,
}

impl MonitorPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => MonitorPhase::Probing,
            2 => MonitorPhase::Refreshing,
            _ => MonitorPhase::Idle,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub refreshed: bool,
    pub checked_at: String,
    pub details: Vec<ProbeOutcome>,
}

impl HealthReport {
    pub fn healthy_fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.healthy as f64 / self.total as f64
    }
}

pub struct HealthMonitor {
    pool: Arc<DomainPool>,
    prober: Arc<dyn Prober>,
    phase: AtomicU8,
    latest: Mutex<Option<HealthReport>>,
    sweep: tokio::sync::Mutex<()>,
}

impl HealthMonitor {
    pub fn new(pool: Arc<DomainPool>, prober: Arc<dyn Prober>) -> Self {
        Self {
            pool,
            prober,
            phase: AtomicU8::new(MonitorPhase::Idle as u8),
            latest: Mutex::new(None),
            sweep: tokio::sync::Mutex::new(()),
        }
    }

    pub fn phase(&self) -> MonitorPhase {
        MonitorPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub fn latest(&self) -> Option<HealthReport> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 执行一次巡检。定时任务与 `/api/health` 共用；同一时刻只跑一轮。
    pub async fn run_once(&self) -> HealthReport {
        let _sweep = self.sweep.lock().await;

        self.set_phase(MonitorPhase::Probing);
        let (generation, domains) = self.pool.snapshot();
        let details = probe_all(self.prober.as_ref(), &domains).await;
        self.pool.record_probes(generation, &details);

        let total = details.len();
        let healthy = details.iter().filter(|o| o.success).count();
        let mut report = HealthReport {
            total,
            healthy,
            unhealthy: total - healthy,
            refreshed: false,
            checked_at: now_rfc3339(),
            details,
        };

        info!(
            target: "health",
            total,
            healthy,
            "健康检查完成: {healthy}/{total} 可用"
        );

        if total > 0 && report.healthy_fraction() < REFRESH_THRESHOLD {
            self.set_phase(MonitorPhase::Refreshing);
            warn!(target: "health", "可用代理不足一半，刷新代理域名列表");
            match self.pool.refresh().await {
                Ok(_) => report.refreshed = true,
                Err(e) => warn!(target: "health", error = %e, "刷新代理域名列表失败"),
            }
        }

        self.set_phase(MonitorPhase::Idle);
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
        report
    }

    /// 启动定时巡检：立即执行一次，之后每 `interval` 执行一次。
    pub fn spawn(self: &Arc<Self>, interval: Duration) -> PeriodicTask {
        let monitor = Arc::clone(self);
        PeriodicTask::spawn("health-check", interval, true, move || {
            let monitor = monitor.clone();
            async move {
                monitor.run_once().await;
            }
        })
    }

    fn set_phase(&self, phase: MonitorPhase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}
