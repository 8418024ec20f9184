//! 周期任务：健康巡检、缓存清理等后台定时器。
//!
//! 每个任务是一个独立的 tokio task，通过 `CancellationToken` 停止；
//! 持有的 [`PeriodicTask`] 被 drop 时同样会停止任务。
//! 单次执行逻辑由调用方提供，测试直接调用那段逻辑即可，不必等待真实时钟。

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct PeriodicTask {
    name: &'static str,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// 启动周期任务。`run_immediately` 为真时先执行一次，再按 `period` 循环。
    pub fn spawn<F, Fut>(
        name: &'static str,
        period: Duration,
        run_immediately: bool,
        mut tick: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let period = period.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let start = if run_immediately {
                Instant::now()
            } else {
                Instant::now() + period
            };
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        // tick 本身也要能被取消，避免关停时卡在一次慢速巡检上。
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tick() => {}
                        }
                    }
                }
            }
            debug!(target: "scheduler", task = name, "periodic task stopped");
        });

        Self {
            name,
            cancel,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// 停止任务并等待其退出。
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
