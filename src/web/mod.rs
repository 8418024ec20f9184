//! HTTP 服务：管理 API、状态页与代理转发入口。

mod error;
mod router;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tracing::{info, warn};

use crate::base_system::context::Config;
use state::{AppState, Services};

pub fn run(config: Config) -> Result<()> {
    let bind_addrs = parse_bind_addrs(&config.bind_addr)?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(run_async(bind_addrs, config))
}

fn parse_bind_addr(raw: &str) -> Result<SocketAddr> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(anyhow!("empty bind addr"));
    }

    if let Ok(a) = s.parse::<SocketAddr>() {
        return Ok(a);
    }

    // 容忍 IPv6 不带方括号，例如 "::1:3000"：最后一段纯数字视为端口。
    if !s.starts_with('[')
        && let Some((host, port)) = s.rsplit_once(':')
        && !host.is_empty()
        && host.contains(':')
        && port.chars().all(|c| c.is_ascii_digit())
    {
        let wrapped = format!("[{host}]:{port}");
        if let Ok(a) = wrapped.parse::<SocketAddr>() {
            return Ok(a);
        }
    }

    Err(anyhow!(
        "invalid bind address: '{s}'. Use '0.0.0.0:3000' or '[::]:3000'; separate multiple binds by comma."
    ))
}

fn parse_bind_addrs(raw: &str) -> Result<Vec<SocketAddr>> {
    let mut out = Vec::new();
    for part in raw.split([',', ';']).map(str::trim).filter(|s| !s.is_empty()) {
        let a = parse_bind_addr(part)?;
        if !out.contains(&a) {
            out.push(a);
        }
    }
    if out.is_empty() {
        return Err(anyhow!("no valid bind addresses"));
    }
    Ok(out)
}

async fn run_async(bind_addrs: Vec<SocketAddr>, config: Config) -> Result<()> {
    let services = Services::build(config)?;

    match services.pool.load().await {
        Ok(domains) => info!(target: "startup", count = domains.len(), "代理域名池已就绪"),
        Err(e) => warn!(target: "startup", error = %e, "加载代理域名失败"),
    }
    if services.pool.is_empty() {
        // 仍然启动：之后可通过 /api/update-domains 补上，期间转发返回 503。
        warn!(target: "startup", "代理域名池为空");
    }

    let state = AppState::new(bind_addrs.clone(), services);
    if state.auth.is_none() {
        warn!(target: "startup", "未设置 SAFE_TOKEN，管理 API 已禁用");
    }
    let background = state.services.spawn_background();

    let notify = Arc::new(tokio::sync::Notify::new());
    {
        let notify = notify.clone();
        let shutdown = state.shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            // 先中断进行中的转发，否则优雅关停会一直等长下载结束。
            shutdown.cancel();
            notify.notify_waiters();
        });
    }

    let mut servers = Vec::new();
    for bind in bind_addrs {
        let listener = match tokio::net::TcpListener::bind(bind).await {
            Ok(l) => l,
            Err(e) => {
                // 双栈系统上 [::]:PORT 可能已覆盖 0.0.0.0:PORT。
                if !servers.is_empty() && e.kind() == std::io::ErrorKind::AddrInUse {
                    warn!(target: "web", bind = %bind, error = %e, "bind failed (AddrInUse), likely already covered by another listener; skipping");
                    continue;
                }
                return Err(anyhow!(e).context(format!("bind failed: {bind}")));
            }
        };

        info!(target: "web", "listening on http://{bind}/");

        let app = router::build_router(state.clone());
        let notify = notify.clone();
        servers.push(tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                notify.notified().await;
            })
            .await
        }));
    }

    if servers.is_empty() {
        return Err(anyhow!("no listeners started (check bind_addr)"));
    }

    println!("Press Ctrl+C to stop.");

    let mut result = Ok(());
    for h in servers {
        let joined = h
            .await
            .context("server task join failed")
            .and_then(|r| r.context("server error"));
        if let Err(e) = joined
            && result.is_ok()
        {
            result = Err(e);
        }
    }

    for task in background {
        let name = task.name();
        task.stop().await;
        info!(target: "web", task = name, "background task stopped");
    }

    result
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    println!("Stopping server...");
}
