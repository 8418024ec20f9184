//! GitHub 资源加速代理。
//!
//! 维护一组第三方代理域名，按策略（最快 / 随机 / 轮询）为每个请求挑选一个，
//! 把 GitHub 资源经代理流式转发给客户端；大文件可拆成多个字节区间分给不同代理并行下载。
//!
//! 代码结构（读代码入口）：
//! - `base_system`：配置、日志、周期任务等基础设施
//! - `relay`：域名池、测速、选择策略、健康巡检、流式转发、分块计划、统计
//! - `web`：axum 服务、管理 API 与鉴权

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::info;

mod base_system;
mod relay;
mod web;

use base_system::config::load_or_create;
use base_system::context::Config;
use base_system::logging::{LogOptions, LogSystem};
use relay::strategy::StrategyKind;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "gh-relay-proxy")]
#[command(about = "GitHub resource relay through rotating proxy domains")]
struct Cli {
    /// 启用调试日志输出
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// 显示版本信息后退出
    #[arg(long, default_value_t = false)]
    version: bool,

    /// 数据目录路径（存放 config.yml、logs 与代理域名列表，方便 Docker 挂载）
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// 配置文件路径（默认为数据目录下的 config.yml）
    #[arg(long)]
    config: Option<PathBuf>,

    /// 管理 API 的 token（覆盖配置文件与 SAFE_TOKEN）
    #[arg(long)]
    token: Option<String>,

    /// 监听地址，多个用逗号分隔（覆盖配置文件与 GH_RELAY_ADDR）
    #[arg(long)]
    bind: Option<String>,

    /// 代理选择策略: fastest / random / round-robin
    #[arg(long)]
    strategy: Option<StrategyKind>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("gh-relay-proxy v{}", VERSION);
        return Ok(());
    }

    // .env 不存在是正常情况。
    let _ = dotenvy::dotenv();

    let data_dir = cli.data_dir.as_deref();
    let _log = init_logging(cli.debug, data_dir)?;
    info!(target: "startup", "当前版本: v{}", VERSION);

    let mut config = load_or_create::<Config>(cli.config.as_deref(), data_dir)
        .context("load config.yml")?;
    config.apply_env_overrides();

    if let Some(token) = cli.token {
        config.safe_token = token;
    }
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Some(strategy) = cli.strategy {
        config.proxy_strategy = strategy;
    }
    config.set_data_dir(data_dir);
    config.validate().context("invalid configuration")?;

    info!(
        target: "startup",
        strategy = %config.proxy_strategy,
        multi_proxy = config.enable_multi_proxy,
        domains_file = %config.domains_file_path().display(),
        "配置加载完成"
    );

    web::run(config)
}

fn init_logging(debug: bool, base_dir: Option<&Path>) -> Result<LogSystem> {
    let opts = LogOptions {
        debug,
        use_color: true,
        archive_on_exit: true,
    };
    LogSystem::init_with_base(opts, base_dir).map_err(|e| anyhow!(e))
}
