use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use taskq::{wait_for_shutdown_signal, Application, ShutdownManager};
use taskq_config::{AppConfig, LogLevel, OutputFormat};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 持久化优先级任务队列与异步执行引擎
#[derive(Debug, Parser)]
#[command(name = "taskq", version, about)]
struct Cli {
    /// 配置文件路径，缺省时依次查找 config/taskq.toml、taskq.toml
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// 日志级别，覆盖配置文件
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<LogLevel>,

    /// 日志格式 (json / pretty)
    #[arg(long, value_name = "FORMAT")]
    log_format: Option<OutputFormat>,

    /// Worker 数量，覆盖配置文件
    #[arg(long, value_name = "N")]
    pool_size: Option<usize>,

    /// 不启动 HTTP API
    #[arg(long)]
    no_api: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref())
        .with_context(|| format!("加载配置失败: {:?}", cli.config))?;
    if let Some(level) = cli.log_level {
        config.observability.log_level = level;
    }
    if let Some(format) = cli.log_format {
        config.observability.log_format = format;
    }
    if let Some(pool_size) = cli.pool_size {
        anyhow::ensure!(pool_size > 0, "--pool-size 必须大于0");
        config.worker.pool_size = pool_size;
    }
    if cli.no_api {
        config.api.enabled = false;
    }

    init_logging(config.observability.log_level, config.observability.log_format)?;
    info!("启动任务引擎 taskq {}", env!("CARGO_PKG_VERSION"));

    let shutdown_timeout = Duration::from_secs(config.worker.shutdown_timeout_seconds + 15);
    let app = Application::new(config).await?;
    let shutdown = ShutdownManager::new();

    let mut app_handle = {
        let token = shutdown.subscribe();
        tokio::spawn(async move { app.run(token).await })
    };

    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            shutdown.shutdown();
        }
        // 启动失败时 run 会提前返回
        result = &mut app_handle => {
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(anyhow::anyhow!("应用任务异常退出: {e}")),
            };
        }
    }

    match tokio::time::timeout(shutdown_timeout, app_handle).await {
        Ok(Ok(Ok(()))) => info!("应用已优雅关闭"),
        Ok(Ok(Err(e))) => error!("应用关闭时发生错误: {e:#}"),
        Ok(Err(e)) => error!("应用任务异常退出: {e}"),
        Err(_) => warn!("应用关闭超时，强制退出"),
    }
    Ok(())
}

/// 初始化日志系统，`RUST_LOG` 优先于配置中的级别
fn init_logging(level: LogLevel, format: OutputFormat) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        OutputFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .context("初始化JSON日志格式失败")?,
        OutputFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .context("初始化Pretty日志格式失败")?,
    }
    Ok(())
}
