use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use taskq_api::{create_app, AppState};
use taskq_config::AppConfig;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::engine::TaskEngine;

/// API 服务器在关闭信号之后等待在途请求的时间
const API_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// 主应用程序：任务引擎加可选的 HTTP API
pub struct Application {
    config: AppConfig,
    engine: Arc<TaskEngine>,
    metrics: Option<PrometheusHandle>,
}

impl Application {
    /// 按配置创建数据库、队列和引擎
    pub async fn new(config: AppConfig) -> Result<Self> {
        let engine = TaskEngine::builder(config.clone())
            .build()
            .await
            .context("创建任务引擎失败")?;
        Ok(Self::with_engine(config, engine))
    }

    /// 使用已构建好的引擎（例如注册了业务执行器的引擎）
    pub fn with_engine(config: AppConfig, engine: TaskEngine) -> Self {
        let metrics = if config.observability.metrics_enabled {
            install_metrics_recorder()
        } else {
            None
        };
        Self {
            config,
            engine: Arc::new(engine),
            metrics,
        }
    }

    pub fn engine(&self) -> &Arc<TaskEngine> {
        &self.engine
    }

    /// 运行直到 `shutdown` 被取消，然后停止 API 和引擎
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.engine.start().await.context("启动任务引擎失败")?;

        let server = if self.config.api.enabled {
            match self.start_api(shutdown.clone()).await {
                Ok(handle) => Some(handle),
                Err(e) => {
                    self.engine.stop().await.context("停止任务引擎失败")?;
                    return Err(e);
                }
            }
        } else {
            info!("API服务器未启用");
            None
        };

        shutdown.cancelled().await;
        info!("收到关闭信号，开始优雅关闭");

        if let Some(server) = server {
            match tokio::time::timeout(API_DRAIN_TIMEOUT, server).await {
                Ok(Ok(())) => info!("API服务器已停止"),
                Ok(Err(e)) => error!("API服务器任务异常退出: {}", e),
                Err(_) => warn!("API服务器关闭超时"),
            }
        }

        self.engine.stop().await.context("停止任务引擎失败")?;
        Ok(())
    }

    async fn start_api(&self, shutdown: CancellationToken) -> Result<tokio::task::JoinHandle<()>> {
        let mut state = AppState::new(self.engine.controller());
        if let Some(handle) = &self.metrics {
            state = state.with_metrics(handle.clone());
        }
        let app = create_app(state, &self.config.api);

        let listener = TcpListener::bind(&self.config.api.bind_address)
            .await
            .with_context(|| format!("绑定地址失败: {}", self.config.api.bind_address))?;
        info!("API服务器启动在 http://{}", self.config.api.bind_address);

        Ok(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                error!("API服务器运行失败: {}", e);
            }
        }))
    }
}

/// 安装全局 Prometheus recorder；已有 recorder 时返回 None
fn install_metrics_recorder() -> Option<PrometheusHandle> {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    match metrics::set_global_recorder(recorder) {
        Ok(()) => {
            info!("Prometheus指标已启用");
            Some(handle)
        }
        Err(e) => {
            warn!("安装指标recorder失败，/metrics 不可用: {}", e);
            None
        }
    }
}
