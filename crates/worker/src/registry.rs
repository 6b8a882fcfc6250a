use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use taskq_domain::ports::{TaskExecutor, TaskTypeCatalog};
use taskq_errors::{EngineError, EngineResult};
use tokio::sync::RwLock;
use tracing::info;

use crate::executors::HealthCheckExecutor;

/// 执行器注册表，按任务类型查找执行器
///
/// 新任务类型通过注册执行器接入，调度核心不需要修改。注册表同时作为提交时的任务类型目录。
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: RwLock<HashMap<String, Arc<dyn TaskExecutor>>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预先注册内置执行器
    pub async fn with_builtin() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(HealthCheckExecutor::new())).await;
        registry
    }

    /// 注册执行器，返回被替换的旧执行器
    pub async fn register(&self, executor: Arc<dyn TaskExecutor>) -> Option<Arc<dyn TaskExecutor>> {
        let name = executor.name().to_string();
        info!("注册执行器: {}", name);
        self.executors.write().await.insert(name, executor)
    }

    /// 同名执行器已存在时返回错误
    pub async fn try_register(&self, executor: Arc<dyn TaskExecutor>) -> EngineResult<()> {
        let mut executors = self.executors.write().await;
        let name = executor.name().to_string();
        if executors.contains_key(&name) {
            return Err(EngineError::Configuration(format!("执行器 {name} 已注册")));
        }
        info!("注册执行器: {}", name);
        executors.insert(name, executor);
        Ok(())
    }

    pub async fn unregister(&self, task_type: &str) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.write().await.remove(task_type)
    }

    pub async fn get(&self, task_type: &str) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.read().await.get(task_type).cloned()
    }

    pub async fn contains(&self, task_type: &str) -> bool {
        self.executors.read().await.contains_key(task_type)
    }

    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executors.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl TaskTypeCatalog for ExecutorRegistry {
    async fn supports(&self, task_type: &str) -> bool {
        self.contains(task_type).await
    }

    async fn task_types(&self) -> Vec<String> {
        self.list().await
    }
}
