use async_trait::async_trait;

use crate::entities::WorkerInfo;

/// 可接受的任务类型目录，提交时用于校验 task_type
#[async_trait]
pub trait TaskTypeCatalog: Send + Sync {
    async fn supports(&self, task_type: &str) -> bool;

    async fn task_types(&self) -> Vec<String>;
}

/// 固定列表的任务类型目录
#[derive(Debug, Clone, Default)]
pub struct StaticTaskTypeCatalog {
    types: Vec<String>,
}

impl StaticTaskTypeCatalog {
    pub fn new<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            types: types.into_iter().map(Into::into).collect(),
        }
    }

    pub fn well_known() -> Self {
        Self::new(crate::entities::TaskType::WELL_KNOWN)
    }
}

#[async_trait]
impl TaskTypeCatalog for StaticTaskTypeCatalog {
    async fn supports(&self, task_type: &str) -> bool {
        self.types.iter().any(|t| t == task_type)
    }

    async fn task_types(&self) -> Vec<String> {
        self.types.clone()
    }
}

/// Worker池运行状态快照，供统计接口读取
pub trait WorkerPoolState: Send + Sync {
    fn workers(&self) -> Vec<WorkerInfo>;

    fn pool_size(&self) -> usize;

    fn is_running(&self) -> bool;
}
