use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use taskq_domain::{
    entities::{Payload, Task, TaskHistoryEntry, TaskPriority, TaskStatus, TaskType},
    repositories::TaskRepository,
    value_objects::{
        Page, SortField, StatusTransition, TaskAggregate, TaskFilter, TaskQuery,
        TransitionOutcome,
    },
};
use taskq_errors::{EngineError, EngineResult};
use tracing::{debug, instrument};
use uuid::Uuid;

const TASK_COLUMNS: &str = "id, task_type, status, priority, tenant_id, payload, result, progress, \
     retry_count, max_retries, error_message, worker_id, timeout_ms, created_at, updated_at, \
     started_at, completed_at, scheduled_for";

const HISTORY_COLUMNS: &str =
    "id, task_id, old_status, new_status, old_progress, new_progress, actor, message, created_at";

/// SQLite 任务仓储
///
/// 条件更新在 `BEGIN IMMEDIATE` 事务中完成：先取得写锁再读取当前状态，
/// 多个进程共享同一数据库文件时也不会出现两个调用者同时通过状态检查。
pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn parse_uuid(value: &str) -> EngineResult<Uuid> {
        Uuid::parse_str(value)
            .map_err(|e| EngineError::Serialization(format!("无效的任务ID {value}: {e}")))
    }

    fn parse_payload(value: &str) -> EngineResult<Payload> {
        Ok(serde_json::from_str(value)?)
    }

    fn to_u8(value: i64) -> u8 {
        value.clamp(0, i64::from(u8::MAX)) as u8
    }

    fn to_u32(value: i64) -> u32 {
        value.clamp(0, i64::from(u32::MAX)) as u32
    }

    fn row_to_task(row: &SqliteRow) -> EngineResult<Task> {
        let id: String = row.try_get("id")?;
        let task_type: String = row.try_get("task_type")?;
        let payload: String = row.try_get("payload")?;
        let result: Option<String> = row.try_get("result")?;
        let progress: i64 = row.try_get("progress")?;
        let retry_count: i64 = row.try_get("retry_count")?;
        let max_retries: i64 = row.try_get("max_retries")?;
        let timeout_ms: i64 = row.try_get("timeout_ms")?;

        Ok(Task {
            id: Self::parse_uuid(&id)?,
            task_type: TaskType::new(task_type),
            status: row.try_get("status")?,
            priority: row.try_get("priority")?,
            tenant_id: row.try_get("tenant_id")?,
            payload: Self::parse_payload(&payload)?,
            result: result.as_deref().map(Self::parse_payload).transpose()?,
            progress: Self::to_u8(progress),
            retry_count: Self::to_u32(retry_count),
            max_retries: Self::to_u32(max_retries),
            error_message: row.try_get("error_message")?,
            worker_id: row.try_get("worker_id")?,
            timeout_ms: timeout_ms.max(0) as u64,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            scheduled_for: row.try_get("scheduled_for")?,
        })
    }

    fn row_to_history(row: &SqliteRow) -> EngineResult<TaskHistoryEntry> {
        let task_id: String = row.try_get("task_id")?;
        let old_progress: i64 = row.try_get("old_progress")?;
        let new_progress: i64 = row.try_get("new_progress")?;
        Ok(TaskHistoryEntry {
            id: row.try_get("id")?,
            task_id: Self::parse_uuid(&task_id)?,
            old_status: row.try_get("old_status")?,
            new_status: row.try_get("new_status")?,
            old_progress: Self::to_u8(old_progress),
            new_progress: Self::to_u8(new_progress),
            actor: row.try_get("actor")?,
            message: row.try_get("message")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, filter: &TaskFilter) {
        builder.push(" WHERE 1 = 1");
        if let Some(tenant_id) = &filter.tenant_id {
            builder.push(" AND tenant_id = ").push_bind(tenant_id.clone());
        }
        if let Some(task_type) = &filter.task_type {
            builder.push(" AND task_type = ").push_bind(task_type.clone());
        }
        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status);
        }
        if let Some(priority) = filter.priority {
            builder.push(" AND priority = ").push_bind(priority);
        }
        if let Some(after) = filter.created_after {
            builder.push(" AND created_at >= ").push_bind(after);
        }
        if let Some(before) = filter.created_before {
            builder.push(" AND created_at <= ").push_bind(before);
        }
    }

    fn order_expression(sort_by: SortField) -> &'static str {
        match sort_by {
            SortField::Priority => {
                "CASE priority WHEN 'critical' THEN 3 WHEN 'high' THEN 2 WHEN 'normal' THEN 1 ELSE 0 END"
            }
            other => other.column(),
        }
    }

    async fn fetch_task(conn: &mut SqliteConnection, id: Uuid) -> EngineResult<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&mut *conn)
            .await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn insert_history(
        conn: &mut SqliteConnection,
        entry: &TaskHistoryEntry,
    ) -> EngineResult<TaskHistoryEntry> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO task_history (task_id, old_status, new_status, old_progress, new_progress,
                                      actor, message, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(entry.task_id.to_string())
        .bind(entry.old_status)
        .bind(entry.new_status)
        .bind(i64::from(entry.old_progress))
        .bind(i64::from(entry.new_progress))
        .bind(&entry.actor)
        .bind(&entry.message)
        .bind(entry.created_at)
        .fetch_one(&mut *conn)
        .await?;

        Ok(TaskHistoryEntry {
            id,
            ..entry.clone()
        })
    }

    async fn transition_in_tx(
        conn: &mut SqliteConnection,
        id: Uuid,
        expected: TaskStatus,
        transition: &StatusTransition,
    ) -> EngineResult<TransitionOutcome> {
        let mut task = Self::fetch_task(conn, id)
            .await?
            .ok_or_else(|| EngineError::task_not_found(id))?;

        if task.status != expected {
            return Err(EngineError::conflict(
                id,
                task.status,
                format!("{expected} -> {}", transition.to),
            ));
        }

        let old_status = task.status;
        let old_progress = task.progress;
        task.status = transition.to;
        transition.update.apply(&mut task);
        task.updated_at = transition.at.max(task.created_at);

        let result = task
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let affected = sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?, progress = ?, result = ?, error_message = ?, retry_count = ?,
                worker_id = ?, started_at = ?, completed_at = ?, scheduled_for = ?, updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(task.status)
        .bind(i64::from(task.progress))
        .bind(result)
        .bind(&task.error_message)
        .bind(i64::from(task.retry_count))
        .bind(&task.worker_id)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(task.scheduled_for)
        .bind(task.updated_at)
        .bind(id.to_string())
        .bind(expected)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        if affected != 1 {
            return Err(EngineError::conflict(
                id,
                old_status,
                format!("{expected} -> {}", transition.to),
            ));
        }

        let entry = Self::insert_history(
            conn,
            &TaskHistoryEntry {
                id: 0,
                task_id: id,
                old_status: Some(old_status),
                new_status: task.status,
                old_progress,
                new_progress: task.progress,
                actor: transition.actor.clone(),
                message: transition.message.clone(),
                created_at: task.updated_at,
            },
        )
        .await?;

        Ok(TransitionOutcome { task, entry })
    }

    async fn progress_in_tx(
        conn: &mut SqliteConnection,
        id: Uuid,
        progress: u8,
        actor: &str,
        message: Option<String>,
        at: DateTime<Utc>,
    ) -> EngineResult<TransitionOutcome> {
        let mut task = Self::fetch_task(conn, id)
            .await?
            .ok_or_else(|| EngineError::task_not_found(id))?;

        if task.status != TaskStatus::Processing {
            return Err(EngineError::conflict(id, task.status, "update_progress"));
        }
        if progress < task.progress {
            return Err(EngineError::validation(format!(
                "进度不能回退: 当前 {}，请求 {}",
                task.progress, progress
            )));
        }

        let old_progress = task.progress;
        task.progress = progress;
        task.updated_at = at.max(task.updated_at);

        let affected = sqlx::query(
            "UPDATE tasks SET progress = ?, updated_at = ? \
             WHERE id = ? AND status = 'processing' AND progress <= ?",
        )
        .bind(i64::from(progress))
        .bind(task.updated_at)
        .bind(id.to_string())
        .bind(i64::from(progress))
        .execute(&mut *conn)
        .await?
        .rows_affected();

        if affected != 1 {
            return Err(EngineError::conflict(id, task.status, "update_progress"));
        }

        let entry = Self::insert_history(
            conn,
            &TaskHistoryEntry {
                id: 0,
                task_id: id,
                old_status: Some(TaskStatus::Processing),
                new_status: TaskStatus::Processing,
                old_progress,
                new_progress: progress,
                actor: actor.to_string(),
                message,
                created_at: task.updated_at,
            },
        )
        .await?;

        Ok(TransitionOutcome { task, entry })
    }

    /// 以 `BEGIN IMMEDIATE` 开启事务；`Transaction` 被丢弃时自动回滚
    async fn begin_immediate(&self) -> EngineResult<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    #[instrument(skip(self, task), fields(
        task_id = %task.id,
        task_type = %task.task_type,
        tenant_id = %task.tenant_id,
    ))]
    async fn create(&self, task: &Task) -> EngineResult<TransitionOutcome> {
        let payload = serde_json::to_string(&task.payload)?;
        let result = task
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        sqlx::query(&sql)
            .bind(task.id.to_string())
            .bind(task.task_type.as_str())
            .bind(task.status)
            .bind(task.priority)
            .bind(&task.tenant_id)
            .bind(payload)
            .bind(result)
            .bind(i64::from(task.progress))
            .bind(i64::from(task.retry_count))
            .bind(i64::from(task.max_retries))
            .bind(&task.error_message)
            .bind(&task.worker_id)
            .bind(i64::try_from(task.timeout_ms).unwrap_or(i64::MAX))
            .bind(task.created_at)
            .bind(task.updated_at)
            .bind(task.started_at)
            .bind(task.completed_at)
            .bind(task.scheduled_for)
            .execute(&mut *tx)
            .await?;

        let entry = Self::insert_history(
            &mut *tx,
            &TaskHistoryEntry {
                id: 0,
                task_id: task.id,
                old_status: None,
                new_status: task.status,
                old_progress: task.progress,
                new_progress: task.progress,
                actor: "system".to_string(),
                message: Some("任务已创建".to_string()),
                created_at: task.created_at,
            },
        )
        .await?;
        tx.commit().await?;

        debug!("任务已持久化: {}", task.id);
        Ok(TransitionOutcome {
            task: task.clone(),
            entry,
        })
    }

    async fn get(&self, id: Uuid) -> EngineResult<Option<Task>> {
        let mut conn = self.pool.acquire().await?;
        Self::fetch_task(&mut conn, id).await
    }

    async fn list(&self, query: &TaskQuery) -> EngineResult<Page<Task>> {
        let page_size = query.page_size.clamp(1, TaskQuery::MAX_PAGE_SIZE);

        let mut count_builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM tasks");
        Self::push_filters(&mut count_builder, &query.filter);
        let total = count_builder
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?;

        let mut builder = QueryBuilder::<Sqlite>::new(format!("SELECT {TASK_COLUMNS} FROM tasks"));
        Self::push_filters(&mut builder, &query.filter);
        builder
            .push(" ORDER BY ")
            .push(Self::order_expression(query.sort_by))
            .push(" ")
            .push(query.order.as_sql())
            .push(", created_at ASC, id ASC LIMIT ")
            .push_bind(i64::from(page_size))
            .push(" OFFSET ")
            .push_bind(i64::try_from(query.offset()).unwrap_or(i64::MAX));

        let rows = builder.build().fetch_all(&self.pool).await?;
        let items = rows
            .iter()
            .map(Self::row_to_task)
            .collect::<EngineResult<Vec<_>>>()?;

        Ok(Page {
            items,
            total: total.max(0) as u64,
            page: query.page.max(1),
            page_size,
        })
    }

    #[instrument(skip(self, transition), fields(
        task_id = %id,
        expected = %expected,
        target = %transition.to,
    ))]
    async fn update_status(
        &self,
        id: Uuid,
        expected: TaskStatus,
        transition: StatusTransition,
    ) -> EngineResult<TransitionOutcome> {
        if !expected.can_transition_to(transition.to) {
            return Err(EngineError::validation(format!(
                "非法的状态转换: {expected} -> {}",
                transition.to
            )));
        }

        let mut tx = self.begin_immediate().await?;
        let outcome = Self::transition_in_tx(&mut tx, id, expected, &transition).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    #[instrument(skip(self, message), fields(task_id = %id, progress = progress))]
    async fn update_progress(
        &self,
        id: Uuid,
        progress: u8,
        actor: &str,
        message: Option<String>,
        at: DateTime<Utc>,
    ) -> EngineResult<TransitionOutcome> {
        let progress = progress.min(100);
        let mut tx = self.begin_immediate().await?;
        let outcome = Self::progress_in_tx(&mut tx, id, progress, actor, message, at).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn append_history(&self, entry: &TaskHistoryEntry) -> EngineResult<TaskHistoryEntry> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_history(&mut conn, entry).await
    }

    async fn history(&self, id: Uuid) -> EngineResult<Vec<TaskHistoryEntry>> {
        let sql = format!("SELECT {HISTORY_COLUMNS} FROM task_history WHERE task_id = ? ORDER BY id ASC");
        let rows = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_history).collect()
    }

    async fn find_by_status(&self, status: TaskStatus, limit: u32) -> EngineResult<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ? ORDER BY created_at ASC LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(status)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn aggregate(&self, tenant_id: Option<&str>) -> EngineResult<TaskAggregate> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT task_type, priority, tenant_id, status, COUNT(*) AS cnt FROM tasks",
        );
        if let Some(tenant_id) = tenant_id {
            builder.push(" WHERE tenant_id = ").push_bind(tenant_id.to_string());
        }
        builder.push(" GROUP BY task_type, priority, tenant_id, status");
        let rows = builder.build().fetch_all(&self.pool).await?;

        let mut aggregate = TaskAggregate::default();
        for row in &rows {
            let task_type: String = row.try_get("task_type")?;
            let priority: TaskPriority = row.try_get("priority")?;
            let tenant: String = row.try_get("tenant_id")?;
            let status: TaskStatus = row.try_get("status")?;
            let count: i64 = row.try_get("cnt")?;
            aggregate.record(&task_type, priority, &tenant, status, count.max(0) as u64);
        }

        let mut avg_builder = QueryBuilder::<Sqlite>::new(
            "SELECT AVG((julianday(completed_at) - julianday(started_at)) * 86400000.0) FROM tasks \
             WHERE status = 'completed' AND started_at IS NOT NULL AND completed_at IS NOT NULL",
        );
        if let Some(tenant_id) = tenant_id {
            avg_builder.push(" AND tenant_id = ").push_bind(tenant_id.to_string());
        }
        let avg = avg_builder
            .build_query_scalar::<Option<f64>>()
            .fetch_one(&self.pool)
            .await?;
        aggregate.avg_processing_ms = avg;

        Ok(aggregate)
    }

    async fn count_completed_since(
        &self,
        tenant_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> EngineResult<u64> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT COUNT(*) FROM tasks WHERE status = 'completed' AND completed_at >= ",
        );
        builder.push_bind(since);
        if let Some(tenant_id) = tenant_id {
            builder.push(" AND tenant_id = ").push_bind(tenant_id.to_string());
        }
        let count = builder
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn health_check(&self) -> EngineResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
