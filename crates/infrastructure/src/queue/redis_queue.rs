use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use taskq_domain::{entities::TaskPriority, ports::QueueEntry, ports::TaskQueue};
use taskq_errors::{EngineError, EngineResult};
use tracing::{debug, info};
use uuid::Uuid;

/// 就绪集分数的优先级分段宽度，需大于任意毫秒时间戳
const PRIORITY_BAND: i64 = 10_000_000_000_000;

/// 把到期的延迟条目转入就绪集（POP_LUA 与 PROMOTE_LUA 共用）
const PROMOTE_DUE: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, member in ipairs(due) do
    local eligible = tonumber(redis.call('ZSCORE', KEYS[2], member))
    local rank = tonumber(string.match(member, '^%d+:(%d):'))
    redis.call('ZADD', KEYS[1], (3 - rank) * tonumber(ARGV[2]) + eligible, member)
    redis.call('ZREM', KEYS[2], member)
end
"#;

/// 幂等入队：成员为 `{seq:016}:{rank}:{id}`，同分数时按入队序号先进先出
const PUSH_LUA: &str = r#"
if redis.call('HEXISTS', KEYS[3], ARGV[1]) == 1 then
    return 0
end
local seq = redis.call('INCR', KEYS[4])
local member = string.format('%016d', seq) .. ':' .. ARGV[2] .. ':' .. ARGV[1]
redis.call('ZADD', KEYS[2], ARGV[3], member)
redis.call('HSET', KEYS[3], ARGV[1], member)
return 1
"#;

const REMOVE_LUA: &str = r#"
local member = redis.call('HGET', KEYS[3], ARGV[1])
if not member then
    return 0
end
redis.call('HDEL', KEYS[3], ARGV[1])
return redis.call('ZREM', KEYS[1], member) + redis.call('ZREM', KEYS[2], member)
"#;

fn promote_script() -> String {
    format!("{PROMOTE_DUE}\nreturn #due")
}

/// 转移到期条目后弹出分数最小的就绪条目
fn pop_script() -> String {
    format!(
        r#"{PROMOTE_DUE}
local popped = redis.call('ZPOPMIN', KEYS[1])
if #popped == 0 then
    return false
end
local id = string.match(popped[1], '^%d+:%d:(.+)$')
if id then
    redis.call('HDEL', KEYS[3], id)
end
return {{popped[1], popped[2]}}
"#
    )
}

/// Redis 优先级队列
///
/// - `{prefix}:ready`   就绪集，分数 = (3 - 优先级) * PRIORITY_BAND + eligible_ms
/// - `{prefix}:delayed` 延迟集，分数 = eligible_ms
/// - `{prefix}:index`   任务ID到集合成员的哈希
/// - `{prefix}:seq`     入队序号
///
/// 集合成员以入队序号开头，分数相同的条目按字典序即入队顺序弹出。
/// 所有跨键操作都在 Lua 脚本中执行，多个进程并发弹出时每个条目只会被取走一次。
pub struct RedisTaskQueue {
    conn: ConnectionManager,
    ready_key: String,
    delayed_key: String,
    index_key: String,
    seq_key: String,
    push_script: Script,
    pop_script: Script,
    promote_script: Script,
    remove_script: Script,
}

impl RedisTaskQueue {
    pub async fn connect(redis_url: &str, key_prefix: &str) -> EngineResult<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| EngineError::queue(format!("创建Redis客户端失败: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| EngineError::queue(format!("连接Redis失败: {e}")))?;
        info!("已连接Redis队列: prefix={}", key_prefix);
        Ok(Self::with_connection(conn, key_prefix))
    }

    pub fn with_connection(conn: ConnectionManager, key_prefix: &str) -> Self {
        Self {
            conn,
            ready_key: format!("{key_prefix}:ready"),
            delayed_key: format!("{key_prefix}:delayed"),
            index_key: format!("{key_prefix}:index"),
            seq_key: format!("{key_prefix}:seq"),
            push_script: Script::new(PUSH_LUA),
            pop_script: Script::new(&pop_script()),
            promote_script: Script::new(&promote_script()),
            remove_script: Script::new(REMOVE_LUA),
        }
    }

    fn ready_score(priority: TaskPriority, eligible_at: DateTime<Utc>) -> i64 {
        (3 - i64::from(priority.rank())) * PRIORITY_BAND + eligible_at.timestamp_millis()
    }

    fn decode_ready_score(score: i64) -> (TaskPriority, DateTime<Utc>) {
        let band = (score / PRIORITY_BAND).clamp(0, 3);
        let rank = (3 - band) as u8;
        let millis = score - band * PRIORITY_BAND;
        let eligible_at = Utc
            .timestamp_millis_opt(millis)
            .single()
            .unwrap_or_else(Utc::now);
        (TaskPriority::from_rank(rank).unwrap_or_default(), eligible_at)
    }

    /// 从 `{seq}:{rank}:{id}` 成员中取出任务ID
    fn parse_member(member: &str) -> EngineResult<Uuid> {
        let id = member.splitn(3, ':').nth(2).unwrap_or(member);
        Uuid::parse_str(id)
            .map_err(|e| EngineError::queue(format!("队列中存在无效的成员 {member}: {e}")))
    }

    async fn member_of(&self, task_id: Uuid) -> EngineResult<Option<String>> {
        let mut conn = self.conn.clone();
        let member: Option<String> = conn.hget(&self.index_key, task_id.to_string()).await?;
        Ok(member)
    }

    async fn promote(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let mut conn = self.conn.clone();
        let promoted: usize = self
            .promote_script
            .key(&self.ready_key)
            .key(&self.delayed_key)
            .arg(now.timestamp_millis())
            .arg(PRIORITY_BAND)
            .invoke_async(&mut conn)
            .await?;
        if promoted > 0 {
            debug!("转移到期延迟条目: {}", promoted);
        }
        Ok(promoted)
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn push(&self, entry: QueueEntry) -> EngineResult<bool> {
        let mut conn = self.conn.clone();
        let added: i64 = self
            .push_script
            .key(&self.ready_key)
            .key(&self.delayed_key)
            .key(&self.index_key)
            .key(&self.seq_key)
            .arg(entry.task_id.to_string())
            .arg(i64::from(entry.priority.rank()))
            .arg(entry.eligible_at.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(added == 1)
    }

    async fn pop_ready(&self, now: DateTime<Utc>) -> EngineResult<Option<QueueEntry>> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, f64)> = self
            .pop_script
            .key(&self.ready_key)
            .key(&self.delayed_key)
            .key(&self.index_key)
            .arg(now.timestamp_millis())
            .arg(PRIORITY_BAND)
            .invoke_async(&mut conn)
            .await?;

        let Some((member, score)) = popped else {
            return Ok(None);
        };
        let task_id = Self::parse_member(&member)?;
        let (priority, eligible_at) = Self::decode_ready_score(score as i64);
        Ok(Some(QueueEntry::new(task_id, priority, eligible_at)))
    }

    async fn remove(&self, task_id: Uuid) -> EngineResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .remove_script
            .key(&self.ready_key)
            .key(&self.delayed_key)
            .key(&self.index_key)
            .arg(task_id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        self.promote(now).await
    }

    async fn len(&self) -> EngineResult<usize> {
        let mut conn = self.conn.clone();
        let (ready, delayed): (usize, usize) = redis::pipe()
            .zcard(&self.ready_key)
            .zcard(&self.delayed_key)
            .query_async(&mut conn)
            .await?;
        Ok(ready + delayed)
    }

    async fn ready_len(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        self.promote(now).await?;
        let mut conn = self.conn.clone();
        let ready: usize = conn.zcard(&self.ready_key).await?;
        Ok(ready)
    }

    async fn len_before(&self, entry: &QueueEntry, now: DateTime<Utc>) -> EngineResult<usize> {
        self.promote(now).await?;
        let mut conn = self.conn.clone();
        if let Some(member) = self.member_of(entry.task_id).await? {
            let rank: Option<usize> = conn.zrank(&self.ready_key, &member).await?;
            if let Some(rank) = rank {
                return Ok(rank);
            }
        }
        let score = Self::ready_score(entry.priority, entry.eligible_at);
        let before: usize = conn
            .zcount(&self.ready_key, "-inf", format!("({score}"))
            .await?;
        Ok(before)
    }

    async fn contains(&self, task_id: Uuid) -> EngineResult<bool> {
        Ok(self.member_of(task_id).await?.is_some())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_roundtrip_keeps_priority_bands_apart() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let critical = RedisTaskQueue::ready_score(TaskPriority::Critical, now);
        let low = RedisTaskQueue::ready_score(TaskPriority::Low, now);
        let later_high = RedisTaskQueue::ready_score(
            TaskPriority::High,
            now + chrono::Duration::days(3650),
        );

        assert!(critical < later_high);
        assert!(later_high < low);
        assert_eq!(
            RedisTaskQueue::decode_ready_score(low),
            (TaskPriority::Low, now)
        );
        assert_eq!(
            RedisTaskQueue::decode_ready_score(critical),
            (TaskPriority::Critical, now)
        );
    }

    #[test]
    fn test_parse_member() {
        let id = Uuid::new_v4();
        let member = format!("{:016}:2:{}", 42, id);
        assert_eq!(RedisTaskQueue::parse_member(&member).unwrap(), id);
        assert!(RedisTaskQueue::parse_member("0000000000000001:2:bad").is_err());
    }

    #[test]
    fn test_member_order_follows_sequence() {
        // 分数相同时 ZSET 按成员字典序排序
        let late_small = format!("{:016}:2:{}", 10, Uuid::nil());
        let early_large = format!("{:016}:2:{}", 9, Uuid::from_u128(u128::MAX));
        assert!(early_large < late_small);
    }
}
