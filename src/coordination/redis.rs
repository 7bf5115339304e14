//! Redis implementation of the coordination store.
//!
//! Queue indexes are sorted sets/sets/lists under the keys defined in
//! [`super::keys`]. The transitions that must not interleave run as Lua
//! scripts, which Redis executes atomically: pop-and-claim, move-to-DLQ,
//! due-promotion and poison tracking.

use super::{keys, CoordinationStore};
use crate::{
    error::ConveyorError,
    job::JobId,
    priority::{queue_score, JobPriority},
    Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{aio::ConnectionManager, AsyncCommands, Client, Script};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Pop the lowest-scored waiting id and mark it processing, atomically.
const DEQUEUE_SCRIPT: &str = r#"
local popped = redis.call('ZPOPMIN', KEYS[1])
if #popped == 0 then
  return false
end
redis.call('SADD', KEYS[2], popped[1])
return popped[1]
"#;

/// Drop the id from the processing set and append it to the DLQ list.
const MOVE_TO_DLQ_SCRIPT: &str = r#"
redis.call('SREM', KEYS[1], ARGV[1])
redis.call('RPUSH', KEYS[2], ARGV[1])
return 1
"#;

/// Pop every delayed id whose promotion instant has passed.
const POP_DUE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
if #due > 0 then
  redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
end
return due
"#;

/// Record a failure entry (unique member, timestamp score), trim entries
/// outside the window, refresh the key TTL, and return the in-window count.
const RECORD_FAILURE_SCRIPT: &str = r#"
redis.call('ZADD', KEYS[1], ARGV[1], ARGV[2])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[3])
local count = redis.call('ZCARD', KEYS[1])
redis.call('EXPIRE', KEYS[1], ARGV[4])
return count
"#;

/// Coordination store backed by Redis.
#[derive(Clone)]
pub struct RedisCoordination {
    conn: ConnectionManager,
    dequeue_script: Script,
    move_to_dlq_script: Script,
    pop_due_script: Script,
    record_failure_script: Script,
}

impl RedisCoordination {
    /// Connect to the given Redis URL.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::with_connection(conn))
    }

    pub fn with_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            dequeue_script: Script::new(DEQUEUE_SCRIPT),
            move_to_dlq_script: Script::new(MOVE_TO_DLQ_SCRIPT),
            pop_due_script: Script::new(POP_DUE_SCRIPT),
            record_failure_script: Script::new(RECORD_FAILURE_SCRIPT),
        }
    }
}

fn parse_job_id(raw: &str) -> Result<JobId> {
    Uuid::parse_str(raw).map_err(|_| {
        ConveyorError::validation("jobId", format!("malformed job id in coordination store: {raw}"))
    })
}

fn parse_job_ids(raw: Vec<String>) -> Result<Vec<JobId>> {
    raw.iter().map(|id| parse_job_id(id)).collect()
}

#[async_trait]
impl CoordinationStore for RedisCoordination {
    async fn enqueue(&self, queue: &str, job_id: JobId, priority: JobPriority) -> Result<()> {
        let mut conn = self.conn.clone();
        let score = queue_score(priority, Utc::now().timestamp_millis());
        conn.zadd::<_, _, _, ()>(keys::waiting(queue), job_id.to_string(), score)
            .await?;
        Ok(())
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<JobId>> {
        let mut conn = self.conn.clone();
        let popped: Option<String> = self
            .dequeue_script
            .key(keys::waiting(queue))
            .key(keys::processing(queue))
            .invoke_async(&mut conn)
            .await?;
        popped.as_deref().map(parse_job_id).transpose()
    }

    async fn ack(&self, queue: &str, job_id: JobId) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.srem::<_, _, ()>(keys::processing(queue), job_id.to_string())
            .await?;
        Ok(())
    }

    async fn remove_waiting(&self, queue: &str, job_id: JobId) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.zrem::<_, _, ()>(keys::waiting(queue), job_id.to_string())
            .await?;
        Ok(())
    }

    async fn is_waiting(&self, queue: &str, job_id: JobId) -> Result<bool> {
        let mut conn = self.conn.clone();
        let score: Option<f64> = conn.zscore(keys::waiting(queue), job_id.to_string()).await?;
        Ok(score.is_some())
    }

    async fn schedule_at(&self, queue: &str, job_id: JobId, at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(
            keys::delayed(queue),
            job_id.to_string(),
            at.timestamp_millis() as f64,
        )
        .await?;
        Ok(())
    }

    async fn remove_delayed(&self, queue: &str, job_id: JobId) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.zrem::<_, _, ()>(keys::delayed(queue), job_id.to_string())
            .await?;
        Ok(())
    }

    async fn pop_due(&self, queue: &str) -> Result<Vec<JobId>> {
        let mut conn = self.conn.clone();
        let due: Vec<String> = self
            .pop_due_script
            .key(keys::delayed(queue))
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        parse_job_ids(due)
    }

    async fn processing_ids(&self, queue: &str) -> Result<Vec<JobId>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(keys::processing(queue)).await?;
        parse_job_ids(members)
    }

    async fn move_to_dlq(&self, queue: &str, job_id: JobId) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .move_to_dlq_script
            .key(keys::processing(queue))
            .key(keys::dlq(queue))
            .arg(job_id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn dlq_ids(&self, queue: &str) -> Result<Vec<JobId>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.lrange(keys::dlq(queue), 0, -1).await?;
        parse_job_ids(members)
    }

    async fn remove_from_dlq(&self, queue: &str, job_id: JobId) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.lrem::<_, _, ()>(keys::dlq(queue), 0, job_id.to_string())
            .await?;
        Ok(())
    }

    async fn record_failure(&self, job_id: JobId, window: Duration) -> Result<u64> {
        let mut conn = self.conn.clone();
        let now_ms = Utc::now().timestamp_millis();
        let window_ms = window.as_millis() as i64;
        let ttl_secs = (window_ms + 999) / 1_000 + 10;
        // The member must be unique per failure: ZADD updates the score of a
        // repeated member, which would collapse two failures landing in the
        // same millisecond into one window entry.
        let member = format!("{now_ms}-{}", Uuid::new_v4());
        let count: u64 = self
            .record_failure_script
            .key(keys::poison(job_id))
            .arg(now_ms)
            .arg(member)
            .arg(now_ms - window_ms)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn ping(&self) -> Result<Duration> {
        let mut conn = self.conn.clone();
        let started = Instant::now();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(started.elapsed())
    }
}
