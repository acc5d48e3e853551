//! Durable backend: Redis LIST (ready) + ZSET (scheduled) + HASH (job
//! records). The scheduled-pop Lua script is adapted from Laravel's
//! `LuaScripts::migrateExpiredJobs` idiom.

use async_trait::async_trait;
use redis::AsyncCommands;

use super::{PersistentData, QueueBackend};
use crate::error::{Error, Result};

/// `KEYS[1]` = `<prefix><queue>:later`, `ARGV[1]` = now (unix seconds).
///
/// Fetches the lowest-scored entry whose score is `<= now` and removes it
/// before returning, so two workers racing this script can never observe
/// the same entry - removal happens inside the script, not as a separate
/// round trip.
const SCHEDULED_POP_SCRIPT: &str = r##"
local expired = redis.call('zrangebyscore', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if expired and #expired > 0 then
    redis.call('zremrangebyrank', KEYS[1], 0, 0)
end
return expired
"##;

struct ScheduledPopScript(redis::Script);

impl ScheduledPopScript {
    fn new() -> Self {
        ScheduledPopScript(redis::Script::new(SCHEDULED_POP_SCRIPT))
    }

    async fn run(
        &self,
        conn: &mut deadpool_redis::Connection,
        later_key: &str,
        now: i64,
    ) -> Result<Option<String>> {
        let result: Vec<String> = self
            .0
            .key(later_key)
            .arg(now)
            .invoke_async(conn)
            .await
            .map_err(Error::RedisError)?;

        Ok(result.into_iter().next())
    }
}

/// Redis-backed queue backend. `prefix` namespaces every key this backend
/// touches, so multiple engines can share one Redis instance.
pub struct RedisBackend {
    pool: deadpool_redis::Pool,
    prefix: String,
    scheduled_pop: ScheduledPopScript,
}

impl RedisBackend {
    pub fn new(pool: deadpool_redis::Pool, prefix: impl Into<String>) -> Self {
        RedisBackend {
            pool,
            prefix: prefix.into(),
            scheduled_pop: ScheduledPopScript::new(),
        }
    }

    fn ready_key(&self, queue: &str) -> String {
        format!("{}{}", self.prefix, queue)
    }

    fn later_key(&self, queue: &str) -> String {
        format!("{}{}:later", self.prefix, queue)
    }

    fn record_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::BackendUnavailable(e.to_string()))
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    async fn push(&self, queue: &str, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: i64 = conn.rpush(self.ready_key(queue), key).await?;
        Ok(())
    }

    async fn push_to_later(&self, queue: &str, key: &str, when: i64) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: i64 = conn.zadd(self.later_key(queue), key, when).await?;
        Ok(())
    }

    async fn pop(&self, queue: &str, timeout_secs: u64) -> Result<Option<String>> {
        let mut conn = self.connection().await?;

        // Step 1: BLPOP the ready list. If it returns, that's our result.
        let popped: Option<(String, String)> = conn
            .blpop(self.ready_key(queue), timeout_secs as usize)
            .await?;
        if let Some((_, value)) = popped {
            return Ok(Some(value));
        }

        // Step 2: the blocking pop timed out. Check the scheduled set once
        // for an entry whose deadline has already passed.
        let now = chrono::Utc::now().timestamp();
        self.scheduled_pop
            .run(&mut conn, &self.later_key(queue), now)
            .await
    }

    async fn get_full_queue(&self, queue: &str) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        let items: Vec<String> = conn.lrange(self.ready_key(queue), 0, -1).await?;
        Ok(items)
    }

    async fn get_persistent_data(&self, key: &str) -> Result<PersistentData> {
        let mut conn = self.connection().await?;
        let data: std::collections::HashMap<String, String> =
            conn.hgetall(self.record_key(key)).await?;
        Ok(data)
    }

    async fn get_persistent_field(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn.hget(self.record_key(key), field).await?;
        Ok(value)
    }

    async fn set_persistent_data(&self, key: &str, data: &PersistentData) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        let pairs: Vec<(&String, &String)> = data.iter().collect();
        let _: () = conn.hset_multiple(self.record_key(key), &pairs).await?;
        Ok(())
    }

    async fn del_persistent_data(&self, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: i64 = conn.del(self.record_key(key)).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, seconds: i64) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: bool = conn.expire(self.record_key(key), seconds as usize).await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        let mut conn = self.connection().await?;
        let ttl: i64 = conn.ttl(self.record_key(key)).await?;
        Ok(ttl)
    }
}
