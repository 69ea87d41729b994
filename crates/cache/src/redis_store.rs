use std::time::Duration;

use redis::AsyncCommands;

use crate::Result;

/// Store backed by a shared redis deployment. This is the production
/// configuration: every node of a cluster points at the same instance,
/// which is what makes queue pops, counters and the in-progress hash
/// atomic across processes.
pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(RedisStore { conn })
    }

    fn conn(&self) -> redis::aio::ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait::async_trait]
impl crate::Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.conn().get(key).await?)
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        Ok(self.conn().set(key, value).await?)
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        Ok(redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut self.conn())
            .await?)
    }

    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut self.conn())
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        Ok(self.conn().del(key).await?)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.conn().exists(key).await?)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        Ok(self
            .conn()
            .pexpire(key, ttl.as_millis() as i64)
            .await?)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        Ok(self.conn().keys(pattern).await?)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        Ok(self.conn().incr(key, delta).await?)
    }

    async fn rpush(&self, key: &str, values: &[Vec<u8>]) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        Ok(self.conn().rpush(key, values).await?)
    }

    async fn lpush(&self, key: &str, values: &[Vec<u8>]) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        Ok(self.conn().lpush(key, values).await?)
    }

    async fn lpop(&self, key: &str, count: usize) -> Result<Vec<Vec<u8>>> {
        let values: Option<Vec<Vec<u8>>> = self
            .conn()
            .lpop(key, Some(std::num::NonZeroUsize::new(count.max(1)).unwrap()))
            .await?;
        Ok(values.unwrap_or_default())
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .conn()
            .lrange(key, start as isize, stop as isize)
            .await?)
    }

    async fn lindex(&self, key: &str, index: i64) -> Result<Option<Vec<u8>>> {
        Ok(self.conn().lindex(key, index as isize).await?)
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        Ok(self.conn().llen(key).await?)
    }

    async fn lrem(&self, key: &str, value: &[u8]) -> Result<usize> {
        Ok(self.conn().lrem(key, 0, value).await?)
    }

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<()> {
        Ok(self.conn().hset(key, field, value).await?)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.conn().hget(key, field).await?)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let removed: i64 = self.conn().hdel(key, field).await?;
        Ok(removed == 1)
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self.conn().hgetall(key).await?)
    }
}
