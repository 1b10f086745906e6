use std::time::Duration;

/// The narrow capability the rate limiter, dedup cache, and department
/// queues actually need from a shared cache — not a general Redis client.
/// Grounded in the same shape as `AiService`: a trait at the seam, one real
/// implementation behind it.
#[async_trait::async_trait]
pub trait EphemeralStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()>;
    /// `SET key value NX EX ttl` — true if the key was newly set, false if it
    /// already existed. Used for webhook-event dedup.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<bool>;
    async fn incr(&self, key: &str) -> anyhow::Result<i64>;
    /// Atomic increment-with-TTL: sets the TTL only on the increment that
    /// first creates the key, so a counter's window is anchored to its first
    /// use rather than reset by every increment.
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> anyhow::Result<i64>;
    /// Atomic decrement, paired with `incr_with_ttl` to undo a counter bump
    /// that turned out to push a ceiling check over its limit.
    async fn decr(&self, key: &str) -> anyhow::Result<i64>;
    async fn expire(&self, key: &str, ttl: Duration) -> anyhow::Result<()>;
    async fn lpush(&self, key: &str, value: &str) -> anyhow::Result<()>;
    async fn rpush(&self, key: &str, value: &str) -> anyhow::Result<()>;
    async fn lpop(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> anyhow::Result<Vec<String>>;
    async fn lrem(&self, key: &str, count: isize, value: &str) -> anyhow::Result<i64>;
    async fn scan(&self, pattern: &str) -> anyhow::Result<Vec<String>>;
}

pub struct RedisEphemeralStore {
    manager: redis::aio::ConnectionManager,
}

impl RedisEphemeralStore {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager })
    }
}

#[async_trait::async_trait]
impl EphemeralStore for RedisEphemeralStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut con = self.manager.clone();
        Ok(redis::AsyncCommands::get(&mut con, key).await?)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        let mut con = self.manager.clone();
        redis::AsyncCommands::set_ex::<_, _, ()>(&mut con, key, value, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<bool> {
        let mut con = self.manager.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut con)
            .await?;
        Ok(set.is_some())
    }

    async fn incr(&self, key: &str) -> anyhow::Result<i64> {
        let mut con = self.manager.clone();
        Ok(redis::AsyncCommands::incr(&mut con, key, 1).await?)
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> anyhow::Result<i64> {
        let mut con = self.manager.clone();
        let count: i64 = redis::AsyncCommands::incr(&mut con, key, 1).await?;
        if count == 1 {
            redis::AsyncCommands::expire::<_, ()>(&mut con, key, ttl.as_secs().max(1) as i64)
                .await?;
        }
        Ok(count)
    }

    async fn decr(&self, key: &str) -> anyhow::Result<i64> {
        let mut con = self.manager.clone();
        Ok(redis::AsyncCommands::decr(&mut con, key, 1).await?)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> anyhow::Result<()> {
        let mut con = self.manager.clone();
        redis::AsyncCommands::expire::<_, ()>(&mut con, key, ttl.as_secs().max(1) as i64).await?;
        Ok(())
    }

    async fn lpush(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut con = self.manager.clone();
        redis::AsyncCommands::lpush::<_, _, ()>(&mut con, key, value).await?;
        Ok(())
    }

    async fn rpush(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut con = self.manager.clone();
        redis::AsyncCommands::rpush::<_, _, ()>(&mut con, key, value).await?;
        Ok(())
    }

    async fn lpop(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut con = self.manager.clone();
        Ok(redis::AsyncCommands::lpop(&mut con, key, None).await?)
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> anyhow::Result<Vec<String>> {
        let mut con = self.manager.clone();
        Ok(redis::AsyncCommands::lrange(&mut con, key, start, stop).await?)
    }

    async fn lrem(&self, key: &str, count: isize, value: &str) -> anyhow::Result<i64> {
        let mut con = self.manager.clone();
        Ok(redis::AsyncCommands::lrem(&mut con, key, count, value).await?)
    }

    async fn scan(&self, pattern: &str) -> anyhow::Result<Vec<String>> {
        let mut con = self.manager.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut con)
                .await?;
            keys.extend(batch);
            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }
        Ok(keys)
    }
}
