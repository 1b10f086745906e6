use std::sync::Arc;
use std::time::Duration;

use crate::schema::ConnectionType;
use crate::services::EphemeralStore;

pub const OFFICIAL_MINUTE_LIMIT: i64 = 20;
pub const OFFICIAL_HOUR_LIMIT: i64 = 100;
pub const OFFICIAL_DAILY_LIMIT: i64 = 500;
pub const QRCODE_HOUR_LIMIT: i64 = 1000;
pub const QRCODE_MIN_DELAY: Duration = Duration::from_millis(500);

fn key(number_id: &str, suffix: &str) -> String {
    format!("whatsapp:ratelimit:{number_id}:{suffix}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitReason {
    Minute,
    Hour,
    Daily,
    MinDelay,
}

#[derive(Debug, Clone)]
pub struct CheckResult {
    pub allowed: bool,
    pub reason: Option<LimitReason>,
    pub retry_after_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct WindowUsage {
    pub used: i64,
    pub limit: i64,
}

#[derive(Debug, Clone)]
pub struct Usage {
    pub minute: WindowUsage,
    pub hour: WindowUsage,
    pub daily: Option<WindowUsage>,
}

pub struct RateLimiter {
    store: Arc<dyn EphemeralStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn EphemeralStore>) -> Self {
        Self { store }
    }

    pub async fn check(
        &self,
        number_id: &str,
        connection_type: ConnectionType,
    ) -> anyhow::Result<CheckResult> {
        let minute_count = self.counter(number_id, "minute").await?;
        if minute_count >= OFFICIAL_MINUTE_LIMIT && connection_type == ConnectionType::Official {
            return Ok(CheckResult {
                allowed: false,
                reason: Some(LimitReason::Minute),
                retry_after_seconds: 60,
            });
        }

        let hour_count = self.counter(number_id, "hour").await?;
        let hour_limit = match connection_type {
            ConnectionType::Official => OFFICIAL_HOUR_LIMIT,
            ConnectionType::Qrcode => QRCODE_HOUR_LIMIT,
        };
        if hour_count >= hour_limit {
            return Ok(CheckResult {
                allowed: false,
                reason: Some(LimitReason::Hour),
                retry_after_seconds: 3600,
            });
        }

        if connection_type == ConnectionType::Official {
            let daily_count = self.counter(number_id, "daily").await?;
            if daily_count >= OFFICIAL_DAILY_LIMIT {
                return Ok(CheckResult {
                    allowed: false,
                    reason: Some(LimitReason::Daily),
                    retry_after_seconds: 86_400,
                });
            }
        }

        if connection_type == ConnectionType::Qrcode {
            if let Some(wait) = self.qrcode_wait(number_id).await? {
                return Ok(CheckResult {
                    allowed: false,
                    reason: Some(LimitReason::MinDelay),
                    retry_after_seconds: wait.as_secs().max(1),
                });
            }
        }

        Ok(CheckResult {
            allowed: true,
            reason: None,
            retry_after_seconds: 0,
        })
    }

    /// Called immediately after a successful upstream send. The official
    /// daily ceiling gets a check-and-decrement-on-fail primitive (the one
    /// limit the spec calls out as deserving it); every other counter
    /// accepts the cheaper increment-only race.
    pub async fn record(
        &self,
        number_id: &str,
        connection_type: ConnectionType,
    ) -> anyhow::Result<bool> {
        if connection_type == ConnectionType::Official {
            let daily_key = key(number_id, "daily");
            let count = self
                .store
                .incr_with_ttl(&daily_key, Duration::from_secs(86_400))
                .await?;
            if count > OFFICIAL_DAILY_LIMIT {
                // the increment pushed us over the hard ceiling: undo it and
                // reject instead of recording a send that should not count.
                // decr (not expire) so the key's TTL — and therefore the
                // rolling 24h window it anchors — is untouched.
                self.store.decr(&daily_key).await.ok();
                return Ok(false);
            }
        }

        self.store
            .incr_with_ttl(&key(number_id, "minute"), Duration::from_secs(60))
            .await?;
        self.store
            .incr_with_ttl(&key(number_id, "hour"), Duration::from_secs(3600))
            .await?;
        self.store
            .set_with_ttl(
                &key(number_id, "last"),
                &chrono::Utc::now().timestamp_millis().to_string(),
                Duration::from_secs(3600),
            )
            .await?;

        Ok(true)
    }

    pub async fn wait_if_needed(
        &self,
        number_id: &str,
        connection_type: ConnectionType,
    ) -> anyhow::Result<u64> {
        let result = self.check(number_id, connection_type).await?;
        if result.allowed {
            Ok(0)
        } else {
            Ok(result.retry_after_seconds)
        }
    }

    pub async fn usage(&self, number_id: &str, connection_type: ConnectionType) -> anyhow::Result<Usage> {
        let minute = self.counter(number_id, "minute").await?;
        let hour = self.counter(number_id, "hour").await?;
        let daily = if connection_type == ConnectionType::Official {
            Some(WindowUsage {
                used: self.counter(number_id, "daily").await?,
                limit: OFFICIAL_DAILY_LIMIT,
            })
        } else {
            None
        };
        let hour_limit = match connection_type {
            ConnectionType::Official => OFFICIAL_HOUR_LIMIT,
            ConnectionType::Qrcode => QRCODE_HOUR_LIMIT,
        };

        Ok(Usage {
            minute: WindowUsage {
                used: minute,
                limit: OFFICIAL_MINUTE_LIMIT,
            },
            hour: WindowUsage {
                used: hour,
                limit: hour_limit,
            },
            daily,
        })
    }

    async fn counter(&self, number_id: &str, suffix: &str) -> anyhow::Result<i64> {
        match self.store.get(&key(number_id, suffix)).await? {
            Some(raw) => Ok(raw.parse().unwrap_or(0)),
            None => Ok(0),
        }
    }

    async fn qrcode_wait(&self, number_id: &str) -> anyhow::Result<Option<Duration>> {
        let Some(raw) = self.store.get(&key(number_id, "last")).await? else {
            return Ok(None);
        };
        let Ok(last_ms) = raw.parse::<i64>() else {
            return Ok(None);
        };
        let elapsed_ms = chrono::Utc::now().timestamp_millis() - last_ms;
        if elapsed_ms < 0 {
            return Ok(None);
        }
        let elapsed = Duration::from_millis(elapsed_ms as u64);
        if elapsed >= QRCODE_MIN_DELAY {
            Ok(None)
        } else {
            Ok(Some(QRCODE_MIN_DELAY - elapsed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct FakeStore {
        values: Mutex<HashMap<String, String>>,
    }

    #[async_trait::async_trait]
    impl EphemeralStore for FakeStore {
        async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            Ok(self.values.lock().await.get(key).cloned())
        }
        async fn set_with_ttl(&self, key: &str, value: &str, _ttl: Duration) -> anyhow::Result<()> {
            self.values.lock().await.insert(key.to_string(), value.to_string());
            Ok(())
        }
        async fn set_if_absent(&self, key: &str, value: &str, _ttl: Duration) -> anyhow::Result<bool> {
            let mut v = self.values.lock().await;
            if v.contains_key(key) {
                Ok(false)
            } else {
                v.insert(key.to_string(), value.to_string());
                Ok(true)
            }
        }
        async fn incr(&self, key: &str) -> anyhow::Result<i64> {
            self.incr_with_ttl(key, Duration::from_secs(60)).await
        }
        async fn incr_with_ttl(&self, key: &str, _ttl: Duration) -> anyhow::Result<i64> {
            let mut v = self.values.lock().await;
            let count: i64 = v.get(key).and_then(|s| s.parse().ok()).unwrap_or(0) + 1;
            v.insert(key.to_string(), count.to_string());
            Ok(count)
        }
        async fn decr(&self, key: &str) -> anyhow::Result<i64> {
            let mut v = self.values.lock().await;
            let count: i64 = v.get(key).and_then(|s| s.parse().ok()).unwrap_or(0) - 1;
            v.insert(key.to_string(), count.to_string());
            Ok(count)
        }
        async fn expire(&self, _key: &str, _ttl: Duration) -> anyhow::Result<()> {
            Ok(())
        }
        async fn lpush(&self, _key: &str, _value: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn rpush(&self, _key: &str, _value: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn lpop(&self, _key: &str) -> anyhow::Result<Option<String>> {
            Ok(None)
        }
        async fn lrange(&self, _key: &str, _start: isize, _stop: isize) -> anyhow::Result<Vec<String>> {
            Ok(vec![])
        }
        async fn lrem(&self, _key: &str, _count: isize, _value: &str) -> anyhow::Result<i64> {
            Ok(0)
        }
        async fn scan(&self, _pattern: &str) -> anyhow::Result<Vec<String>> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn allows_send_below_limit_then_rejects_at_limit() {
        let limiter = RateLimiter::new(Arc::new(FakeStore::default()));
        for _ in 0..OFFICIAL_MINUTE_LIMIT {
            let check = limiter.check("num-1", ConnectionType::Official).await.unwrap();
            assert!(check.allowed);
            limiter.record("num-1", ConnectionType::Official).await.unwrap();
        }
        let check = limiter.check("num-1", ConnectionType::Official).await.unwrap();
        assert!(!check.allowed);
        assert_eq!(check.reason, Some(LimitReason::Minute));
    }

    #[tokio::test]
    async fn qrcode_enforces_min_delay() {
        let limiter = RateLimiter::new(Arc::new(FakeStore::default()));
        assert!(limiter.check("num-2", ConnectionType::Qrcode).await.unwrap().allowed);
        limiter.record("num-2", ConnectionType::Qrcode).await.unwrap();
        let check = limiter.check("num-2", ConnectionType::Qrcode).await.unwrap();
        assert!(!check.allowed);
        assert_eq!(check.reason, Some(LimitReason::MinDelay));
    }

    #[tokio::test]
    async fn daily_ceiling_rejects_on_overshoot() {
        let limiter = RateLimiter::new(Arc::new(FakeStore::default()));
        for _ in 0..OFFICIAL_DAILY_LIMIT {
            assert!(limiter.record("num-3", ConnectionType::Official).await.unwrap());
        }
        assert!(!limiter.record("num-3", ConnectionType::Official).await.unwrap());
    }

    #[tokio::test]
    async fn daily_ceiling_stays_capped_across_repeated_overshoot_attempts() {
        let store = Arc::new(FakeStore::default());
        let limiter = RateLimiter::new(store.clone());
        for _ in 0..OFFICIAL_DAILY_LIMIT {
            assert!(limiter.record("num-4", ConnectionType::Official).await.unwrap());
        }

        for _ in 0..5 {
            assert!(!limiter.record("num-4", ConnectionType::Official).await.unwrap());
        }

        let daily_key = key("num-4", "daily");
        let count: i64 = store.get(&daily_key).await.unwrap().unwrap().parse().unwrap();
        assert_eq!(count, OFFICIAL_DAILY_LIMIT);
        assert!(!limiter.check("num-4", ConnectionType::Official).await.unwrap().allowed);
    }
}
