use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;

use crate::services::traits::{Lease, LockError, RoundLock};

// Delete the key only if it still carries our token
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Round lock backed by a single Redis key
///
/// Acquisition is `SET key token NX PX ttl`; the key expires on its own if
/// the holder dies mid-round.
pub struct RedisLease {
    redis: Arc<tokio::sync::Mutex<ConnectionManager>>,
}

impl RedisLease {
    pub async fn new(redis_url: &str) -> Result<Self, LockError> {
        let client = redis::Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;

        Ok(Self {
            redis: Arc::new(tokio::sync::Mutex::new(redis)),
        })
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl RoundLock for RedisLease {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<Lease>, LockError> {
        let lease = Lease::new(key, ttl);

        let mut conn = self.redis.lock().await;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&lease.token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut *conn)
            .await?;
        drop(conn);

        if reply.is_some() {
            tracing::debug!("Acquired round lease {} for {:?}", key, ttl);
            Ok(Some(lease))
        } else {
            tracing::debug!("Round lease {} is held elsewhere", key);
            Ok(None)
        }
    }

    async fn is_held(&self, lease: &Lease) -> Result<bool, LockError> {
        let mut conn = self.redis.lock().await;
        let value: Option<String> = redis::cmd("GET")
            .arg(&lease.key)
            .query_async(&mut *conn)
            .await?;

        Ok(value.as_deref() == Some(lease.token.as_str()))
    }

    async fn release(&self, lease: &Lease) -> Result<(), LockError> {
        let mut conn = self.redis.lock().await;
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&lease.key)
            .arg(&lease.token)
            .invoke_async(&mut *conn)
            .await?;

        if deleted == 0 {
            tracing::warn!("Round lease {} was no longer ours at release", lease.key);
        } else {
            tracing::debug!("Released round lease {}", lease.key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_never_rounds_to_zero() {
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(30)), 30_000);
    }

    #[tokio::test]
    #[ignore = "Requires Redis"]
    async fn test_lease_is_exclusive() {
        let lock = RedisLease::new("redis://127.0.0.1:6379")
            .await
            .expect("Failed to connect to Redis");
        let key = format!("coffee-match:test:{}", uuid::Uuid::new_v4());

        let lease = lock.try_acquire(&key, Duration::from_secs(5)).await.unwrap().unwrap();
        assert!(lock.try_acquire(&key, Duration::from_secs(5)).await.unwrap().is_none());
        assert!(lock.is_held(&lease).await.unwrap());

        lock.release(&lease).await.unwrap();
        assert!(!lock.is_held(&lease).await.unwrap());
    }
}
