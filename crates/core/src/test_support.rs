use crate::error::StoreError;
use crate::store::{KeyValueStore, MemoryStore};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// A memory store that can be switched off to simulate an outage, or slowed
/// down to widen race windows around stage reads.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    down: AtomicBool,
    read_delay_ms: AtomicU64,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Every `mget` sleeps this long before answering.
    pub fn set_read_delay(&self, delay: Duration) {
        self.read_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("simulated outage".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KeyValueStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        let delay = self.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.check()?;
        self.inner.mget(keys).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.check()?;
        self.inner.set_ex(key, value, ttl).await
    }

    async fn set_ex_many(
        &self,
        entries: &[(String, String)],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.check()?;
        self.inner.set_ex_many(entries, ttl).await
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        self.check()?;
        self.inner.delete(keys).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.check()?;
        self.inner.expire(key, ttl).await
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check()?;
        self.inner.rpush(key, value).await
    }

    async fn lrange(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.check()?;
        self.inner.lrange(key).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check()?;
        self.inner.ping().await
    }
}
