use super::KeyValueStore;
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    List(Vec<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-process key-value store with Redis-like expiry.
///
/// Expiry follows the tokio clock, so paused-time tests see keys lapse.
/// One instance shared through an `Arc` behaves like a single Redis database
/// for every machine holding it.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>, StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))?;
        let now = Instant::now();
        entries.retain(|_, entry| entry.is_live(now));
        Ok(entries)
    }

    fn text(entries: &HashMap<String, Entry>, key: &str) -> Option<String> {
        match entries.get(key) {
            Some(Entry {
                value: Value::Text(text),
                ..
            }) => Some(text.clone()),
            _ => None,
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries()?;
        Ok(Self::text(&entries, key))
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        let entries = self.entries()?;
        Ok(keys.iter().map(|key| Self::text(&entries, key)).collect())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut entries = self.entries()?;
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_ex_many(
        &self,
        pairs: &[(String, String)],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut entries = self.entries()?;
        let expires_at = Some(Instant::now() + ttl);
        for (key, value) in pairs {
            entries.insert(
                key.clone(),
                Entry {
                    value: Value::Text(value.clone()),
                    expires_at,
                },
            );
        }
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut entries = self.entries()?;
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut entries = self.entries()?;
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries()?;
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::List(Vec::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::List(items) => {
                items.push(value.to_string());
                Ok(())
            }
            Value::Text(_) => Err(StoreError::Unavailable(format!(
                "WRONGTYPE: {key} does not hold a list"
            ))),
        }
    }

    async fn lrange(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let entries = self.entries()?;
        match entries.get(key) {
            Some(Entry {
                value: Value::List(items),
                ..
            }) => Ok(items.clone()),
            Some(_) => Err(StoreError::Unavailable(format!(
                "WRONGTYPE: {key} does not hold a list"
            ))),
            None => Ok(Vec::new()),
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.entries().map(|_| ())
    }
}
