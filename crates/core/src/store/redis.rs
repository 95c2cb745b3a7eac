use super::KeyValueStore;
use crate::error::StoreError;
use ::redis::aio::MultiplexedConnection;
use ::redis::{Client, RedisResult};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;

/// Redis-backed store.
///
/// The connection is opened lazily and shared between callers. A dropped
/// connection is discarded and re-established on the next call, and every
/// command is bounded by `op_timeout` so an unreachable server never stalls a
/// stage transition for long.
pub struct RedisStore {
    client: Client,
    conn: Mutex<Option<MultiplexedConnection>>,
    op_timeout: Duration,
}

impl RedisStore {
    /// Validates the URL; no connection is made until the first command.
    pub fn open(url: &str, op_timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
            op_timeout,
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = tokio::time::timeout(
            self.op_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| StoreError::Timeout(self.op_timeout))??;
        tracing::info!("Redis connection established");
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn reset(&self) {
        self.conn.lock().await.take();
    }

    async fn run<T, F, Fut>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let conn = self.connection().await?;
        match tokio::time::timeout(self.op_timeout, op(conn)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if e.is_connection_dropped() || e.is_io_error() {
                    self.reset().await;
                }
                Err(StoreError::Redis(e))
            }
            Err(_) => {
                self.reset().await;
                Err(StoreError::Timeout(self.op_timeout))
            }
        }
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        self.run(|mut conn| async move {
            ::redis::cmd("GET")
                .arg(&key)
                .query_async::<_, Option<String>>(&mut conn)
                .await
        })
        .await
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let keys = keys.to_vec();
        self.run(|mut conn| async move {
            ::redis::cmd("MGET")
                .arg(&keys)
                .query_async::<_, Vec<Option<String>>>(&mut conn)
                .await
        })
        .await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let key = key.to_string();
        let value = value.to_string();
        self.run(|mut conn| async move {
            ::redis::cmd("SET")
                .arg(&key)
                .arg(&value)
                .arg("EX")
                .arg(ttl.as_secs())
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
    }

    async fn set_ex_many(
        &self,
        entries: &[(String, String)],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut pipe = ::redis::pipe();
        pipe.atomic();
        for (key, value) in entries {
            pipe.cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl.as_secs())
                .ignore();
        }
        self.run(|mut conn| async move { pipe.query_async::<_, ()>(&mut conn).await })
            .await
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let keys = keys.to_vec();
        self.run(|mut conn| async move {
            ::redis::cmd("DEL")
                .arg(&keys)
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let key = key.to_string();
        self.run(|mut conn| async move {
            ::redis::cmd("EXPIRE")
                .arg(&key)
                .arg(ttl.as_secs())
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        let value = value.to_string();
        self.run(|mut conn| async move {
            ::redis::cmd("RPUSH")
                .arg(&key)
                .arg(&value)
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
    }

    async fn lrange(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let key = key.to_string();
        self.run(|mut conn| async move {
            ::redis::cmd("LRANGE")
                .arg(&key)
                .arg(0)
                .arg(-1)
                .query_async::<_, Vec<String>>(&mut conn)
                .await
        })
        .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.run(|mut conn| async move {
            ::redis::cmd("PING")
                .query_async::<_, String>(&mut conn)
                .await
                .map(|_| ())
        })
        .await
    }
}
