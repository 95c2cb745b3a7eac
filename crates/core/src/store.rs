//! Shared, expiring session storage.
//!
//! `KeyValueStore` is the raw backend contract (Redis in production, memory in
//! tests and single-process deployments). `StageStore` sits on top of it and
//! knows the per-room key layout. Every `StageStore` method swallows backend
//! failures after logging them: callers keep running on their local state.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use crate::error::StoreError;
use crate::stage::Stage;
use crate::transcript::TranscriptEntry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use std::sync::Arc;
use std::time::Duration;

pub const STAGE_TTL: Duration = Duration::from_secs(3600);
pub const TRANSCRIPT_TTL: Duration = Duration::from_secs(86400);
pub const METADATA_TTL: Duration = Duration::from_secs(3600);

/// Minimal key-value operations the interview state needs from a backend.
///
/// Implementations must be safe to share between rooms and between tasks.
/// `set_ex_many` and `mget` must be atomic with respect to each other so a
/// reader never sees half of a multi-key write.
#[async_trait]
#[cfg_attr(test, automock)]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn set_ex_many(
        &self,
        entries: &[(String, String)],
        ttl: Duration,
    ) -> Result<(), StoreError>;

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn rpush(&self, key: &str, value: &str) -> Result<(), StoreError>;

    async fn lrange(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

pub fn stage_key(room_id: &str) -> String {
    format!("interview:{room_id}:stage")
}

pub fn stage_start_key(room_id: &str) -> String {
    format!("interview:{room_id}:stage_start")
}

pub fn transcript_key(room_id: &str) -> String {
    format!("interview:{room_id}:transcript")
}

pub fn metadata_key(room_id: &str) -> String {
    format!("interview:{room_id}:metadata")
}

/// The authoritative stage of a room as last written by any process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistedStage {
    pub stage: Stage,
    pub entered_at: Option<DateTime<Utc>>,
}

fn encode_record(entry: &TranscriptEntry) -> Result<String, StoreError> {
    Ok(serde_json::to_string(entry)?)
}

fn decode_record(record: &str) -> Result<TranscriptEntry, StoreError> {
    Ok(serde_json::from_str(record)?)
}

#[derive(Clone)]
pub struct StageStore {
    backend: Arc<dyn KeyValueStore>,
}

impl StageStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    /// Writes the stage and its entry time together. Returns whether the write landed.
    pub async fn save_stage(&self, room_id: &str, stage: Stage, entered_at: DateTime<Utc>) -> bool {
        let entries = [
            (stage_key(room_id), stage.to_string()),
            (stage_start_key(room_id), entered_at.to_rfc3339()),
        ];
        match self.backend.set_ex_many(&entries, STAGE_TTL).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(room_id, %stage, "Failed to persist stage: {}", e);
                false
            }
        }
    }

    /// Reads the shared stage. `None` when nothing usable is stored or the
    /// backend cannot be reached; the caller keeps its cached value.
    pub async fn load_stage(&self, room_id: &str) -> Option<PersistedStage> {
        let keys = [stage_key(room_id), stage_start_key(room_id)];
        let values = match self.backend.mget(&keys).await {
            Ok(values) => values,
            Err(e) => {
                tracing::error!(room_id, "Failed to read stage from store: {}", e);
                return None;
            }
        };
        let mut values = values.into_iter();
        let raw_stage = values.next().flatten()?;
        let stage = match raw_stage.parse::<Stage>() {
            Ok(stage) => stage,
            Err(e) => {
                tracing::warn!(room_id, "Ignoring stored stage: {}", e);
                return None;
            }
        };
        let entered_at = values.next().flatten().and_then(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|e| tracing::warn!(room_id, "Ignoring stored stage start {:?}: {}", raw, e))
                .ok()
        });
        Some(PersistedStage { stage, entered_at })
    }

    /// Removes the room's stage and metadata keys. The transcript is left to
    /// expire on its own so it can still be read after the interview.
    pub async fn clear_session(&self, room_id: &str) {
        let keys = [stage_key(room_id), stage_start_key(room_id), metadata_key(room_id)];
        if let Err(e) = self.backend.delete(&keys).await {
            tracing::error!(room_id, "Failed to clean up store keys: {}", e);
        }
    }

    pub async fn append_transcript(&self, room_id: &str, entry: &TranscriptEntry) {
        let key = transcript_key(room_id);
        let record = match encode_record(entry) {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(room_id, "Failed to encode transcript entry: {}", e);
                return;
            }
        };
        if let Err(e) = self.backend.rpush(&key, &record).await {
            tracing::error!(room_id, "Failed to append to transcript: {}", e);
            return;
        }
        if let Err(e) = self.backend.expire(&key, TRANSCRIPT_TTL).await {
            tracing::error!(room_id, "Failed to refresh transcript expiry: {}", e);
        }
    }

    pub async fn transcript(&self, room_id: &str) -> Vec<TranscriptEntry> {
        let records = match self.backend.lrange(&transcript_key(room_id)).await {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(room_id, "Failed to read transcript: {}", e);
                return Vec::new();
            }
        };
        records
            .iter()
            .filter_map(|record| match decode_record(record) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!(room_id, "Skipping malformed transcript record: {}", e);
                    None
                }
            })
            .collect()
    }

    pub async fn save_metadata(&self, room_id: &str, metadata: &str) {
        if let Err(e) = self
            .backend
            .set_ex(&metadata_key(room_id), metadata, METADATA_TTL)
            .await
        {
            tracing::error!(room_id, "Failed to store metadata: {}", e);
        }
    }

    pub async fn metadata(&self, room_id: &str) -> Option<String> {
        self.backend
            .get(&metadata_key(room_id))
            .await
            .map_err(|e| tracing::error!(room_id, "Failed to read metadata: {}", e))
            .ok()
            .flatten()
    }

    pub async fn is_healthy(&self) -> bool {
        match self.backend.ping().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Store health check failed: {}", e);
                false
            }
        }
    }
}
