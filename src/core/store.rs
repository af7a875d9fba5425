//! Block event persistence.
//!
//! The core only writes best-effort records and reads them back for history
//! views. Redis keeps events in a sorted set scored by block time.

use std::net::IpAddr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use redis::Client as RedisClient;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core::packet::Protocol;
use crate::core::rule_engine::{BlockDecision, BlockLevel, ConnectionFact};
use crate::utils::format_key;

/// Errors that can occur while persisting block events
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Persisted block event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockEventRecord {
    pub id: String,
    pub process_id: Option<u32>,
    pub process_name: Option<String>,
    pub remote_address: IpAddr,
    pub remote_port: Option<u16>,
    pub protocol: Protocol,
    pub block_level: BlockLevel,
    pub reason: String,
    pub confidence_score: f64,
    pub triggered_rules: Vec<String>,
    pub blocked_at: DateTime<Utc>,
}

impl BlockEventRecord {
    pub fn from_decision(fact: &ConnectionFact, decision: &BlockDecision) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            process_id: fact.process_id,
            process_name: fact.process_name.clone(),
            remote_address: fact.remote_ip,
            remote_port: fact.remote_port,
            protocol: fact.protocol,
            block_level: decision.level,
            reason: decision.reason.clone(),
            confidence_score: decision.confidence_score,
            triggered_rules: decision.triggered_rules.clone(),
            blocked_at: decision.analyzed_at,
        }
    }
}

impl redis::FromRedisValue for BlockEventRecord {
    fn from_redis_value(v: &redis::Value) -> redis::RedisResult<Self> {
        let str_value: String = redis::FromRedisValue::from_redis_value(v)?;
        serde_json::from_str(&str_value).map_err(|e| {
            redis::RedisError::from((
                redis::ErrorKind::TypeError,
                "Failed to parse BlockEventRecord from JSON",
                e.to_string(),
            ))
        })
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlockEventStore: Send + Sync {
    async fn record_block_event(&self, record: BlockEventRecord) -> Result<(), StoreError>;

    /// Events blocked at or after `since`, oldest first
    async fn get_history(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<BlockEventRecord>, StoreError>;
}

/// Redis-backed block event store
pub struct RedisBlockStore {
    redis_client: RedisClient,
    key: String,
}

impl RedisBlockStore {
    pub fn new(redis_client: RedisClient) -> Self {
        Self {
            redis_client,
            key: format_key("defense", "block_events"),
        }
    }

    /// Removes events blocked before `cutoff`
    pub async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut conn = self.redis_client.get_async_connection().await?;
        let removed: u64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(&self.key)
            .arg("-inf")
            .arg(format!("({}", cutoff.timestamp_millis()))
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }
}

#[async_trait]
impl BlockEventStore for RedisBlockStore {
    async fn record_block_event(&self, record: BlockEventRecord) -> Result<(), StoreError> {
        let mut conn = self.redis_client.get_async_connection().await?;
        let json = serde_json::to_string(&record)?;
        redis::cmd("ZADD")
            .arg(&self.key)
            .arg(record.blocked_at.timestamp_millis())
            .arg(json)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_history(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<BlockEventRecord>, StoreError> {
        let mut conn = self.redis_client.get_async_connection().await?;
        let records: Vec<BlockEventRecord> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.key)
            .arg(since.timestamp_millis())
            .arg("+inf")
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await?;
        Ok(records)
    }
}

/// In-process store, used when Redis is disabled
pub struct MemoryBlockStore {
    records: Mutex<Vec<BlockEventRecord>>,
    capacity: usize,
}

impl MemoryBlockStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryBlockStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl BlockEventStore for MemoryBlockStore {
    async fn record_block_event(&self, record: BlockEventRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        let position = records.partition_point(|r| r.blocked_at <= record.blocked_at);
        records.insert(position, record);
        if records.len() > self.capacity {
            let excess = records.len() - self.capacity;
            records.drain(..excess);
        }
        Ok(())
    }

    async fn get_history(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<BlockEventRecord>, StoreError> {
        let records = self.records.lock();
        Ok(records
            .iter()
            .filter(|r| r.blocked_at >= since)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rule_engine::{BlockRuleConfig, BlockRuleEngine};
    use chrono::{Duration, TimeZone};

    fn record_at(at: DateTime<Utc>) -> BlockEventRecord {
        let engine = BlockRuleEngine::new(BlockRuleConfig {
            malicious_ips: vec!["203.0.113.66".parse().unwrap()],
            ..Default::default()
        });
        let fact = ConnectionFact::new("203.0.113.66".parse().unwrap(), at)
            .with_remote_port(443)
            .with_process(812, "updater");
        let decision = engine.evaluate(&fact);
        BlockEventRecord::from_decision(&fact, &decision)
    }

    #[tokio::test]
    async fn memory_store_returns_history_in_time_order() {
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let store = MemoryBlockStore::new(100);
        for offset in [30, 10, 20] {
            store.record_block_event(record_at(base + Duration::seconds(offset))).await.unwrap();
        }

        let history = store.get_history(base + Duration::seconds(15), 10).await.unwrap();
        let times: Vec<_> = history.iter().map(|r| r.blocked_at).collect();
        assert_eq!(times, vec![base + Duration::seconds(20), base + Duration::seconds(30)]);
        assert_eq!(history[0].block_level, BlockLevel::Immediate);
        assert_eq!(history[0].process_name.as_deref(), Some("updater"));

        assert_eq!(store.get_history(base, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn memory_store_drops_oldest_past_capacity() {
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let store = MemoryBlockStore::new(2);
        for offset in 0..3 {
            store.record_block_event(record_at(base + Duration::seconds(offset))).await.unwrap();
        }
        assert_eq!(store.len(), 2);
        let history = store.get_history(base, 10).await.unwrap();
        assert_eq!(history[0].blocked_at, base + Duration::seconds(1));
    }

    #[test]
    fn records_parse_from_redis_values() {
        let record = record_at(Utc::now());
        let value = redis::Value::Data(serde_json::to_vec(&record).unwrap());
        let parsed: BlockEventRecord = redis::FromRedisValue::from_redis_value(&value).unwrap();
        assert_eq!(parsed, record);
    }
}
