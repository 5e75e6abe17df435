//! Redis dead-letter store.
//!
//! Each record body is a JSON string key; an index sorted set scored by
//! record time gives oldest-first ordering for pruning. Records have no TTL.

use super::RedisKeys;
use crate::dead_letter::{DeadLetterRecord, DeadLetterStore};
use crate::error::JobResult;
use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, warn};

/// Dead-letter records kept on the broker.
pub struct RedisDeadLetterStore {
    pool: Pool,
    keys: RedisKeys,
    ping_timeout: Duration,
}

impl RedisDeadLetterStore {
    /// Create a store on an already verified pool.
    pub fn new(pool: Pool, keys: RedisKeys, ping_timeout: Duration) -> Self {
        Self {
            pool,
            keys,
            ping_timeout,
        }
    }

    async fn conn(&self) -> JobResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }

    async fn load(&self, ids: &[String]) -> JobResult<Vec<DeadLetterRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn().await?;
        let keys: Vec<String> = ids.iter().map(|id| self.keys.dead_letter_record(id)).collect();
        let bodies: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(&mut *conn).await?;

        let mut records = Vec::with_capacity(bodies.len());
        for (id, body) in ids.iter().zip(bodies) {
            match body.map(|json| serde_json::from_str::<DeadLetterRecord>(&json)) {
                Some(Ok(record)) => records.push(record),
                Some(Err(e)) => warn!(record_id = %id, error = %e, "Skipping corrupt dead-letter record"),
                None => debug!(record_id = %id, "Dead-letter index entry without body"),
            }
        }

        Ok(records)
    }
}

#[async_trait]
impl DeadLetterStore for RedisDeadLetterStore {
    async fn ping(&self) -> JobResult<()> {
        super::ping(&self.pool, self.ping_timeout).await
    }

    async fn add(&self, record: &DeadLetterRecord) -> JobResult<String> {
        let mut conn = self.conn().await?;
        let json = serde_json::to_string(record)?;

        let _: () = redis::pipe()
            .atomic()
            .set(self.keys.dead_letter_record(&record.id), json)
            .zadd(
                self.keys.dead_letter_index(),
                &record.id,
                record.timestamp.timestamp_millis(),
            )
            .query_async(&mut *conn)
            .await?;

        Ok(record.id.clone())
    }

    async fn get(&self, id: &str) -> JobResult<Option<DeadLetterRecord>> {
        let mut conn = self.conn().await?;
        let body: Option<String> = conn.get(self.keys.dead_letter_record(id)).await?;
        Ok(body.map(|json| serde_json::from_str(&json)).transpose()?)
    }

    async fn list(&self, limit: usize) -> JobResult<Vec<DeadLetterRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = {
            let mut conn = self.conn().await?;
            conn.zrevrange(self.keys.dead_letter_index(), 0, last_index(limit))
                .await?
        };
        self.load(&ids).await
    }

    async fn prune(&self, keep: usize) -> JobResult<u64> {
        let mut conn = self.conn().await?;
        let index = self.keys.dead_letter_index();

        let total: usize = conn.zcard(&index).await?;
        if total <= keep {
            return Ok(0);
        }

        let excess = total - keep;
        let oldest: Vec<String> = conn.zrange(&index, 0, last_index(excess)).await?;

        let mut pipe = redis::pipe();
        for id in &oldest {
            pipe.del(self.keys.dead_letter_record(id)).ignore();
            pipe.zrem(&index, id).ignore();
        }
        let _: () = pipe.query_async(&mut *conn).await?;

        Ok(oldest.len() as u64)
    }

    async fn close(&self) {
        self.pool.close();
    }
}

/// Inclusive stop index covering the first `count` members of a sorted set.
fn last_index(count: usize) -> isize {
    isize::try_from(count).unwrap_or(isize::MAX) - 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_index_saturates() {
        assert_eq!(last_index(1), 0);
        assert_eq!(last_index(100), 99);
        assert_eq!(last_index(usize::MAX), isize::MAX - 1);
    }
}
