use rusqlite::params;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use crate::storage::{self, now_ms, with_conn};

/// 限流窗口：60 秒
const RATE_LIMIT_WINDOW_MS: i64 = 60_000;
/// 共享存储里的记录保留时长：120 秒
const RATE_LIMIT_RETENTION_MS: i64 = 120_000;

/// 渠道级滑动窗口 RPM 限流器。
///
/// 正常走共享存储（所有副本共用的 SQLite），任何存储错误都只对当次调用
/// 降级到进程内窗口；两种表示永远不会同时参与一次判定。整体 fail-open：
/// 限流器自身绝不能成为全量拒绝的根因。
pub struct RateLimiter {
    db_path: PathBuf,
    /// 共享存储不可用的部署可以整体关掉，只用进程内窗口
    shared_store_enabled: bool,
    buckets: RwLock<HashMap<i64, Arc<Mutex<Vec<i64>>>>>,
}

impl RateLimiter {
    pub fn new(db_path: PathBuf) -> Self {
        Self {
            db_path,
            shared_store_enabled: true,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    pub fn memory_only(db_path: PathBuf) -> Self {
        Self {
            db_path,
            shared_store_enabled: false,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// 检查并记录一次请求，返回是否放行。判定与记录是同一个原子操作，
    /// 调用方不需要（也不应该）再单独记录。
    pub async fn check_and_record(&self, channel_id: i64) -> bool {
        self.check_and_record_at(channel_id, now_ms()).await
    }

    pub async fn check_and_record_at(&self, channel_id: i64, now_ms: i64) -> bool {
        let max_rpm = storage::get_channel_max_rpm(self.db_path.clone(), channel_id).await;
        if max_rpm <= 0 {
            return true;
        }

        if self.shared_store_enabled {
            match self.check_shared(channel_id, max_rpm, now_ms).await {
                Ok(allowed) => return allowed,
                Err(e) => {
                    tracing::warn!(
                        channel_id,
                        err = %e,
                        "channel rate limit shared store error, falling back to memory"
                    );
                }
            }
        }

        self.check_memory(channel_id, max_rpm, now_ms)
    }

    async fn check_shared(
        &self,
        channel_id: i64,
        max_rpm: i64,
        now_ms: i64,
    ) -> anyhow::Result<bool> {
        with_conn(self.db_path.clone(), move |conn| {
            let tx = conn.unchecked_transaction()?;

            tx.execute(
                r#"DELETE FROM channel_rpm WHERE channel_id = ?1 AND at_ms < ?2"#,
                params![channel_id, now_ms - RATE_LIMIT_RETENTION_MS],
            )?;

            let count: i64 = tx.query_row(
                r#"SELECT COUNT(*) FROM channel_rpm WHERE channel_id = ?1 AND at_ms > ?2"#,
                params![channel_id, now_ms - RATE_LIMIT_WINDOW_MS],
                |row| row.get(0),
            )?;

            if count >= max_rpm {
                tx.commit()?;
                return Ok(false);
            }

            tx.execute(
                r#"INSERT INTO channel_rpm (channel_id, at_ms) VALUES (?1, ?2)"#,
                params![channel_id, now_ms],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    fn check_memory(&self, channel_id: i64, max_rpm: i64, now_ms: i64) -> bool {
        let bucket = {
            let read = self.buckets.read().unwrap();
            read.get(&channel_id).cloned()
        };
        let bucket = match bucket {
            Some(b) => b,
            None => self
                .buckets
                .write()
                .unwrap()
                .entry(channel_id)
                .or_insert_with(|| Arc::new(Mutex::new(Vec::with_capacity(100))))
                .clone(),
        };

        let mut timestamps = bucket.lock().unwrap();
        let window_start = now_ms - RATE_LIMIT_WINDOW_MS;

        timestamps.retain(|ts| *ts > window_start);
        if timestamps.len() as i64 >= max_rpm {
            return false;
        }

        timestamps.push(now_ms);
        true
    }

    /// 当前窗口内的请求数（监控、展示用）。
    pub async fn current_rpm(&self, channel_id: i64) -> i64 {
        self.current_rpm_at(channel_id, now_ms()).await
    }

    pub async fn current_rpm_at(&self, channel_id: i64, now_ms: i64) -> i64 {
        if self.shared_store_enabled {
            let result = with_conn(self.db_path.clone(), move |conn| {
                conn.execute(
                    r#"DELETE FROM channel_rpm WHERE channel_id = ?1 AND at_ms < ?2"#,
                    params![channel_id, now_ms - RATE_LIMIT_RETENTION_MS],
                )?;
                let count: i64 = conn.query_row(
                    r#"SELECT COUNT(*) FROM channel_rpm WHERE channel_id = ?1 AND at_ms > ?2"#,
                    params![channel_id, now_ms - RATE_LIMIT_WINDOW_MS],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await;

            match result {
                Ok(count) => return count,
                Err(e) => {
                    tracing::warn!(channel_id, err = %e, "channel rpm query failed");
                    return 0;
                }
            }
        }

        let bucket = self.buckets.read().unwrap().get(&channel_id).cloned();
        match bucket {
            Some(b) => {
                let timestamps = b.lock().unwrap();
                let window_start = now_ms - RATE_LIMIT_WINDOW_MS;
                timestamps.iter().filter(|ts| **ts > window_start).count() as i64
            }
            None => 0,
        }
    }

    /// 清除某个渠道的限流记录（两种表示都清）。
    pub async fn clear(&self, channel_id: i64) {
        if self.shared_store_enabled {
            let result = with_conn(self.db_path.clone(), move |conn| {
                conn.execute(
                    r#"DELETE FROM channel_rpm WHERE channel_id = ?1"#,
                    params![channel_id],
                )?;
                Ok(())
            })
            .await;
            if let Err(e) = result {
                tracing::warn!(channel_id, err = %e, "clear channel rpm failed");
            }
        }

        self.buckets.write().unwrap().remove(&channel_id);
    }
}
