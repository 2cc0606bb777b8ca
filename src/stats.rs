use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::storage::{self, now_ms};

/// 统计窗口：最近 24 小时
const STATS_WINDOW_MS: i64 = 24 * 3600 * 1000;
/// 统计功能被禁用时的复查间隔
const DISABLED_RECHECK: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize)]
pub struct ChannelStats {
    pub channel_id: i64,
    pub total: i64,
    pub success: i64,
    pub fail: i64,
    /// 成功率，0-100
    pub success_rate: f64,
}

#[derive(Default)]
struct CacheInner {
    stats: HashMap<i64, ChannelStats>,
    updated_at_ms: i64,
}

/// 渠道统计缓存。读取走共享锁，刷新任务整表替换，读者不会看到半新半旧。
#[derive(Default)]
pub struct ChannelStatsCache {
    inner: RwLock<CacheInner>,
}

impl ChannelStatsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, channel_id: i64) -> Option<ChannelStats> {
        self.inner.read().unwrap().stats.get(&channel_id).cloned()
    }

    pub fn all(&self) -> HashMap<i64, ChannelStats> {
        self.inner.read().unwrap().stats.clone()
    }

    pub fn updated_at_ms(&self) -> i64 {
        self.inner.read().unwrap().updated_at_ms
    }

    pub fn replace(&self, stats: HashMap<i64, ChannelStats>) {
        let mut inner = self.inner.write().unwrap();
        inner.stats = stats;
        inner.updated_at_ms = now_ms();
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.stats.clear();
        inner.updated_at_ms = 0;
    }
}

pub struct StatsAggregator {
    db_path: PathBuf,
    cache: std::sync::Arc<ChannelStatsCache>,
    running: AtomicBool,
}

impl StatsAggregator {
    pub fn new(db_path: PathBuf, cache: std::sync::Arc<ChannelStatsCache>) -> Self {
        Self {
            db_path,
            cache,
            running: AtomicBool::new(false),
        }
    }

    pub fn cache(&self) -> &ChannelStatsCache {
        &self.cache
    }

    /// 统计刷新循环。只应在 master 节点上启动一次。
    pub async fn run_loop(&self) {
        tracing::info!("channel stats task started");

        // 首次启动立即刷新一轮
        self.run_once().await;

        loop {
            let settings = match storage::get_gateway_settings(self.db_path.clone()).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(err = %e, "load gateway settings failed");
                    storage::GatewaySettings::default()
                }
            };

            let interval = settings.stats_refresh_interval();
            if interval <= 0 {
                // 禁用状态，周期性复查是否重新开启
                tokio::time::sleep(DISABLED_RECHECK).await;
                continue;
            }

            tokio::time::sleep(Duration::from_secs(interval as u64 * 60)).await;
            self.run_once().await;
        }
    }

    /// 刷新一轮。重入时直接跳过。
    pub async fn run_once(&self) {
        let settings = match storage::get_gateway_settings(self.db_path.clone()).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(err = %e, "load gateway settings failed");
                return;
            }
        };
        if !settings.stats_enabled() {
            return;
        }

        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let start_ms = now_ms() - STATS_WINDOW_MS;
        match storage::channel_stats_since(self.db_path.clone(), start_ms).await {
            Ok(rows) => {
                let mut stats = HashMap::with_capacity(rows.len());
                for row in rows {
                    let success_rate = if row.total > 0 {
                        row.success as f64 / row.total as f64 * 100.0
                    } else {
                        0.0
                    };
                    stats.insert(
                        row.channel_id,
                        ChannelStats {
                            channel_id: row.channel_id,
                            total: row.total,
                            success: row.success,
                            fail: row.fail,
                            success_rate,
                        },
                    );
                }
                let count = stats.len();
                self.cache.replace(stats);
                tracing::debug!(channels = count, "channel stats cache updated");
            }
            Err(e) => {
                tracing::warn!(err = %e, "channel stats query failed");
            }
        }

        self.running.store(false, Ordering::SeqCst);
    }
}
