use std::sync::Arc;

use relaycore::stats::{ChannelStatsCache, StatsAggregator};
use relaycore::storage::{self, CreateRequestLog, now_ms};

fn temp_db_path() -> std::path::PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!("relaycore-test-{}.sqlite", uuid::Uuid::new_v4()));
    p
}

async fn insert_log(db_path: std::path::PathBuf, channel_id: i64, success: bool, at_ms: i64) {
    storage::insert_request_log(
        db_path,
        CreateRequestLog {
            channel_id,
            model: Some("m1".to_string()),
            success,
            latency_ms: 120,
            created_at_ms: at_ms,
        },
    )
    .await
    .expect("insert request log");
}

#[tokio::test]
async fn refresh_builds_success_rates_over_recent_window() {
    let db_path = temp_db_path();
    storage::init_db(&db_path).expect("init_db");

    let now = now_ms();
    for _ in 0..9 {
        insert_log(db_path.clone(), 1, true, now - 60_000).await;
    }
    insert_log(db_path.clone(), 1, false, now - 60_000).await;
    insert_log(db_path.clone(), 2, false, now - 60_000).await;
    // 超出 24 小时窗口的记录不参与统计
    insert_log(db_path.clone(), 1, false, now - 25 * 3600 * 1000).await;

    let cache = Arc::new(ChannelStatsCache::new());
    let aggregator = StatsAggregator::new(db_path.clone(), cache.clone());
    aggregator.run_once().await;

    let c1 = cache.get(1).expect("stats for channel 1");
    assert_eq!(c1.total, 10);
    assert_eq!(c1.success, 9);
    assert_eq!(c1.fail, 1);
    assert!((c1.success_rate - 90.0).abs() < f64::EPSILON);

    let c2 = cache.get(2).expect("stats for channel 2");
    assert_eq!(c2.total, 1);
    assert_eq!(c2.success_rate, 0.0);

    assert!(cache.updated_at_ms() > 0);
    assert!(cache.get(3).is_none());
}

#[tokio::test]
async fn refresh_replaces_previous_snapshot() {
    let db_path = temp_db_path();
    storage::init_db(&db_path).expect("init_db");

    let now = now_ms();
    insert_log(db_path.clone(), 1, true, now - 1000).await;

    let cache = Arc::new(ChannelStatsCache::new());
    let aggregator = StatsAggregator::new(db_path.clone(), cache.clone());
    aggregator.run_once().await;
    assert_eq!(cache.get(1).unwrap().total, 1);

    insert_log(db_path.clone(), 1, true, now - 500).await;
    aggregator.run_once().await;
    assert_eq!(cache.get(1).unwrap().total, 2);

    cache.clear();
    assert!(cache.get(1).is_none());
    assert_eq!(cache.updated_at_ms(), 0);
}

#[tokio::test]
async fn disabled_stats_skip_refresh()  {
    let db_path = temp_db_path();
    storage::init_db(&db_path).expect("init_db");

    storage::update_gateway_settings(
        db_path.clone(),
        storage::GatewaySettingsPatch {
            stats_refresh_interval_minutes: Some(0),
            ..Default::default()
        },
    )
    .await
    .expect("disable stats");

    insert_log(db_path.clone(), 1, true, now_ms() - 1000).await;

    let cache = Arc::new(ChannelStatsCache::new());
    let aggregator = StatsAggregator::new(db_path.clone(), cache.clone());
    aggregator.run_once().await;

    assert!(cache.get(1).is_none());
    assert_eq!(cache.updated_at_ms(), 0);
}
