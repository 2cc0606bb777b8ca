use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use relaycore::admin;
use relaycore::monitor::PriorityMonitor;
use relaycore::probe::ChannelTester;
use relaycore::storage::{self, Channel, ChannelStatus, CreateChannel};

fn temp_db_path() -> std::path::PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!("relaycore-test-{}.sqlite", uuid::Uuid::new_v4()));
    p
}

async fn seed_channel(
    db_path: std::path::PathBuf,
    name: &str,
    models: &str,
) -> Channel {
    storage::create_channel(
        db_path,
        CreateChannel {
            name: name.to_string(),
            base_url: "http://127.0.0.1:1".to_string(),
            api_key: "k".to_string(),
            group_names: "default".to_string(),
            models: models.to_string(),
            priority: 0,
            weight: 0,
            status: ChannelStatus::Enabled,
        },
    )
    .await
    .expect("create channel")
}

/// 按渠道 id 配置的假探测：睡指定时长后返回成功。
struct LatencyTester {
    latencies: HashMap<i64, u64>,
}

impl ChannelTester for LatencyTester {
    fn test<'a>(
        &'a self,
        channel: &'a Channel,
        _model: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<bool>> {
        let latency = self.latencies.get(&channel.id).copied().unwrap_or(0);
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(latency)).await;
            Ok(true)
        })
    }
}

#[tokio::test(start_paused = true)]
async fn monitor_assigns_priority_and_weight_with_max_merge() {
    let db_path = temp_db_path();
    storage::init_db(&db_path).expect("init_db");

    // m1 分组：c1(8000ms) + c2(800ms)；m2 分组：c1(8000ms) + c3(4000ms)
    let c1 = seed_channel(db_path.clone(), "c1", "m1,m2").await;
    let c2 = seed_channel(db_path.clone(), "c2", "m1").await;
    let c3 = seed_channel(db_path.clone(), "c3", "m2").await;

    let tester = Arc::new(LatencyTester {
        latencies: HashMap::from([(c1.id, 8000), (c2.id, 800), (c3.id, 4000)]),
    });

    let monitor = PriorityMonitor::new(db_path.clone(), tester);
    monitor.run_once().await.expect("run_once");

    let c1 = storage::get_channel(db_path.clone(), c1.id)
        .await
        .unwrap()
        .unwrap();
    let c2 = storage::get_channel(db_path.clone(), c2.id)
        .await
        .unwrap()
        .unwrap();
    let c3 = storage::get_channel(db_path.clone(), c3.id)
        .await
        .unwrap()
        .unwrap();

    // c2 在第 0 层（800ms），c1/c3 在第 1 层
    assert_eq!(c2.priority, 100);
    assert_eq!(c2.weight, 76);
    assert_eq!(c1.priority, 99);
    assert_eq!(c1.weight, 35);
    assert_eq!(c3.priority, 99);
    assert_eq!(c3.weight, 87);

    // 探测耗时落库
    assert_eq!(c1.response_time_ms, 8000);
    assert_eq!(c2.response_time_ms, 800);
}

#[tokio::test(start_paused = true)]
async fn monitor_respects_model_priorities_config() {
    let db_path = temp_db_path();
    storage::init_db(&db_path).expect("init_db");

    storage::update_gateway_settings(
        db_path.clone(),
        storage::GatewaySettingsPatch {
            model_priorities: Some("m1:50".to_string()),
            ..Default::default()
        },
    )
    .await
    .expect("update settings");

    let c1 = seed_channel(db_path.clone(), "c1", "m1").await;
    let c2 = seed_channel(db_path.clone(), "c2", "m1").await;

    let tester = Arc::new(LatencyTester {
        latencies: HashMap::from([(c1.id, 1000), (c2.id, 5000)]),
    });

    let monitor = PriorityMonitor::new(db_path.clone(), tester);
    monitor.run_once().await.expect("run_once");

    let c1 = storage::get_channel(db_path.clone(), c1.id)
        .await
        .unwrap()
        .unwrap();
    let c2 = storage::get_channel(db_path.clone(), c2.id)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(c1.priority, 50);
    assert_eq!(c2.priority, 49);
}

#[tokio::test(start_paused = true)]
async fn timeout_counts_as_failure_and_small_cohort_is_skipped() {
    let db_path = temp_db_path();
    storage::init_db(&db_path).expect("init_db");

    // c1 超时（40s > 默认 30s），分组内只剩 1 个成功结果，整组跳过
    let c1 = seed_channel(db_path.clone(), "c1", "m1").await;
    let c2 = seed_channel(db_path.clone(), "c2", "m1").await;

    let tester = Arc::new(LatencyTester {
        latencies: HashMap::from([(c1.id, 40_000), (c2.id, 500)]),
    });

    let monitor = PriorityMonitor::new(db_path.clone(), tester);
    monitor.run_once().await.expect("run_once");

    let c1 = storage::get_channel(db_path.clone(), c1.id)
        .await
        .unwrap()
        .unwrap();
    let c2 = storage::get_channel(db_path.clone(), c2.id)
        .await
        .unwrap()
        .unwrap();

    // 超时按失败计，耗时不低于超时上限
    assert!(c1.response_time_ms >= 30_000);
    // 没有发生优先级调整
    assert_eq!(c1.priority, 0);
    assert_eq!(c2.priority, 0);
    assert_eq!(c1.weight, 0);
    assert_eq!(c2.weight, 0);
}

#[tokio::test(start_paused = true)]
async fn single_channel_cohorts_are_not_probed() {
    let db_path = temp_db_path();
    storage::init_db(&db_path).expect("init_db");

    let c1 = seed_channel(db_path.clone(), "c1", "m1").await;

    let tester = Arc::new(LatencyTester {
        latencies: HashMap::from([(c1.id, 1000)]),
    });

    let monitor = PriorityMonitor::new(db_path.clone(), tester);
    monitor.run_once().await.expect("run_once");

    let c1 = storage::get_channel(db_path.clone(), c1.id)
        .await
        .unwrap()
        .unwrap();
    // 整组跳过：既不调整优先级，也不更新探测耗时
    assert_eq!(c1.priority, 0);
    assert_eq!(c1.response_time_ms, 0);
}

/// 卡在手动放行信号上的假探测，用来模拟执行中的任务。
struct BlockingTester {
    release: watch::Receiver<bool>,
    started: mpsc::UnboundedSender<i64>,
}

impl ChannelTester for BlockingTester {
    fn test<'a>(
        &'a self,
        channel: &'a Channel,
        _model: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<bool>> {
        let mut release = self.release.clone();
        let _ = self.started.send(channel.id);
        Box::pin(async move {
            let _ = release.wait_for(|v| *v).await;
            Ok(true)
        })
    }
}

#[tokio::test(start_paused = true)]
async fn manual_trigger_is_rejected_while_running() {
    let db_path = temp_db_path();
    storage::init_db(&db_path).expect("init_db");

    seed_channel(db_path.clone(), "c1", "m1").await;
    seed_channel(db_path.clone(), "c2", "m1").await;

    let (release_tx, release_rx) = watch::channel(false);
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let tester = Arc::new(BlockingTester {
        release: release_rx,
        started: started_tx,
    });

    let monitor = Arc::new(PriorityMonitor::new(db_path.clone(), tester));

    let running = {
        let monitor = monitor.clone();
        tokio::spawn(async move { monitor.run_once().await })
    };

    // 等到至少一个探测真正开始
    started_rx.recv().await.expect("probe started");
    assert!(monitor.is_running());

    // 执行中再次触发：拒绝
    let resp = admin::run_channel_priority_monitor(&monitor);
    assert!(!resp.success);
    assert!(resp.message.contains("正在运行"));

    let err = monitor.run_once().await.unwrap_err();
    assert!(err.to_string().contains("正在运行"));

    // 放行后第一轮正常结束
    release_tx.send(true).expect("release probes");
    running.await.expect("join").expect("first run");
    assert!(!monitor.is_running());
}
