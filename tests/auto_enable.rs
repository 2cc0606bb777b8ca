use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use relaycore::autoenable::AutoEnableProber;
use relaycore::probe::{ChannelTester, Notifier};
use relaycore::storage::{
    self, Channel, ChannelStatus, CreateChannel, OperationAction, OperationLogQuery,
    OperationModule,
};

fn temp_db_path() -> std::path::PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!("relaycore-test-{}.sqlite", uuid::Uuid::new_v4()));
    p
}

#[derive(Clone, Copy)]
enum Outcome {
    Pass,
    Fail,
    Hang,
}

/// 按 (渠道, 模型) 配置结果的假探测。
struct ScriptedTester {
    outcomes: HashMap<(i64, String), Outcome>,
    calls: Mutex<Vec<(i64, String)>>,
}

impl ChannelTester for ScriptedTester {
    fn test<'a>(
        &'a self,
        channel: &'a Channel,
        model: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<bool>> {
        self.calls
            .lock()
            .unwrap()
            .push((channel.id, model.to_string()));
        let outcome = self
            .outcomes
            .get(&(channel.id, model.to_string()))
            .copied()
            .unwrap_or(Outcome::Fail);
        Box::pin(async move {
            match outcome {
                Outcome::Pass => Ok(true),
                Outcome::Fail => Ok(false),
                Outcome::Hang => {
                    // 故意超过探测超时
                    tokio::time::sleep(Duration::from_secs(600)).await;
                    Ok(true)
                }
            }
        })
    }
}

#[derive(Default)]
struct RecordingNotifier {
    notifications: Mutex<Vec<(String, String, String)>>,
}

impl Notifier for RecordingNotifier {
    fn notify(&self, kind: &str, subject: &str, content: &str) {
        self.notifications.lock().unwrap().push((
            kind.to_string(),
            subject.to_string(),
            content.to_string(),
        ));
    }
}

async fn seed_disabled_channel(db_path: std::path::PathBuf, name: &str, models: &str) -> Channel {
    let channel = storage::create_channel(
        db_path.clone(),
        CreateChannel {
            name: name.to_string(),
            base_url: "http://127.0.0.1:1".to_string(),
            api_key: "k".to_string(),
            group_names: "default".to_string(),
            models: models.to_string(),
            priority: 0,
            weight: 0,
            status: ChannelStatus::AutoDisabled,
        },
    )
    .await
    .expect("create channel");
    storage::set_channel_auto_enable(db_path, channel.id, true)
        .await
        .expect("enable auto enable");
    channel
}

#[tokio::test(start_paused = true)]
async fn channel_above_threshold_is_enabled_with_log_and_notification() {
    let db_path = temp_db_path();
    storage::init_db(&db_path).expect("init_db");

    // [ok, 超时, ok] -> 66.7% ≥ 50%
    let channel = seed_disabled_channel(db_path.clone(), "recovering", "m1,m2,m3").await;
    let tester = Arc::new(ScriptedTester {
        outcomes: HashMap::from([
            ((channel.id, "m1".to_string()), Outcome::Pass),
            ((channel.id, "m2".to_string()), Outcome::Hang),
            ((channel.id, "m3".to_string()), Outcome::Pass),
        ]),
        calls: Mutex::new(Vec::new()),
    });
    let notifier = Arc::new(RecordingNotifier::default());

    let prober = AutoEnableProber::new(db_path.clone(), tester.clone(), notifier.clone());
    prober.run_once().await;

    let channel = storage::get_channel(db_path.clone(), channel.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(channel.status, ChannelStatus::Enabled);

    // 三个模型都测过
    assert_eq!(tester.calls.lock().unwrap().len(), 3);

    // 一条 enable 操作日志，带新旧状态
    let (logs, total) = storage::list_operation_logs(
        db_path.clone(),
        0,
        10,
        OperationLogQuery {
            module: Some(OperationModule::Channel),
            action: Some(OperationAction::Enable),
            ..Default::default()
        },
    )
    .await
    .expect("list logs");
    assert_eq!(total, 1);
    assert!(logs[0].old_value.contains("auto_disabled"));
    assert!(logs[0].new_value.contains("enabled"));
    assert_eq!(logs[0].target_id, channel.id.to_string());

    // root 用户收到一条通知
    let notifications = notifier.notifications.lock().unwrap();
    assert_eq!(notifications.len(), 1);
    assert!(notifications[0].1.contains("已被自动启用"));
}

#[tokio::test(start_paused = true)]
async fn channel_below_threshold_stays_disabled() {
    let db_path = temp_db_path();
    storage::init_db(&db_path).expect("init_db");

    // [ok, fail, fail] -> 33.3% < 50%
    let channel = seed_disabled_channel(db_path.clone(), "flaky", "m1,m2,m3").await;
    let tester = Arc::new(ScriptedTester {
        outcomes: HashMap::from([
            ((channel.id, "m1".to_string()), Outcome::Pass),
            ((channel.id, "m2".to_string()), Outcome::Fail),
            ((channel.id, "m3".to_string()), Outcome::Fail),
        ]),
        calls: Mutex::new(Vec::new()),
    });
    let notifier = Arc::new(RecordingNotifier::default());

    let prober = AutoEnableProber::new(db_path.clone(), tester, notifier.clone());
    prober.run_once().await;

    let channel = storage::get_channel(db_path.clone(), channel.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(channel.status, ChannelStatus::AutoDisabled);
    assert!(notifier.notifications.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn channel_without_models_scores_zero() {
    let db_path = temp_db_path();
    storage::init_db(&db_path).expect("init_db");

    let channel = seed_disabled_channel(db_path.clone(), "empty", "").await;
    let tester = Arc::new(ScriptedTester {
        outcomes: HashMap::new(),
        calls: Mutex::new(Vec::new()),
    });
    let notifier = Arc::new(RecordingNotifier::default());

    let prober = AutoEnableProber::new(db_path.clone(), tester.clone(), notifier);
    prober.run_once().await;

    let channel = storage::get_channel(db_path.clone(), channel.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(channel.status, ChannelStatus::AutoDisabled);
    assert!(tester.calls.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn enabled_channels_are_not_probed() {
    let db_path = temp_db_path();
    storage::init_db(&db_path).expect("init_db");

    // 已启用的渠道即使开了 auto_enable 也不会被测
    let channel = storage::create_channel(
        db_path.clone(),
        CreateChannel {
            name: "healthy".to_string(),
            base_url: "http://127.0.0.1:1".to_string(),
            api_key: "k".to_string(),
            group_names: "default".to_string(),
            models: "m1".to_string(),
            priority: 0,
            weight: 0,
            status: ChannelStatus::Enabled,
        },
    )
    .await
    .expect("create channel");
    storage::set_channel_auto_enable(db_path.clone(), channel.id, true)
        .await
        .expect("set auto enable");

    let tester = Arc::new(ScriptedTester {
        outcomes: HashMap::new(),
        calls: Mutex::new(Vec::new()),
    });
    let notifier = Arc::new(RecordingNotifier::default());

    let prober = AutoEnableProber::new(db_path.clone(), tester.clone(), notifier);
    prober.run_once().await;

    assert!(tester.calls.lock().unwrap().is_empty());
}
