use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::json;

use crate::probe::{ChannelTester, Notifier};
use crate::storage::{
    self, Channel, ChannelStatus, NewOperationLog, OperationAction, OperationModule,
};

/// 启动后的预热等待，让系统完成初始化
const STARTUP_WARMUP: Duration = Duration::from_secs(30);
/// 功能关闭时的复查间隔
const DISABLED_RECHECK: Duration = Duration::from_secs(60);
/// 同一渠道内相邻模型测试的间隔
const INTER_MODEL_PAUSE: Duration = Duration::from_millis(200);
/// 相邻渠道之间的间隔，避免对共享上游形成请求洪峰
const INTER_CHANNEL_PAUSE: Duration = Duration::from_millis(500);

/// 渠道自动启用探测器：周期性重测「开启了自动启用且当前未启用」的渠道，
/// 成功率达标的重新启用。
pub struct AutoEnableProber {
    db_path: PathBuf,
    tester: Arc<dyn ChannelTester>,
    notifier: Arc<dyn Notifier>,
    running: AtomicBool,
}

impl AutoEnableProber {
    pub fn new(
        db_path: PathBuf,
        tester: Arc<dyn ChannelTester>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            db_path,
            tester,
            notifier,
            running: AtomicBool::new(false),
        }
    }

    /// 探测循环。只应在 master 节点上启动一次。
    pub async fn run_loop(&self) {
        tracing::info!("channel auto enable task started");
        tokio::time::sleep(STARTUP_WARMUP).await;

        loop {
            let settings = match storage::get_gateway_settings(self.db_path.clone()).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(err = %e, "load gateway settings failed");
                    storage::GatewaySettings::default()
                }
            };

            if !settings.auto_enable_enabled {
                tokio::time::sleep(DISABLED_RECHECK).await;
                continue;
            }

            let interval_minutes = settings.auto_enable_interval();
            tracing::info!(
                interval_minutes,
                "channel auto enable task will run this round"
            );

            self.run_once().await;

            tokio::time::sleep(Duration::from_secs(interval_minutes as u64 * 60)).await;
        }
    }

    /// 执行一轮检测。已有一轮在跑时直接丢弃本次触发。
    pub async fn run_once(&self) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::info!("channel auto enable task is already running, skip this round");
            return;
        }

        self.run_pass().await;

        self.running.store(false, Ordering::SeqCst);
    }

    async fn run_pass(&self) {
        tracing::info!("starting channel auto enable check");

        let channels = match storage::get_auto_enable_channels_to_test(self.db_path.clone()).await {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(err = %e, "failed to get auto enable channels");
                return;
            }
        };

        if channels.is_empty() {
            tracing::info!("no channels need auto enable check");
            return;
        }

        tracing::info!(count = channels.len(), "channels need auto enable check");

        let settings = match storage::get_gateway_settings(self.db_path.clone()).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(err = %e, "load gateway settings failed");
                storage::GatewaySettings::default()
            }
        };
        let threshold = settings.auto_enable_threshold();
        let timeout_seconds = settings.auto_enable_timeout();

        for channel in channels {
            let success_rate = self.test_all_models(&channel, timeout_seconds).await;

            tracing::info!(
                channel_id = channel.id,
                channel_name = %channel.name,
                success_rate,
                threshold,
                "channel auto enable test result"
            );

            if success_rate >= threshold as f64 {
                self.enable_channel(&channel).await;
            }

            tokio::time::sleep(INTER_CHANNEL_PAUSE).await;
        }

        tracing::info!("channel auto enable check completed");
    }

    /// 测试渠道的全部模型，返回成功率（0-100）。没有模型的渠道按 0 计。
    async fn test_all_models(&self, channel: &Channel, timeout_seconds: i64) -> f64 {
        let models = channel.model_list();
        if models.is_empty() {
            tracing::info!(
                channel_id = channel.id,
                channel_name = %channel.name,
                "channel has no models to test"
            );
            return 0.0;
        }

        let total = models.len();
        let mut success_count = 0usize;

        for model in &models {
            if self
                .test_single_model(channel, model, timeout_seconds)
                .await
            {
                success_count += 1;
            }
            tokio::time::sleep(INTER_MODEL_PAUSE).await;
        }

        let success_rate = success_count as f64 / total as f64 * 100.0;
        tracing::info!(
            channel_id = channel.id,
            channel_name = %channel.name,
            success = success_count,
            total,
            success_rate,
            "channel test completed"
        );
        success_rate
    }

    /// 带超时的单模型测试。超时与测试内部 panic 都按失败计，不影响后续测试。
    async fn test_single_model(&self, channel: &Channel, model: &str, timeout_seconds: i64) -> bool {
        let tester = self.tester.clone();
        let ch = channel.clone();
        let model_name = model.to_string();

        let handle = tokio::spawn(async move { tester.test(&ch, &model_name).await });

        match tokio::time::timeout(Duration::from_secs(timeout_seconds.max(1) as u64), handle).await
        {
            Err(_) => {
                tracing::info!(
                    channel_id = channel.id,
                    model,
                    timeout_seconds,
                    "channel model test timeout"
                );
                false
            }
            Ok(Err(join_err)) => {
                tracing::error!(
                    channel_id = channel.id,
                    model,
                    err = %join_err,
                    "channel model test panicked"
                );
                false
            }
            Ok(Ok(Err(e))) => {
                tracing::info!(
                    channel_id = channel.id,
                    model,
                    err = %e,
                    "channel model test failed"
                );
                false
            }
            Ok(Ok(Ok(success))) => success,
        }
    }

    /// 启用渠道并记录操作日志、通知 root 用户。
    async fn enable_channel(&self, channel: &Channel) {
        let old_status = channel.status;

        let updated = match storage::update_channel_status(
            self.db_path.clone(),
            channel.id,
            ChannelStatus::Enabled,
        )
        .await
        {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(
                    channel_id = channel.id,
                    channel_name = %channel.name,
                    err = %e,
                    "failed to auto enable channel"
                );
                return;
            }
        };

        if !updated {
            tracing::error!(
                channel_id = channel.id,
                channel_name = %channel.name,
                "failed to auto enable channel"
            );
            return;
        }

        let log = NewOperationLog {
            user_id: 0,
            username: String::new(),
            module: OperationModule::Channel,
            action: OperationAction::Enable,
            target_id: channel.id.to_string(),
            target_name: channel.name.clone(),
            old_value: Some(json!({ "status": old_status })),
            new_value: Some(json!({ "status": ChannelStatus::Enabled })),
            description: "系统自动启用：渠道测试成功率达标".to_string(),
            ip: String::new(),
        };
        if let Err(e) = storage::record_operation_log(self.db_path.clone(), log).await {
            tracing::warn!(channel_id = channel.id, err = %e, "record operation log failed");
        }

        let subject = format!("通道「{}」（#{}）已被自动启用", channel.name, channel.id);
        let content = format!(
            "通道「{}」（#{}）测试成功率达标，已被系统自动启用",
            channel.name, channel.id
        );
        self.notifier
            .notify("channel_auto_enabled", &subject, &content);

        tracing::info!(
            channel_id = channel.id,
            channel_name = %channel.name,
            "channel has been auto enabled"
        );
    }
}
