use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::probe::ChannelTester;
use crate::storage::{self, ResponseTimeTier};

/// 功能关闭时的复查间隔
const DISABLED_RECHECK: Duration = Duration::from_secs(60);
/// 未配置模型优先级时的基准值
const DEFAULT_BASE_PRIORITY: i64 = 100;

/// 单次渠道探测结果，只在一轮监控内存活。
#[derive(Debug, Clone)]
pub struct ChannelTestResult {
    pub channel_id: i64,
    pub channel_name: String,
    pub models: Vec<String>,
    pub response_time_ms: i64,
    pub success: bool,
    pub error: Option<String>,
}

/// 解析模型优先级配置，格式：model:priority，一行一个。
/// 不合法的行直接跳过。
pub fn parse_model_priorities(config: &str) -> HashMap<String, i64> {
    let mut result = HashMap::new();
    for line in config.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((model, priority)) = line.split_once(':') else {
            continue;
        };
        let Ok(priority) = priority.trim().parse::<i64>() else {
            continue;
        };
        result.insert(model.trim().to_string(), priority);
    }
    result
}

/// 根据响应时间取所属层级索引；超出全部层级时落在最后一层。
pub fn tier_index(response_time_ms: i64, tiers: &[ResponseTimeTier]) -> usize {
    let response_time_sec = response_time_ms as f64 / 1000.0;
    for (i, tier) in tiers.iter().enumerate() {
        if response_time_sec >= tier.min as f64 && response_time_sec < tier.max as f64 {
            return i;
        }
    }
    tiers.len().saturating_sub(1)
}

/// 层级内按响应时间线性插值出权重：越快权重越大，范围 [10, 100]。
pub fn tier_weight(response_time_ms: i64, min_ms: i64, max_ms: i64) -> u32 {
    if response_time_ms <= min_ms {
        return 100;
    }
    if response_time_ms >= max_ms {
        return 10;
    }
    let time_range = (max_ms - min_ms).max(1);
    let ratio = (max_ms - response_time_ms) as f64 / time_range as f64;
    (10.0 + ratio * 90.0) as u32
}

#[derive(Debug, Clone)]
enum ProbeSlot {
    Pending,
    Done(Option<ChannelTestResult>),
}

/// 渠道优先级监控：按模型分组并行探测启用渠道，按延迟层级重排每个
/// 渠道的优先级与权重。一个渠道出现在多个模型分组里时，最终取各分组
/// 结果的最大值。
#[derive(Clone)]
pub struct PriorityMonitor {
    db_path: PathBuf,
    tester: Arc<dyn ChannelTester>,
    running: Arc<AtomicBool>,
}

impl PriorityMonitor {
    pub fn new(db_path: PathBuf, tester: Arc<dyn ChannelTester>) -> Self {
        Self {
            db_path,
            tester,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 手动触发一轮监控：同步应答、异步执行。已有一轮在跑时返回 false。
    pub fn trigger(&self) -> bool {
        if self.is_running() {
            return false;
        }
        let monitor = self.clone();
        tokio::spawn(async move {
            if let Err(e) = monitor.run_once().await {
                tracing::error!(err = %e, "channel priority monitor failed");
            }
        });
        true
    }

    /// 自动监控循环。只应在 master 节点上启动一次。
    pub async fn run_loop(&self) {
        loop {
            let settings = match storage::get_gateway_settings(self.db_path.clone()).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(err = %e, "load gateway settings failed");
                    storage::GatewaySettings::default()
                }
            };

            if !settings.priority_monitor_enabled {
                tokio::time::sleep(DISABLED_RECHECK).await;
                continue;
            }

            let mut current = settings;
            loop {
                let interval_minutes = current.priority_monitor_interval();
                tokio::time::sleep(Duration::from_secs(interval_minutes as u64 * 60)).await;

                current = match storage::get_gateway_settings(self.db_path.clone()).await {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!(err = %e, "load gateway settings failed");
                        break;
                    }
                };
                if !current.priority_monitor_enabled {
                    break;
                }

                tracing::info!(interval_minutes, "running channel priority monitor");
                if let Err(e) = self.run_once().await {
                    tracing::error!(err = %e, "channel priority monitor failed");
                }
            }
        }
    }

    /// 执行一轮监控，带单飞保护。
    pub async fn run_once(&self) -> anyhow::Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            anyhow::bail!("渠道优先级监控任务正在运行中");
        }

        let settings = storage::get_gateway_settings(self.db_path.clone()).await;
        let result = match settings {
            Ok(settings) => {
                let model_priorities = parse_model_priorities(&settings.model_priorities);
                let tiers = settings.tiers();
                let timeout_seconds = settings.priority_monitor_timeout_seconds;
                self.run_pass(timeout_seconds, model_priorities, tiers).await
            }
            Err(e) => Err(e),
        };

        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn run_pass(
        &self,
        timeout_seconds: i64,
        model_priorities: HashMap<String, i64>,
        tiers: Vec<ResponseTimeTier>,
    ) -> anyhow::Result<()> {
        let run_id = Uuid::new_v4();
        let channels = storage::list_enabled_channels(self.db_path.clone()).await?;

        if channels.is_empty() {
            tracing::info!(%run_id, "no enabled channels to monitor");
            return Ok(());
        }

        tracing::info!(%run_id, count = channels.len(), "channel priority monitor started");

        // 按模型建倒排：模型 -> 渠道 id 列表
        let mut model_channels: HashMap<String, Vec<i64>> = HashMap::new();
        for channel in &channels {
            for model in channel.model_list() {
                model_channels.entry(model).or_default().push(channel.id);
            }
        }

        // 只有一个渠道的模型分组没有比较意义，整组跳过
        let mut channels_to_test: HashSet<i64> = HashSet::new();
        for (model, channel_ids) in &model_channels {
            if channel_ids.len() <= 1 {
                tracing::debug!(%run_id, model = %model, "model cohort too small, skipped");
                continue;
            }
            channels_to_test.extend(channel_ids.iter().copied());
        }

        if channels_to_test.is_empty() {
            tracing::info!(%run_id, "no channels need testing, all model cohorts have one channel");
            return Ok(());
        }

        tracing::info!(
            %run_id,
            cohorts = model_channels.len(),
            probe_set = channels_to_test.len(),
            "model cohorts built"
        );

        // 每个渠道一个完成闩；不在探测集合里的渠道直接预置完成，
        // 避免包含它们的分组空等
        let mut latches: HashMap<i64, watch::Receiver<ProbeSlot>> = HashMap::new();
        let mut senders: HashMap<i64, watch::Sender<ProbeSlot>> = HashMap::new();
        for channel in &channels {
            if channels_to_test.contains(&channel.id) {
                let (tx, rx) = watch::channel(ProbeSlot::Pending);
                latches.insert(channel.id, rx);
                senders.insert(channel.id, tx);
            } else {
                let (_tx, rx) = watch::channel(ProbeSlot::Done(None));
                latches.insert(channel.id, rx);
            }
        }

        // 最终优先级与权重，多个分组取最大值
        let merged: Arc<Mutex<(HashMap<i64, i64>, HashMap<i64, u32>)>> =
            Arc::new(Mutex::new((HashMap::new(), HashMap::new())));

        // 每个模型分组一个收集任务，等齐组内成员后立即归并，
        // 不用等其它分组的慢渠道
        let mut collectors = JoinSet::new();
        for (model, channel_ids) in &model_channels {
            if channel_ids.len() <= 1 {
                continue;
            }

            let model = model.clone();
            let member_latches: Vec<watch::Receiver<ProbeSlot>> = channel_ids
                .iter()
                .filter_map(|id| latches.get(id).cloned())
                .collect();
            let base_priority = model_priorities
                .get(&model)
                .copied()
                .unwrap_or(DEFAULT_BASE_PRIORITY);
            let tiers = tiers.clone();
            let merged = merged.clone();

            collectors.spawn(async move {
                let mut success_results: Vec<ChannelTestResult> = Vec::new();
                for mut rx in member_latches {
                    let slot = match rx
                        .wait_for(|s| matches!(s, ProbeSlot::Done(_)))
                        .await
                    {
                        Ok(slot) => slot.clone(),
                        // 探测任务异常退出，当作没有结果
                        Err(_) => ProbeSlot::Done(None),
                    };
                    if let ProbeSlot::Done(Some(result)) = slot
                        && result.success
                    {
                        success_results.push(result);
                    }
                }

                // 少于两个成功结果没有排序意义
                if success_results.len() < 2 {
                    tracing::debug!(
                        model = %model,
                        success = success_results.len(),
                        "model cohort has too few successful results, skipped"
                    );
                    return;
                }

                reduce_cohort(&model, base_priority, &tiers, success_results, &merged);
            });
        }

        // 发起探测。每个渠道用第一个模型做代表性测试。
        for channel in channels {
            let Some(tx) = senders.remove(&channel.id) else {
                continue;
            };

            let tester = self.tester.clone();
            let db_path = self.db_path.clone();
            tokio::spawn(async move {
                let result = probe_channel(tester, db_path, channel, timeout_seconds).await;
                let _ = tx.send(ProbeSlot::Done(Some(result)));
            });
        }

        // 等全部分组归并完成后一次性落库，减少写放大
        while collectors.join_next().await.is_some() {}

        let (priorities, weights) = {
            let guard = merged.lock().unwrap();
            (guard.0.clone(), guard.1.clone())
        };

        let mut updated = 0usize;
        for (channel_id, priority) in priorities {
            let weight = weights.get(&channel_id).copied().unwrap_or(0);
            match storage::update_channel_priority_and_weight(
                self.db_path.clone(),
                channel_id,
                priority,
                weight,
            )
            .await
            {
                Ok(()) => updated += 1,
                Err(e) => {
                    tracing::error!(
                        %run_id,
                        channel_id,
                        err = %e,
                        "update channel priority and weight failed"
                    );
                }
            }
        }

        tracing::info!(%run_id, updated, "channel priority monitor completed");
        Ok(())
    }
}

async fn probe_channel(
    tester: Arc<dyn ChannelTester>,
    db_path: PathBuf,
    channel: storage::Channel,
    timeout_seconds: i64,
) -> ChannelTestResult {
    let models = channel.model_list();
    let test_model = models.first().cloned().unwrap_or_default();

    let started = tokio::time::Instant::now();
    let outcome = if timeout_seconds > 0 {
        tokio::time::timeout(
            Duration::from_secs(timeout_seconds as u64),
            tester.test(&channel, &test_model),
        )
        .await
    } else {
        Ok(tester.test(&channel, &test_model).await)
    };
    let response_time_ms = started.elapsed().as_millis() as i64;

    let (success, error) = match outcome {
        Err(_) => (
            false,
            Some(format!(
                "响应超时: {response_time_ms}ms > {timeout_seconds}s"
            )),
        ),
        Ok(Err(e)) => (false, Some(e.to_string())),
        Ok(Ok(success)) => (success, None),
    };

    if let Err(e) =
        storage::update_channel_response_time(db_path, channel.id, response_time_ms).await
    {
        tracing::warn!(
            channel_id = channel.id,
            err = %e,
            "update channel response time failed"
        );
    }

    ChannelTestResult {
        channel_id: channel.id,
        channel_name: channel.name,
        models,
        response_time_ms,
        success,
        error,
    }
}

/// 对一个模型分组做层级归并：按响应时间分层，层内按时间排序算权重，
/// 层间优先级递减，结果与全局映射按最大值合并。
fn reduce_cohort(
    model: &str,
    base_priority: i64,
    tiers: &[ResponseTimeTier],
    success_results: Vec<ChannelTestResult>,
    merged: &Mutex<(HashMap<i64, i64>, HashMap<i64, u32>)>,
) {
    let mut tier_groups: HashMap<usize, Vec<ChannelTestResult>> = HashMap::new();
    for result in success_results {
        let idx = tier_index(result.response_time_ms, tiers);
        tier_groups.entry(idx).or_default().push(result);
    }

    let mut tier_indices: Vec<usize> = tier_groups.keys().copied().collect();
    tier_indices.sort_unstable();

    for idx in tier_indices {
        let mut group = tier_groups.remove(&idx).unwrap_or_default();
        group.sort_by_key(|r| r.response_time_ms);

        let tier = tiers[idx];
        let tier_priority = base_priority - idx as i64;
        let min_ms = tier.min * 1000;
        let max_ms = tier.max * 1000;

        for result in group {
            let new_weight = tier_weight(result.response_time_ms, min_ms, max_ms);

            {
                let mut guard = merged.lock().unwrap();
                let (priorities, weights) = &mut *guard;
                priorities
                    .entry(result.channel_id)
                    .and_modify(|p| *p = (*p).max(tier_priority))
                    .or_insert(tier_priority);
                weights
                    .entry(result.channel_id)
                    .and_modify(|w| *w = (*w).max(new_weight))
                    .or_insert(new_weight);
            }

            tracing::info!(
                model = %model,
                channel_id = result.channel_id,
                channel_name = %result.channel_name,
                response_time_ms = result.response_time_ms,
                tier = idx + 1,
                priority = tier_priority,
                weight = new_weight,
                "cohort result"
            );
        }
    }
}
