use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::monitor::PriorityMonitor;
use crate::ratelimit::RateLimiter;
use crate::storage;

/// 管理操作统一应答信封。失败用 success=false + message 表达，
/// 不依赖任何传输层语义。
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            message: String::new(),
            data: Some(data),
        }
    }

    pub fn ok_empty() -> Self {
        Self {
            success: true,
            message: String::new(),
            data: None,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelSettingsView {
    pub channel_id: i64,
    pub auto_enable: bool,
    pub max_rpm: i64,
    pub current_rpm: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelAutoEnableView {
    pub channel_id: i64,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelMaxRpmView {
    pub channel_id: i64,
    pub max_rpm: i64,
    pub current_rpm: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResultView {
    pub total: usize,
    pub success: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSettingsEntry {
    pub auto_enable: bool,
    pub max_rpm: i64,
}

async fn channel_exists(db_path: PathBuf, channel_id: i64) -> anyhow::Result<bool> {
    Ok(storage::get_channel(db_path, channel_id).await?.is_some())
}

/// 渠道未配置时返回默认值（auto_enable=false，max_rpm=0）。
pub async fn get_channel_settings(
    db_path: PathBuf,
    limiter: &RateLimiter,
    channel_id: i64,
) -> ApiResponse<ChannelSettingsView> {
    let settings = match storage::get_channel_settings(db_path, channel_id).await {
        Ok(v) => v,
        Err(e) => return ApiResponse::fail(e.to_string()),
    };

    let current_rpm = limiter.current_rpm(channel_id).await;
    let view = match settings {
        Some(s) => ChannelSettingsView {
            channel_id,
            auto_enable: s.auto_enable,
            max_rpm: s.max_rpm,
            current_rpm,
        },
        None => ChannelSettingsView {
            channel_id,
            auto_enable: false,
            max_rpm: 0,
            current_rpm,
        },
    };
    ApiResponse::ok(view)
}

pub async fn set_channel_settings(
    db_path: PathBuf,
    channel_id: i64,
    auto_enable: bool,
    max_rpm: i64,
) -> ApiResponse<()> {
    match channel_exists(db_path.clone(), channel_id).await {
        Ok(true) => {}
        Ok(false) => return ApiResponse::fail("渠道不存在"),
        Err(e) => return ApiResponse::fail(e.to_string()),
    }

    // RPM 限制不能为负数
    let max_rpm = max_rpm.max(0);
    match storage::set_channel_settings(db_path, channel_id, auto_enable, max_rpm).await {
        Ok(()) => ApiResponse::ok_empty(),
        Err(e) => ApiResponse::fail(e.to_string()),
    }
}

pub async fn get_channel_auto_enable(
    db_path: PathBuf,
    channel_id: i64,
) -> ApiResponse<ChannelAutoEnableView> {
    let enabled = storage::get_channel_auto_enable(db_path, channel_id).await;
    ApiResponse::ok(ChannelAutoEnableView {
        channel_id,
        enabled,
    })
}

pub async fn set_channel_auto_enable(
    db_path: PathBuf,
    channel_id: i64,
    enabled: bool,
) -> ApiResponse<()> {
    match channel_exists(db_path.clone(), channel_id).await {
        Ok(true) => {}
        Ok(false) => return ApiResponse::fail("渠道不存在"),
        Err(e) => return ApiResponse::fail(e.to_string()),
    }

    match storage::set_channel_auto_enable(db_path, channel_id, enabled).await {
        Ok(()) => ApiResponse::ok_empty(),
        Err(e) => ApiResponse::fail(e.to_string()),
    }
}

pub async fn batch_get_channel_auto_enable(
    db_path: PathBuf,
    channel_ids: Vec<i64>,
) -> ApiResponse<HashMap<i64, bool>> {
    match storage::batch_get_channel_auto_enable(db_path, channel_ids).await {
        Ok(map) => ApiResponse::ok(map),
        Err(e) => ApiResponse::fail(e.to_string()),
    }
}

pub async fn batch_set_channel_auto_enable(
    db_path: PathBuf,
    channel_ids: Vec<i64>,
    enabled: bool,
) -> ApiResponse<BatchResultView> {
    if channel_ids.is_empty() {
        return ApiResponse::fail("渠道ID列表不能为空");
    }

    let total = channel_ids.len();
    let mut success = 0usize;
    for channel_id in channel_ids {
        if storage::set_channel_auto_enable(db_path.clone(), channel_id, enabled)
            .await
            .is_ok()
        {
            success += 1;
        }
    }

    ApiResponse::ok(BatchResultView { total, success })
}

pub async fn get_channel_max_rpm(
    db_path: PathBuf,
    limiter: &RateLimiter,
    channel_id: i64,
) -> ApiResponse<ChannelMaxRpmView> {
    let max_rpm = storage::get_channel_max_rpm(db_path, channel_id).await;
    let current_rpm = limiter.current_rpm(channel_id).await;
    ApiResponse::ok(ChannelMaxRpmView {
        channel_id,
        max_rpm,
        current_rpm,
    })
}

pub async fn set_channel_max_rpm(
    db_path: PathBuf,
    channel_id: i64,
    max_rpm: i64,
) -> ApiResponse<()> {
    match channel_exists(db_path.clone(), channel_id).await {
        Ok(true) => {}
        Ok(false) => return ApiResponse::fail("渠道不存在"),
        Err(e) => return ApiResponse::fail(e.to_string()),
    }

    let max_rpm = max_rpm.max(0);
    match storage::set_channel_max_rpm(db_path, channel_id, max_rpm).await {
        Ok(()) => ApiResponse::ok_empty(),
        Err(e) => ApiResponse::fail(e.to_string()),
    }
}

pub async fn get_all_auto_enable_channels(db_path: PathBuf) -> ApiResponse<Vec<i64>> {
    match storage::get_all_auto_enable_channel_ids(db_path).await {
        Ok(ids) => ApiResponse::ok(ids),
        Err(e) => ApiResponse::fail(e.to_string()),
    }
}

pub async fn batch_get_channel_settings(
    db_path: PathBuf,
    channel_ids: Vec<i64>,
) -> ApiResponse<HashMap<i64, BatchSettingsEntry>> {
    let auto_enable_map =
        match storage::batch_get_channel_auto_enable(db_path.clone(), channel_ids.clone()).await {
            Ok(v) => v,
            Err(e) => return ApiResponse::fail(e.to_string()),
        };
    let rpm_map = match storage::batch_get_channel_max_rpm(db_path, channel_ids.clone()).await {
        Ok(v) => v,
        Err(e) => return ApiResponse::fail(e.to_string()),
    };

    let mut result = HashMap::with_capacity(channel_ids.len());
    for channel_id in channel_ids {
        result.insert(
            channel_id,
            BatchSettingsEntry {
                auto_enable: auto_enable_map.get(&channel_id).copied().unwrap_or(false),
                max_rpm: rpm_map.get(&channel_id).copied().unwrap_or(0),
            },
        );
    }
    ApiResponse::ok(result)
}

/// 手动触发渠道优先级监控。已有一轮在跑时拒绝，不会叠加执行。
pub fn run_channel_priority_monitor(monitor: &PriorityMonitor) -> ApiResponse<()> {
    if monitor.trigger() {
        ApiResponse {
            success: true,
            message: "渠道优先级监控任务已开始执行".to_string(),
            data: None,
        }
    } else {
        ApiResponse::fail("渠道优先级监控任务正在运行中，请稍后再试")
    }
}
