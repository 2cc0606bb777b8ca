use rusqlite::{Connection, OptionalExtension as _, params};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::logging::LogLevel;

use super::{now_ms, with_conn};

const KEY_AUTO_ENABLE_ENABLED: &str = "auto_enable_enabled";
const KEY_AUTO_ENABLE_INTERVAL_MINUTES: &str = "auto_enable_interval_minutes";
const KEY_AUTO_ENABLE_TIMEOUT_SECONDS: &str = "auto_enable_timeout_seconds";
const KEY_AUTO_ENABLE_SUCCESS_RATE_THRESHOLD: &str = "auto_enable_success_rate_threshold";
const KEY_AUTO_ENABLE_TEST_COUNT: &str = "auto_enable_test_count";
const KEY_PRIORITY_MONITOR_ENABLED: &str = "priority_monitor_enabled";
const KEY_PRIORITY_MONITOR_INTERVAL_MINUTES: &str = "priority_monitor_interval_minutes";
const KEY_PRIORITY_MONITOR_TIMEOUT_SECONDS: &str = "priority_monitor_timeout_seconds";
const KEY_MODEL_PRIORITIES: &str = "model_priorities";
const KEY_RESPONSE_TIME_TIERS: &str = "response_time_tiers";
const KEY_STATS_REFRESH_INTERVAL_MINUTES: &str = "stats_refresh_interval_minutes";
const KEY_STREAM_TIMEOUT_SECONDS: &str = "stream_timeout_seconds";
const KEY_NON_STREAM_TIMEOUT_SECONDS: &str = "non_stream_timeout_seconds";
const KEY_MAX_RETRY_PER_GROUP: &str = "max_retry_per_group";
const KEY_LOG_LEVEL: &str = "log_level";

/// 响应时间分层，半开区间 [min, max)，单位秒。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseTimeTier {
    pub min: i64,
    pub max: i64,
}

pub fn default_response_time_tiers() -> Vec<ResponseTimeTier> {
    vec![
        ResponseTimeTier { min: 0, max: 3 },
        ResponseTimeTier { min: 3, max: 10 },
        ResponseTimeTier { min: 10, max: 30 },
        ResponseTimeTier { min: 30, max: 9999 },
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    pub auto_enable_enabled: bool,
    pub auto_enable_interval_minutes: i64,
    pub auto_enable_timeout_seconds: i64,
    pub auto_enable_success_rate_threshold: i64,
    pub auto_enable_test_count: i64,
    pub priority_monitor_enabled: bool,
    pub priority_monitor_interval_minutes: i64,
    pub priority_monitor_timeout_seconds: i64,
    /// 模型优先级配置，格式 model:priority，一行一个
    pub model_priorities: String,
    pub response_time_tiers: Vec<ResponseTimeTier>,
    pub stats_refresh_interval_minutes: i64,
    pub stream_timeout_seconds: i64,
    pub non_stream_timeout_seconds: i64,
    pub max_retry_per_group: i64,
    pub log_level: LogLevel,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            auto_enable_enabled: false,
            auto_enable_interval_minutes: 30,
            auto_enable_timeout_seconds: 30,
            auto_enable_success_rate_threshold: 50,
            auto_enable_test_count: 2,
            priority_monitor_enabled: false,
            priority_monitor_interval_minutes: 30,
            priority_monitor_timeout_seconds: 30,
            model_priorities: String::new(),
            response_time_tiers: default_response_time_tiers(),
            stats_refresh_interval_minutes: 5,
            stream_timeout_seconds: 10,
            non_stream_timeout_seconds: 30,
            max_retry_per_group: 2,
            log_level: LogLevel::Info,
        }
    }
}

impl GatewaySettings {
    pub fn auto_enable_interval(&self) -> i64 {
        if self.auto_enable_interval_minutes <= 0 {
            30
        } else {
            self.auto_enable_interval_minutes
        }
    }

    pub fn auto_enable_timeout(&self) -> i64 {
        if self.auto_enable_timeout_seconds <= 0 {
            30
        } else {
            self.auto_enable_timeout_seconds
        }
    }

    pub fn auto_enable_threshold(&self) -> i64 {
        if self.auto_enable_success_rate_threshold <= 0 {
            50
        } else {
            self.auto_enable_success_rate_threshold.min(100)
        }
    }

    pub fn auto_enable_tests(&self) -> i64 {
        if self.auto_enable_test_count <= 0 {
            2
        } else {
            self.auto_enable_test_count
        }
    }

    pub fn priority_monitor_interval(&self) -> i64 {
        if self.priority_monitor_interval_minutes <= 0 {
            30
        } else {
            self.priority_monitor_interval_minutes
        }
    }

    pub fn stats_refresh_interval(&self) -> i64 {
        self.stats_refresh_interval_minutes.max(0)
    }

    pub fn stats_enabled(&self) -> bool {
        self.stats_refresh_interval_minutes > 0
    }

    pub fn stream_timeout(&self) -> i64 {
        if self.stream_timeout_seconds <= 0 {
            10
        } else {
            self.stream_timeout_seconds
        }
    }

    pub fn non_stream_timeout(&self) -> i64 {
        if self.non_stream_timeout_seconds <= 0 {
            30
        } else {
            self.non_stream_timeout_seconds
        }
    }

    pub fn max_retry(&self) -> i64 {
        if self.max_retry_per_group <= 0 {
            2
        } else {
            self.max_retry_per_group
        }
    }

    pub fn tiers(&self) -> Vec<ResponseTimeTier> {
        if self.response_time_tiers.is_empty() {
            default_response_time_tiers()
        } else {
            self.response_time_tiers.clone()
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewaySettingsPatch {
    pub auto_enable_enabled: Option<bool>,
    pub auto_enable_interval_minutes: Option<i64>,
    pub auto_enable_timeout_seconds: Option<i64>,
    pub auto_enable_success_rate_threshold: Option<i64>,
    pub auto_enable_test_count: Option<i64>,
    pub priority_monitor_enabled: Option<bool>,
    pub priority_monitor_interval_minutes: Option<i64>,
    pub priority_monitor_timeout_seconds: Option<i64>,
    pub model_priorities: Option<String>,
    pub response_time_tiers: Option<Vec<ResponseTimeTier>>,
    pub stats_refresh_interval_minutes: Option<i64>,
    pub stream_timeout_seconds: Option<i64>,
    pub non_stream_timeout_seconds: Option<i64>,
    pub max_retry_per_group: Option<i64>,
    pub log_level: Option<LogLevel>,
}

fn get_setting(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM app_settings WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

fn set_setting(
    conn: &Connection,
    key: &str,
    value: &str,
    updated_at_ms: i64,
) -> rusqlite::Result<()> {
    conn.execute(
        r#"
        INSERT INTO app_settings (key, value, updated_at_ms)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(key) DO UPDATE SET
          value = excluded.value,
          updated_at_ms = excluded.updated_at_ms
        "#,
        params![key, value, updated_at_ms],
    )?;
    Ok(())
}

fn parse_bool(v: &str) -> bool {
    let v = v.trim();
    v == "1" || v.eq_ignore_ascii_case("true")
}

pub async fn get_gateway_settings(db_path: PathBuf) -> anyhow::Result<GatewaySettings> {
    with_conn(db_path, move |conn| {
        let mut out = GatewaySettings::default();

        if let Some(v) = get_setting(conn, KEY_AUTO_ENABLE_ENABLED)? {
            out.auto_enable_enabled = parse_bool(&v);
        }
        if let Some(v) = get_setting(conn, KEY_AUTO_ENABLE_INTERVAL_MINUTES)?
            && let Ok(n) = v.trim().parse::<i64>()
        {
            out.auto_enable_interval_minutes = n;
        }
        if let Some(v) = get_setting(conn, KEY_AUTO_ENABLE_TIMEOUT_SECONDS)?
            && let Ok(n) = v.trim().parse::<i64>()
        {
            out.auto_enable_timeout_seconds = n;
        }
        if let Some(v) = get_setting(conn, KEY_AUTO_ENABLE_SUCCESS_RATE_THRESHOLD)?
            && let Ok(n) = v.trim().parse::<i64>()
        {
            out.auto_enable_success_rate_threshold = n;
        }
        if let Some(v) = get_setting(conn, KEY_AUTO_ENABLE_TEST_COUNT)?
            && let Ok(n) = v.trim().parse::<i64>()
        {
            out.auto_enable_test_count = n;
        }
        if let Some(v) = get_setting(conn, KEY_PRIORITY_MONITOR_ENABLED)? {
            out.priority_monitor_enabled = parse_bool(&v);
        }
        if let Some(v) = get_setting(conn, KEY_PRIORITY_MONITOR_INTERVAL_MINUTES)?
            && let Ok(n) = v.trim().parse::<i64>()
        {
            out.priority_monitor_interval_minutes = n;
        }
        if let Some(v) = get_setting(conn, KEY_PRIORITY_MONITOR_TIMEOUT_SECONDS)?
            && let Ok(n) = v.trim().parse::<i64>()
        {
            out.priority_monitor_timeout_seconds = n;
        }
        if let Some(v) = get_setting(conn, KEY_MODEL_PRIORITIES)? {
            out.model_priorities = v;
        }
        if let Some(v) = get_setting(conn, KEY_RESPONSE_TIME_TIERS)?
            && let Ok(tiers) = serde_json::from_str::<Vec<ResponseTimeTier>>(&v)
        {
            out.response_time_tiers = tiers;
        }
        if let Some(v) = get_setting(conn, KEY_STATS_REFRESH_INTERVAL_MINUTES)?
            && let Ok(n) = v.trim().parse::<i64>()
        {
            out.stats_refresh_interval_minutes = n;
        }
        if let Some(v) = get_setting(conn, KEY_STREAM_TIMEOUT_SECONDS)?
            && let Ok(n) = v.trim().parse::<i64>()
        {
            out.stream_timeout_seconds = n;
        }
        if let Some(v) = get_setting(conn, KEY_NON_STREAM_TIMEOUT_SECONDS)?
            && let Ok(n) = v.trim().parse::<i64>()
        {
            out.non_stream_timeout_seconds = n;
        }
        if let Some(v) = get_setting(conn, KEY_MAX_RETRY_PER_GROUP)?
            && let Ok(n) = v.trim().parse::<i64>()
        {
            out.max_retry_per_group = n;
        }
        if let Some(v) = get_setting(conn, KEY_LOG_LEVEL)? {
            match v.trim() {
                "none" | "off" => out.log_level = LogLevel::None,
                "debug" => out.log_level = LogLevel::Debug,
                "info" => out.log_level = LogLevel::Info,
                "warn" | "warning" => out.log_level = LogLevel::Warning,
                "error" => out.log_level = LogLevel::Error,
                _ => {}
            }
        }

        Ok(out)
    })
    .await
}

pub async fn update_gateway_settings(
    db_path: PathBuf,
    patch: GatewaySettingsPatch,
) -> anyhow::Result<GatewaySettings> {
    let db_path2 = db_path.clone();
    with_conn(db_path2, move |conn| {
        let updated_at_ms = now_ms();
        if let Some(v) = patch.auto_enable_enabled {
            set_setting(
                conn,
                KEY_AUTO_ENABLE_ENABLED,
                if v { "true" } else { "false" },
                updated_at_ms,
            )?;
        }
        if let Some(v) = patch.auto_enable_interval_minutes {
            set_setting(
                conn,
                KEY_AUTO_ENABLE_INTERVAL_MINUTES,
                &v.to_string(),
                updated_at_ms,
            )?;
        }
        if let Some(v) = patch.auto_enable_timeout_seconds {
            set_setting(
                conn,
                KEY_AUTO_ENABLE_TIMEOUT_SECONDS,
                &v.to_string(),
                updated_at_ms,
            )?;
        }
        if let Some(v) = patch.auto_enable_success_rate_threshold {
            set_setting(
                conn,
                KEY_AUTO_ENABLE_SUCCESS_RATE_THRESHOLD,
                &v.to_string(),
                updated_at_ms,
            )?;
        }
        if let Some(v) = patch.auto_enable_test_count {
            set_setting(
                conn,
                KEY_AUTO_ENABLE_TEST_COUNT,
                &v.to_string(),
                updated_at_ms,
            )?;
        }
        if let Some(v) = patch.priority_monitor_enabled {
            set_setting(
                conn,
                KEY_PRIORITY_MONITOR_ENABLED,
                if v { "true" } else { "false" },
                updated_at_ms,
            )?;
        }
        if let Some(v) = patch.priority_monitor_interval_minutes {
            set_setting(
                conn,
                KEY_PRIORITY_MONITOR_INTERVAL_MINUTES,
                &v.to_string(),
                updated_at_ms,
            )?;
        }
        if let Some(v) = patch.priority_monitor_timeout_seconds {
            set_setting(
                conn,
                KEY_PRIORITY_MONITOR_TIMEOUT_SECONDS,
                &v.to_string(),
                updated_at_ms,
            )?;
        }
        if let Some(v) = patch.model_priorities {
            set_setting(conn, KEY_MODEL_PRIORITIES, &v, updated_at_ms)?;
        }
        if let Some(v) = patch.response_time_tiers {
            let json = serde_json::to_string(&v)?;
            set_setting(conn, KEY_RESPONSE_TIME_TIERS, &json, updated_at_ms)?;
        }
        if let Some(v) = patch.stats_refresh_interval_minutes {
            set_setting(
                conn,
                KEY_STATS_REFRESH_INTERVAL_MINUTES,
                &v.to_string(),
                updated_at_ms,
            )?;
        }
        if let Some(v) = patch.stream_timeout_seconds {
            set_setting(
                conn,
                KEY_STREAM_TIMEOUT_SECONDS,
                &v.to_string(),
                updated_at_ms,
            )?;
        }
        if let Some(v) = patch.non_stream_timeout_seconds {
            set_setting(
                conn,
                KEY_NON_STREAM_TIMEOUT_SECONDS,
                &v.to_string(),
                updated_at_ms,
            )?;
        }
        if let Some(v) = patch.max_retry_per_group {
            set_setting(conn, KEY_MAX_RETRY_PER_GROUP, &v.to_string(), updated_at_ms)?;
        }
        if let Some(v) = patch.log_level {
            set_setting(conn, KEY_LOG_LEVEL, v.as_str(), updated_at_ms)?;
        }
        Ok(())
    })
    .await?;

    get_gateway_settings(db_path).await
}
