use rand::Rng as _;
use rusqlite::types::{FromSql, FromSqlError, ValueRef};
use rusqlite::{OptionalExtension as _, Row, params};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::{now_ms, with_conn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Enabled,
    ManuallyDisabled,
    AutoDisabled,
}

impl ChannelStatus {
    pub fn as_i64(self) -> i64 {
        match self {
            ChannelStatus::Enabled => 1,
            ChannelStatus::ManuallyDisabled => 2,
            ChannelStatus::AutoDisabled => 3,
        }
    }

    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            1 => Some(ChannelStatus::Enabled),
            2 => Some(ChannelStatus::ManuallyDisabled),
            3 => Some(ChannelStatus::AutoDisabled),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelStatus::Enabled => "enabled",
            ChannelStatus::ManuallyDisabled => "manually_disabled",
            ChannelStatus::AutoDisabled => "auto_disabled",
        }
    }
}

impl FromSql for ChannelStatus {
    fn column_result(value: ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
        let v = value.as_i64()?;
        ChannelStatus::from_i64(v).ok_or(FromSqlError::OutOfRange(v))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    /// 逗号分隔的分组列表
    pub group_names: String,
    /// 逗号分隔的模型列表
    pub models: String,
    pub status: ChannelStatus,
    pub priority: i64,
    pub weight: u32,
    pub response_time_ms: i64,
    pub test_time_ms: i64,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl Channel {
    pub fn model_list(&self) -> Vec<String> {
        split_trimmed(&self.models)
    }

    pub fn group_list(&self) -> Vec<String> {
        split_trimmed(&self.group_names)
    }

    pub fn supports_model(&self, model: &str) -> bool {
        self.models.split(',').any(|m| m.trim() == model)
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.group_names.split(',').any(|g| g.trim() == group)
    }
}

fn split_trimmed(v: &str) -> Vec<String> {
    v.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub(super) fn channel_from_row(row: &Row<'_>) -> rusqlite::Result<Channel> {
    Ok(Channel {
        id: row.get(0)?,
        name: row.get(1)?,
        base_url: row.get(2)?,
        api_key: row.get(3)?,
        group_names: row.get(4)?,
        models: row.get(5)?,
        status: row.get(6)?,
        priority: row.get(7)?,
        weight: row.get::<_, i64>(8)?.max(0) as u32,
        response_time_ms: row.get(9)?,
        test_time_ms: row.get(10)?,
        created_at_ms: row.get(11)?,
        updated_at_ms: row.get(12)?,
    })
}

pub(super) const CHANNEL_COLUMNS: &str = "id, name, base_url, api_key, group_names, models, status, priority, weight, response_time_ms, test_time_ms, created_at_ms, updated_at_ms";

#[derive(Debug, Clone, Deserialize)]
pub struct CreateChannel {
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    pub group_names: String,
    pub models: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub weight: u32,
    pub status: ChannelStatus,
}

pub async fn create_channel(db_path: PathBuf, input: CreateChannel) -> anyhow::Result<Channel> {
    with_conn(db_path, move |conn| {
        let ts = now_ms();
        conn.execute(
            r#"
            INSERT INTO channels (name, base_url, api_key, group_names, models, status, priority, weight, response_time_ms, test_time_ms, created_at_ms, updated_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, 0, ?9, ?9)
            "#,
            params![
                input.name,
                input.base_url,
                input.api_key,
                input.group_names,
                input.models,
                input.status.as_i64(),
                input.priority,
                input.weight as i64,
                ts,
            ],
        )?;
        let id = conn.last_insert_rowid();

        Ok(Channel {
            id,
            name: input.name,
            base_url: input.base_url,
            api_key: input.api_key,
            group_names: input.group_names,
            models: input.models,
            status: input.status,
            priority: input.priority,
            weight: input.weight,
            response_time_ms: 0,
            test_time_ms: 0,
            created_at_ms: ts,
            updated_at_ms: ts,
        })
    })
    .await
}

pub async fn list_channels(db_path: PathBuf) -> anyhow::Result<Vec<Channel>> {
    with_conn(db_path, |conn| {
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {CHANNEL_COLUMNS}
            FROM channels
            ORDER BY priority DESC, name ASC
            "#
        ))?;
        let rows = stmt.query_map([], channel_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    })
    .await
}

pub async fn list_enabled_channels(db_path: PathBuf) -> anyhow::Result<Vec<Channel>> {
    with_conn(db_path, |conn| {
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {CHANNEL_COLUMNS}
            FROM channels
            WHERE status = ?1
            ORDER BY priority DESC, name ASC
            "#
        ))?;
        let rows = stmt.query_map([ChannelStatus::Enabled.as_i64()], channel_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    })
    .await
}

pub async fn get_channel(db_path: PathBuf, channel_id: i64) -> anyhow::Result<Option<Channel>> {
    with_conn(db_path, move |conn| {
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {CHANNEL_COLUMNS}
            FROM channels
            WHERE id = ?1
            "#
        ))?;
        stmt.query_row([channel_id], channel_from_row)
            .optional()
            .map_err(Into::into)
    })
    .await
}

/// 更新渠道状态。返回是否真的更新了某一行。
pub async fn update_channel_status(
    db_path: PathBuf,
    channel_id: i64,
    status: ChannelStatus,
) -> anyhow::Result<bool> {
    with_conn(db_path, move |conn| {
        let updated = conn.execute(
            r#"
            UPDATE channels
            SET status = ?2, updated_at_ms = ?3
            WHERE id = ?1 AND status != ?2
            "#,
            params![channel_id, status.as_i64(), now_ms()],
        )?;
        Ok(updated > 0)
    })
    .await
}

pub async fn update_channel_priority_and_weight(
    db_path: PathBuf,
    channel_id: i64,
    priority: i64,
    weight: u32,
) -> anyhow::Result<()> {
    with_conn(db_path, move |conn| {
        let updated = conn.execute(
            r#"
            UPDATE channels
            SET priority = ?2, weight = ?3, updated_at_ms = ?4
            WHERE id = ?1
            "#,
            params![channel_id, priority, weight as i64, now_ms()],
        )?;
        if updated == 0 {
            return Err(anyhow::anyhow!("channel not found: {channel_id}"));
        }
        Ok(())
    })
    .await
}

pub async fn update_channel_response_time(
    db_path: PathBuf,
    channel_id: i64,
    response_time_ms: i64,
) -> anyhow::Result<()> {
    with_conn(db_path, move |conn| {
        let ts = now_ms();
        conn.execute(
            r#"
            UPDATE channels
            SET response_time_ms = ?2, test_time_ms = ?3, updated_at_ms = ?3
            WHERE id = ?1
            "#,
            params![channel_id, response_time_ms, ts],
        )?;
        Ok(())
    })
    .await
}

/// 在指定分组内，为指定模型按优先级档位随机取一个启用的渠道。
///
/// `priority_retry` 表示第几档优先级（0 为最高档）；档位内按权重加权随机，
/// 档位不存在时返回 None。
pub async fn get_random_satisfied_channel(
    db_path: PathBuf,
    group: String,
    model: String,
    priority_retry: i64,
) -> anyhow::Result<Option<Channel>> {
    with_conn(db_path, move |conn| {
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {CHANNEL_COLUMNS}
            FROM channels
            WHERE status = ?1
            ORDER BY priority DESC
            "#
        ))?;
        let rows = stmt.query_map([ChannelStatus::Enabled.as_i64()], channel_from_row)?;
        let candidates: Vec<Channel> = rows
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .filter(|c| c.in_group(&group) && c.supports_model(&model))
            .collect();

        Ok(pick_by_priority_band(candidates, priority_retry))
    })
    .await
}

fn pick_by_priority_band(candidates: Vec<Channel>, priority_retry: i64) -> Option<Channel> {
    if candidates.is_empty() || priority_retry < 0 {
        return None;
    }

    let mut levels: Vec<i64> = candidates.iter().map(|c| c.priority).collect();
    levels.sort_unstable_by(|a, b| b.cmp(a));
    levels.dedup();

    let level = *levels.get(priority_retry as usize)?;
    let band: Vec<Channel> = candidates
        .into_iter()
        .filter(|c| c.priority == level)
        .collect();

    // 权重 0 的渠道按 1 计，保证仍有机会被选中
    let total: u64 = band.iter().map(|c| c.weight.max(1) as u64).sum();
    let mut roll = rand::thread_rng().gen_range(0..total);
    for channel in band {
        let w = channel.weight.max(1) as u64;
        if roll < w {
            return Some(channel);
        }
        roll -= w;
    }
    None
}
