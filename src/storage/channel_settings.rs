use rusqlite::{Connection, OptionalExtension as _, Row, params};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use super::channel::{CHANNEL_COLUMNS, Channel, ChannelStatus, channel_from_row};
use super::{now_ms, with_conn};

/// 渠道扩展配置（自动启用、RPM 限流），channel_id 唯一。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSettings {
    pub id: i64,
    pub channel_id: i64,
    pub auto_enable: bool,
    pub max_rpm: i64,
    pub created_time: i64,
    pub updated_time: i64,
}

fn settings_from_row(row: &Row<'_>) -> rusqlite::Result<ChannelSettings> {
    Ok(ChannelSettings {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        auto_enable: row.get::<_, i64>(2)? != 0,
        max_rpm: row.get(3)?,
        created_time: row.get(4)?,
        updated_time: row.get(5)?,
    })
}

fn get_settings_row(conn: &Connection, channel_id: i64) -> anyhow::Result<Option<ChannelSettings>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, channel_id, enabled, max_rpm, created_time, updated_time
        FROM channel_auto_enables
        WHERE channel_id = ?1
        "#,
    )?;
    stmt.query_row([channel_id], settings_from_row)
        .optional()
        .map_err(Into::into)
}

fn upsert_settings(
    conn: &Connection,
    channel_id: i64,
    auto_enable: Option<bool>,
    max_rpm: Option<i64>,
    default_auto_enable: bool,
) -> anyhow::Result<()> {
    let ts = now_ms();
    match get_settings_row(conn, channel_id)? {
        Some(existing) => {
            conn.execute(
                r#"
                UPDATE channel_auto_enables
                SET enabled = ?2, max_rpm = ?3, updated_time = ?4
                WHERE channel_id = ?1
                "#,
                params![
                    channel_id,
                    auto_enable.unwrap_or(existing.auto_enable) as i64,
                    max_rpm.unwrap_or(existing.max_rpm).max(0),
                    ts,
                ],
            )?;
        }
        None => {
            conn.execute(
                r#"
                INSERT INTO channel_auto_enables (channel_id, enabled, max_rpm, created_time, updated_time)
                VALUES (?1, ?2, ?3, ?4, ?4)
                "#,
                params![
                    channel_id,
                    auto_enable.unwrap_or(default_auto_enable) as i64,
                    max_rpm.unwrap_or(0).max(0),
                    ts,
                ],
            )?;
        }
    }
    Ok(())
}

pub async fn get_channel_settings(
    db_path: PathBuf,
    channel_id: i64,
) -> anyhow::Result<Option<ChannelSettings>> {
    with_conn(db_path, move |conn| get_settings_row(conn, channel_id)).await
}

pub async fn set_channel_settings(
    db_path: PathBuf,
    channel_id: i64,
    auto_enable: bool,
    max_rpm: i64,
) -> anyhow::Result<()> {
    with_conn(db_path, move |conn| {
        upsert_settings(conn, channel_id, Some(auto_enable), Some(max_rpm), false)
    })
    .await
}

/// 渠道未配置时返回 false。
pub async fn get_channel_auto_enable(db_path: PathBuf, channel_id: i64) -> bool {
    match get_channel_settings(db_path, channel_id).await {
        Ok(Some(s)) => s.auto_enable,
        _ => false,
    }
}

pub async fn set_channel_auto_enable(
    db_path: PathBuf,
    channel_id: i64,
    enabled: bool,
) -> anyhow::Result<()> {
    with_conn(db_path, move |conn| {
        upsert_settings(conn, channel_id, Some(enabled), None, false)
    })
    .await
}

/// 渠道未配置或查询失败时返回 0（不限流）。
pub async fn get_channel_max_rpm(db_path: PathBuf, channel_id: i64) -> i64 {
    match get_channel_settings(db_path, channel_id).await {
        Ok(Some(s)) => s.max_rpm,
        _ => 0,
    }
}

pub async fn set_channel_max_rpm(
    db_path: PathBuf,
    channel_id: i64,
    max_rpm: i64,
) -> anyhow::Result<()> {
    with_conn(db_path, move |conn| {
        // 新建行时默认不开启自动启用
        upsert_settings(conn, channel_id, None, Some(max_rpm), false)
    })
    .await
}

pub async fn delete_channel_settings(db_path: PathBuf, channel_id: i64) -> anyhow::Result<()> {
    with_conn(db_path, move |conn| {
        conn.execute(
            r#"DELETE FROM channel_auto_enables WHERE channel_id = ?1"#,
            params![channel_id],
        )?;
        Ok(())
    })
    .await
}

pub async fn batch_get_channel_auto_enable(
    db_path: PathBuf,
    channel_ids: Vec<i64>,
) -> anyhow::Result<HashMap<i64, bool>> {
    if channel_ids.is_empty() {
        return Ok(HashMap::new());
    }
    with_conn(db_path, move |conn| {
        let mut out = HashMap::new();
        let mut stmt = conn.prepare(
            r#"SELECT enabled FROM channel_auto_enables WHERE channel_id = ?1"#,
        )?;
        for channel_id in channel_ids {
            if let Some(enabled) = stmt
                .query_row([channel_id], |row| row.get::<_, i64>(0))
                .optional()?
            {
                out.insert(channel_id, enabled != 0);
            }
        }
        Ok(out)
    })
    .await
}

pub async fn batch_get_channel_max_rpm(
    db_path: PathBuf,
    channel_ids: Vec<i64>,
) -> anyhow::Result<HashMap<i64, i64>> {
    if channel_ids.is_empty() {
        return Ok(HashMap::new());
    }
    with_conn(db_path, move |conn| {
        let mut out = HashMap::new();
        let mut stmt = conn.prepare(
            r#"SELECT max_rpm FROM channel_auto_enables WHERE channel_id = ?1"#,
        )?;
        for channel_id in channel_ids {
            if let Some(max_rpm) = stmt
                .query_row([channel_id], |row| row.get::<_, i64>(0))
                .optional()?
            {
                out.insert(channel_id, max_rpm);
            }
        }
        Ok(out)
    })
    .await
}

pub async fn get_all_auto_enable_channel_ids(db_path: PathBuf) -> anyhow::Result<Vec<i64>> {
    with_conn(db_path, |conn| {
        let mut stmt = conn.prepare(
            r#"SELECT channel_id FROM channel_auto_enables WHERE enabled = 1 ORDER BY channel_id ASC"#,
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    })
    .await
}

/// 开启了自动启用且当前状态不是启用的渠道。
pub async fn get_auto_enable_channels_to_test(db_path: PathBuf) -> anyhow::Result<Vec<Channel>> {
    with_conn(db_path, |conn| {
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {CHANNEL_COLUMNS}
            FROM channels
            WHERE status != ?1
              AND id IN (SELECT channel_id FROM channel_auto_enables WHERE enabled = 1)
            ORDER BY id ASC
            "#
        ))?;
        let rows = stmt.query_map([ChannelStatus::Enabled.as_i64()], channel_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    })
    .await
}
