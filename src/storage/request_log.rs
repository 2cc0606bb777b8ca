use rusqlite::params;
use serde::Serialize;
use std::path::PathBuf;

use super::with_conn;

#[derive(Debug, Clone)]
pub struct CreateRequestLog {
    pub channel_id: i64,
    pub model: Option<String>,
    pub success: bool,
    pub latency_ms: i64,
    pub created_at_ms: i64,
}

pub async fn insert_request_log(db_path: PathBuf, input: CreateRequestLog) -> anyhow::Result<()> {
    with_conn(db_path, move |conn| {
        conn.execute(
            r#"
            INSERT INTO request_logs (channel_id, model, success, latency_ms, created_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                input.channel_id,
                input.model,
                input.success as i64,
                input.latency_ms,
                input.created_at_ms,
            ],
        )?;
        Ok(())
    })
    .await
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatsRow {
    pub channel_id: i64,
    pub total: i64,
    pub success: i64,
    pub fail: i64,
}

pub async fn channel_stats_since(
    db_path: PathBuf,
    start_ms: i64,
) -> anyhow::Result<Vec<ChannelStatsRow>> {
    with_conn(db_path, move |conn| {
        let mut stmt = conn.prepare(
            r#"
            SELECT
              channel_id,
              COUNT(*) AS total,
              SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END) AS success,
              SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END) AS fail
            FROM request_logs
            WHERE created_at_ms >= ?1
            GROUP BY channel_id
            "#,
        )?;
        let rows = stmt.query_map(params![start_ms], |row| {
            Ok(ChannelStatsRow {
                channel_id: row.get(0)?,
                total: row.get(1)?,
                success: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                fail: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
            })
        })?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    })
    .await
}
