use anyhow::Context as _;
use rusqlite::Connection;
use std::path::{Path, PathBuf};

mod channel;
mod channel_settings;
mod operation_log;
mod request_log;
mod settings;

pub use channel::{
    Channel, ChannelStatus, CreateChannel, create_channel, get_channel,
    get_random_satisfied_channel, list_channels, list_enabled_channels,
    update_channel_priority_and_weight, update_channel_response_time, update_channel_status,
};
pub use channel_settings::{
    ChannelSettings, batch_get_channel_auto_enable, batch_get_channel_max_rpm,
    delete_channel_settings, get_all_auto_enable_channel_ids, get_auto_enable_channels_to_test,
    get_channel_auto_enable, get_channel_max_rpm, get_channel_settings, set_channel_auto_enable,
    set_channel_max_rpm, set_channel_settings,
};
pub use operation_log::{
    NewOperationLog, OperationAction, OperationLog, OperationLogQuery, OperationModule,
    delete_old_operation_logs, list_operation_logs, record_operation_log,
};
pub use request_log::{
    ChannelStatsRow, CreateRequestLog, channel_stats_since, insert_request_log,
};
pub use settings::{
    GatewaySettings, GatewaySettingsPatch, ResponseTimeTier, get_gateway_settings,
    update_gateway_settings,
};

pub fn init_db(db_path: &Path) -> anyhow::Result<()> {
    let conn = Connection::open(db_path).with_context(|| "打开 SQLite 文件失败")?;

    let migration = include_str!("../../migrations/001_init.sql");
    conn.execute_batch(migration)
        .with_context(|| "执行 migrations/001_init.sql 失败")?;

    ensure_channels_schema(&conn)?;
    ensure_channel_auto_enables_schema(&conn)?;
    ensure_request_logs_schema(&conn)?;
    ensure_operation_logs_schema(&conn)?;
    ensure_channel_rpm_schema(&conn)?;

    Ok(())
}

fn ensure_channels_schema(conn: &Connection) -> anyhow::Result<()> {
    ensure_column(conn, "channels", "weight", "INTEGER NOT NULL DEFAULT 0")?;
    ensure_column(
        conn,
        "channels",
        "response_time_ms",
        "INTEGER NOT NULL DEFAULT 0",
    )?;
    ensure_column(
        conn,
        "channels",
        "test_time_ms",
        "INTEGER NOT NULL DEFAULT 0",
    )?;
    conn.execute(
        r#"CREATE INDEX IF NOT EXISTS idx_channels_status_priority ON channels(status, priority)"#,
        [],
    )?;
    Ok(())
}

fn ensure_channel_auto_enables_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_channel_auto_enables_channel
          ON channel_auto_enables(channel_id)
        "#,
        [],
    )?;
    Ok(())
}

fn ensure_request_logs_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        r#"
        CREATE INDEX IF NOT EXISTS idx_request_logs_channel_ts
          ON request_logs(channel_id, created_at_ms)
        "#,
        [],
    )?;
    Ok(())
}

fn ensure_operation_logs_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        r#"CREATE INDEX IF NOT EXISTS idx_operation_logs_module ON operation_logs(module)"#,
        [],
    )?;
    conn.execute(
        r#"CREATE INDEX IF NOT EXISTS idx_operation_logs_action ON operation_logs(action)"#,
        [],
    )?;
    conn.execute(
        r#"CREATE INDEX IF NOT EXISTS idx_operation_logs_created ON operation_logs(created_at)"#,
        [],
    )?;
    conn.execute(
        r#"
        CREATE INDEX IF NOT EXISTS idx_operation_logs_module_created
          ON operation_logs(module, created_at)
        "#,
        [],
    )?;
    Ok(())
}

fn ensure_channel_rpm_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        r#"
        CREATE INDEX IF NOT EXISTS idx_channel_rpm_channel_ts
          ON channel_rpm(channel_id, at_ms)
        "#,
        [],
    )?;
    Ok(())
}

fn ensure_column(
    conn: &Connection,
    table: &str,
    column: &str,
    column_def: &str,
) -> anyhow::Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(());
        }
    }

    conn.execute(
        &format!("ALTER TABLE {table} ADD COLUMN {column} {column_def}"),
        [],
    )
    .with_context(|| format!("为 {table} 添加字段 {column} 失败"))?;

    Ok(())
}

pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub(crate) async fn with_conn<T, F>(db_path: PathBuf, f: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> anyhow::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let conn = Connection::open(&db_path)
            .with_context(|| format!("打开 SQLite 文件失败：{}", db_path.display()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        f(&conn)
    })
    .await
    .context("等待 sqlite blocking 任务失败")?
}
