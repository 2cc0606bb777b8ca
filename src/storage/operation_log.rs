use rusqlite::types::{FromSql, FromSqlError, ValueRef};
use rusqlite::{Row, params};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::watch;

use super::{now_ms, with_conn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationModule {
    Channel,
    Option,
    User,
    Token,
    Model,
}

impl OperationModule {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationModule::Channel => "channel",
            OperationModule::Option => "option",
            OperationModule::User => "user",
            OperationModule::Token => "token",
            OperationModule::Model => "model",
        }
    }
}

impl std::str::FromStr for OperationModule {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "channel" => Ok(OperationModule::Channel),
            "option" => Ok(OperationModule::Option),
            "user" => Ok(OperationModule::User),
            "token" => Ok(OperationModule::Token),
            "model" => Ok(OperationModule::Model),
            other => Err(anyhow::anyhow!("未知操作日志模块：{other}")),
        }
    }
}

impl FromSql for OperationModule {
    fn column_result(value: ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
        let s = value.as_str()?;
        s.parse::<OperationModule>()
            .map_err(|e| FromSqlError::Other(e.into_boxed_dyn_error()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationAction {
    Create,
    Update,
    Delete,
    Enable,
    Disable,
}

impl OperationAction {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationAction::Create => "create",
            OperationAction::Update => "update",
            OperationAction::Delete => "delete",
            OperationAction::Enable => "enable",
            OperationAction::Disable => "disable",
        }
    }
}

impl std::str::FromStr for OperationAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(OperationAction::Create),
            "update" => Ok(OperationAction::Update),
            "delete" => Ok(OperationAction::Delete),
            "enable" => Ok(OperationAction::Enable),
            "disable" => Ok(OperationAction::Disable),
            other => Err(anyhow::anyhow!("未知操作日志动作：{other}")),
        }
    }
}

impl FromSql for OperationAction {
    fn column_result(value: ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
        let s = value.as_str()?;
        s.parse::<OperationAction>()
            .map_err(|e| FromSqlError::Other(e.into_boxed_dyn_error()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationLog {
    pub id: i64,
    pub user_id: i64,
    pub username: String,
    pub module: OperationModule,
    pub action: OperationAction,
    pub target_id: String,
    pub target_name: String,
    pub old_value: String,
    pub new_value: String,
    pub description: String,
    pub ip: String,
    pub created_at: i64,
}

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<OperationLog> {
    Ok(OperationLog {
        id: row.get(0)?,
        user_id: row.get(1)?,
        username: row.get(2)?,
        module: row.get(3)?,
        action: row.get(4)?,
        target_id: row.get(5)?,
        target_name: row.get(6)?,
        old_value: row.get(7)?,
        new_value: row.get(8)?,
        description: row.get(9)?,
        ip: row.get(10)?,
        created_at: row.get(11)?,
    })
}

#[derive(Debug, Clone)]
pub struct NewOperationLog {
    pub user_id: i64,
    pub username: String,
    pub module: OperationModule,
    pub action: OperationAction,
    pub target_id: String,
    pub target_name: String,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    pub description: String,
    pub ip: String,
}

pub async fn record_operation_log(db_path: PathBuf, entry: NewOperationLog) -> anyhow::Result<()> {
    with_conn(db_path, move |conn| {
        let old_value = entry
            .old_value
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_default();
        let new_value = entry
            .new_value
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_default();

        conn.execute(
            r#"
            INSERT INTO operation_logs (user_id, username, module, action, target_id, target_name, old_value, new_value, description, ip, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                entry.user_id,
                entry.username,
                entry.module.as_str(),
                entry.action.as_str(),
                entry.target_id,
                entry.target_name,
                old_value,
                new_value,
                entry.description,
                entry.ip,
                now_ms(),
            ],
        )?;
        Ok(())
    })
    .await
}

#[derive(Debug, Clone, Default)]
pub struct OperationLogQuery {
    pub module: Option<OperationModule>,
    pub action: Option<OperationAction>,
    pub username: Option<String>,
    pub target_id: Option<String>,
    pub keyword: Option<String>,
    pub start_timestamp: Option<i64>,
    pub end_timestamp: Option<i64>,
}

pub async fn list_operation_logs(
    db_path: PathBuf,
    start_idx: i64,
    num: i64,
    query: OperationLogQuery,
) -> anyhow::Result<(Vec<OperationLog>, i64)> {
    with_conn(db_path, move |conn| {
        let mut where_clauses = Vec::<String>::new();
        let mut args = Vec::<Box<dyn rusqlite::ToSql>>::new();

        if let Some(module) = query.module {
            where_clauses.push(format!("module = ?{}", args.len() + 1));
            args.push(Box::new(module.as_str()));
        }
        if let Some(action) = query.action {
            where_clauses.push(format!("action = ?{}", args.len() + 1));
            args.push(Box::new(action.as_str()));
        }
        if let Some(username) = query.username.filter(|v| !v.is_empty()) {
            where_clauses.push(format!("username = ?{}", args.len() + 1));
            args.push(Box::new(username));
        }
        if let Some(target_id) = query.target_id.filter(|v| !v.is_empty()) {
            where_clauses.push(format!("target_id = ?{}", args.len() + 1));
            args.push(Box::new(target_id));
        }
        if let Some(keyword) = query.keyword.filter(|v| !v.is_empty()) {
            let pattern = format!("%{keyword}%");
            let n = args.len() + 1;
            where_clauses.push(format!(
                "(target_name LIKE ?{n} OR description LIKE ?{n} OR old_value LIKE ?{n} OR new_value LIKE ?{n})"
            ));
            args.push(Box::new(pattern));
        }
        if let Some(start) = query.start_timestamp.filter(|v| *v != 0) {
            where_clauses.push(format!("created_at >= ?{}", args.len() + 1));
            args.push(Box::new(start));
        }
        if let Some(end) = query.end_timestamp.filter(|v| *v != 0) {
            where_clauses.push(format!("created_at <= ?{}", args.len() + 1));
            args.push(Box::new(end));
        }

        let where_sql = if where_clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", where_clauses.join(" AND "))
        };

        let params_ref: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM operation_logs {where_sql}"),
            params_ref.as_slice(),
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT id, user_id, username, module, action, target_id, target_name, old_value, new_value, description, ip, created_at
            FROM operation_logs
            {where_sql}
            ORDER BY id DESC
            LIMIT {num} OFFSET {start_idx}
            "#
        ))?;
        let rows = stmt.query_map(params_ref.as_slice(), log_from_row)?;
        let logs = rows.collect::<rusqlite::Result<Vec<_>>>()?;

        Ok((logs, total))
    })
    .await
}

/// 分批删除历史操作日志。`cancel` 置为 true 时提前退出并返回已删除的行数。
pub async fn delete_old_operation_logs(
    db_path: PathBuf,
    target_timestamp: i64,
    batch_limit: i64,
    cancel: watch::Receiver<bool>,
) -> anyhow::Result<i64> {
    let batch_limit = batch_limit.max(1);
    let mut total = 0i64;

    loop {
        if *cancel.borrow() {
            return Ok(total);
        }

        let deleted = with_conn(db_path.clone(), move |conn| {
            let n = conn.execute(
                r#"
                DELETE FROM operation_logs
                WHERE id IN (
                  SELECT id FROM operation_logs WHERE created_at < ?1 LIMIT ?2
                )
                "#,
                params![target_timestamp, batch_limit],
            )?;
            Ok(n as i64)
        })
        .await?;

        total += deleted;
        if deleted < batch_limit {
            break;
        }
    }

    Ok(total)
}
