use futures_util::future::BoxFuture;
use std::path::PathBuf;

use crate::groups::GroupRatioRegistry;
use crate::storage::{self, Channel};

/// 渠道池：按 (分组, 模型, 优先级档位) 随机取一个可用渠道。
///
/// `priority_retry` 为 0 表示最高优先级档位；该档位没有渠道时返回 None。
pub trait ChannelPool: Send + Sync {
    fn get_random_satisfied_channel<'a>(
        &'a self,
        group: &'a str,
        model: &'a str,
        priority_retry: i64,
    ) -> BoxFuture<'a, anyhow::Result<Option<Channel>>>;
}

/// 直接查 channels 表的池实现。
pub struct SqliteChannelPool {
    db_path: PathBuf,
}

impl SqliteChannelPool {
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }
}

impl ChannelPool for SqliteChannelPool {
    fn get_random_satisfied_channel<'a>(
        &'a self,
        group: &'a str,
        model: &'a str,
        priority_retry: i64,
    ) -> BoxFuture<'a, anyhow::Result<Option<Channel>>> {
        Box::pin(storage::get_random_satisfied_channel(
            self.db_path.clone(),
            group.to_string(),
            model.to_string(),
            priority_retry,
        ))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SelectError {
    #[error("no valid groups found")]
    NoValidGroups,
    #[error("auto groups is not enabled")]
    AutoGroupsDisabled,
    #[error(transparent)]
    Pool(#[from] anyhow::Error),
}

/// 一次请求在重试过程中携带的选路状态。
#[derive(Debug, Clone, Default)]
pub struct SelectContext {
    pub user_group: String,
    /// 令牌是否允许 auto 分组跨分组重试
    pub cross_group_retry: bool,
    retry: i64,
    reset_next_try: bool,
    multi_group_index: usize,
    auto_group_index: usize,
    /// 多分组模式下最终选中的分组
    pub multi_group: Option<String>,
    /// auto 模式下最终选中的分组
    pub auto_group: Option<String>,
}

impl SelectContext {
    pub fn retry(&self) -> i64 {
        self.retry
    }

    pub fn set_retry(&mut self, retry: i64) {
        self.retry = retry;
    }

    /// 叠加一次重试。上一次选择预置了跨分组切换时，本次叠加被吸收，
    /// 使下一个分组从优先级档位 0 开始。
    pub fn increase_retry(&mut self) {
        if self.reset_next_try {
            self.reset_next_try = false;
            return;
        }
        self.retry += 1;
    }

    pub fn reset_retry_next_try(&mut self) {
        self.reset_next_try = true;
    }
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub channel: Option<Channel>,
    pub group: String,
}

/// 为 `(token_group, model)` 选一个渠道。
///
/// `token_group` 支持三种形式：单个分组名；逗号分隔的多个分组（按顺序
/// fall-through，每个分组用完 `max_retry_per_group` 个优先级档位后切到
/// 下一个分组）；字面量 `auto`（使用用户配置的 auto 分组链，链为空时报
/// `AutoGroupsDisabled`）。多分组与 auto 的游标都记录在 `ctx` 里，因此
/// 相同的上下文状态下两次调用的行为一致。
pub async fn select_channel(
    pool: &dyn ChannelPool,
    registry: &GroupRatioRegistry,
    max_retry_per_group: i64,
    ctx: &mut SelectContext,
    token_group: &str,
    model: &str,
) -> Result<Selection, SelectError> {
    let mut select_group = token_group.to_string();

    if token_group.contains(',') && token_group != "auto" {
        let valid_groups: Vec<String> = token_group
            .split(',')
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(str::to_string)
            .collect();

        if valid_groups.is_empty() {
            return Err(SelectError::NoValidGroups);
        }

        // 多分组模式默认跨分组重试，cross_group_retry 只约束 auto 分组
        let start_group_index = ctx.multi_group_index;
        let mut channel = None;

        for i in start_group_index..valid_groups.len() {
            let current_group = &valid_groups[i];
            let priority_retry = if i > start_group_index { 0 } else { ctx.retry() };
            tracing::debug!(
                group = %current_group,
                priority_retry,
                "multi-group selecting group"
            );

            let found = pool
                .get_random_satisfied_channel(current_group, model, priority_retry)
                .await
                .unwrap_or(None);
            let Some(found) = found else {
                tracing::debug!(
                    group = %current_group,
                    model,
                    priority_retry,
                    "no available channel in group, trying next group"
                );
                ctx.multi_group_index = i + 1;
                ctx.set_retry(0);
                continue;
            };

            select_group = current_group.clone();
            ctx.multi_group = Some(current_group.clone());
            channel = Some(found);

            if priority_retry >= max_retry_per_group - 1 {
                // 本分组的档位已用完：本次仍用当前分组，下次重试切到下一个分组
                tracing::debug!(
                    group = %current_group,
                    priority_retry,
                    max_retry_per_group,
                    "group retries exhausted, preparing switch to next group"
                );
                ctx.multi_group_index = i + 1;
                ctx.set_retry(0);
                ctx.reset_retry_next_try();
            } else {
                ctx.multi_group_index = i;
            }
            break;
        }

        return Ok(Selection {
            channel,
            group: select_group,
        });
    }

    if token_group == "auto" {
        if registry.auto_groups().is_empty() {
            return Err(SelectError::AutoGroupsDisabled);
        }
        let auto_groups = registry.user_auto_groups(&ctx.user_group);

        let cross_group_retry = ctx.cross_group_retry;
        let start_group_index = ctx.auto_group_index;
        let mut channel = None;

        for i in start_group_index..auto_groups.len() {
            let auto_group = &auto_groups[i];
            let priority_retry = if i > start_group_index { 0 } else { ctx.retry() };
            tracing::debug!(group = %auto_group, priority_retry, "auto selecting group");

            let found = pool
                .get_random_satisfied_channel(auto_group, model, priority_retry)
                .await
                .unwrap_or(None);
            let Some(found) = found else {
                tracing::debug!(
                    group = %auto_group,
                    model,
                    priority_retry,
                    "no available channel in group, trying next group"
                );
                ctx.auto_group_index = i + 1;
                ctx.set_retry(0);
                continue;
            };

            select_group = auto_group.clone();
            ctx.auto_group = Some(auto_group.clone());
            channel = Some(found);

            if cross_group_retry && priority_retry >= max_retry_per_group - 1 {
                tracing::debug!(
                    group = %auto_group,
                    priority_retry,
                    max_retry_per_group,
                    "group retries exhausted, preparing switch to next group"
                );
                ctx.auto_group_index = i + 1;
                ctx.set_retry(0);
                ctx.reset_retry_next_try();
            } else {
                ctx.auto_group_index = i;
            }
            break;
        }

        return Ok(Selection {
            channel,
            group: select_group,
        });
    }

    // 单分组：直接透传 retry 作为优先级档位，池错误原样上抛
    let channel = pool
        .get_random_satisfied_channel(token_group, model, ctx.retry())
        .await?;
    Ok(Selection {
        channel,
        group: select_group,
    })
}
