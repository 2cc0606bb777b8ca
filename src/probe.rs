use futures_util::future::BoxFuture;
use std::time::Duration;

use crate::storage::Channel;

/// 渠道探测能力。探测实现由外层注入，核心只关心成功与否；
/// 耗时由调用方自行计量。
pub trait ChannelTester: Send + Sync {
    fn test<'a>(&'a self, channel: &'a Channel, model: &'a str)
    -> BoxFuture<'a, anyhow::Result<bool>>;
}

/// 根用户通知能力（邮件、webhook 等由外层实现）。
pub trait Notifier: Send + Sync {
    fn notify(&self, kind: &str, subject: &str, content: &str);
}

/// 默认通知实现：只写日志。
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, kind: &str, subject: &str, content: &str) {
        tracing::info!(kind, subject, content, "root user notification");
    }
}

const PROBE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// 默认探测实现：GET {base_url}/v1/models 带 Bearer 认证，
/// 2xx 视为该渠道可用。整体超时由调用方控制。
pub struct HttpChannelTester {
    client: reqwest::Client,
}

impl Default for HttpChannelTester {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpChannelTester {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(PROBE_CONNECT_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl ChannelTester for HttpChannelTester {
    fn test<'a>(
        &'a self,
        channel: &'a Channel,
        model: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<bool>> {
        Box::pin(async move {
            let url = format!("{}/v1/models", channel.base_url.trim_end_matches('/'));

            let mut request = self.client.get(&url);
            if !channel.api_key.is_empty() {
                request = request.header("Authorization", format!("Bearer {}", channel.api_key));
            }

            let response = request.send().await?;
            let ok = response.status().is_success();
            if !ok {
                tracing::debug!(
                    channel_id = channel.id,
                    model,
                    http_status = response.status().as_u16(),
                    "channel probe got non-2xx"
                );
            }
            Ok(ok)
        })
    }
}
