//! 日志通道管理
//!
//! 每个运行中的部署一个广播通道，供 SSE 订阅；不持久化

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

use crate::config::env::constants::LOG_CHANNEL_CAPACITY;
use crate::domain::deploy::LogEntry;

/// 日志通道信息
struct LogChannel {
    /// 广播发送者，完成后置空使订阅者收到 Closed
    sender: Option<broadcast::Sender<LogEntry>>,
    /// 创建时间
    created_at: DateTime<Utc>,
    /// 结束时的运行结果
    outcome: Option<bool>,
}

/// 日志中心
pub struct LogHub {
    /// 通道映射 (deployment_id -> LogChannel)
    channels: RwLock<HashMap<String, LogChannel>>,
}

impl LogHub {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// 创建日志通道
    ///
    /// 同一 ID 重新运行时替换旧通道
    pub async fn create(&self, deployment_id: &str) -> broadcast::Sender<LogEntry> {
        let mut channels = self.channels.write().await;

        if let Some(LogChannel {
            sender: Some(sender),
            ..
        }) = channels.get(deployment_id)
        {
            return sender.clone();
        }

        let (sender, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        channels.insert(
            deployment_id.to_string(),
            LogChannel {
                sender: Some(sender.clone()),
                created_at: Utc::now(),
                outcome: None,
            },
        );
        sender
    }

    /// 订阅日志通道，通道不存在或已完成时返回 None
    pub async fn subscribe(&self, deployment_id: &str) -> Option<broadcast::Receiver<LogEntry>> {
        let channels = self.channels.read().await;
        channels
            .get(deployment_id)
            .and_then(|c| c.sender.as_ref())
            .map(|s| s.subscribe())
    }

    /// 标记通道完成
    pub async fn finish(&self, deployment_id: &str, success: bool) {
        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get_mut(deployment_id) {
            channel.sender = None;
            channel.outcome = Some(success);
        }
    }

    /// 运行结果，未完成或不存在时为 None
    pub async fn outcome(&self, deployment_id: &str) -> Option<bool> {
        let channels = self.channels.read().await;
        channels.get(deployment_id).and_then(|c| c.outcome)
    }

    /// 检查通道是否存在
    pub async fn exists(&self, deployment_id: &str) -> bool {
        self.channels.read().await.contains_key(deployment_id)
    }

    /// 清理超过 `max_age_hours` 的已完成通道
    pub async fn cleanup_expired(&self, max_age_hours: i64) {
        let now = Utc::now();
        let mut channels = self.channels.write().await;
        channels.retain(|_, channel| {
            channel.sender.is_some() || (now - channel.created_at).num_hours() < max_age_hours
        });
    }

    /// 活跃通道数量（未完成）
    pub async fn active_count(&self) -> usize {
        let channels = self.channels.read().await;
        channels.values().filter(|c| c.sender.is_some()).count()
    }
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::deploy::LogLevel;

    #[tokio::test]
    async fn test_create_and_subscribe() {
        let hub = LogHub::new();
        let sender = hub.create("d-1").await;
        let mut receiver = hub.subscribe("d-1").await.unwrap();

        let _ = sender.send(LogEntry::new(LogLevel::Info, "Hello", None));
        let entry = receiver.recv().await.unwrap();
        assert_eq!(entry.message, "Hello");
        assert_eq!(hub.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_finish_closes_subscribers() {
        let hub = LogHub::new();
        let sender = hub.create("d-1").await;
        let mut receiver = hub.subscribe("d-1").await.unwrap();

        hub.finish("d-1", true).await;
        drop(sender);

        assert!(matches!(
            receiver.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert!(hub.subscribe("d-1").await.is_none());
        assert_eq!(hub.outcome("d-1").await, Some(true));
        assert_eq!(hub.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_cleanup_expired_keeps_active() {
        let hub = LogHub::new();
        hub.create("running").await;
        hub.create("done").await;
        hub.finish("done", false).await;

        hub.cleanup_expired(0).await;
        assert!(hub.exists("running").await);
        assert!(!hub.exists("done").await);
    }
}
