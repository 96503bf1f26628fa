//! Pub/sub transport for task progress frames.
//!
//! `publish` returns the broker-reported subscriber count; a task
//! context turns zero subscribers into [`WorkerError::NoSubscribers`]
//! rather than treating it as a transport error.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::WorkerError;

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, WorkerError>;
}

/// Real transport: a Redis `PUBLISH`, whose return value is already the
/// number of clients that received the message.
pub struct RedisBus {
    conn: ConnectionManager,
}

impl RedisBus {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, WorkerError> {
        let mut conn = self.conn.clone();
        let receivers: usize = conn
            .publish(channel, payload)
            .await
            .map_err(|e| WorkerError::Other(e.into()))?;
        Ok(receivers)
    }
}

/// In-process fake used by tests: records every frame published and
/// reports a fixed subscriber count.
#[derive(Default)]
pub struct FakeBus {
    pub subscriber_count: std::sync::atomic::AtomicUsize,
    pub published: tokio::sync::Mutex<Vec<(String, String)>>,
}

impl FakeBus {
    pub fn with_subscribers(count: usize) -> Self {
        Self {
            subscriber_count: std::sync::atomic::AtomicUsize::new(count),
            published: tokio::sync::Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl MessageBus for FakeBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, WorkerError> {
        self.published
            .lock()
            .await
            .push((channel.to_string(), payload.to_string()));
        Ok(self
            .subscriber_count
            .load(std::sync::atomic::Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_bus_records_published_frames() {
        let bus = FakeBus::with_subscribers(1);
        bus.publish("task_status:abc", "{\"hello\":true}").await.unwrap();
        let log = bus.published.lock().await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, "task_status:abc");
    }

    #[tokio::test]
    async fn fake_bus_reports_configured_subscriber_count() {
        let bus = FakeBus::with_subscribers(0);
        let n = bus.publish("task_status:abc", "{}").await.unwrap();
        assert_eq!(n, 0);
    }
}
