//! Per-task lifetime object: heartbeat loop, progress/result
//! publication, cooperative cancellation via subscriber-count watch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::WorkerError;
use crate::task::bus::MessageBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Progress,
    Heartbeat,
    Result,
}

#[derive(Debug, Serialize)]
pub struct Frame {
    pub task_id: String,
    pub message_type: MessageType,
    pub status: String,
    pub data: Value,
    pub elapsed_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct TaskContext {
    pub task_id: String,
    pub status_id: String,
    pub worker_id: String,
    start_time: Instant,
    heartbeat_interval: Duration,
    /// Set when the heartbeat loop observes zero subscribers; user code
    /// polls `check_for_cancellation` between checkpoints.
    cancelled: CancellationToken,
    /// Cancelled by `destroy()` to stop the heartbeat loop on normal
    /// task completion, independent of `cancelled`.
    shutdown: CancellationToken,
    bus: Arc<dyn MessageBus>,
}

impl TaskContext {
    pub fn new(bus: Arc<dyn MessageBus>, worker_id: String, heartbeat_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            task_id: Uuid::new_v4().to_string(),
            status_id: Uuid::new_v4().to_string(),
            worker_id,
            start_time: Instant::now(),
            heartbeat_interval,
            cancelled: CancellationToken::new(),
            shutdown: CancellationToken::new(),
            bus,
        })
    }

    fn channel(&self) -> String {
        format!("task_status:{}", self.status_id)
    }

    fn elapsed(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    /// Publish one frame. Zero subscribers is surfaced as
    /// [`WorkerError::NoSubscribers`], not swallowed — callers (the
    /// heartbeat loop, or the final result publish) decide how to react.
    pub async fn publish(
        &self,
        message_type: MessageType,
        status: &str,
        data: Value,
        error: Option<String>,
    ) -> Result<(), WorkerError> {
        let frame = Frame {
            task_id: self.task_id.clone(),
            message_type,
            status: status.to_string(),
            data,
            elapsed_time: self.elapsed(),
            error,
        };
        let payload = serde_json::to_string(&frame).map_err(|e| WorkerError::Other(e.into()))?;
        let subscribers = self.bus.publish(&self.channel(), &payload).await?;
        if subscribers == 0 {
            return Err(WorkerError::NoSubscribers);
        }
        Ok(())
    }

    /// Publish the task's final frame. A zero-subscriber result here is
    /// not actionable (the task is already finishing) so it's swallowed.
    pub async fn publish_result(&self, status: &str, data: Value, error: Option<String>) {
        if let Err(e) = self.publish(MessageType::Result, status, data, error).await {
            tracing::debug!(task_id = %self.task_id, error = %e, "final result publish found no subscribers");
        }
    }

    pub fn check_for_cancellation(&self) -> Result<(), WorkerError> {
        if self.cancelled.is_cancelled() {
            Err(WorkerError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_cancelled()
    }

    /// Stop the heartbeat loop. Idempotent.
    pub fn destroy(&self) {
        self.shutdown.cancel();
    }

    /// Spawn the background heartbeat loop. Sleeps on the shutdown token
    /// so `destroy()` can preempt it; a `NoSubscribers`
    /// heartbeat publish sets the cancellation flag and ends the loop.
    pub fn spawn_heartbeat(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let ctx = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = ctx.shutdown.cancelled() => break,
                    () = tokio::time::sleep(ctx.heartbeat_interval) => {
                        let result = ctx
                            .publish(MessageType::Heartbeat, "running", Value::Null, None)
                            .await;
                        if let Err(WorkerError::NoSubscribers) = result {
                            tracing::info!(task_id = %ctx.task_id, "no subscribers on heartbeat channel, cancelling task");
                            ctx.cancelled.cancel();
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::bus::FakeBus;
    use serde_json::json;

    #[tokio::test]
    async fn publish_with_subscribers_succeeds() {
        let bus = Arc::new(FakeBus::with_subscribers(1));
        let ctx = TaskContext::new(bus, "worker-1".into(), Duration::from_millis(50));
        ctx.publish(MessageType::Progress, "running", json!({"n": 1}), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_errors() {
        let bus = Arc::new(FakeBus::with_subscribers(0));
        let ctx = TaskContext::new(bus, "worker-1".into(), Duration::from_millis(50));
        let err = ctx
            .publish(MessageType::Progress, "running", Value::Null, None)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::NoSubscribers));
    }

    #[tokio::test]
    async fn heartbeat_with_no_subscribers_sets_cancellation_flag() {
        let bus = Arc::new(FakeBus::with_subscribers(0));
        let ctx = TaskContext::new(bus, "worker-1".into(), Duration::from_millis(10));
        let handle = ctx.spawn_heartbeat();

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.await.unwrap();

        assert!(ctx.is_cancelled());
        assert!(matches!(
            ctx.check_for_cancellation(),
            Err(WorkerError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn destroy_stops_heartbeat_without_flagging_cancellation() {
        let bus = Arc::new(FakeBus::with_subscribers(1));
        let ctx = TaskContext::new(bus, "worker-1".into(), Duration::from_secs(5));
        let handle = ctx.spawn_heartbeat();

        ctx.destroy();
        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("heartbeat loop should exit promptly on destroy()")
            .unwrap();

        assert!(!ctx.is_cancelled());
    }
}
