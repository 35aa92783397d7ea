use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Wakes the deriver loop for one tenant. The event log itself is the
/// source of truth for what work exists; this task only says "go check
/// `org_id` again" (spec §4.1: single-writer-per-tenant poll loop).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeriverTask {
    pub org_id: String,
}

#[async_trait::async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, task: DeriverTask) -> anyhow::Result<()>;
}

/// Simple in-memory queue using Tokio channels.
pub struct ChannelJobQueue {
    sender: mpsc::Sender<DeriverTask>,
}

impl ChannelJobQueue {
    pub fn new(sender: mpsc::Sender<DeriverTask>) -> Self {
        Self { sender }
    }
}

#[async_trait::async_trait]
impl JobQueue for ChannelJobQueue {
    async fn enqueue(&self, task: DeriverTask) -> anyhow::Result<()> {
        self.sender
            .send(task)
            .await
            .map_err(|e| anyhow::anyhow!("queue send error: {}", e))
    }
}
