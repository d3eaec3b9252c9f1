use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::model::CompletionEvent;

/// Publishes `CompletionEvent`s on topic `complete_topic` (spec.md §6). A
/// real deployment backs this with an at-least-once durable broker client;
/// here it's an in-process channel so the consumer loop can run in the same
/// process during tests and single-node deployments.
#[async_trait]
pub trait CompletionQueue: Send + Sync {
    async fn publish(&self, event: CompletionEvent);
}

#[derive(Clone)]
pub struct InMemoryCompletionQueue {
    sender: mpsc::UnboundedSender<CompletionEvent>,
}

impl InMemoryCompletionQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CompletionEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl CompletionQueue for InMemoryCompletionQueue {
    async fn publish(&self, event: CompletionEvent) {
        if self.sender.send(event).is_err() {
            warn!("completion queue consumer has shut down, dropping event");
        }
    }
}
