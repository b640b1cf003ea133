//! Work queue seam.
//!
//! Delivery is at-least-once. A dequeued message stays invisible until it is
//! completed or abandoned; a worker that crashes lets it reappear after the
//! visibility timeout with a higher dequeue count.

mod memory;
mod message;

pub use memory::InMemoryMessageQueue;
pub use message::{
    IndexScanMessage, LeafScanMessage, PageScanMessage, ScanMessage,
};

use std::{fmt, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// Handle for one delivery of a message.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ReceiptId(pub Uuid);

impl Default for ReceiptId {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiptId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for ReceiptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A delivered message.
#[derive(Clone, Debug)]
pub struct QueuedMessage {
    pub receipt: ReceiptId,
    pub message: ScanMessage,
    /// Deliveries so far, including this one.
    pub dequeue_count: u32,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Make the messages visible after `delay`.
    async fn enqueue(
        &self,
        messages: Vec<ScanMessage>,
        delay: Duration,
    ) -> Result<()>;

    /// Move a message to the dead-letter destination.
    async fn dead_letter(&self, message: ScanMessage) -> Result<()>;

    /// Take up to `max` visible messages and hide them for the visibility
    /// timeout.
    async fn dequeue(&self, max: usize) -> Result<Vec<QueuedMessage>>;

    async fn complete(&self, receipt: ReceiptId) -> Result<()>;

    /// Return the message to the queue for immediate redelivery.
    async fn abandon(&self, receipt: ReceiptId) -> Result<()>;

    /// Page and leaf messages for `scan_id` still in the queue, visible or
    /// not. `None` when the backend cannot tell.
    async fn pending_child_messages(
        &self,
        _scan_id: &str,
    ) -> Result<Option<usize>> {
        Ok(None)
    }
}
