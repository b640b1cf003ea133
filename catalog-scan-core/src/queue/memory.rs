use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{MessageQueue, QueuedMessage, ReceiptId, ScanMessage};
use crate::error::{CatalogScanError, Result};

#[derive(Clone, Debug)]
struct Envelope {
    receipt: ReceiptId,
    message: ScanMessage,
    dequeue_count: u32,
    visible_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct QueueState {
    messages: Vec<Envelope>,
    dead_letters: Vec<ScanMessage>,
}

/// Process-local queue with visibility timeouts and delayed delivery.
#[derive(Clone)]
pub struct InMemoryMessageQueue {
    state: Arc<Mutex<QueueState>>,
    visibility_timeout: chrono::Duration,
}

impl fmt::Debug for InMemoryMessageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryMessageQueue");
        debug.field("visibility_timeout", &self.visibility_timeout);
        match self.state.try_lock() {
            Ok(state) => {
                debug
                    .field("messages", &state.messages.len())
                    .field("dead_letters", &state.dead_letters.len());
            }
            Err(_) => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl Default for InMemoryMessageQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(5 * 60))
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

fn after(now: DateTime<Utc>, delay: chrono::Duration) -> DateTime<Utc> {
    now.checked_add_signed(delay)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl InMemoryMessageQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            visibility_timeout: to_chrono(visibility_timeout),
        }
    }

    /// Messages still in the queue, including hidden ones.
    pub async fn len(&self) -> usize {
        self.state.lock().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn dead_letters(&self) -> Vec<ScanMessage> {
        self.state.lock().await.dead_letters.clone()
    }

    /// Make every delayed message visible now. Messages held by a consumer
    /// stay hidden.
    pub async fn release_delayed(&self) {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        for envelope in state
            .messages
            .iter_mut()
            .filter(|envelope| envelope.dequeue_count == 0)
        {
            envelope.visible_at = envelope.visible_at.min(now);
        }
    }

    /// Snapshot of queued messages with their visibility time, oldest first.
    pub async fn peek_all(&self) -> Vec<(ScanMessage, DateTime<Utc>)> {
        self.state
            .lock()
            .await
            .messages
            .iter()
            .map(|envelope| (envelope.message.clone(), envelope.visible_at))
            .collect()
    }
}

#[async_trait]
impl MessageQueue for InMemoryMessageQueue {
    async fn enqueue(
        &self,
        messages: Vec<ScanMessage>,
        delay: Duration,
    ) -> Result<()> {
        let visible_at = after(Utc::now(), to_chrono(delay));
        let mut state = self.state.lock().await;
        state
            .messages
            .extend(messages.into_iter().map(|message| Envelope {
                receipt: ReceiptId::new(),
                message,
                dequeue_count: 0,
                visible_at,
            }));
        Ok(())
    }

    async fn dead_letter(&self, message: ScanMessage) -> Result<()> {
        self.state.lock().await.dead_letters.push(message);
        Ok(())
    }

    async fn dequeue(&self, max: usize) -> Result<Vec<QueuedMessage>> {
        let now = Utc::now();
        let hidden_until = after(now, self.visibility_timeout);
        let mut state = self.state.lock().await;

        let mut delivered = Vec::new();
        for envelope in state.messages.iter_mut() {
            if delivered.len() >= max {
                break;
            }
            if envelope.visible_at > now {
                continue;
            }
            envelope.dequeue_count += 1;
            envelope.visible_at = hidden_until;
            delivered.push(QueuedMessage {
                receipt: envelope.receipt,
                message: envelope.message.clone(),
                dequeue_count: envelope.dequeue_count,
            });
        }
        Ok(delivered)
    }

    async fn complete(&self, receipt: ReceiptId) -> Result<()> {
        let mut state = self.state.lock().await;
        let before = state.messages.len();
        state.messages.retain(|envelope| envelope.receipt != receipt);
        if state.messages.len() == before {
            return Err(CatalogScanError::InvalidState(format!(
                "no delivery with receipt {receipt}"
            )));
        }
        Ok(())
    }

    async fn abandon(&self, receipt: ReceiptId) -> Result<()> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let envelope = state
            .messages
            .iter_mut()
            .find(|envelope| envelope.receipt == receipt)
            .ok_or_else(|| {
                CatalogScanError::InvalidState(format!(
                    "no delivery with receipt {receipt}"
                ))
            })?;
        envelope.visible_at = now;
        Ok(())
    }

    async fn pending_child_messages(
        &self,
        scan_id: &str,
    ) -> Result<Option<usize>> {
        let state = self.state.lock().await;
        let count = state
            .messages
            .iter()
            .filter(|envelope| {
                !matches!(envelope.message, ScanMessage::Index(_))
                    && envelope.message.scan_id() == scan_id
            })
            .count();
        Ok(Some(count))
    }
}
