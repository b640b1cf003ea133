use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
    time::Duration,
};

use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    context::ScanContext,
    error::Result,
    processor::{
        IndexScanProcessor, LeafDelivery, LeafScanProcessor, PageScanProcessor,
    },
    queue::{LeafScanMessage, QueuedMessage, ReceiptId, ScanMessage},
    service::CatalogScanService,
};

/// Pulls scan messages off the queue and routes them to the processors.
///
/// Leaf messages from one dequeue are handed to the leaf processor as a
/// single batch; index and page messages are processed one at a time. A
/// message is completed only after its processor returned.
pub struct ScanWorker {
    context: ScanContext,
    service: Arc<CatalogScanService>,
    index: IndexScanProcessor,
    page: PageScanProcessor,
    leaf: LeafScanProcessor,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for ScanWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("ScanWorker");
        debug.field("cancelled", &self.shutdown.is_cancelled());
        match self.handles.try_lock() {
            Ok(handles) => {
                debug.field("workers", &handles.len());
            }
            Err(_) => {
                debug.field("workers", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl ScanWorker {
    pub fn new(context: ScanContext) -> Self {
        let service = Arc::new(CatalogScanService::new(context.clone()));
        Self {
            index: IndexScanProcessor::new(context.clone(), Arc::clone(&service)),
            page: PageScanProcessor::new(context.clone()),
            leaf: LeafScanProcessor::new(context.clone()),
            service,
            context,
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn service(&self) -> &Arc<CatalogScanService> {
        &self.service
    }

    /// Dequeue one batch and process it. Returns how many messages were
    /// delivered.
    pub async fn run_once(&self) -> Result<usize> {
        let batch_size = self.context.config.worker.batch_size.max(1);
        let delivered = self.context.queue.dequeue(batch_size).await?;
        let count = delivered.len();

        let mut leaves = Vec::new();
        for queued in delivered {
            let QueuedMessage {
                receipt,
                message,
                dequeue_count,
            } = queued;
            match message {
                ScanMessage::Leaf(message) => leaves.push((
                    receipt,
                    LeafDelivery {
                        message,
                        dequeue_count,
                    },
                )),
                ScanMessage::Index(inner) => {
                    let result = self.index.process(&inner).await;
                    self.settle(receipt, ScanMessage::Index(inner), dequeue_count, result)
                        .await?;
                }
                ScanMessage::Page(inner) => {
                    let result = self.page.process(&inner).await;
                    self.settle(receipt, ScanMessage::Page(inner), dequeue_count, result)
                        .await?;
                }
            }
        }

        if !leaves.is_empty() {
            self.process_leaves(leaves).await?;
        }

        Ok(count)
    }

    /// Keep processing until a dequeue comes back empty. Delayed messages
    /// are not waited for.
    pub async fn drain(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let count = self.run_once().await?;
            if count == 0 {
                return Ok(total);
            }
            total += count;
        }
    }

    async fn settle(
        &self,
        receipt: ReceiptId,
        message: ScanMessage,
        dequeue_count: u32,
        result: Result<()>,
    ) -> Result<()> {
        let queue = &self.context.queue;
        match result {
            Ok(()) => queue.complete(receipt).await,
            Err(err)
                if dequeue_count >= self.context.config.worker.max_dequeue_count =>
            {
                error!(
                    scan_id = %message.scan_id(),
                    dequeue_count,
                    "giving up on message: {err}"
                );
                queue.dead_letter(message).await?;
                queue.complete(receipt).await
            }
            Err(err) => {
                warn!(
                    scan_id = %message.scan_id(),
                    dequeue_count,
                    "message failed and will be redelivered: {err}"
                );
                queue.abandon(receipt).await
            }
        }
    }

    async fn process_leaves(
        &self,
        leaves: Vec<(ReceiptId, LeafDelivery)>,
    ) -> Result<()> {
        let queue = &self.context.queue;
        let deliveries: Vec<LeafDelivery> =
            leaves.iter().map(|(_, delivery)| delivery.clone()).collect();

        let outcome = match self.leaf.process(&deliveries).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(count = leaves.len(), "leaf scan batch failed: {err}");
                for (receipt, _) in &leaves {
                    queue.abandon(*receipt).await?;
                }
                return Ok(());
            }
        };

        let failed: HashSet<&LeafScanMessage> = outcome.failed.iter().collect();
        let delayed: HashMap<&LeafScanMessage, Duration> = outcome
            .try_again_later
            .iter()
            .map(|(message, delay)| (message, *delay))
            .collect();

        // Only the most delivered copy of a repeated message carries the
        // outcome; the other copies complete.
        let mut primary: HashMap<&LeafScanMessage, usize> = HashMap::new();
        for (index, (_, delivery)) in leaves.iter().enumerate() {
            primary
                .entry(&delivery.message)
                .and_modify(|kept| {
                    if delivery.dequeue_count > leaves[*kept].1.dequeue_count {
                        *kept = index;
                    }
                })
                .or_insert(index);
        }

        for (index, (receipt, delivery)) in leaves.iter().enumerate() {
            if primary.get(&delivery.message) != Some(&index) {
                queue.complete(*receipt).await?;
            } else if failed.contains(&delivery.message) {
                queue.abandon(*receipt).await?;
            } else if let Some(delay) = delayed.get(&delivery.message) {
                queue
                    .enqueue(vec![ScanMessage::Leaf(delivery.message.clone())], *delay)
                    .await?;
                queue.complete(*receipt).await?;
            } else {
                queue.complete(*receipt).await?;
            }
        }

        debug!(
            count = leaves.len(),
            failed = outcome.failed.len(),
            delayed = outcome.try_again_later.len(),
            "settled leaf scan batch"
        );
        Ok(())
    }

    /// Spawn `parallelism` consumer loops. Call [`Self::shutdown`] to stop
    /// them.
    pub async fn start(self: &Arc<Self>, parallelism: usize) {
        let mut handles = self.handles.lock().await;
        for i in 0..parallelism.max(1) {
            let worker = Arc::clone(self);
            let shutdown = self.shutdown.clone();
            let idle = self.context.config.worker.idle_poll();
            handles.push(tokio::spawn(async move {
                loop {
                    if shutdown.is_cancelled() {
                        info!("scan worker {i} shutting down");
                        break;
                    }

                    let wait = match worker.run_once().await {
                        Ok(0) => idle,
                        Ok(_) => continue,
                        Err(err) => {
                            warn!("scan worker {i} failed to process messages: {err}");
                            idle
                        }
                    };

                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }));
        }
        info!(parallelism, "scan workers started");
    }

    pub async fn shutdown(&self) {
        info!("shutting down scan workers");
        self.shutdown.cancel();

        let handles = {
            let mut guard = self.handles.lock().await;
            std::mem::take(&mut *guard)
        };

        for handle in handles {
            match tokio::time::timeout(Duration::from_secs(30), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("scan worker task failed: {err:?}"),
                Err(_) => warn!("scan worker task timed out during shutdown"),
            }
        }

        info!("scan workers stopped");
    }
}
