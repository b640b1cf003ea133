use std::fmt;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{
    error::Result,
    events::{ScanEvent, ScanObserver},
};

/// In-process fan-out of scan events to any number of subscribers. Slow
/// subscribers lose the oldest events instead of blocking publishers.
pub struct InProcScanEventBus {
    sender: broadcast::Sender<ScanEvent>,
    capacity: usize,
}

impl fmt::Debug for InProcScanEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcScanEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcScanEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.sender.subscribe()
    }

    /// Subscribe as a stream; lagged receivers yield an error item.
    pub fn stream(&self) -> BroadcastStream<ScanEvent> {
        BroadcastStream::new(self.subscribe())
    }
}

#[async_trait]
impl ScanObserver for InProcScanEventBus {
    async fn publish(&self, event: ScanEvent) -> Result<()> {
        let _ = self.sender.send(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DriverName;
    use futures::StreamExt;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = InProcScanEventBus::new(8);
        let mut stream = bus.stream();

        bus.publish(ScanEvent::ScanAborted {
            driver: DriverName::new("BuildVersionSet"),
            scan_id: "s1".into(),
        })
        .await
        .unwrap();

        let event = stream.next().await.unwrap().unwrap();
        assert!(matches!(
            event,
            ScanEvent::ScanAborted { scan_id, .. } if scan_id == "s1"
        ));
    }
}
