//! In-process runtime pieces: the queue consumer and the event bus.

mod event_bus;
mod worker;

pub use event_bus::InProcScanEventBus;
pub use worker::ScanWorker;
