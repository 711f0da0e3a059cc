//! Fire-and-forget broadcast of loop events to attached surfaces.
//!
//! The transport that carries events out of the process is not this crate's
//! concern; surfaces attach a receiver and fold events with the reducer in
//! [`crate::loop_state`]. Delivery is best-effort: with no receivers the
//! send is dropped, and a slow receiver misses events rather than blocking
//! the run.

use futures::Stream;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

use crate::protocol::LoopEvent;

/// Broadcasts loop events to every attached surface.
pub struct LoopEventBroadcaster {
    tx: broadcast::Sender<LoopEvent>,
}

impl LoopEventBroadcaster {
    /// Create a new broadcaster.
    pub fn new() -> Self {
        // Buffer 256 events; a lagging surface re-syncs from the next run_start.
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Emit an event to all attached surfaces.
    pub fn emit(&self, event: LoopEvent) {
        // Ignore send errors (no receivers is fine)
        let _ = self.tx.send(event);
    }

    /// Attach a new surface.
    pub fn subscribe(&self) -> impl Stream<Item = LoopEvent> + Send + 'static + use<> {
        BroadcastStream::new(self.tx.subscribe()).filter_map(|result| result.ok())
    }
}

impl Default for LoopEventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
