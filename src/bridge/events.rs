//! Bridge notifications for observers (REST layer, virtual node, CLI).
use std::sync::Arc;

use tokio::sync::watch;

use super::delivery::DeliveryUpdate;
use super::snapshot::LocalIdentity;
use crate::storage::{NeighborRecord, StoredMessage, TracerouteRecord};

#[derive(Debug, Clone)]
pub enum BridgeEvent {
    LinkUp {
        generation: u64,
    },
    /// Fired once per connection generation after the device finished its config burst.
    CaptureComplete {
        generation: u64,
        identity: Arc<LocalIdentity>,
    },
    LinkDown {
        generation: u64,
        error: Option<String>,
    },
    TextReceived(StoredMessage),
    Delivery(DeliveryUpdate),
    Traceroute(TracerouteRecord),
    NeighborInfo(NeighborRecord),
    NodeUpdated(u32),
}

/// Latest completed capture, published on its own channel so busy event traffic can
/// never push it out of an observer's queue.
pub(crate) type CaptureSlot = Option<(u64, Arc<LocalIdentity>)>;

/// Yields each completed config capture, at most once per connection generation.
pub struct ConfigCaptureSubscription {
    rx: watch::Receiver<CaptureSlot>,
    last_generation: u64,
}

impl ConfigCaptureSubscription {
    /// Only captures completed after this call are reported.
    pub(crate) fn new(mut rx: watch::Receiver<CaptureSlot>) -> Self {
        let last_generation = rx
            .borrow_and_update()
            .as_ref()
            .map(|(g, _)| *g)
            .unwrap_or(0);
        Self {
            rx,
            last_generation,
        }
    }

    /// Wait for the next capture. Returns `None` once the bridge is dropped.
    pub async fn next(&mut self) -> Option<(u64, Arc<LocalIdentity>)> {
        loop {
            if self.rx.changed().await.is_err() {
                return None;
            }
            let latest = self.rx.borrow_and_update().clone();
            if let Some((generation, identity)) = latest {
                if generation > self.last_generation {
                    self.last_generation = generation;
                    return Some((generation, identity));
                }
            }
        }
    }
}
