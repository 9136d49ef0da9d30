//! Delivery state of outbound text messages.
//!
//! ```text
//! Pending -> Sent -> Delivered -> Confirmed
//!        \       \           \
//!         +-------+-----------+--> Failed (only from Pending/Sent)
//! ```
//!
//! `Delivered` means the mesh accepted the packet (our own radio or a relay reported
//! success); `Confirmed` means the intended recipient acknowledged it. `Confirmed` and
//! `Failed` are final. Stale unresolved entries are failed by [`DeliveryTracker::sweep`]
//! and resolved ones are evicted after the retention window.
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;

use crate::logutil::{node_id, truncate_for_log};
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Pending,
    Sent,
    Delivered,
    Confirmed,
    Failed,
}

impl DeliveryState {
    pub fn is_final(self) -> bool {
        matches!(self, DeliveryState::Confirmed | DeliveryState::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            DeliveryState::Pending => 0,
            DeliveryState::Sent => 1,
            DeliveryState::Delivered => 2,
            DeliveryState::Confirmed | DeliveryState::Failed => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "type", content = "value")]
pub enum Destination {
    Node(u32),
    Channel(u32),
}

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub packet_id: u32,
    pub destination: Destination,
    pub channel: u32,
    pub text: String,
    pub reply_id: Option<u32>,
    pub want_ack: bool,
    pub state: DeliveryState,
    pub created_at: Instant,
    pub updated_at: Instant,
    pub sent_at: Option<Instant>,
    pub error: Option<String>,
}

impl OutboundMessage {
    pub fn new(
        packet_id: u32,
        destination: Destination,
        channel: u32,
        text: impl Into<String>,
        reply_id: Option<u32>,
        want_ack: bool,
    ) -> Self {
        let now = Instant::now();
        Self {
            packet_id,
            destination,
            channel,
            text: text.into(),
            reply_id,
            want_ack,
            state: DeliveryState::Pending,
            created_at: now,
            updated_at: now,
            sent_at: None,
            error: None,
        }
    }
}

/// A state change worth telling observers about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryUpdate {
    pub packet_id: u32,
    pub state: DeliveryState,
    pub error: Option<String>,
}

pub struct DeliveryTracker {
    entries: Mutex<HashMap<u32, OutboundMessage>>,
    ack_timeout: Duration,
    retention: Duration,
}

impl DeliveryTracker {
    pub fn new(ack_timeout: Duration, retention: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ack_timeout,
            retention,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, OutboundMessage>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn track(&self, message: OutboundMessage) {
        debug!(
            "Tracking packet 0x{:08x} ({:?}): {}",
            message.packet_id,
            message.destination,
            truncate_for_log(&message.text, 40)
        );
        self.lock().insert(message.packet_id, message);
    }

    fn advance(
        &self,
        packet_id: u32,
        next: DeliveryState,
        error: Option<String>,
    ) -> Option<DeliveryUpdate> {
        let mut entries = self.lock();
        let entry = entries.get_mut(&packet_id)?;
        let allowed = match next {
            DeliveryState::Failed => {
                matches!(entry.state, DeliveryState::Pending | DeliveryState::Sent)
            }
            _ => !entry.state.is_final() && next.rank() > entry.state.rank(),
        };
        if !allowed {
            return None;
        }
        let now = Instant::now();
        entry.state = next;
        entry.updated_at = now;
        match next {
            DeliveryState::Sent => entry.sent_at = Some(now),
            DeliveryState::Failed => {
                entry.error = error.clone();
                metrics::inc_delivery_failed();
            }
            DeliveryState::Confirmed => {
                metrics::inc_delivery_confirmed();
                metrics::observe_ack_latency(entry.sent_at.unwrap_or(entry.created_at));
            }
            _ => {}
        }
        Some(DeliveryUpdate {
            packet_id,
            state: next,
            error,
        })
    }

    pub fn on_sent(&self, packet_id: u32) -> Option<DeliveryUpdate> {
        self.advance(packet_id, DeliveryState::Sent, None)
    }

    /// Apply a successful routing report for `packet_id` sent by node `from`.
    ///
    /// An ack from the local radio only means the hop was taken: `Delivered`. A direct
    /// message is `Confirmed` by its destination. A channel broadcast has no single
    /// destination, so an ack from any other node moves it on to `Confirmed`, even after
    /// it was already reported `Delivered`. REST consumers should expect both states for
    /// broadcasts.
    pub fn on_ack(&self, packet_id: u32, from: u32, local: Option<u32>) -> Option<DeliveryUpdate> {
        let destination = self.lock().get(&packet_id)?.destination;
        let from_local = local == Some(from);
        let next = match destination {
            Destination::Node(dest) if dest == from => DeliveryState::Confirmed,
            Destination::Node(_) => DeliveryState::Delivered,
            Destination::Channel(_) if from_local => DeliveryState::Delivered,
            Destination::Channel(_) => DeliveryState::Confirmed,
        };
        let update = self.advance(packet_id, next, None);
        if let Some(u) = &update {
            info!(
                "Packet 0x{:08x} {:?} (ack from {})",
                packet_id,
                u.state,
                node_id(from)
            );
        }
        update
    }

    pub fn on_routing_error(&self, packet_id: u32, reason: &str) -> Option<DeliveryUpdate> {
        let update = self.advance(packet_id, DeliveryState::Failed, Some(reason.to_string()));
        if update.is_some() {
            warn!("Packet 0x{:08x} failed: {}", packet_id, reason);
        }
        update
    }

    /// Fail entries still unresolved after the ack timeout and evict resolved entries past
    /// the retention window. Returns the failures.
    pub fn sweep(&self, now: Instant) -> Vec<DeliveryUpdate> {
        let mut entries = self.lock();
        let mut failed = Vec::new();
        for entry in entries.values_mut() {
            let unresolved = matches!(entry.state, DeliveryState::Pending | DeliveryState::Sent);
            if unresolved && now.saturating_duration_since(entry.created_at) >= self.ack_timeout {
                entry.state = DeliveryState::Failed;
                entry.updated_at = now;
                entry.error = Some("timeout".into());
                metrics::inc_delivery_failed();
                failed.push(DeliveryUpdate {
                    packet_id: entry.packet_id,
                    state: DeliveryState::Failed,
                    error: entry.error.clone(),
                });
            }
        }
        let before = entries.len();
        entries.retain(|_, e| {
            let resolved = e.state.rank() >= DeliveryState::Delivered.rank();
            !(resolved && now.saturating_duration_since(e.updated_at) >= self.retention)
        });
        let evicted = before - entries.len();
        if !failed.is_empty() || evicted > 0 {
            debug!(
                "Delivery sweep: {} timed out, {} evicted",
                failed.len(),
                evicted
            );
        }
        failed
    }

    pub fn state(&self, packet_id: u32) -> Option<DeliveryState> {
        self.lock().get(&packet_id).map(|e| e.state)
    }

    pub fn get(&self, packet_id: u32) -> Option<OutboundMessage> {
        self.lock().get(&packet_id).cloned()
    }

    /// `Some(true)` once the mesh accepted the packet, `Some(false)` when it failed,
    /// `None` while in flight or unknown.
    pub fn acknowledged(&self, packet_id: u32) -> Option<bool> {
        match self.state(packet_id)? {
            DeliveryState::Delivered | DeliveryState::Confirmed => Some(true),
            DeliveryState::Failed => Some(false),
            DeliveryState::Pending | DeliveryState::Sent => None,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL: u32 = 0x1000;
    const PEER: u32 = 0x2000;

    fn tracker() -> DeliveryTracker {
        DeliveryTracker::new(Duration::from_secs(60), Duration::from_secs(300))
    }

    fn dm(id: u32) -> OutboundMessage {
        OutboundMessage::new(id, Destination::Node(PEER), 0, "hello", None, true)
    }

    fn broadcast(id: u32) -> OutboundMessage {
        OutboundMessage::new(id, Destination::Channel(0), 0, "hi all", None, true)
    }

    #[test]
    fn direct_message_confirmed_by_destination() {
        let t = tracker();
        t.track(dm(1));
        assert_eq!(t.state(1), Some(DeliveryState::Pending));
        assert_eq!(t.acknowledged(1), None);
        t.on_sent(1).unwrap();
        let u = t.on_ack(1, PEER, Some(LOCAL)).unwrap();
        assert_eq!(u.state, DeliveryState::Confirmed);
        assert_eq!(t.acknowledged(1), Some(true));
    }

    #[test]
    fn relay_ack_then_destination_ack() {
        let t = tracker();
        t.track(dm(2));
        t.on_sent(2);
        assert_eq!(
            t.on_ack(2, LOCAL, Some(LOCAL)).unwrap().state,
            DeliveryState::Delivered
        );
        assert_eq!(
            t.on_ack(2, PEER, Some(LOCAL)).unwrap().state,
            DeliveryState::Confirmed
        );
    }

    #[test]
    fn broadcast_local_ack_is_delivered() {
        let t = tracker();
        t.track(broadcast(3));
        t.on_sent(3);
        assert_eq!(
            t.on_ack(3, LOCAL, Some(LOCAL)).unwrap().state,
            DeliveryState::Delivered
        );
        // duplicate implicit ack is not a transition
        assert!(t.on_ack(3, LOCAL, Some(LOCAL)).is_none());
    }

    #[test]
    fn broadcast_moves_from_delivered_to_confirmed_on_peer_ack() {
        let t = tracker();
        t.track(broadcast(6));
        t.on_sent(6);
        t.on_ack(6, LOCAL, Some(LOCAL));
        assert_eq!(t.acknowledged(6), Some(true));
        assert_eq!(
            t.on_ack(6, PEER, Some(LOCAL)).unwrap().state,
            DeliveryState::Confirmed
        );
        assert!(t.on_ack(6, PEER + 1, Some(LOCAL)).is_none());
    }

    #[test]
    fn final_states_never_regress() {
        let t = tracker();
        t.track(dm(4));
        t.on_sent(4);
        t.on_routing_error(4, "NO_ROUTE").unwrap();
        assert!(t.on_ack(4, PEER, Some(LOCAL)).is_none());
        assert!(t.on_sent(4).is_none());
        assert_eq!(t.state(4), Some(DeliveryState::Failed));
        assert_eq!(t.acknowledged(4), Some(false));

        t.track(dm(5));
        t.on_ack(5, PEER, Some(LOCAL));
        assert!(t.on_routing_error(5, "MAX_RETRANSMIT").is_none());
        assert_eq!(t.state(5), Some(DeliveryState::Confirmed));
    }

    #[test]
    fn delivered_cannot_fail() {
        let t = tracker();
        t.track(dm(6));
        t.on_ack(6, LOCAL, Some(LOCAL));
        assert!(t.on_routing_error(6, "TIMEOUT").is_none());
        assert_eq!(t.state(6), Some(DeliveryState::Delivered));
    }

    #[test]
    fn every_event_order_ends_in_resolved_state() {
        #[derive(Clone, Copy, Debug)]
        enum Ev {
            Sent,
            Ack,
            Nak,
            Timeout,
        }
        let events = [Ev::Sent, Ev::Ack, Ev::Nak, Ev::Timeout];
        // all permutations of the four events
        let mut perms = Vec::new();
        for a in 0..4 {
            for b in 0..4 {
                for c in 0..4 {
                    for d in 0..4 {
                        let idx = [a, b, c, d];
                        let mut seen = [false; 4];
                        if idx.iter().all(|&i| !std::mem::replace(&mut seen[i], true)) {
                            perms.push(idx.map(|i| events[i]));
                        }
                    }
                }
            }
        }
        assert_eq!(perms.len(), 24);
        let t = DeliveryTracker::new(Duration::ZERO, Duration::from_secs(300));
        for (n, order) in perms.iter().enumerate() {
            let id = 100 + n as u32;
            t.track(dm(id));
            let mut last_rank = 0;
            for ev in order {
                match ev {
                    Ev::Sent => {
                        t.on_sent(id);
                    }
                    Ev::Ack => {
                        t.on_ack(id, PEER, Some(LOCAL));
                    }
                    Ev::Nak => {
                        t.on_routing_error(id, "NO_RESPONSE");
                    }
                    Ev::Timeout => {
                        t.sweep(Instant::now());
                    }
                }
                let rank = t.state(id).unwrap().rank();
                assert!(rank >= last_rank, "regressed in {order:?}");
                last_rank = rank;
            }
            let end = t.state(id).unwrap();
            assert!(
                matches!(
                    end,
                    DeliveryState::Confirmed | DeliveryState::Delivered | DeliveryState::Failed
                ),
                "{order:?} ended in {end:?}"
            );
        }
    }

    #[test]
    fn sweep_fails_stale_and_evicts_resolved() {
        let t = DeliveryTracker::new(Duration::from_secs(10), Duration::from_secs(20));
        t.track(dm(7));
        t.track(dm(8));
        t.on_ack(8, PEER, Some(LOCAL));
        let start = Instant::now();

        assert!(t.sweep(start).is_empty());
        let failed = t.sweep(start + Duration::from_secs(11));
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].packet_id, 7);
        assert_eq!(failed[0].error.as_deref(), Some("timeout"));
        // already resolved: a later sweep must not re-fire it
        assert!(t.sweep(start + Duration::from_secs(12)).is_empty());
        assert_eq!(t.state(8), Some(DeliveryState::Confirmed));

        t.sweep(start + Duration::from_secs(60));
        assert!(t.is_empty());
    }

    #[test]
    fn unknown_packet_ignored() {
        let t = tracker();
        assert!(t.on_ack(99, PEER, Some(LOCAL)).is_none());
        assert!(t.on_routing_error(99, "x").is_none());
        assert_eq!(t.acknowledged(99), None);
    }
}
