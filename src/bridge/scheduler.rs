//! Automatic traceroute target selection.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::protobuf::meshtastic_generated as proto;

/// Remembers when each node was last traced and picks the stalest one next.
#[derive(Debug, Default)]
pub struct TracerouteScheduler {
    last_traced: HashMap<u32, Instant>,
}

impl TracerouteScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, node: u32, at: Instant) {
        self.last_traced.insert(node, at);
    }

    pub fn last_traced(&self, node: u32) -> Option<Instant> {
        self.last_traced.get(&node).copied()
    }

    /// Never-traced nodes first, then the least recently traced. Ties go to the node
    /// heard most recently. Nodes traced within `min_gap` are skipped.
    pub fn next_target(
        &self,
        nodes: &[Arc<proto::NodeInfo>],
        local: u32,
        now: Instant,
        min_gap: Duration,
    ) -> Option<u32> {
        nodes
            .iter()
            .filter(|n| n.num != local && n.num != crate::meshtastic::BROADCAST_ADDR)
            .filter(|n| match self.last_traced(n.num) {
                Some(at) => now.saturating_duration_since(at) >= min_gap,
                None => true,
            })
            .min_by(|a, b| {
                let ta = self.last_traced(a.num);
                let tb = self.last_traced(b.num);
                ta.cmp(&tb).then(b.last_heard.cmp(&a.last_heard))
            })
            .map(|n| n.num)
    }
}
