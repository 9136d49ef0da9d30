//! Session passkeys for privileged admin commands to remote nodes.
//!
//! Firmware 2.5+ hands out a short-lived passkey in every admin response. Commands to a
//! remote node must echo a valid one. Keys are cached per node, expire lazily, and are
//! all dropped when the link is re-established. Concurrent callers needing a key for the
//! same node share a single request.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::time::Instant;

use super::admin::AdminClient;
use super::correlation::RequestKind;
use super::error::{BridgeError, BridgeResult};
use super::firmware::{self, Capability};
use super::snapshot::DeviceSnapshot;
use crate::logutil::node_id;
use crate::metrics;
use crate::protobuf::meshtastic_generated as proto;

#[derive(Debug, Clone)]
pub struct SessionPasskey {
    pub node_num: u32,
    pub token: Bytes,
    pub obtained_at: Instant,
    pub expires_at: Instant,
}

impl SessionPasskey {
    pub fn is_valid_at(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// TTL cache of passkeys keyed by node number.
pub struct PasskeyCache {
    ttl: Duration,
    entries: Mutex<HashMap<u32, SessionPasskey>>,
    inflight: Mutex<HashMap<u32, Arc<tokio::sync::Mutex<()>>>>,
}

impl PasskeyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<u32, SessionPasskey>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Cached key for `node` if still valid; expired keys are evicted on the way.
    pub fn get(&self, node: u32) -> Option<SessionPasskey> {
        let now = Instant::now();
        let mut entries = self.entries();
        match entries.get(&node) {
            Some(key) if key.is_valid_at(now) => Some(key.clone()),
            Some(_) => {
                entries.remove(&node);
                debug!("Session passkey for {} expired", node_id(node));
                None
            }
            None => None,
        }
    }

    pub fn store(&self, node: u32, token: Bytes) -> SessionPasskey {
        let now = Instant::now();
        let key = SessionPasskey {
            node_num: node,
            token,
            obtained_at: now,
            expires_at: now + self.ttl,
        };
        self.entries().insert(node, key.clone());
        key
    }

    pub fn invalidate(&self, node: u32) -> bool {
        self.entries().remove(&node).is_some()
    }

    pub fn clear(&self) -> usize {
        let mut entries = self.entries();
        let n = entries.len();
        entries.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn inflight(&self) -> MutexGuard<'_, HashMap<u32, Arc<tokio::sync::Mutex<()>>>> {
        self.inflight.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Per-node request lock. The map entry goes away with the last lease.
    fn lease(&self, node: u32) -> NodeLease<'_> {
        let lock = self.inflight().entry(node).or_default().clone();
        NodeLease {
            cache: self,
            node,
            lock,
        }
    }

    fn inflight_nodes(&self) -> usize {
        self.inflight().len()
    }
}

struct NodeLease<'a> {
    cache: &'a PasskeyCache,
    node: u32,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl NodeLease<'_> {
    async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.lock.lock().await
    }
}

impl Drop for NodeLease<'_> {
    fn drop(&mut self) {
        let mut inflight = self.cache.inflight();
        // The map's copy plus ours: nobody else is waiting on this node.
        if Arc::strong_count(&self.lock) == 2 {
            inflight.remove(&self.node);
        }
    }
}

#[derive(Clone)]
pub struct SessionManager {
    cache: Arc<PasskeyCache>,
    admin: AdminClient,
    snapshot: DeviceSnapshot,
}

impl SessionManager {
    pub fn new(admin: AdminClient, snapshot: DeviceSnapshot, ttl: Duration) -> Self {
        Self {
            cache: Arc::new(PasskeyCache::new(ttl)),
            admin,
            snapshot,
        }
    }

    /// Cached passkey only; never touches the network.
    pub fn get_passkey(&self, node: u32) -> Option<SessionPasskey> {
        if self.admin.is_local(node) {
            return None;
        }
        self.cache.get(node)
    }

    /// Ask `node` for a fresh passkey and cache it.
    pub async fn request_passkey(&self, node: u32) -> BridgeResult<SessionPasskey> {
        firmware::require(
            self.snapshot.identity().as_deref(),
            Capability::SessionPasskeys,
        )?;
        metrics::inc_passkey_requests();
        let request = proto::AdminMessage {
            payload_variant: Some(proto::admin_message::PayloadVariant::GetConfigRequest(
                proto::admin_message::ConfigType::SessionkeyConfig as i32,
            )),
            ..Default::default()
        };
        let response = self
            .admin
            .roundtrip(RequestKind::SessionPasskey, node, request)
            .await?;
        if response.session_passkey.is_empty() {
            warn!(
                target: "security",
                "{} answered a session key request without a passkey",
                node_id(node)
            );
            return Err(BridgeError::FirmwareUnsupported {
                feature: Capability::SessionPasskeys.name(),
                required: Capability::SessionPasskeys.min_version().to_string(),
                found: format!("unknown on {}", node_id(node)),
            });
        }
        let key = self.cache.store(node, response.session_passkey);
        info!(
            "Obtained session passkey for {} (valid {:?})",
            node_id(node),
            key.remaining()
        );
        Ok(key)
    }

    /// Token to attach to an admin command for `node`: `None` for the local node,
    /// otherwise a cached or freshly requested key.
    pub async fn ensure_passkey(&self, node: u32) -> BridgeResult<Option<Bytes>> {
        if self.admin.local_node()? == node {
            return Ok(None);
        }
        if let Some(key) = self.cache.get(node) {
            metrics::inc_passkey_cache_hits();
            return Ok(Some(key.token));
        }
        let lease = self.cache.lease(node);
        let _guard = lease.lock().await;
        if let Some(key) = self.cache.get(node) {
            metrics::inc_passkey_cache_hits();
            return Ok(Some(key.token));
        }
        Ok(Some(self.request_passkey(node).await?.token))
    }

    /// Refresh the cache from any admin message a remote node sends us.
    pub fn observe(&self, from: u32, admin: &proto::AdminMessage) {
        if admin.session_passkey.is_empty() || self.admin.is_local(from) {
            return;
        }
        self.cache.store(from, admin.session_passkey.clone());
        debug!("Refreshed session passkey for {}", node_id(from));
    }

    pub fn invalidate(&self, node: u32) {
        if self.cache.invalidate(node) {
            warn!(target: "security", "Session passkey for {} rejected; dropped", node_id(node));
        }
    }

    /// Drop every cached key (link re-established or user disconnect).
    pub fn clear(&self) {
        let n = self.cache.clear();
        if n > 0 {
            debug!("Cleared {} session passkeys", n);
        }
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}
