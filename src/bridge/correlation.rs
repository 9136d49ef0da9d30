//! Request/response correlation for admin exchanges.
//!
//! An entry is registered before its request frame is written and removed exactly once:
//! by the matching response, by its deadline timer, or by cancellation. Whoever removes
//! the entry from the map owns completion, so a response racing its timeout can never
//! complete a handle twice. Responses that find no entry are counted and dropped.
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::error::BridgeError;
use crate::logutil::node_id;
use crate::meshtastic::transport::TransportError;
use crate::metrics;
use crate::protobuf::meshtastic_generated as proto;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    SessionPasskey,
    RemoteConfig,
    RemoteModuleConfig,
    RemoteChannel,
    RemoteOwner,
    DeviceMetadata,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestKind::SessionPasskey => "session passkey",
            RequestKind::RemoteConfig => "config",
            RequestKind::RemoteModuleConfig => "module config",
            RequestKind::RemoteChannel => "channel",
            RequestKind::RemoteOwner => "owner",
            RequestKind::DeviceMetadata => "device metadata",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub request_id: u32,
    pub kind: RequestKind,
    pub destination: u32,
    pub created_at: Instant,
    pub deadline: Instant,
}

type Outcome = Result<proto::AdminMessage, BridgeError>;

struct Entry {
    info: PendingRequest,
    tx: oneshot::Sender<Outcome>,
    timer: JoinHandle<()>,
}

/// Completion side of a registered request.
#[derive(Debug)]
pub struct PendingHandle {
    request_id: u32,
    rx: oneshot::Receiver<Outcome>,
}

impl PendingHandle {
    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    pub async fn wait(self) -> Outcome {
        self.rx
            .await
            .unwrap_or_else(|_| Err(BridgeError::Transport(TransportError::LinkClosed)))
    }
}

#[derive(Clone, Default)]
pub struct RequestTracker {
    entries: Arc<Mutex<HashMap<u32, Entry>>>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request and arm its deadline. The returned id must be used as the
    /// packet id of the request frame.
    pub fn register(
        &self,
        kind: RequestKind,
        destination: u32,
        timeout: Duration,
    ) -> (u32, PendingHandle) {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let mut entries = self.lock();
        let request_id = loop {
            let id: u32 = rand::random();
            if id != 0 && !entries.contains_key(&id) {
                break id;
            }
        };

        let map = self.entries.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = map.lock().ok().and_then(|mut m| m.remove(&request_id));
            if let Some(entry) = expired {
                metrics::inc_request_timeouts();
                warn!(
                    "{} request 0x{:08x} to {} timed out after {:?}",
                    entry.info.kind,
                    request_id,
                    node_id(entry.info.destination),
                    timeout
                );
                let _ = entry.tx.send(Err(BridgeError::Timeout {
                    kind: entry.info.kind,
                    request_id,
                    destination: node_id(entry.info.destination),
                    waited: timeout,
                }));
            }
        });

        entries.insert(
            request_id,
            Entry {
                info: PendingRequest {
                    request_id,
                    kind,
                    destination,
                    created_at: now,
                    deadline: now + timeout,
                },
                tx,
                timer,
            },
        );
        debug!(
            "Registered {} request 0x{:08x} to {}",
            kind,
            request_id,
            node_id(destination)
        );
        (request_id, PendingHandle { request_id, rx })
    }

    /// Complete a pending request with its response. Returns false for unknown or
    /// already-completed ids (late responses).
    pub fn resolve(&self, request_id: u32, response: proto::AdminMessage) -> bool {
        match self.take(request_id) {
            Some(entry) => {
                debug!(
                    "Resolved {} request 0x{:08x} after {:?}",
                    entry.info.kind,
                    request_id,
                    entry.info.created_at.elapsed()
                );
                let _ = entry.tx.send(Ok(response));
                true
            }
            None => {
                metrics::inc_late_responses();
                debug!("Discarding response for unknown request 0x{:08x}", request_id);
                false
            }
        }
    }

    /// Fail a pending request early (routing error, rejected passkey).
    pub fn fail(&self, request_id: u32, error: BridgeError) -> bool {
        match self.take(request_id) {
            Some(entry) => {
                let _ = entry.tx.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Forget a request whose frame never made it onto the link.
    pub fn discard(&self, request_id: u32) {
        let _ = self.take(request_id);
    }

    /// Fail every pending request, returning how many were cancelled.
    pub fn cancel_all<F>(&self, make_error: F) -> usize
    where
        F: Fn() -> BridgeError,
    {
        let drained: Vec<Entry> = self.lock().drain().map(|(_, e)| e).collect();
        let count = drained.len();
        for entry in drained {
            entry.timer.abort();
            let _ = entry.tx.send(Err(make_error()));
        }
        if count > 0 {
            debug!("Cancelled {} pending requests", count);
        }
        count
    }

    pub fn pending(&self) -> Vec<PendingRequest> {
        self.lock().values().map(|e| e.info.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take(&self, request_id: u32) -> Option<Entry> {
        let entry = self.lock().remove(&request_id)?;
        entry.timer.abort();
        Some(entry)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u32, Entry>> {
        // A poisoned map only means another thread panicked mid-update; the data is still usable.
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner_response() -> proto::AdminMessage {
        proto::AdminMessage {
            payload_variant: Some(proto::admin_message::PayloadVariant::GetOwnerResponse(
                proto::User {
                    long_name: "Base".into(),
                    ..Default::default()
                },
            )),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn resolve_completes_handle_once() {
        let tracker = RequestTracker::new();
        let (id, handle) = tracker.register(RequestKind::RemoteOwner, 0x10, Duration::from_secs(5));
        assert_eq!(handle.request_id(), id);
        assert_eq!(tracker.len(), 1);

        assert!(tracker.resolve(id, owner_response()));
        assert!(!tracker.resolve(id, owner_response()));
        assert!(tracker.is_empty());

        let resp = tokio_test::assert_ok!(handle.wait().await);
        assert!(matches!(
            resp.payload_variant,
            Some(proto::admin_message::PayloadVariant::GetOwnerResponse(_))
        ));
    }

    #[tokio::test]
    async fn deadline_fails_with_timeout_and_late_response_is_dropped() {
        let tracker = RequestTracker::new();
        let (id, handle) =
            tracker.register(RequestKind::RemoteConfig, 0x20, Duration::from_millis(30));
        let err = tokio_test::assert_err!(handle.wait().await);
        match err {
            BridgeError::Timeout {
                kind, request_id, ..
            } => {
                assert_eq!(kind, RequestKind::RemoteConfig);
                assert_eq!(request_id, id);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(tracker.is_empty());

        let late_before = metrics::snapshot().late_responses;
        assert!(!tracker.resolve(id, owner_response()));
        assert!(metrics::snapshot().late_responses > late_before);
    }

    #[tokio::test]
    async fn fail_delivers_error() {
        let tracker = RequestTracker::new();
        let (id, handle) =
            tracker.register(RequestKind::RemoteChannel, 0x30, Duration::from_secs(5));
        assert!(tracker.fail(
            id,
            BridgeError::Routing {
                reason: "NO_ROUTE".into()
            }
        ));
        assert!(matches!(
            handle.wait().await,
            Err(BridgeError::Routing { .. })
        ));
    }

    #[tokio::test]
    async fn cancel_all_fails_everything() {
        let tracker = RequestTracker::new();
        let (_, a) = tracker.register(RequestKind::RemoteOwner, 1, Duration::from_secs(5));
        let (_, b) = tracker.register(RequestKind::DeviceMetadata, 2, Duration::from_secs(5));
        assert_eq!(tracker.pending().len(), 2);
        let n = tracker.cancel_all(|| BridgeError::Transport(TransportError::Disconnected));
        assert_eq!(n, 2);
        for h in [a, b] {
            assert!(matches!(
                h.wait().await,
                Err(BridgeError::Transport(TransportError::Disconnected))
            ));
        }
    }

    #[tokio::test]
    async fn discarded_request_reports_link_closed() {
        let tracker = RequestTracker::new();
        let (id, handle) =
            tracker.register(RequestKind::SessionPasskey, 3, Duration::from_secs(5));
        tracker.discard(id);
        assert!(matches!(
            handle.wait().await,
            Err(BridgeError::Transport(TransportError::LinkClosed))
        ));
    }
}
