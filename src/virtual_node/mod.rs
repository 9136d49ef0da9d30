//! # Virtual Node Server
//!
//! A TCP listener speaking the device stream protocol so that ordinary Meshtastic
//! clients can attach to the bridge as if it were the radio. Each client gets:
//!
//! - a replay of the captured config when it sends `want_config_id`
//! - every mesh frame the bridge receives, through a bounded per-client queue
//! - its outbound packets forwarded to the device (admin packets only when allowed)
//!
//! A client whose queue fills up is considered stalled and disconnected so one slow
//! reader never holds up the others.
mod client;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bridge::MeshBridge;
use crate::config::VirtualNodeConfig;
use crate::meshtastic::framer;
use crate::metrics;
use crate::protobuf::meshtastic_generated as proto;

/// Public view of an attached client.
#[derive(Debug, Clone, Serialize)]
pub struct VirtualClient {
    pub connection_id: Uuid,
    pub peer: SocketAddr,
    pub connected_at: DateTime<Utc>,
    pub admin_commands_allowed: bool,
}

struct ClientEntry {
    info: VirtualClient,
    tx: mpsc::Sender<Bytes>,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
pub(crate) struct ClientRegistry {
    clients: Mutex<HashMap<Uuid, ClientEntry>>,
}

impl ClientRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, ClientEntry>> {
        self.clients.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn insert(&self, info: VirtualClient, tx: mpsc::Sender<Bytes>) {
        self.lock().insert(
            info.connection_id,
            ClientEntry {
                info,
                tx,
                task: None,
            },
        );
    }

    fn attach_task(&self, id: Uuid, task: JoinHandle<()>) {
        match self.lock().get_mut(&id) {
            Some(entry) => entry.task = Some(task),
            // Client already finished before we got here.
            None => task.abort(),
        }
    }

    /// Forget a client. Returns true if it was still registered.
    pub(crate) fn remove(&self, id: Uuid) -> bool {
        self.lock().remove(&id).is_some()
    }

    fn drop_client(&self, id: Uuid, reason: &str) {
        if let Some(entry) = self.lock().remove(&id) {
            warn!(
                "Dropping virtual client {} ({}): {}",
                entry.info.peer, id, reason
            );
            metrics::inc_virtual_clients_dropped();
            if let Some(task) = entry.task {
                task.abort();
            }
        }
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn details(&self) -> Vec<VirtualClient> {
        let mut list: Vec<VirtualClient> = self.lock().values().map(|e| e.info.clone()).collect();
        list.sort_by_key(|c| c.connected_at);
        list
    }

    /// Queue `frame` for every client without waiting. Stalled or closed clients are
    /// disconnected. Returns how many clients accepted the frame.
    fn fan_out(&self, frame: &Bytes) -> usize {
        let mut delivered = 0;
        let mut stalled = Vec::new();
        for (id, entry) in self.lock().iter() {
            match entry.tx.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => stalled.push((*id, "send queue full")),
                Err(mpsc::error::TrySendError::Closed(_)) => stalled.push((*id, "connection closed")),
            }
        }
        for (id, reason) in stalled {
            self.drop_client(id, reason);
        }
        delivered
    }

    fn close_all(&self) -> usize {
        let drained: Vec<ClientEntry> = self.lock().drain().map(|(_, e)| e).collect();
        let count = drained.len();
        for entry in drained {
            if let Some(task) = entry.task {
                task.abort();
            }
        }
        count
    }
}

struct Running {
    local_addr: SocketAddr,
    accept: JoinHandle<()>,
    forward: JoinHandle<()>,
}

pub struct VirtualNodeServer {
    bridge: MeshBridge,
    config: VirtualNodeConfig,
    registry: Arc<ClientRegistry>,
    running: Mutex<Option<Running>>,
}

impl VirtualNodeServer {
    pub fn new(bridge: MeshBridge, config: VirtualNodeConfig) -> Self {
        Self {
            bridge,
            config,
            registry: Arc::new(ClientRegistry::default()),
            running: Mutex::new(None),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Bind and start accepting clients. Returns the bound address (useful with port 0).
    pub async fn start(&self) -> Result<SocketAddr> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }
        let bind = format!("{}:{}", self.config.bind, self.config.port);
        let listener = TcpListener::bind(&bind)
            .await
            .map_err(|e| anyhow!("Failed to bind virtual node on {}: {}", bind, e))?;
        let local_addr = listener.local_addr()?;

        let forward = tokio::spawn(forward_mesh_feed(
            self.bridge.mesh_feed(),
            self.registry.clone(),
        ));
        let accept = tokio::spawn(accept_loop(
            listener,
            self.bridge.clone(),
            self.registry.clone(),
            self.config.clone(),
        ));

        let mut guard = self.running();
        if let Some(existing) = guard.as_ref() {
            // Lost a start() race; keep the first listener.
            accept.abort();
            forward.abort();
            return Ok(existing.local_addr);
        }
        *guard = Some(Running {
            local_addr,
            accept,
            forward,
        });
        info!("Virtual node listening on {}", local_addr);
        Ok(local_addr)
    }

    /// Stop listening and disconnect every client.
    pub fn stop(&self) {
        let Some(running) = self.running().take() else {
            return;
        };
        running.accept.abort();
        running.forward.abort();
        let closed = self.registry.close_all();
        info!(
            "Virtual node on {} stopped ({} clients disconnected)",
            running.local_addr, closed
        );
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running().as_ref().map(|r| r.local_addr)
    }

    pub fn client_count(&self) -> usize {
        self.registry.len()
    }

    pub fn client_details(&self) -> Vec<VirtualClient> {
        self.registry.details()
    }

    /// Send one message to every attached client. Returns the number of clients it was
    /// queued for.
    pub fn broadcast_to_clients(&self, message: &proto::FromRadio) -> usize {
        match framer::encode(message) {
            Ok(frame) => self.registry.fan_out(&frame),
            Err(e) => {
                warn!("Cannot broadcast to virtual clients: {}", e);
                0
            }
        }
    }
}

impl Drop for VirtualNodeServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(
    listener: TcpListener,
    bridge: MeshBridge,
    registry: Arc<ClientRegistry>,
    config: VirtualNodeConfig,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Virtual node accept failed: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed for {}: {}", peer, e);
        }
        let info = VirtualClient {
            connection_id: Uuid::new_v4(),
            peer,
            connected_at: Utc::now(),
            admin_commands_allowed: config.allow_admin_commands,
        };
        let id = info.connection_id;
        let (tx, rx) = mpsc::channel(config.client_queue_len.max(1));
        registry.insert(info.clone(), tx);
        info!("Virtual client {} connected ({})", peer, id);
        let task = tokio::spawn(client::serve(
            stream,
            info,
            bridge.clone(),
            registry.clone(),
            rx,
        ));
        registry.attach_task(id, task);
    }
}

async fn forward_mesh_feed(mut feed: broadcast::Receiver<Bytes>, registry: Arc<ClientRegistry>) {
    loop {
        match feed.recv().await {
            Ok(frame) => {
                registry.fan_out(&frame);
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Virtual node feed lagged; {} mesh frames skipped", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("Virtual node feed closed");
}
