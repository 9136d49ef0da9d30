//! # Protocol Bridge
//!
//! [`MeshBridge`] owns the device transport and everything layered on top of it:
//!
//! ```text
//!            ┌──────────── MeshBridge ────────────┐
//! device ⇄ Transport ─► PacketRouter ─► snapshot / tracker / session / delivery / persistence
//!            ▲                                    │
//!            └── AdminClient ◄── session, transactions, REST-facing operations
//! ```
//!
//! One bridge is constructed at startup and handed to whoever needs it (the virtual node
//! server, the CLI). Handles are cheap clones of an `Arc`.
pub mod admin;
pub mod correlation;
pub mod delivery;
pub mod error;
pub mod events;
pub mod firmware;
pub mod router;
pub mod scheduler;
pub mod session;
pub mod snapshot;
pub mod transaction;

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use log::{debug, error, info, warn};
use prost::Message;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::logutil::{node_id, truncate_for_log};
use crate::meshtastic::link::{connector_for, Connector};
use crate::meshtastic::transport::{ConnectionState, LinkEvent, Transport, TransportSettings};
use crate::meshtastic::{new_packet_id, BROADCAST_ADDR};
use crate::protobuf::meshtastic_generated as proto;
use crate::storage::{Direction, NodeRecord, Persistence, StoredMessage};

use admin::AdminClient;
use correlation::{RequestKind, RequestTracker};
use delivery::{DeliveryState, DeliveryTracker, Destination, OutboundMessage};
use firmware::Capability;
use router::PacketRouter;
use scheduler::TracerouteScheduler;
use session::{SessionManager, SessionPasskey};
use snapshot::DeviceSnapshot;
use transaction::ConfigTransactions;

pub use error::{BridgeError, BridgeResult, ErrorKind};
pub use events::{BridgeEvent, ConfigCaptureSubscription};
use events::CaptureSlot;
pub use snapshot::{DeviceConfigView, LocalIdentity};

use proto::admin_message::PayloadVariant as AdminVariant;

/// Largest text payload the firmware accepts in one packet.
pub const MAX_TEXT_BYTES: usize = 228;
/// Highest channel index on a device.
pub const MAX_CHANNEL_INDEX: u32 = 7;
/// Persistence key for the automatic traceroute interval.
pub const TRACEROUTE_INTERVAL_SETTING: &str = "traceroute_interval_minutes";
const MAX_TRACEROUTE_INTERVAL_MINUTES: u32 = 24 * 60;

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub device: String,
    pub generation: u64,
    pub identity: Option<LocalIdentity>,
    pub last_error: Option<String>,
    pub node_count: usize,
    pub pending_requests: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PositionRequest {
    pub packet_id: u32,
    pub request_id: u32,
}

struct Inner {
    config: Config,
    transport: Transport,
    snapshot: DeviceSnapshot,
    tracker: RequestTracker,
    admin: AdminClient,
    session: SessionManager,
    transactions: ConfigTransactions,
    delivery: Arc<DeliveryTracker>,
    persistence: Arc<dyn Persistence>,
    router: PacketRouter,
    events: broadcast::Sender<BridgeEvent>,
    captures: watch::Sender<CaptureSlot>,
    mesh_feed: broadcast::Sender<Bytes>,
    traceroute_interval: watch::Sender<u32>,
    traceroutes: Mutex<TracerouteScheduler>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn emit(&self, event: BridgeEvent) {
        let _ = self.events.send(event);
    }

    fn audit(&self, action: &str, detail: String) {
        if let Err(e) = self.persistence.audit_log(action, &detail) {
            warn!("Audit log write failed ({}): {}", action, e);
        }
    }
}

#[derive(Clone)]
pub struct MeshBridge {
    inner: Arc<Inner>,
}

impl MeshBridge {
    /// Build a bridge for the device named in `config`. Must be called inside a Tokio
    /// runtime; background tasks are spawned immediately but nothing connects until
    /// [`MeshBridge::connect`].
    pub fn new(config: Config, persistence: Arc<dyn Persistence>) -> anyhow::Result<Self> {
        let connector = connector_for(&config.device)?;
        Ok(Self::with_connector(config, connector, persistence))
    }

    pub fn with_connector(
        config: Config,
        connector: Arc<dyn Connector>,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        let (transport, link_events) =
            Transport::new(connector, TransportSettings::from(&config.device));
        let snapshot = DeviceSnapshot::new();
        let tracker = RequestTracker::new();
        let admin = AdminClient::new(
            transport.clone(),
            tracker.clone(),
            snapshot.clone(),
            config.requests.admin_timeout(),
            config.requests.admin_channel,
        );
        let session = SessionManager::new(
            admin.clone(),
            snapshot.clone(),
            config.requests.passkey_ttl(),
        );
        let transactions = ConfigTransactions::new(admin.clone());
        let delivery = Arc::new(DeliveryTracker::new(
            Duration::from_secs(config.delivery.ack_timeout_secs),
            Duration::from_secs(config.delivery.retention_secs),
        ));
        let (events, _) = broadcast::channel(256);
        let (mesh_feed, _) = broadcast::channel(256);
        let router = PacketRouter::new(
            snapshot.clone(),
            tracker.clone(),
            session.clone(),
            delivery.clone(),
            persistence.clone(),
            events.clone(),
            mesh_feed.clone(),
        );

        match persistence.get_all_nodes() {
            Ok(records) => {
                let added = snapshot.warm(records.iter().map(NodeRecord::to_node_info));
                if added > 0 {
                    info!("Warmed node snapshot with {} stored nodes", added);
                }
            }
            Err(e) => warn!("Could not load stored nodes: {}", e),
        }
        let interval = match persistence.get_setting(TRACEROUTE_INTERVAL_SETTING) {
            Ok(Some(v)) => v.parse().unwrap_or_else(|_| {
                warn!("Ignoring invalid stored traceroute interval '{}'", v);
                config.traceroute.interval_minutes
            }),
            _ => config.traceroute.interval_minutes,
        };
        let (traceroute_interval, interval_rx) = watch::channel(interval);
        let sweep_every = Duration::from_secs(config.delivery.sweep_interval_secs.max(1));

        let inner = Arc::new(Inner {
            config,
            transport,
            snapshot,
            tracker,
            admin,
            session,
            transactions,
            delivery,
            persistence,
            router,
            events,
            captures: watch::channel(None).0,
            mesh_feed,
            traceroute_interval,
            traceroutes: Mutex::new(TracerouteScheduler::new()),
            tasks: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&inner);
        let tasks = vec![
            tokio::spawn(dispatch(weak.clone(), link_events)),
            tokio::spawn(sweep_deliveries(weak.clone(), sweep_every)),
            tokio::spawn(run_traceroutes(weak, interval_rx)),
        ];
        if let Ok(mut guard) = inner.tasks.lock() {
            guard.extend(tasks);
        }
        MeshBridge { inner }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn persistence(&self) -> Arc<dyn Persistence> {
        self.inner.persistence.clone()
    }

    // ---- connection -------------------------------------------------------------

    pub async fn connect(&self) {
        self.inner.transport.connect().await;
    }

    /// Close the device link without reconnecting. Pending requests fail with a transport
    /// error and device-derived state is dropped; virtual client sockets stay open.
    pub async fn user_disconnect(&self) {
        let inner = &self.inner;
        inner.transport.user_disconnect().await;
        let cancelled = inner.tracker.cancel_all(|| {
            BridgeError::Transport(crate::meshtastic::transport::TransportError::Disconnected)
        });
        inner.snapshot.clear_device_state();
        inner.session.clear();
        inner.transactions.reset().await;
        info!(
            "Disconnected from device by user ({} pending requests cancelled)",
            cancelled
        );
        inner.audit("disconnect", format!("cancelled={}", cancelled));
    }

    pub async fn user_reconnect(&self) {
        info!("Reconnect requested by user");
        self.inner.transport.user_reconnect().await;
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.transport.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.transport.subscribe_state()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        let inner = &self.inner;
        ConnectionStatus {
            state: inner.transport.state(),
            device: inner.transport.describe(),
            generation: inner.transport.generation(),
            identity: inner.snapshot.identity().map(|i| (*i).clone()),
            last_error: inner.transport.last_error(),
            node_count: inner.snapshot.node_count(),
            pending_requests: inner.tracker.len(),
        }
    }

    /// Wait until the current (or next) config capture completes.
    pub async fn wait_for_capture(&self, timeout: Duration) -> BridgeResult<Arc<LocalIdentity>> {
        let mut sub = self.config_capture();
        if let Some(identity) = self.inner.snapshot.identity() {
            return Ok(identity);
        }
        match tokio::time::timeout(timeout, sub.next()).await {
            Ok(Some((_, identity))) => Ok(identity),
            Ok(None) => Err(crate::meshtastic::transport::TransportError::LinkClosed.into()),
            Err(_) => Err(BridgeError::NotReady),
        }
    }

    // ---- observers --------------------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.inner.events.subscribe()
    }

    /// Completed config captures, once per connection generation.
    pub fn config_capture(&self) -> ConfigCaptureSubscription {
        ConfigCaptureSubscription::new(self.inner.captures.subscribe())
    }

    /// Framed device output for virtual clients (packets, node updates, queue status).
    pub fn mesh_feed(&self) -> broadcast::Receiver<Bytes> {
        self.inner.mesh_feed.subscribe()
    }

    /// FromRadio payloads answering a client's `want_config_id`.
    pub fn replay_frames(&self, config_id: u32) -> Vec<Bytes> {
        self.inner.snapshot.replay_frames(config_id)
    }

    // ---- node state -------------------------------------------------------------

    pub fn local_node_info(&self) -> Option<Arc<LocalIdentity>> {
        self.inner.snapshot.identity()
    }

    pub fn all_nodes(&self) -> Vec<Arc<proto::NodeInfo>> {
        self.inner.snapshot.nodes()
    }

    pub fn node(&self, num: u32) -> Option<Arc<proto::NodeInfo>> {
        self.inner.snapshot.node(num)
    }

    pub fn device_config(&self) -> DeviceConfigView {
        self.inner.snapshot.device_config()
    }

    pub fn delivery_state(&self, packet_id: u32) -> Option<DeliveryState> {
        self.inner.delivery.state(packet_id)
    }

    pub fn acknowledged(&self, packet_id: u32) -> Option<bool> {
        self.inner.delivery.acknowledged(packet_id)
    }

    // ---- mesh traffic -----------------------------------------------------------

    async fn send_packet(&self, packet: proto::MeshPacket) -> BridgeResult<()> {
        let msg = proto::ToRadio {
            payload_variant: Some(proto::to_radio::PayloadVariant::Packet(packet)),
        };
        self.inner.transport.send(&msg).await?;
        Ok(())
    }

    fn track_and_record(&self, packet: &proto::MeshPacket, data: &proto::Data, from: u32, user_id: Option<&str>) {
        let text = String::from_utf8_lossy(&data.payload).into_owned();
        let reply_id = (data.reply_id != 0).then_some(data.reply_id);
        let destination = if packet.to == BROADCAST_ADDR {
            Destination::Channel(packet.channel)
        } else {
            Destination::Node(packet.to)
        };
        self.inner.delivery.track(OutboundMessage::new(
            packet.id,
            destination,
            packet.channel,
            text.clone(),
            reply_id,
            packet.want_ack,
        ));
        let stored = StoredMessage {
            packet_id: packet.id,
            from,
            to: packet.to,
            channel: packet.channel,
            text,
            direction: Direction::Outbound,
            reply_id,
            emoji: data.emoji != 0,
            user_id: user_id.map(str::to_string),
            rx_snr: None,
            hops_away: None,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.inner.persistence.insert_message(&stored) {
            warn!("Failed to persist outbound message 0x{:08x}: {}", packet.id, e);
        }
    }

    fn mark_sent(&self, packet_id: u32, result: &BridgeResult<()>) {
        let update = match result {
            Ok(()) => self.inner.delivery.on_sent(packet_id),
            Err(e) => self.inner.delivery.on_routing_error(packet_id, &e.to_string()),
        };
        if let Some(u) = update {
            self.inner.emit(BridgeEvent::Delivery(u));
        }
    }

    /// Send a text message to a channel (no `destination`) or a node. Returns the packet id
    /// whose delivery state can be followed with [`MeshBridge::delivery_state`].
    pub async fn send_text_message(
        &self,
        text: &str,
        channel: u32,
        destination: Option<u32>,
        reply_id: Option<u32>,
        emoji: bool,
        user_id: Option<&str>,
    ) -> BridgeResult<u32> {
        if text.is_empty() {
            return Err(BridgeError::InvalidArgument("message text is empty".into()));
        }
        if text.len() > MAX_TEXT_BYTES {
            return Err(BridgeError::InvalidArgument(format!(
                "message is {} bytes; the limit is {}",
                text.len(),
                MAX_TEXT_BYTES
            )));
        }
        check_channel(channel)?;
        let local = self.inner.admin.local_node()?;
        let to = destination.unwrap_or(BROADCAST_ADDR);
        let data = proto::Data {
            portnum: proto::PortNum::TextMessageApp as i32,
            payload: Bytes::copy_from_slice(text.as_bytes()),
            reply_id: reply_id.unwrap_or(0),
            emoji: emoji as u32,
            ..Default::default()
        };
        let packet = proto::MeshPacket {
            to,
            channel,
            id: new_packet_id(),
            want_ack: true,
            payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(data.clone())),
            ..Default::default()
        };
        let id = packet.id;
        self.track_and_record(&packet, &data, local, user_id);
        let result = self.send_packet(packet).await;
        self.mark_sent(id, &result);
        result?;
        info!(
            "Sent text 0x{:08x} to {} ch{}: {}",
            id,
            node_id(to),
            channel,
            truncate_for_log(text, 60)
        );
        Ok(id)
    }

    pub async fn send_traceroute(&self, destination: u32, channel: u32) -> BridgeResult<u32> {
        check_channel(channel)?;
        self.inner.admin.local_node()?;
        let packet = proto::MeshPacket {
            to: destination,
            channel,
            id: new_packet_id(),
            want_ack: true,
            payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: proto::PortNum::TracerouteApp as i32,
                payload: Bytes::from(proto::RouteDiscovery::default().encode_to_vec()),
                want_response: true,
                ..Default::default()
            })),
            ..Default::default()
        };
        let id = packet.id;
        self.send_packet(packet).await?;
        if let Ok(mut sched) = self.inner.traceroutes.lock() {
            sched.record(destination, Instant::now());
        }
        info!("Traceroute 0x{:08x} sent to {}", id, node_id(destination));
        Ok(id)
    }

    /// Ask `destination` for its position. The reply carries the packet id as its
    /// `request_id`.
    pub async fn send_position_request(
        &self,
        destination: u32,
        channel: u32,
    ) -> BridgeResult<PositionRequest> {
        check_channel(channel)?;
        let local = self.inner.admin.local_node()?;
        let own_position = self
            .inner
            .snapshot
            .node(local)
            .and_then(|n| n.position.clone())
            .unwrap_or_default();
        let packet = proto::MeshPacket {
            to: destination,
            channel,
            id: new_packet_id(),
            want_ack: true,
            payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: proto::PortNum::PositionApp as i32,
                payload: Bytes::from(own_position.encode_to_vec()),
                want_response: true,
                ..Default::default()
            })),
            ..Default::default()
        };
        let id = packet.id;
        self.send_packet(packet).await?;
        debug!("Position request 0x{:08x} sent to {}", id, node_id(destination));
        Ok(PositionRequest {
            packet_id: id,
            request_id: id,
        })
    }

    /// Forward a packet produced by a virtual client. Text packets are delivery-tracked.
    pub async fn forward_client_packet(&self, mut packet: proto::MeshPacket) -> BridgeResult<u32> {
        if packet.id == 0 {
            packet.id = new_packet_id();
        }
        let id = packet.id;
        let text = match &packet.payload_variant {
            Some(proto::mesh_packet::PayloadVariant::Decoded(d))
                if d.portnum == proto::PortNum::TextMessageApp as i32 =>
            {
                Some(d.clone())
            }
            _ => None,
        };
        if let Some(data) = &text {
            let from = self.inner.snapshot.my_node_num().unwrap_or(packet.from);
            self.track_and_record(&packet, data, from, None);
        }
        let result = self.send_packet(packet).await;
        if text.is_some() {
            self.mark_sent(id, &result);
        }
        result.map(|_| id)
    }

    // ---- local configuration ----------------------------------------------------

    pub async fn begin_edit_settings(&self) -> BridgeResult<()> {
        self.inner.transactions.begin().await
    }

    /// Returns false when no edit was open.
    pub async fn commit_edit_settings(&self) -> BridgeResult<bool> {
        let committed = self.inner.transactions.commit().await?;
        if committed {
            self.inner.audit("commit_edit_settings", String::new());
        }
        Ok(committed)
    }

    async fn write_config(&self, config: proto::Config) -> BridgeResult<()> {
        let msg = proto::AdminMessage {
            payload_variant: Some(AdminVariant::SetConfig(config.clone())),
            ..Default::default()
        };
        self.inner.transactions.write(msg).await?;
        self.inner.snapshot.set_config(config, None);
        Ok(())
    }

    async fn write_module_config(&self, config: proto::ModuleConfig) -> BridgeResult<()> {
        let msg = proto::AdminMessage {
            payload_variant: Some(AdminVariant::SetModuleConfig(config.clone())),
            ..Default::default()
        };
        self.inner.transactions.write(msg).await?;
        self.inner.snapshot.set_module_config(config, None);
        Ok(())
    }

    pub async fn set_channel_config(&self, channel: proto::Channel) -> BridgeResult<()> {
        if channel.index < 0 || channel.index as u32 > MAX_CHANNEL_INDEX {
            return Err(BridgeError::InvalidArgument(format!(
                "channel index {} out of range",
                channel.index
            )));
        }
        let msg = proto::AdminMessage {
            payload_variant: Some(AdminVariant::SetChannel(channel.clone())),
            ..Default::default()
        };
        self.inner.transactions.write(msg).await?;
        self.inner.snapshot.set_channel(channel, None);
        Ok(())
    }

    pub async fn set_lora_config(&self, lora: proto::config::LoRaConfig) -> BridgeResult<()> {
        self.write_config(config_of(proto::config::PayloadVariant::Lora(lora)))
            .await
    }

    pub async fn set_device_config(&self, device: proto::config::DeviceConfig) -> BridgeResult<()> {
        self.write_config(config_of(proto::config::PayloadVariant::Device(device)))
            .await
    }

    pub async fn set_network_config(
        &self,
        network: proto::config::NetworkConfig,
    ) -> BridgeResult<()> {
        self.write_config(config_of(proto::config::PayloadVariant::Network(network)))
            .await
    }

    pub async fn set_position_config(
        &self,
        position: proto::config::PositionConfig,
    ) -> BridgeResult<()> {
        self.write_config(config_of(proto::config::PayloadVariant::Position(position)))
            .await
    }

    pub async fn set_mqtt_config(&self, mqtt: proto::module_config::MqttConfig) -> BridgeResult<()> {
        self.write_module_config(module_config_of(
            proto::module_config::PayloadVariant::Mqtt(mqtt),
        ))
        .await
    }

    pub async fn set_neighbor_info_config(
        &self,
        neighbor_info: proto::module_config::NeighborInfoConfig,
    ) -> BridgeResult<()> {
        self.write_module_config(module_config_of(
            proto::module_config::PayloadVariant::NeighborInfo(neighbor_info),
        ))
        .await
    }

    /// Fetch one config section from the local node and refresh the snapshot.
    pub async fn request_config(
        &self,
        config_type: proto::admin_message::ConfigType,
    ) -> BridgeResult<proto::Config> {
        let local = self.inner.admin.local_node()?;
        let config = self.fetch_config(local, config_type, None).await?;
        self.inner.snapshot.set_config(config.clone(), None);
        Ok(config)
    }

    pub async fn request_module_config(
        &self,
        module_type: proto::admin_message::ModuleConfigType,
    ) -> BridgeResult<proto::ModuleConfig> {
        let local = self.inner.admin.local_node()?;
        let config = self.fetch_module_config(local, module_type, None).await?;
        self.inner.snapshot.set_module_config(config.clone(), None);
        Ok(config)
    }

    // ---- remote administration --------------------------------------------------

    async fn authorized_roundtrip(
        &self,
        kind: RequestKind,
        node: u32,
        variant: AdminVariant,
        passkey: Option<Bytes>,
    ) -> BridgeResult<proto::AdminMessage> {
        let msg = proto::AdminMessage {
            session_passkey: passkey.unwrap_or_default(),
            payload_variant: Some(variant),
        };
        self.inner.admin.roundtrip(kind, node, msg).await
    }

    async fn fetch_config(
        &self,
        node: u32,
        config_type: proto::admin_message::ConfigType,
        passkey: Option<Bytes>,
    ) -> BridgeResult<proto::Config> {
        let response = self
            .authorized_roundtrip(
                RequestKind::RemoteConfig,
                node,
                AdminVariant::GetConfigRequest(config_type as i32),
                passkey,
            )
            .await?;
        match response.payload_variant {
            Some(AdminVariant::GetConfigResponse(config)) => Ok(config),
            other => Err(unexpected("config", other)),
        }
    }

    async fn fetch_module_config(
        &self,
        node: u32,
        module_type: proto::admin_message::ModuleConfigType,
        passkey: Option<Bytes>,
    ) -> BridgeResult<proto::ModuleConfig> {
        let response = self
            .authorized_roundtrip(
                RequestKind::RemoteModuleConfig,
                node,
                AdminVariant::GetModuleConfigRequest(module_type as i32),
                passkey,
            )
            .await?;
        match response.payload_variant {
            Some(AdminVariant::GetModuleConfigResponse(config)) => Ok(config),
            other => Err(unexpected("module config", other)),
        }
    }

    /// Read a config section from any node, obtaining a session passkey first when the
    /// node is remote and none is cached.
    pub async fn request_remote_config(
        &self,
        node: u32,
        config_type: proto::admin_message::ConfigType,
    ) -> BridgeResult<proto::Config> {
        let passkey = self.inner.session.ensure_passkey(node).await?;
        self.fetch_config(node, config_type, passkey).await
    }

    pub async fn request_remote_module_config(
        &self,
        node: u32,
        module_type: proto::admin_message::ModuleConfigType,
    ) -> BridgeResult<proto::ModuleConfig> {
        let passkey = self.inner.session.ensure_passkey(node).await?;
        self.fetch_module_config(node, module_type, passkey).await
    }

    /// Read channel `index` (0-based) from a node.
    pub async fn request_remote_channel(&self, node: u32, index: u32) -> BridgeResult<proto::Channel> {
        if index > MAX_CHANNEL_INDEX {
            return Err(BridgeError::InvalidArgument(format!(
                "channel index {} out of range",
                index
            )));
        }
        let passkey = self.inner.session.ensure_passkey(node).await?;
        // The firmware numbers channel requests from 1.
        let response = self
            .authorized_roundtrip(
                RequestKind::RemoteChannel,
                node,
                AdminVariant::GetChannelRequest(index + 1),
                passkey,
            )
            .await?;
        match response.payload_variant {
            Some(AdminVariant::GetChannelResponse(channel)) => Ok(channel),
            other => Err(unexpected("channel", other)),
        }
    }

    pub async fn request_remote_owner(&self, node: u32) -> BridgeResult<proto::User> {
        let passkey = self.inner.session.ensure_passkey(node).await?;
        let response = self
            .authorized_roundtrip(
                RequestKind::RemoteOwner,
                node,
                AdminVariant::GetOwnerRequest(true),
                passkey,
            )
            .await?;
        match response.payload_variant {
            Some(AdminVariant::GetOwnerResponse(user)) => Ok(user),
            other => Err(unexpected("owner", other)),
        }
    }

    pub async fn request_device_metadata(&self, node: u32) -> BridgeResult<proto::DeviceMetadata> {
        let passkey = self.inner.session.ensure_passkey(node).await?;
        let response = self
            .authorized_roundtrip(
                RequestKind::DeviceMetadata,
                node,
                AdminVariant::GetDeviceMetadataRequest(true),
                passkey,
            )
            .await?;
        match response.payload_variant {
            Some(AdminVariant::GetDeviceMetadataResponse(md)) => Ok(md),
            other => Err(unexpected("device metadata", other)),
        }
    }

    /// Cached passkey for `node`, without network I/O.
    pub fn session_passkey(&self, node: u32) -> Option<SessionPasskey> {
        self.inner.session.get_passkey(node)
    }

    pub async fn request_remote_session_passkey(&self, node: u32) -> BridgeResult<SessionPasskey> {
        if self.inner.admin.is_local(node) {
            return Err(BridgeError::InvalidArgument(
                "the local node does not use session passkeys".into(),
            ));
        }
        self.inner.session.request_passkey(node).await
    }

    /// Send an arbitrary admin message. A passkey is attached for remote nodes; local
    /// writes join an open edit transaction.
    pub async fn send_admin_command(
        &self,
        mut admin: proto::AdminMessage,
        destination: u32,
    ) -> BridgeResult<u32> {
        let local = self.inner.admin.local_node()?;
        let id = if destination == local {
            self.inner.transactions.write(admin).await?
        } else {
            if let Some(token) = self.inner.session.ensure_passkey(destination).await? {
                admin.session_passkey = token;
            }
            self.inner.admin.send(destination, admin).await?
        };
        self.inner
            .audit("admin_command", format!("to={} packet=0x{:08x}", node_id(destination), id));
        Ok(id)
    }

    async fn local_admin(&self, action: &str, variant: AdminVariant) -> BridgeResult<u32> {
        let local = self.inner.admin.local_node()?;
        let msg = proto::AdminMessage {
            payload_variant: Some(variant),
            ..Default::default()
        };
        let id = self.inner.admin.send(local, msg).await?;
        info!("{} sent to local node (packet 0x{:08x})", action, id);
        Ok(id)
    }

    pub async fn reboot_device(&self, seconds: i32) -> BridgeResult<u32> {
        let id = self
            .local_admin("Reboot", AdminVariant::RebootSeconds(seconds))
            .await?;
        self.inner.audit("reboot", format!("seconds={}", seconds));
        Ok(id)
    }

    /// Wipe the device node database; the bridge keeps only the local node afterwards.
    pub async fn purge_node_db(&self, seconds: i32) -> BridgeResult<u32> {
        let id = self
            .local_admin("Node DB reset", AdminVariant::NodedbReset(seconds))
            .await?;
        let removed = self.inner.snapshot.retain_local_node();
        self.inner
            .audit("purge_node_db", format!("seconds={} removed={}", seconds, removed));
        Ok(id)
    }

    pub async fn remove_node(&self, node: u32) -> BridgeResult<u32> {
        let id = self
            .local_admin("Remove node", AdminVariant::RemoveByNodenum(node))
            .await?;
        self.inner.snapshot.remove_node(node);
        self.inner.audit("remove_node", node_id(node));
        Ok(id)
    }

    async fn set_favorite(&self, node: u32, favorite: bool) -> BridgeResult<u32> {
        firmware::require(
            self.inner.snapshot.identity().as_deref(),
            Capability::FavoriteNodes,
        )?;
        let variant = if favorite {
            AdminVariant::SetFavoriteNode(node)
        } else {
            AdminVariant::RemoveFavoriteNode(node)
        };
        let id = self.local_admin("Favorite update", variant).await?;
        let info = self
            .inner
            .snapshot
            .update_node(node, |n| n.is_favorite = favorite);
        if let Err(e) = self
            .inner
            .persistence
            .upsert_node(&NodeRecord::from_node_info(&info))
        {
            warn!("Failed to persist favorite flag for {}: {}", node_id(node), e);
        }
        Ok(id)
    }

    pub async fn set_favorite_node(&self, node: u32) -> BridgeResult<u32> {
        self.set_favorite(node, true).await
    }

    pub async fn remove_favorite_node(&self, node: u32) -> BridgeResult<u32> {
        self.set_favorite(node, false).await
    }

    // ---- automatic traceroutes --------------------------------------------------

    /// Set the automatic traceroute interval; 0 disables it. The value is persisted.
    pub fn set_traceroute_interval(&self, minutes: u32) -> BridgeResult<()> {
        if minutes > MAX_TRACEROUTE_INTERVAL_MINUTES {
            return Err(BridgeError::InvalidArgument(format!(
                "traceroute interval must be at most {} minutes",
                MAX_TRACEROUTE_INTERVAL_MINUTES
            )));
        }
        if let Err(e) = self
            .inner
            .persistence
            .set_setting(TRACEROUTE_INTERVAL_SETTING, &minutes.to_string())
        {
            warn!("Failed to persist traceroute interval: {}", e);
        }
        self.inner.traceroute_interval.send_replace(minutes);
        info!("Automatic traceroute interval set to {} minutes", minutes);
        Ok(())
    }

    pub fn traceroute_interval(&self) -> u32 {
        *self.inner.traceroute_interval.borrow()
    }

    /// Disconnect and stop background tasks.
    pub async fn shutdown(&self) {
        self.user_disconnect().await;
        let tasks: Vec<JoinHandle<()>> = match self.inner.tasks.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            task.abort();
        }
    }
}

fn check_channel(channel: u32) -> BridgeResult<()> {
    if channel > MAX_CHANNEL_INDEX {
        return Err(BridgeError::InvalidArgument(format!(
            "channel {} out of range (0-{})",
            channel, MAX_CHANNEL_INDEX
        )));
    }
    Ok(())
}

fn config_of(variant: proto::config::PayloadVariant) -> proto::Config {
    proto::Config {
        payload_variant: Some(variant),
    }
}

fn module_config_of(variant: proto::module_config::PayloadVariant) -> proto::ModuleConfig {
    proto::ModuleConfig {
        payload_variant: Some(variant),
    }
}

fn unexpected(expected: &str, got: Option<AdminVariant>) -> BridgeError {
    BridgeError::UnexpectedResponse(format!("expected {} response, got {:?}", expected, got))
}

async fn dispatch(weak: Weak<Inner>, mut link_events: mpsc::UnboundedReceiver<LinkEvent>) {
    while let Some(event) = link_events.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        match event {
            LinkEvent::Up { generation } => {
                inner.snapshot.clear_device_state();
                inner.session.clear();
                inner.transactions.reset().await;
                inner.emit(BridgeEvent::LinkUp { generation });
            }
            LinkEvent::Frame { frame, .. } => inner.router.handle_frame(frame),
            LinkEvent::CaptureComplete { generation } => match inner.snapshot.finish_capture() {
                Some(identity) => {
                    info!(
                        "Connected to {} '{}' ({} nodes known)",
                        identity.node_id,
                        identity.long_name,
                        inner.snapshot.node_count()
                    );
                    inner
                        .captures
                        .send_replace(Some((generation, identity.clone())));
                    inner.emit(BridgeEvent::CaptureComplete {
                        generation,
                        identity,
                    });
                }
                None => error!("Config capture finished without my_info; device not usable"),
            },
            LinkEvent::Down { generation, error } => {
                inner.session.clear();
                inner.transactions.reset().await;
                inner.emit(BridgeEvent::LinkDown { generation, error });
            }
        }
    }
    debug!("Bridge dispatcher stopped");
}

async fn sweep_deliveries(weak: Weak<Inner>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            break;
        };
        for update in inner.delivery.sweep(Instant::now()) {
            inner.emit(BridgeEvent::Delivery(update));
        }
    }
}

async fn run_traceroutes(weak: Weak<Inner>, mut interval_rx: watch::Receiver<u32>) {
    loop {
        let minutes = *interval_rx.borrow_and_update();
        if minutes == 0 {
            if interval_rx.changed().await.is_err() {
                break;
            }
            continue;
        }
        let period = Duration::from_secs(minutes as u64 * 60);
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            changed = interval_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        }
        let Some(inner) = weak.upgrade() else {
            break;
        };
        let bridge = MeshBridge { inner };
        let Some(identity) = bridge.local_node_info() else {
            debug!("Skipping automatic traceroute: device not ready");
            continue;
        };
        let target = bridge.inner.traceroutes.lock().ok().and_then(|sched| {
            sched.next_target(&bridge.all_nodes(), identity.node_num, Instant::now(), period)
        });
        match target {
            Some(node) => {
                if let Err(e) = bridge.send_traceroute(node, 0).await {
                    warn!("Automatic traceroute to {} failed: {}", node_id(node), e);
                }
            }
            None => debug!("No traceroute target available"),
        }
    }
}
