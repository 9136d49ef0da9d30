//! Inbound frame dispatch.
//!
//! Every `FromRadio` frame from the device passes through [`PacketRouter::handle_frame`].
//! Device-state frames update the snapshot; mesh packets are routed by port number to the
//! correlation tracker, session cache, delivery tracker and persistence. Nothing here is
//! fatal: payloads that fail to decode and unknown ports are logged and dropped.
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use log::{debug, info, trace, warn};
use prost::Message;
use tokio::sync::broadcast;

use super::correlation::RequestTracker;
use super::delivery::{DeliveryTracker, DeliveryUpdate};
use super::events::BridgeEvent;
use super::error::BridgeError;
use super::session::SessionManager;
use super::snapshot::DeviceSnapshot;
use crate::logutil::{node_id, truncate_for_log};
use crate::meshtastic::framer::{self, Frame};
use crate::protobuf::meshtastic_generated as proto;
use crate::storage::{
    Direction, NeighborLink, NeighborRecord, NodeRecord, Persistence, StoredMessage,
    TracerouteRecord,
};
use proto::from_radio::PayloadVariant as FromRadioVariant;
use proto::mesh_packet::PayloadVariant as PacketVariant;

/// Human-readable routing error name (`NO_ROUTE`, ...).
pub fn routing_error_name(code: i32) -> String {
    proto::routing::Error::try_from(code)
        .map(|e| e.as_str_name().to_string())
        .unwrap_or_else(|_| format!("ROUTING_ERROR_{}", code))
}

/// Traceroute SNR values travel as dB * 4.
fn snr_db(raw: &[i32]) -> Vec<f32> {
    raw.iter().map(|v| *v as f32 / 4.0).collect()
}

#[derive(Clone)]
pub struct PacketRouter {
    snapshot: DeviceSnapshot,
    tracker: RequestTracker,
    session: SessionManager,
    delivery: Arc<DeliveryTracker>,
    persistence: Arc<dyn Persistence>,
    events: broadcast::Sender<BridgeEvent>,
    mesh_feed: broadcast::Sender<Bytes>,
}

impl PacketRouter {
    pub fn new(
        snapshot: DeviceSnapshot,
        tracker: RequestTracker,
        session: SessionManager,
        delivery: Arc<DeliveryTracker>,
        persistence: Arc<dyn Persistence>,
        events: broadcast::Sender<BridgeEvent>,
        mesh_feed: broadcast::Sender<Bytes>,
    ) -> Self {
        Self {
            snapshot,
            tracker,
            session,
            delivery,
            persistence,
            events,
            mesh_feed,
        }
    }

    fn emit(&self, event: BridgeEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn emit_delivery(&self, update: Option<DeliveryUpdate>) {
        if let Some(u) = update {
            self.emit(BridgeEvent::Delivery(u));
        }
    }

    /// Pass a frame on to attached virtual clients.
    fn feed(&self, raw: &Bytes) {
        if self.mesh_feed.receiver_count() == 0 {
            return;
        }
        match framer::encode_raw(raw) {
            Ok(frame) => {
                let _ = self.mesh_feed.send(frame);
            }
            Err(e) => warn!("Not forwarding frame to virtual clients: {}", e),
        }
    }

    fn persist_node(&self, info: &proto::NodeInfo) {
        if let Err(e) = self.persistence.upsert_node(&NodeRecord::from_node_info(info)) {
            warn!("Failed to persist node {}: {}", node_id(info.num), e);
        }
    }

    pub fn handle_frame(&self, frame: Frame<proto::FromRadio>) {
        let Frame { message, raw } = frame;
        let Some(variant) = message.payload_variant else {
            trace!("Empty FromRadio frame");
            return;
        };
        match variant {
            FromRadioVariant::Packet(packet) => {
                self.handle_packet(&packet);
                self.feed(&raw);
            }
            FromRadioVariant::MyInfo(info) => {
                info!("Local node is {}", node_id(info.my_node_num));
                self.snapshot.set_my_info(info, raw);
            }
            FromRadioVariant::NodeInfo(info) => {
                trace!("NodeInfo for {}", node_id(info.num));
                self.persist_node(&info);
                let num = info.num;
                self.snapshot.upsert_node(info, Some(raw.clone()));
                self.emit(BridgeEvent::NodeUpdated(num));
                self.feed(&raw);
            }
            FromRadioVariant::Config(config) => self.snapshot.set_config(config, Some(raw)),
            FromRadioVariant::ModuleConfig(config) => {
                self.snapshot.set_module_config(config, Some(raw))
            }
            FromRadioVariant::Channel(channel) => self.snapshot.set_channel(channel, Some(raw)),
            FromRadioVariant::Metadata(metadata) => {
                info!("Device firmware {}", metadata.firmware_version);
                self.snapshot.set_metadata(metadata, raw);
            }
            FromRadioVariant::ConfigCompleteId(id) => {
                debug!("config_complete_id 0x{:08x}", id);
            }
            FromRadioVariant::Rebooted(_) => {
                warn!("Device reports it rebooted");
            }
            FromRadioVariant::QueueStatus(status) => {
                if status.res != 0 && status.mesh_packet_id != 0 {
                    warn!(
                        "Device rejected packet 0x{:08x} (res={}, free={}/{})",
                        status.mesh_packet_id, status.res, status.free, status.maxlen
                    );
                    let update = self.delivery.on_routing_error(
                        status.mesh_packet_id,
                        &format!("device queue rejected packet (res={})", status.res),
                    );
                    self.emit_delivery(update);
                }
                self.feed(&raw);
            }
        }
    }

    fn handle_packet(&self, packet: &proto::MeshPacket) {
        self.touch_node(packet);
        let data = match &packet.payload_variant {
            Some(PacketVariant::Decoded(data)) => data,
            Some(PacketVariant::Encrypted(_)) => {
                trace!(
                    "Encrypted packet 0x{:08x} from {} (no key)",
                    packet.id,
                    node_id(packet.from)
                );
                return;
            }
            None => return,
        };
        let port = proto::PortNum::try_from(data.portnum).unwrap_or(proto::PortNum::UnknownApp);
        match port {
            proto::PortNum::TextMessageApp => self.on_text(packet, data),
            proto::PortNum::RoutingApp => self.on_routing(packet, data),
            proto::PortNum::AdminApp => self.on_admin(packet, data),
            proto::PortNum::NodeinfoApp => self.on_user(packet, data),
            proto::PortNum::PositionApp => self.on_position(packet, data),
            proto::PortNum::TelemetryApp => self.on_telemetry(packet, data),
            proto::PortNum::NeighborinfoApp => self.on_neighbor_info(packet, data),
            proto::PortNum::TracerouteApp => self.on_traceroute(packet, data),
            _ => debug!(
                "Dropping packet 0x{:08x} from {} on unhandled port {}",
                packet.id,
                node_id(packet.from),
                data.portnum
            ),
        }
    }

    /// Refresh last-heard and link quality for the sender.
    fn touch_node(&self, packet: &proto::MeshPacket) {
        if packet.from == 0 {
            return;
        }
        let heard = if packet.rx_time != 0 {
            packet.rx_time
        } else {
            Utc::now().timestamp() as u32
        };
        self.snapshot.update_node(packet.from, |n| {
            n.last_heard = heard;
            if packet.rx_snr != 0.0 {
                n.snr = packet.rx_snr;
            }
            if packet.hop_start > 0 {
                n.hops_away = packet.hop_start.checked_sub(packet.hop_limit);
            }
            n.via_mqtt = packet.via_mqtt;
        });
    }

    fn decode<M: Message + Default>(&self, packet: &proto::MeshPacket, payload: &Bytes) -> Option<M> {
        match M::decode(payload.clone()) {
            Ok(m) => Some(m),
            Err(e) => {
                warn!(
                    "Undecodable payload in packet 0x{:08x} from {}: {}",
                    packet.id,
                    node_id(packet.from),
                    e
                );
                None
            }
        }
    }

    fn on_text(&self, packet: &proto::MeshPacket, data: &proto::Data) {
        let text = String::from_utf8_lossy(&data.payload).into_owned();
        info!(
            "Text 0x{:08x} {} -> {} ch{}: {}",
            packet.id,
            node_id(packet.from),
            node_id(packet.to),
            packet.channel,
            truncate_for_log(&text, 80)
        );
        let local = self.snapshot.my_node_num();
        // A reply from someone else proves they received the original.
        if data.reply_id != 0 && local != Some(packet.from) {
            let update = self.delivery.on_ack(data.reply_id, packet.from, local);
            self.emit_delivery(update);
        }
        let message = StoredMessage {
            packet_id: packet.id,
            from: packet.from,
            to: packet.to,
            channel: packet.channel,
            text,
            direction: Direction::Inbound,
            reply_id: (data.reply_id != 0).then_some(data.reply_id),
            emoji: data.emoji != 0,
            user_id: None,
            rx_snr: (packet.rx_snr != 0.0).then_some(packet.rx_snr),
            hops_away: (packet.hop_start > 0)
                .then(|| packet.hop_start.saturating_sub(packet.hop_limit)),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.persistence.insert_message(&message) {
            warn!("Failed to persist message 0x{:08x}: {}", packet.id, e);
        }
        self.emit(BridgeEvent::TextReceived(message));
    }

    fn on_routing(&self, packet: &proto::MeshPacket, data: &proto::Data) {
        let Some(routing) = self.decode::<proto::Routing>(packet, &data.payload) else {
            return;
        };
        let code = match routing.variant {
            Some(proto::routing::Variant::ErrorReason(code)) => code,
            Some(_) => {
                trace!("Route discovery routing packet from {}", node_id(packet.from));
                return;
            }
            None => proto::routing::Error::None as i32,
        };
        let is_ack_priority = packet.priority == proto::mesh_packet::Priority::Ack as i32;
        let target = if data.request_id != 0 {
            data.request_id
        } else if is_ack_priority {
            data.reply_id
        } else {
            0
        };
        if target == 0 {
            trace!("Routing packet from {} without a target id", node_id(packet.from));
            return;
        }

        if code == proto::routing::Error::None as i32 {
            let local = self.snapshot.my_node_num();
            let update = self.delivery.on_ack(target, packet.from, local);
            self.emit_delivery(update);
            return;
        }

        let reason = routing_error_name(code);
        let update = self.delivery.on_routing_error(target, &reason);
        self.emit_delivery(update);

        let session_rejected = code == proto::routing::Error::AdminBadSessionKey as i32
            || code == proto::routing::Error::AdminPublicKeyUnauthorized as i32;
        let error = if session_rejected {
            let node = self
                .tracker
                .pending()
                .into_iter()
                .find(|p| p.request_id == target)
                .map(|p| p.destination)
                .unwrap_or(packet.from);
            self.session.invalidate(node);
            BridgeError::PasskeyUnavailable {
                node: node_id(node),
                reason: reason.clone(),
            }
        } else {
            BridgeError::Routing {
                reason: reason.clone(),
            }
        };
        if self.tracker.fail(target, error) {
            warn!(
                "Admin request 0x{:08x} failed: {} (reported by {})",
                target,
                reason,
                node_id(packet.from)
            );
        }
    }

    fn on_admin(&self, packet: &proto::MeshPacket, data: &proto::Data) {
        let Some(admin) = self.decode::<proto::AdminMessage>(packet, &data.payload) else {
            return;
        };
        self.session.observe(packet.from, &admin);
        if data.request_id == 0 {
            debug!("Unsolicited admin message from {}", node_id(packet.from));
            return;
        }
        self.tracker.resolve(data.request_id, admin);
    }

    fn on_user(&self, packet: &proto::MeshPacket, data: &proto::Data) {
        let Some(user) = self.decode::<proto::User>(packet, &data.payload) else {
            return;
        };
        debug!(
            "User {} is '{}' ({})",
            node_id(packet.from),
            truncate_for_log(&user.long_name, 40),
            truncate_for_log(&user.short_name, 8)
        );
        let info = self.snapshot.update_node(packet.from, |n| n.user = Some(user));
        self.persist_node(&info);
        self.emit(BridgeEvent::NodeUpdated(packet.from));
    }

    fn on_position(&self, packet: &proto::MeshPacket, data: &proto::Data) {
        let Some(position) = self.decode::<proto::Position>(packet, &data.payload) else {
            return;
        };
        if position.latitude_i.is_none() && position.longitude_i.is_none() {
            trace!("Position from {} without coordinates", node_id(packet.from));
            return;
        }
        let info = self
            .snapshot
            .update_node(packet.from, |n| n.position = Some(position));
        self.persist_node(&info);
        self.emit(BridgeEvent::NodeUpdated(packet.from));
    }

    fn on_telemetry(&self, packet: &proto::MeshPacket, data: &proto::Data) {
        let Some(telemetry) = self.decode::<proto::Telemetry>(packet, &data.payload) else {
            return;
        };
        match telemetry.variant {
            Some(proto::telemetry::Variant::DeviceMetrics(metrics)) => {
                let info = self
                    .snapshot
                    .update_node(packet.from, |n| n.device_metrics = Some(metrics));
                self.persist_node(&info);
                self.emit(BridgeEvent::NodeUpdated(packet.from));
            }
            Some(_) => trace!("Environment telemetry from {}", node_id(packet.from)),
            None => {}
        }
    }

    fn on_neighbor_info(&self, packet: &proto::MeshPacket, data: &proto::Data) {
        let Some(report) = self.decode::<proto::NeighborInfo>(packet, &data.payload) else {
            return;
        };
        let reporter = if report.node_id != 0 {
            report.node_id
        } else {
            packet.from
        };
        let record = NeighborRecord {
            reporter,
            neighbors: report
                .neighbors
                .iter()
                .map(|n| NeighborLink {
                    node: n.node_id,
                    snr: n.snr,
                })
                .collect(),
            broadcast_interval_secs: report.node_broadcast_interval_secs,
            timestamp: Utc::now(),
        };
        debug!(
            "{} reports {} neighbors",
            node_id(reporter),
            record.neighbors.len()
        );
        if let Err(e) = self.persistence.insert_neighbor_info(&record) {
            warn!("Failed to persist neighbor info: {}", e);
        }
        self.emit(BridgeEvent::NeighborInfo(record));
    }

    fn on_traceroute(&self, packet: &proto::MeshPacket, data: &proto::Data) {
        if data.request_id == 0 {
            // Requests passing through or addressed to us are answered by the firmware.
            return;
        }
        let Some(route) = self.decode::<proto::RouteDiscovery>(packet, &data.payload) else {
            return;
        };
        let record = TracerouteRecord {
            request_id: data.request_id,
            from: packet.to,
            to: packet.from,
            route: route.route,
            route_back: route.route_back,
            snr_towards: snr_db(&route.snr_towards),
            snr_back: snr_db(&route.snr_back),
            timestamp: Utc::now(),
        };
        info!(
            "Traceroute to {}: {} hops out, {} back",
            node_id(record.to),
            record.route.len(),
            record.route_back.len()
        );
        if let Err(e) = self.persistence.insert_traceroute(&record) {
            warn!("Failed to persist traceroute: {}", e);
        }
        self.emit(BridgeEvent::Traceroute(record));
    }
}
