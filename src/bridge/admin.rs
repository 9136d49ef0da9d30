//! Admin packet construction and request/response round trips.
use std::time::Duration;

use bytes::Bytes;
use log::debug;
use prost::Message;

use super::correlation::{RequestKind, RequestTracker};
use super::error::{BridgeError, BridgeResult};
use super::snapshot::DeviceSnapshot;
use crate::logutil::node_id;
use crate::meshtastic::new_packet_id;
use crate::meshtastic::transport::{ConnectionState, Transport, TransportError};
use crate::protobuf::meshtastic_generated as proto;

#[derive(Clone)]
pub struct AdminClient {
    transport: Transport,
    tracker: RequestTracker,
    snapshot: DeviceSnapshot,
    timeout: Duration,
    admin_channel: u32,
}

impl AdminClient {
    pub fn new(
        transport: Transport,
        tracker: RequestTracker,
        snapshot: DeviceSnapshot,
        timeout: Duration,
        admin_channel: u32,
    ) -> Self {
        Self {
            transport,
            tracker,
            snapshot,
            timeout,
            admin_channel,
        }
    }

    /// Node number of the attached device; needs at least `my_info` from the capture.
    pub fn local_node(&self) -> BridgeResult<u32> {
        if let Some(num) = self.snapshot.my_node_num() {
            return Ok(num);
        }
        match self.transport.state() {
            ConnectionState::Connected => Err(BridgeError::NotReady),
            state => Err(TransportError::NotConnected(state).into()),
        }
    }

    pub fn is_local(&self, node: u32) -> bool {
        self.snapshot.my_node_num() == Some(node)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn packet(
        &self,
        to: u32,
        admin: &proto::AdminMessage,
        id: u32,
        want_response: bool,
    ) -> proto::ToRadio {
        let remote = !self.is_local(to);
        let channel = if remote { self.admin_channel } else { 0 };
        let packet = proto::MeshPacket {
            to,
            channel,
            id,
            want_ack: remote,
            priority: proto::mesh_packet::Priority::Reliable as i32,
            // Without a dedicated admin channel, remote admin rides on PKI encryption.
            pki_encrypted: remote && self.admin_channel == 0,
            payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: proto::PortNum::AdminApp as i32,
                payload: Bytes::from(admin.encode_to_vec()),
                want_response,
                ..Default::default()
            })),
            ..Default::default()
        };
        proto::ToRadio {
            payload_variant: Some(proto::to_radio::PayloadVariant::Packet(packet)),
        }
    }

    /// Send an admin message without waiting for a reply. Returns the packet id.
    pub async fn send(&self, to: u32, admin: proto::AdminMessage) -> BridgeResult<u32> {
        let id = new_packet_id();
        self.transport.send(&self.packet(to, &admin, id, false)).await?;
        debug!("Sent admin packet 0x{:08x} to {}", id, node_id(to));
        Ok(id)
    }

    /// Send an admin request and wait for the response correlated by packet id.
    pub async fn roundtrip(
        &self,
        kind: RequestKind,
        to: u32,
        admin: proto::AdminMessage,
    ) -> BridgeResult<proto::AdminMessage> {
        let (id, handle) = self.tracker.register(kind, to, self.timeout);
        if let Err(e) = self.transport.send(&self.packet(to, &admin, id, true)).await {
            self.tracker.discard(id);
            return Err(e.into());
        }
        debug!("Sent {} request 0x{:08x} to {}", kind, id, node_id(to));
        handle.wait().await
    }
}
