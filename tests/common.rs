//! Test utilities & fixtures.
//! A scripted radio on the far end of an in-memory duplex stream, plus helpers to stand
//! up a bridge that has already captured the device config.
#![allow(dead_code)] // Each test binary uses a different subset.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use prost::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, Mutex};

use meshbridge::bridge::MeshBridge;
use meshbridge::config::Config;
use meshbridge::meshtastic::framer::{self, FrameBuffer};
use meshbridge::meshtastic::link::{ConnectFuture, Connector, DeviceStream};
use meshbridge::protobuf::meshtastic_generated as proto;
use meshbridge::storage::MemoryStore;

pub const LOCAL: u32 = 0x0a0b_0c0d;
pub const REMOTE: u32 = 0x1122_3344;
pub const FIRMWARE: &str = "2.5.6.abcdef";
pub const STEP: Duration = Duration::from_secs(5);

/// Small timeouts and no heartbeat so tests stay quick and the wire stays quiet.
pub fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.device.reconnect_min_ms = 20;
    cfg.device.reconnect_max_ms = 80;
    cfg.device.connect_timeout_ms = 1000;
    cfg.device.heartbeat_secs = 0;
    cfg.requests.admin_timeout_secs = 1;
    cfg.delivery.sweep_interval_secs = 1;
    cfg.virtual_node.bind = "127.0.0.1".to_string();
    cfg.virtual_node.port = 0;
    cfg.logging.file = None;
    cfg.logging.security_file = None;
    cfg
}

/// Hands the bridge one end of a fresh duplex pipe per connection attempt, after
/// refusing the first `refusals` attempts.
pub struct DuplexConnector {
    streams: mpsc::UnboundedSender<DuplexStream>,
    refusals: AtomicUsize,
    attempts: Arc<AtomicUsize>,
}

impl Connector for DuplexConnector {
    fn open(&self) -> ConnectFuture {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refuse = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let streams = self.streams.clone();
        Box::pin(async move {
            if refuse {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "scripted refusal",
                ));
            }
            let (bridge_end, device_end) = tokio::io::duplex(64 * 1024);
            streams
                .send(device_end)
                .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "test ended"))?;
            Ok(Box::new(bridge_end) as DeviceStream)
        })
    }

    fn describe(&self) -> String {
        "duplex://test".to_string()
    }
}

/// Receives the device side of each connection the bridge opens.
pub struct DeviceAcceptor {
    streams: Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
    pub attempts: Arc<AtomicUsize>,
}

impl DeviceAcceptor {
    pub async fn accept(&self) -> FakeDevice {
        let stream = tokio::time::timeout(STEP, self.streams.lock().await.recv())
            .await
            .expect("bridge did not connect in time")
            .expect("connector dropped");
        FakeDevice::new(stream)
    }
}

pub fn duplex_connector(refusals: usize) -> (Arc<DuplexConnector>, DeviceAcceptor) {
    let (tx, rx) = mpsc::unbounded_channel();
    let attempts = Arc::new(AtomicUsize::new(0));
    (
        Arc::new(DuplexConnector {
            streams: tx,
            refusals: AtomicUsize::new(refusals),
            attempts: attempts.clone(),
        }),
        DeviceAcceptor {
            streams: Mutex::new(rx),
            attempts,
        },
    )
}

pub struct FakeDevice {
    stream: DuplexStream,
    framer: FrameBuffer,
    pub node_num: u32,
}

impl FakeDevice {
    fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            framer: FrameBuffer::new(),
            node_num: LOCAL,
        }
    }

    /// Next ToRadio written by the bridge, skipping heartbeats.
    pub async fn next_to_radio(&mut self) -> proto::ToRadio {
        tokio::time::timeout(STEP, async {
            let mut buf = [0u8; 1024];
            loop {
                if let Some(frame) = self
                    .framer
                    .next_frame::<proto::ToRadio>()
                    .expect("bridge wrote a malformed frame")
                {
                    if matches!(
                        frame.message.payload_variant,
                        Some(proto::to_radio::PayloadVariant::Heartbeat(_))
                    ) {
                        continue;
                    }
                    return frame.message;
                }
                let n = self.stream.read(&mut buf).await.expect("device read");
                assert!(n > 0, "bridge closed the link");
                self.framer.push(&buf[..n]);
            }
        })
        .await
        .expect("no frame from bridge in time")
    }

    /// True if the bridge writes nothing (besides heartbeats) within `wait`.
    pub async fn stays_quiet(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.next_to_radio()).await.is_err()
    }

    pub async fn next_packet(&mut self) -> proto::MeshPacket {
        match self.next_to_radio().await.payload_variant {
            Some(proto::to_radio::PayloadVariant::Packet(p)) => p,
            other => panic!("expected a packet, got {:?}", other),
        }
    }

    pub async fn expect_admin(&mut self) -> (proto::MeshPacket, proto::AdminMessage) {
        let packet = self.next_packet().await;
        let admin = match &packet.payload_variant {
            Some(proto::mesh_packet::PayloadVariant::Decoded(d))
                if d.portnum == proto::PortNum::AdminApp as i32 =>
            {
                proto::AdminMessage::decode(d.payload.clone()).expect("admin payload")
            }
            other => panic!("expected an admin packet, got {:?}", other),
        };
        (packet, admin)
    }

    pub async fn send(&mut self, message: proto::FromRadio) {
        let bytes = framer::encode(&message).expect("encode FromRadio");
        self.stream.write_all(&bytes).await.expect("device write");
    }

    pub async fn send_variant(&mut self, variant: proto::from_radio::PayloadVariant) {
        self.send(proto::FromRadio {
            id: 0,
            payload_variant: Some(variant),
        })
        .await;
    }

    pub async fn send_packet(&mut self, packet: proto::MeshPacket) {
        self.send_variant(proto::from_radio::PayloadVariant::Packet(packet))
            .await;
    }

    /// Answer the bridge's `want_config_id` with a minimal config burst.
    pub async fn complete_handshake(&mut self, firmware: &str) -> u32 {
        use proto::from_radio::PayloadVariant as V;
        let config_id = match self.next_to_radio().await.payload_variant {
            Some(proto::to_radio::PayloadVariant::WantConfigId(id)) => id,
            other => panic!("expected want_config_id, got {:?}", other),
        };
        self.send_variant(V::MyInfo(proto::MyNodeInfo {
            my_node_num: self.node_num,
            reboot_count: 3,
            ..Default::default()
        }))
        .await;
        self.send_variant(V::NodeInfo(node_info(self.node_num, "Bridge Base", "BASE")))
            .await;
        self.send_variant(V::Metadata(proto::DeviceMetadata {
            firmware_version: firmware.to_string(),
            ..Default::default()
        }))
        .await;
        self.send_variant(V::Channel(proto::Channel {
            index: 0,
            role: proto::channel::Role::Primary as i32,
            settings: Some(proto::ChannelSettings {
                name: "LongFast".to_string(),
                ..Default::default()
            }),
        }))
        .await;
        self.send_variant(V::Config(proto::Config {
            payload_variant: Some(proto::config::PayloadVariant::Lora(
                proto::config::LoRaConfig {
                    hop_limit: 3,
                    ..Default::default()
                },
            )),
        }))
        .await;
        self.send_variant(V::NodeInfo(node_info(REMOTE, "Hilltop Relay", "HILL")))
            .await;
        self.send_variant(V::ConfigCompleteId(config_id)).await;
        config_id
    }

    /// Reply to an admin request from `from` with `response`.
    pub async fn reply_admin(
        &mut self,
        from: u32,
        request: &proto::MeshPacket,
        response: proto::AdminMessage,
    ) {
        self.send_packet(proto::MeshPacket {
            from,
            to: self.node_num,
            id: rand::random(),
            payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: proto::PortNum::AdminApp as i32,
                payload: Bytes::from(response.encode_to_vec()),
                request_id: request.id,
                ..Default::default()
            })),
            ..Default::default()
        })
        .await;
    }

    /// Routing packet from `from` about `packet_id` (`Error::None` is an ACK).
    pub async fn send_routing(&mut self, from: u32, packet_id: u32, error: proto::routing::Error) {
        let routing = proto::Routing {
            variant: Some(proto::routing::Variant::ErrorReason(error as i32)),
        };
        self.send_packet(proto::MeshPacket {
            from,
            to: self.node_num,
            id: rand::random(),
            payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: proto::PortNum::RoutingApp as i32,
                payload: Bytes::from(routing.encode_to_vec()),
                request_id: packet_id,
                ..Default::default()
            })),
            ..Default::default()
        })
        .await;
    }
}

pub fn node_info(num: u32, long: &str, short: &str) -> proto::NodeInfo {
    proto::NodeInfo {
        num,
        user: Some(proto::User {
            id: format!("!{:08x}", num),
            long_name: long.to_string(),
            short_name: short.to_string(),
            ..Default::default()
        }),
        last_heard: 1_700_000_000,
        ..Default::default()
    }
}

pub fn admin(variant: proto::admin_message::PayloadVariant) -> proto::AdminMessage {
    proto::AdminMessage {
        payload_variant: Some(variant),
        ..Default::default()
    }
}

pub struct Rig {
    pub bridge: MeshBridge,
    pub device: FakeDevice,
    pub acceptor: DeviceAcceptor,
    pub store: Arc<MemoryStore>,
}

/// A bridge connected to a fake device that has finished its config capture.
pub async fn connected_rig(config: Config, firmware: &str) -> Rig {
    let (connector, acceptor) = duplex_connector(0);
    let store = Arc::new(MemoryStore::new());
    let bridge = MeshBridge::with_connector(config, connector, store.clone());
    let mut capture = bridge.config_capture();
    bridge.connect().await;
    let mut device = acceptor.accept().await;
    device.complete_handshake(firmware).await;
    tokio::time::timeout(STEP, capture.next())
        .await
        .expect("capture did not complete")
        .expect("bridge dropped");
    Rig {
        bridge,
        device,
        acceptor,
        store,
    }
}
