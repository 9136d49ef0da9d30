//! Third-party clients attached through the virtual node server.
mod common;

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use common::*;
use meshbridge::meshtastic::framer::{self, FrameBuffer};
use meshbridge::meshtastic::BROADCAST_ADDR;
use meshbridge::protobuf::meshtastic_generated as proto;
use meshbridge::virtual_node::VirtualNodeServer;
use prost::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use proto::from_radio::PayloadVariant as F;

struct TestClient {
    stream: TcpStream,
    framer: FrameBuffer,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.expect("connect to virtual node"),
            framer: FrameBuffer::new(),
        }
    }

    async fn send(&mut self, variant: proto::to_radio::PayloadVariant) {
        let bytes = framer::encode(&proto::ToRadio {
            payload_variant: Some(variant),
        })
        .expect("encode");
        self.stream.write_all(&bytes).await.expect("client write");
    }

    async fn next(&mut self) -> F {
        tokio::time::timeout(STEP, async {
            let mut buf = [0u8; 1024];
            loop {
                if let Some(frame) = self
                    .framer
                    .next_frame::<proto::FromRadio>()
                    .expect("server wrote a malformed frame")
                {
                    return frame.message.payload_variant.expect("empty FromRadio");
                }
                let n = self.stream.read(&mut buf).await.expect("client read");
                assert!(n > 0, "server closed the connection");
                self.framer.push(&buf[..n]);
            }
        })
        .await
        .expect("no frame from server in time")
    }

    /// Request a config replay and collect it up to the completion marker.
    async fn want_config(&mut self, id: u32) -> Vec<F> {
        self.send(proto::to_radio::PayloadVariant::WantConfigId(id))
            .await;
        let mut frames = Vec::new();
        loop {
            let frame = self.next().await;
            if frame == F::ConfigCompleteId(id) {
                return frames;
            }
            frames.push(frame);
        }
    }
}

async fn wait_for_clients(server: &VirtualNodeServer, count: usize) {
    tokio::time::timeout(STEP, async {
        while server.client_count() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("expected {} clients, have {}", count, server.client_count()));
}

fn text_packet(from: u32, to: u32, id: u32, text: &'static str) -> proto::MeshPacket {
    proto::MeshPacket {
        from,
        to,
        id,
        payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
            portnum: proto::PortNum::TextMessageApp as i32,
            payload: Bytes::from_static(text.as_bytes()),
            ..Default::default()
        })),
        ..Default::default()
    }
}

#[tokio::test]
async fn client_receives_config_replay() {
    let cfg = test_config();
    let Rig { bridge, .. } = connected_rig(cfg.clone(), FIRMWARE).await;
    let server = VirtualNodeServer::new(bridge.clone(), cfg.virtual_node);
    let addr = server.start().await.expect("start");
    assert!(server.is_running());

    let mut client = TestClient::connect(addr).await;
    let frames = client.want_config(0x0bad_cafe).await;

    assert!(matches!(&frames[0], F::MyInfo(info) if info.my_node_num == LOCAL));
    assert!(matches!(&frames[1], F::NodeInfo(n) if n.num == LOCAL));
    assert!(frames.iter().any(|f| matches!(f, F::Metadata(m) if m.firmware_version == FIRMWARE)));
    assert!(frames.iter().any(|f| matches!(f, F::Channel(c) if c.index == 0)));
    assert!(frames.iter().any(|f| matches!(f, F::Config(_))));
    assert!(matches!(frames.last(), Some(F::NodeInfo(n)) if n.num == REMOTE));

    let details = server.client_details();
    assert_eq!(details.len(), 1);
    assert!(!details[0].admin_commands_allowed);
}

#[tokio::test]
async fn fan_out_counts_follow_connected_clients() {
    let cfg = test_config();
    let Rig { bridge, .. } = connected_rig(cfg.clone(), FIRMWARE).await;
    let server = VirtualNodeServer::new(bridge, cfg.virtual_node);
    let addr = server.start().await.expect("start");

    let mut a = TestClient::connect(addr).await;
    let b = TestClient::connect(addr).await;
    wait_for_clients(&server, 2).await;

    let notice = proto::FromRadio {
        id: 0,
        payload_variant: Some(F::QueueStatus(proto::QueueStatus {
            free: 8,
            maxlen: 16,
            ..Default::default()
        })),
    };
    assert_eq!(server.broadcast_to_clients(&notice), 2);
    assert!(matches!(a.next().await, F::QueueStatus(q) if q.free == 8));

    drop(b);
    wait_for_clients(&server, 1).await;
    assert_eq!(server.broadcast_to_clients(&notice), 1);
}

#[tokio::test]
async fn mesh_traffic_reaches_every_client() {
    let cfg = test_config();
    let Rig {
        bridge, mut device, ..
    } = connected_rig(cfg.clone(), FIRMWARE).await;
    let server = VirtualNodeServer::new(bridge, cfg.virtual_node);
    let addr = server.start().await.expect("start");

    let mut a = TestClient::connect(addr).await;
    let mut b = TestClient::connect(addr).await;
    wait_for_clients(&server, 2).await;

    device
        .send_packet(text_packet(REMOTE, BROADCAST_ADDR, 0x5150, "hi all"))
        .await;
    for client in [&mut a, &mut b] {
        match client.next().await {
            F::Packet(p) => {
                assert_eq!(p.id, 0x5150);
                assert_eq!(p.from, REMOTE);
            }
            other => panic!("expected mesh packet, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn client_packets_are_forwarded_to_the_device() {
    let cfg = test_config();
    let Rig {
        bridge, mut device, ..
    } = connected_rig(cfg.clone(), FIRMWARE).await;
    let server = VirtualNodeServer::new(bridge.clone(), cfg.virtual_node);
    let addr = server.start().await.expect("start");

    let mut client = TestClient::connect(addr).await;
    client
        .send(proto::to_radio::PayloadVariant::Packet(text_packet(
            0,
            REMOTE,
            0,
            "from the app",
        )))
        .await;

    let packet = device.next_packet().await;
    assert_ne!(packet.id, 0);
    assert_eq!(packet.to, REMOTE);
    match &packet.payload_variant {
        Some(proto::mesh_packet::PayloadVariant::Decoded(d)) => {
            assert_eq!(d.payload.as_ref(), b"from the app")
        }
        other => panic!("expected decoded text, got {:?}", other),
    }
    // Text from clients is delivery-tracked like our own.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(bridge.delivery_state(packet.id).is_some());
}

#[tokio::test]
async fn admin_packets_rejected_without_permission() {
    let cfg = test_config();
    let Rig {
        bridge, mut device, ..
    } = connected_rig(cfg.clone(), FIRMWARE).await;
    let server = VirtualNodeServer::new(bridge, cfg.virtual_node);
    let addr = server.start().await.expect("start");

    let mut client = TestClient::connect(addr).await;
    let request = admin(proto::admin_message::PayloadVariant::RebootSeconds(1));
    client
        .send(proto::to_radio::PayloadVariant::Packet(proto::MeshPacket {
            to: LOCAL,
            id: 0x00c0_ffee,
            payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: proto::PortNum::AdminApp as i32,
                payload: Bytes::from(request.encode_to_vec()),
                ..Default::default()
            })),
            ..Default::default()
        }))
        .await;

    match client.next().await {
        F::Packet(p) => {
            let data = match p.payload_variant {
                Some(proto::mesh_packet::PayloadVariant::Decoded(d)) => d,
                other => panic!("expected decoded reply, got {:?}", other),
            };
            assert_eq!(data.portnum, proto::PortNum::RoutingApp as i32);
            assert_eq!(data.request_id, 0x00c0_ffee);
            let routing = proto::Routing::decode(data.payload).expect("routing");
            assert_eq!(
                routing.variant,
                Some(proto::routing::Variant::ErrorReason(
                    proto::routing::Error::NotAuthorized as i32
                ))
            );
        }
        other => panic!("expected routing reply, got {:?}", other),
    }
    assert!(device.stays_quiet(Duration::from_millis(150)).await);
}

#[tokio::test]
async fn admin_packets_forwarded_when_allowed() {
    let mut cfg = test_config();
    cfg.virtual_node.allow_admin_commands = true;
    let Rig {
        bridge, mut device, ..
    } = connected_rig(cfg.clone(), FIRMWARE).await;
    let server = VirtualNodeServer::new(bridge, cfg.virtual_node);
    let addr = server.start().await.expect("start");

    let mut client = TestClient::connect(addr).await;
    let request = admin(proto::admin_message::PayloadVariant::GetOwnerRequest(true));
    client
        .send(proto::to_radio::PayloadVariant::Packet(proto::MeshPacket {
            to: LOCAL,
            id: 77,
            payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: proto::PortNum::AdminApp as i32,
                payload: Bytes::from(request.encode_to_vec()),
                want_response: true,
                ..Default::default()
            })),
            ..Default::default()
        }))
        .await;
    let (packet, msg) = device.expect_admin().await;
    assert_eq!(packet.id, 77);
    assert_eq!(msg, request);
}

#[tokio::test]
async fn stop_disconnects_clients() {
    let cfg = test_config();
    let Rig { bridge, .. } = connected_rig(cfg.clone(), FIRMWARE).await;
    let server = VirtualNodeServer::new(bridge, cfg.virtual_node);
    let addr = server.start().await.expect("start");
    assert_eq!(server.local_addr(), Some(addr));

    let mut client = TestClient::connect(addr).await;
    wait_for_clients(&server, 1).await;
    server.stop();
    assert!(!server.is_running());
    assert_eq!(server.client_count(), 0);

    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(STEP, client.stream.read(&mut buf))
        .await
        .expect("socket closed promptly")
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn clients_survive_device_disconnect() {
    let cfg = test_config();
    let Rig { bridge, .. } = connected_rig(cfg.clone(), FIRMWARE).await;
    let server = VirtualNodeServer::new(bridge.clone(), cfg.virtual_node);
    let addr = server.start().await.expect("start");

    let mut client = TestClient::connect(addr).await;
    wait_for_clients(&server, 1).await;
    bridge.user_disconnect().await;

    // Still attached; the replay is now only the completion marker.
    let frames = client.want_config(5).await;
    assert!(frames.is_empty());
    assert_eq!(server.client_count(), 1);
}

#[tokio::test]
async fn stalled_client_is_disconnected() {
    let mut cfg = test_config();
    cfg.virtual_node.client_queue_len = 4;
    let Rig { bridge, .. } = connected_rig(cfg.clone(), FIRMWARE).await;
    let server = VirtualNodeServer::new(bridge, cfg.virtual_node);
    let addr = server.start().await.expect("start");

    // Never reads until the server gives up on it.
    let mut stalled = TestClient::connect(addr).await;
    wait_for_clients(&server, 1).await;

    let bulky = proto::FromRadio {
        id: 0,
        payload_variant: Some(F::Packet(proto::MeshPacket {
            from: REMOTE,
            to: BROADCAST_ADDR,
            id: 0x0b1b,
            payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: proto::PortNum::TextMessageApp as i32,
                payload: Bytes::from(vec![b'z'; 400]),
                ..Default::default()
            })),
            ..Default::default()
        })),
    };
    let mut sent = 0u32;
    while server.client_count() > 0 {
        assert!(sent < 500_000, "stalled client was never dropped");
        server.broadcast_to_clients(&bulky);
        sent += 1;
        tokio::task::yield_now().await;
    }

    // Draining what was already written must end in EOF or a reset.
    let closed = tokio::time::timeout(STEP, async {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match stalled.stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "socket of the dropped client is still open");
}
