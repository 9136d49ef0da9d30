//! Per-client socket handling for the virtual node.
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::{ClientRegistry, VirtualClient};
use crate::bridge::MeshBridge;
use crate::logutil::node_id;
use crate::meshtastic::framer::{self, FrameBuffer};
use crate::protobuf::meshtastic_generated as proto;
use proto::to_radio::PayloadVariant as ToRadioVariant;

/// Run one client until it disconnects, fails to decode, or is dropped by the registry.
pub(super) async fn serve(
    stream: TcpStream,
    info: VirtualClient,
    bridge: MeshBridge,
    registry: Arc<ClientRegistry>,
    queue: mpsc::Receiver<Bytes>,
) {
    let (mut reader, writer) = stream.into_split();
    let (direct_tx, direct_rx) = mpsc::unbounded_channel::<Bytes>();
    let mut writer_task = tokio::spawn(write_loop(writer, queue, direct_rx));
    // The registry drops stalled clients by aborting this task; the writer must go with it
    // or the socket stays open behind a blocked write.
    let _writer_guard = AbortOnDrop(writer_task.abort_handle());

    let mut framer = FrameBuffer::new();
    let mut buf = [0u8; 1024];
    let reason: String = loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) => break "closed by client".into(),
                    Ok(n) => n,
                    Err(e) => break format!("read failed: {}", e),
                };
                framer.push(&buf[..n]);
                let mut failure = None;
                loop {
                    match framer.next_frame::<proto::ToRadio>() {
                        Ok(Some(frame)) => {
                            if matches!(frame.message.payload_variant, Some(ToRadioVariant::Disconnect(true))) {
                                failure = Some("client requested disconnect".to_string());
                                break;
                            }
                            for reply in handle_message(&bridge, &info, frame.message).await {
                                let _ = direct_tx.send(reply);
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            failure = Some(format!("protocol decode error: {}", e));
                            break;
                        }
                    }
                }
                if let Some(reason) = failure {
                    break reason;
                }
            }
            written = &mut writer_task => {
                break match written {
                    Ok(Ok(())) => "send queue closed".into(),
                    Ok(Err(e)) => format!("write failed: {}", e),
                    Err(e) => format!("writer task ended: {}", e),
                };
            }
        }
    };

    writer_task.abort();
    if registry.remove(info.connection_id) {
        info!(
            "Virtual client {} disconnected ({}): {}",
            info.peer, info.connection_id, reason
        );
    }
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::Receiver<Bytes>,
    mut direct: mpsc::UnboundedReceiver<Bytes>,
) -> Result<()> {
    loop {
        let frame = tokio::select! {
            biased;
            Some(f) = direct.recv() => f,
            Some(f) = queue.recv() => f,
            else => return Ok(()),
        };
        writer.write_all(&frame).await?;
    }
}

/// Frames to write straight back to the client in response to `message`.
async fn handle_message(
    bridge: &MeshBridge,
    info: &VirtualClient,
    message: proto::ToRadio,
) -> Vec<Bytes> {
    let Some(variant) = message.payload_variant else {
        return Vec::new();
    };
    match variant {
        ToRadioVariant::WantConfigId(config_id) => {
            let frames: Vec<Bytes> = bridge
                .replay_frames(config_id)
                .iter()
                .filter_map(|raw| match framer::encode_raw(raw) {
                    Ok(f) => Some(f),
                    Err(e) => {
                        warn!("Skipping oversized replay frame: {}", e);
                        None
                    }
                })
                .collect();
            debug!(
                "Replaying {} config frames to virtual client {} (want_config_id=0x{:08x})",
                frames.len(),
                info.peer,
                config_id
            );
            frames
        }
        ToRadioVariant::Packet(packet) => handle_packet(bridge, info, packet).await,
        ToRadioVariant::Heartbeat(_) | ToRadioVariant::Disconnect(_) => Vec::new(),
    }
}

fn is_admin(packet: &proto::MeshPacket) -> bool {
    matches!(
        &packet.payload_variant,
        Some(proto::mesh_packet::PayloadVariant::Decoded(d))
            if d.portnum == proto::PortNum::AdminApp as i32
    )
}

async fn handle_packet(
    bridge: &MeshBridge,
    info: &VirtualClient,
    packet: proto::MeshPacket,
) -> Vec<Bytes> {
    if is_admin(&packet) && !info.admin_commands_allowed {
        warn!(
            target: "security",
            "Rejected admin packet 0x{:08x} for {} from virtual client {}",
            packet.id,
            node_id(packet.to),
            info.peer
        );
        return not_authorized(bridge, &packet).into_iter().collect();
    }
    match bridge.forward_client_packet(packet).await {
        Ok(id) => debug!("Forwarded packet 0x{:08x} from virtual client {}", id, info.peer),
        Err(e) => warn!("Could not forward packet from virtual client {}: {}", info.peer, e),
    }
    Vec::new()
}

/// Routing NOT_AUTHORIZED reply addressed back to the client, as the radio itself would
/// answer a refused admin request.
fn not_authorized(bridge: &MeshBridge, request: &proto::MeshPacket) -> Option<Bytes> {
    let local = bridge.local_node_info().map(|i| i.node_num).unwrap_or(0);
    let routing = proto::Routing {
        variant: Some(proto::routing::Variant::ErrorReason(
            proto::routing::Error::NotAuthorized as i32,
        )),
    };
    let reply = proto::FromRadio {
        id: 0,
        payload_variant: Some(proto::from_radio::PayloadVariant::Packet(proto::MeshPacket {
            from: local,
            to: request.from,
            channel: request.channel,
            id: crate::meshtastic::new_packet_id(),
            payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: proto::PortNum::RoutingApp as i32,
                payload: prost::Message::encode_to_vec(&routing).into(),
                request_id: request.id,
                ..Default::default()
            })),
            ..Default::default()
        })),
    };
    match framer::encode(&reply) {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!("Could not encode NOT_AUTHORIZED reply: {}", e);
            None
        }
    }
}
