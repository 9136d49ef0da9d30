//! Correlated admin requests against local and remote nodes, with session passkeys.
mod common;

use std::time::Duration;

use bytes::Bytes;
use common::*;
use meshbridge::bridge::BridgeError;
use meshbridge::meshtastic::transport::TransportError;
use meshbridge::metrics;
use meshbridge::protobuf::meshtastic_generated as proto;
use proto::admin_message::{ConfigType, PayloadVariant as A};

const PASSKEY: &[u8] = b"\x01\x02\x03\x04\x05\x06\x07\x08";

fn lora(hop_limit: u32) -> proto::Config {
    proto::Config {
        payload_variant: Some(proto::config::PayloadVariant::Lora(
            proto::config::LoRaConfig {
                hop_limit,
                ..Default::default()
            },
        )),
    }
}

/// Answer a session key request the way firmware does: the passkey rides on a
/// config response.
async fn grant_passkey(device: &mut FakeDevice) {
    let (request, msg) = device.expect_admin().await;
    assert_eq!(request.to, REMOTE);
    assert_eq!(
        msg.payload_variant,
        Some(A::GetConfigRequest(ConfigType::SessionkeyConfig as i32))
    );
    let mut reply = admin(A::GetConfigResponse(proto::Config {
        payload_variant: Some(proto::config::PayloadVariant::Sessionkey(
            proto::config::SessionkeyConfig::default(),
        )),
    }));
    reply.session_passkey = Bytes::from_static(PASSKEY);
    device.reply_admin(REMOTE, &request, reply).await;
}

#[tokio::test]
async fn remote_config_fetches_passkey_then_config() {
    let Rig {
        bridge, mut device, ..
    } = connected_rig(test_config(), FIRMWARE).await;

    let b = bridge.clone();
    let task =
        tokio::spawn(async move { b.request_remote_config(REMOTE, ConfigType::LoraConfig).await });

    grant_passkey(&mut device).await;
    let (request, msg) = device.expect_admin().await;
    assert_eq!(request.to, REMOTE);
    assert!(request.want_ack);
    assert!(request.pki_encrypted);
    assert_eq!(msg.session_passkey.as_ref(), PASSKEY);
    assert_eq!(
        msg.payload_variant,
        Some(A::GetConfigRequest(ConfigType::LoraConfig as i32))
    );
    device
        .reply_admin(REMOTE, &request, admin(A::GetConfigResponse(lora(5))))
        .await;

    let config = task.await.unwrap().expect("remote config");
    assert_eq!(config, lora(5));
    // Exactly two admin frames went out.
    assert!(device.stays_quiet(Duration::from_millis(150)).await);
    assert!(bridge.session_passkey(REMOTE).is_some());
}

#[tokio::test]
async fn cached_passkey_is_reused() {
    let Rig {
        bridge, mut device, ..
    } = connected_rig(test_config(), FIRMWARE).await;

    let b = bridge.clone();
    let first = tokio::spawn(async move { b.request_remote_owner(REMOTE).await });
    grant_passkey(&mut device).await;
    let (request, _) = device.expect_admin().await;
    let owner = proto::User {
        long_name: "Hilltop Relay".into(),
        ..Default::default()
    };
    device
        .reply_admin(REMOTE, &request, admin(A::GetOwnerResponse(owner.clone())))
        .await;
    assert_eq!(first.await.unwrap().expect("owner"), owner);

    // Second request goes straight out with the cached key.
    let b = bridge.clone();
    let second = tokio::spawn(async move { b.request_device_metadata(REMOTE).await });
    let (request, msg) = device.expect_admin().await;
    assert_eq!(msg.payload_variant, Some(A::GetDeviceMetadataRequest(true)));
    assert_eq!(msg.session_passkey.as_ref(), PASSKEY);
    let metadata = proto::DeviceMetadata {
        firmware_version: "2.5.9".into(),
        ..Default::default()
    };
    device
        .reply_admin(
            REMOTE,
            &request,
            admin(A::GetDeviceMetadataResponse(metadata.clone())),
        )
        .await;
    assert_eq!(second.await.unwrap().expect("metadata"), metadata);
}

#[tokio::test]
async fn concurrent_requests_share_one_passkey_request() {
    let Rig {
        bridge, mut device, ..
    } = connected_rig(test_config(), FIRMWARE).await;

    let (b1, b2) = (bridge.clone(), bridge.clone());
    let t1 = tokio::spawn(async move { b1.request_remote_owner(REMOTE).await });
    let t2 = tokio::spawn(async move { b2.request_remote_owner(REMOTE).await });

    grant_passkey(&mut device).await;
    for _ in 0..2 {
        let (request, msg) = device.expect_admin().await;
        assert_eq!(msg.payload_variant, Some(A::GetOwnerRequest(true)));
        assert_eq!(msg.session_passkey.as_ref(), PASSKEY);
        device
            .reply_admin(
                REMOTE,
                &request,
                admin(A::GetOwnerResponse(proto::User::default())),
            )
            .await;
    }
    assert!(t1.await.unwrap().is_ok());
    assert!(t2.await.unwrap().is_ok());
    assert!(device.stays_quiet(Duration::from_millis(150)).await);
}

#[tokio::test]
async fn remote_channel_request_is_one_based() {
    let Rig {
        bridge, mut device, ..
    } = connected_rig(test_config(), FIRMWARE).await;

    let b = bridge.clone();
    let task = tokio::spawn(async move { b.request_remote_channel(REMOTE, 2).await });
    grant_passkey(&mut device).await;
    let (request, msg) = device.expect_admin().await;
    assert_eq!(msg.payload_variant, Some(A::GetChannelRequest(3)));
    let channel = proto::Channel {
        index: 2,
        ..Default::default()
    };
    device
        .reply_admin(REMOTE, &request, admin(A::GetChannelResponse(channel.clone())))
        .await;
    assert_eq!(task.await.unwrap().expect("channel"), channel);
}

#[tokio::test]
async fn late_response_is_discarded() {
    let Rig {
        bridge, mut device, ..
    } = connected_rig(test_config(), FIRMWARE).await;
    let late_before = metrics::snapshot().late_responses;

    let b = bridge.clone();
    let task = tokio::spawn(async move { b.request_config(ConfigType::LoraConfig).await });
    let (request, msg) = device.expect_admin().await;
    assert_eq!(request.to, LOCAL);
    assert!(!request.pki_encrypted);
    assert_eq!(
        msg.payload_variant,
        Some(A::GetConfigRequest(ConfigType::LoraConfig as i32))
    );

    match task.await.unwrap() {
        Err(BridgeError::Timeout { request_id, .. }) => assert_eq!(request_id, request.id),
        other => panic!("expected timeout, got {:?}", other),
    }
    device
        .reply_admin(LOCAL, &request, admin(A::GetConfigResponse(lora(7))))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(metrics::snapshot().late_responses > late_before);
    assert_eq!(bridge.connection_status().pending_requests, 0);
    // The stale answer did not leak into the snapshot.
    assert!(!bridge.device_config().configs.contains(&std::sync::Arc::new(lora(7))));
}

#[tokio::test]
async fn rejected_passkey_is_dropped() {
    let Rig {
        bridge, mut device, ..
    } = connected_rig(test_config(), FIRMWARE).await;

    let b = bridge.clone();
    let task = tokio::spawn(async move { b.request_remote_owner(REMOTE).await });
    grant_passkey(&mut device).await;
    let (request, _) = device.expect_admin().await;
    device
        .send_routing(REMOTE, request.id, proto::routing::Error::AdminBadSessionKey)
        .await;

    match task.await.unwrap() {
        Err(BridgeError::PasskeyUnavailable { reason, .. }) => {
            assert_eq!(reason, "ADMIN_BAD_SESSION_KEY")
        }
        other => panic!("expected passkey error, got {:?}", other),
    }
    assert!(bridge.session_passkey(REMOTE).is_none());
}

#[tokio::test]
async fn old_firmware_cannot_use_passkeys() {
    let Rig {
        bridge, mut device, ..
    } = connected_rig(test_config(), "2.3.15.deb7c27").await;

    match bridge
        .request_remote_config(REMOTE, ConfigType::DeviceConfig)
        .await
    {
        Err(BridgeError::FirmwareUnsupported { feature, .. }) => {
            assert_eq!(feature, "session passkeys")
        }
        other => panic!("expected firmware error, got {:?}", other),
    }
    assert!(device.stays_quiet(Duration::from_millis(150)).await);
}

#[tokio::test]
async fn user_disconnect_cancels_pending_requests() {
    let Rig {
        bridge, mut device, ..
    } = connected_rig(test_config(), FIRMWARE).await;

    let b = bridge.clone();
    let task = tokio::spawn(async move { b.request_config(ConfigType::DeviceConfig).await });
    device.expect_admin().await;
    bridge.user_disconnect().await;

    match task.await.unwrap() {
        Err(BridgeError::Transport(TransportError::Disconnected)) => {}
        other => panic!("expected cancellation, got {:?}", other),
    }
    assert_eq!(bridge.connection_status().pending_requests, 0);
}

#[tokio::test]
async fn local_requests_need_no_passkey() {
    let Rig {
        bridge, mut device, ..
    } = connected_rig(test_config(), FIRMWARE).await;

    let b = bridge.clone();
    let task = tokio::spawn(async move { b.request_remote_config(LOCAL, ConfigType::LoraConfig).await });
    let (request, msg) = device.expect_admin().await;
    assert!(msg.session_passkey.is_empty());
    device
        .reply_admin(LOCAL, &request, admin(A::GetConfigResponse(lora(4))))
        .await;
    assert_eq!(task.await.unwrap().expect("local config"), lora(4));
    assert!(bridge.session_passkey(LOCAL).is_none());
}
