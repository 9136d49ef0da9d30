//! Working copy of everything the device reported during config capture, plus node
//! records refreshed from mesh traffic.
//!
//! Records are held as `Arc`s and replaced whole; readers never observe a half-updated
//! node. Device frames are kept verbatim alongside the decoded value so virtual clients
//! receive exactly what the radio sent, including fields this crate does not model.
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;
use prost::Message;
use serde::Serialize;

use crate::logutil::node_id;
use crate::protobuf::meshtastic_generated as proto;
use proto::from_radio::PayloadVariant as FromRadioVariant;

/// Identity of the directly attached node, rebuilt on every successful capture.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalIdentity {
    pub node_num: u32,
    pub node_id: String,
    pub long_name: String,
    pub short_name: String,
    pub firmware_version: Option<String>,
    pub reboot_count: u32,
}

struct NodeEntry {
    info: Arc<proto::NodeInfo>,
    raw: Option<Bytes>,
}

#[derive(Default)]
struct State {
    my_info: Option<(proto::MyNodeInfo, Bytes)>,
    metadata: Option<(proto::DeviceMetadata, Bytes)>,
    nodes: HashMap<u32, NodeEntry>,
    channels: BTreeMap<i32, (Arc<proto::Channel>, Bytes)>,
    configs: BTreeMap<i32, (Arc<proto::Config>, Bytes)>,
    module_configs: BTreeMap<i32, (Arc<proto::ModuleConfig>, Bytes)>,
    identity: Option<Arc<LocalIdentity>>,
}

/// Device configuration as last captured or written.
#[derive(Debug, Clone, Default)]
pub struct DeviceConfigView {
    pub channels: Vec<Arc<proto::Channel>>,
    pub configs: Vec<Arc<proto::Config>>,
    pub module_configs: Vec<Arc<proto::ModuleConfig>>,
    pub metadata: Option<proto::DeviceMetadata>,
}

#[derive(Clone, Default)]
pub struct DeviceSnapshot {
    state: Arc<RwLock<State>>,
}

fn encode_from_radio(variant: FromRadioVariant) -> Bytes {
    Bytes::from(
        proto::FromRadio {
            id: 0,
            payload_variant: Some(variant),
        }
        .encode_to_vec(),
    )
}

/// Slot numbers follow `AdminMessage.ConfigType`.
pub fn config_slot(config: &proto::Config) -> Option<i32> {
    use proto::config::PayloadVariant as V;
    let slot = match config.payload_variant.as_ref()? {
        V::Device(_) => 0,
        V::Position(_) => 1,
        V::Power(_) => 2,
        V::Network(_) => 3,
        V::Display(_) => 4,
        V::Lora(_) => 5,
        V::Bluetooth(_) => 6,
        V::Security(_) => 7,
        V::Sessionkey(_) => 8,
    };
    Some(slot)
}

/// Slot numbers follow `AdminMessage.ModuleConfigType`.
pub fn module_config_slot(config: &proto::ModuleConfig) -> Option<i32> {
    use proto::module_config::PayloadVariant as V;
    let slot = match config.payload_variant.as_ref()? {
        V::Mqtt(_) => 0,
        V::Telemetry(_) => 5,
        V::NeighborInfo(_) => 9,
    };
    Some(slot)
}

impl DeviceSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Drop device-derived state (identity, channels, configs). Node records survive.
    pub fn clear_device_state(&self) {
        let mut st = self.write();
        st.my_info = None;
        st.metadata = None;
        st.channels.clear();
        st.configs.clear();
        st.module_configs.clear();
        st.identity = None;
    }

    pub fn set_my_info(&self, info: proto::MyNodeInfo, raw: Bytes) {
        self.write().my_info = Some((info, raw));
    }

    pub fn set_metadata(&self, metadata: proto::DeviceMetadata, raw: Bytes) {
        self.write().metadata = Some((metadata, raw));
    }

    pub fn set_channel(&self, channel: proto::Channel, raw: Option<Bytes>) {
        let raw = raw.unwrap_or_else(|| encode_from_radio(FromRadioVariant::Channel(channel.clone())));
        self.write()
            .channels
            .insert(channel.index, (Arc::new(channel), raw));
    }

    pub fn set_config(&self, config: proto::Config, raw: Option<Bytes>) {
        let Some(slot) = config_slot(&config) else {
            return;
        };
        let raw = raw.unwrap_or_else(|| encode_from_radio(FromRadioVariant::Config(config.clone())));
        self.write().configs.insert(slot, (Arc::new(config), raw));
    }

    pub fn set_module_config(&self, config: proto::ModuleConfig, raw: Option<Bytes>) {
        let Some(slot) = module_config_slot(&config) else {
            return;
        };
        let raw = raw
            .unwrap_or_else(|| encode_from_radio(FromRadioVariant::ModuleConfig(config.clone())));
        self.write()
            .module_configs
            .insert(slot, (Arc::new(config), raw));
    }

    /// Replace a node record wholesale (NodeInfo frame from the device).
    pub fn upsert_node(&self, info: proto::NodeInfo, raw: Option<Bytes>) -> Arc<proto::NodeInfo> {
        let info = Arc::new(info);
        self.write().nodes.insert(
            info.num,
            NodeEntry {
                info: info.clone(),
                raw,
            },
        );
        info
    }

    /// Copy-on-write update of one node; creates the record if it is new.
    pub fn update_node<F>(&self, num: u32, f: F) -> Arc<proto::NodeInfo>
    where
        F: FnOnce(&mut proto::NodeInfo),
    {
        let mut st = self.write();
        let mut next = st
            .nodes
            .get(&num)
            .map(|e| (*e.info).clone())
            .unwrap_or_else(|| proto::NodeInfo {
                num,
                ..Default::default()
            });
        f(&mut next);
        let info = Arc::new(next);
        st.nodes.insert(
            num,
            NodeEntry {
                info: info.clone(),
                raw: None,
            },
        );
        info
    }

    pub fn remove_node(&self, num: u32) -> bool {
        self.write().nodes.remove(&num).is_some()
    }

    /// Forget every node except the local one.
    pub fn retain_local_node(&self) -> usize {
        let mut st = self.write();
        let local = st.my_info.as_ref().map(|(i, _)| i.my_node_num);
        let before = st.nodes.len();
        st.nodes.retain(|num, _| Some(*num) == local);
        before - st.nodes.len()
    }

    /// Seed node records from persistence before the first capture.
    pub fn warm<I: IntoIterator<Item = proto::NodeInfo>>(&self, nodes: I) -> usize {
        let mut st = self.write();
        let mut added = 0;
        for info in nodes {
            if let std::collections::hash_map::Entry::Vacant(slot) = st.nodes.entry(info.num) {
                slot.insert(NodeEntry {
                    info: Arc::new(info),
                    raw: None,
                });
                added += 1;
            }
        }
        added
    }

    pub fn node(&self, num: u32) -> Option<Arc<proto::NodeInfo>> {
        self.read().nodes.get(&num).map(|e| e.info.clone())
    }

    /// All nodes, most recently heard first.
    pub fn nodes(&self) -> Vec<Arc<proto::NodeInfo>> {
        let mut nodes: Vec<_> = self.read().nodes.values().map(|e| e.info.clone()).collect();
        nodes.sort_by(|a, b| b.last_heard.cmp(&a.last_heard).then(a.num.cmp(&b.num)));
        nodes
    }

    pub fn node_count(&self) -> usize {
        self.read().nodes.len()
    }

    pub fn my_node_num(&self) -> Option<u32> {
        self.read().my_info.as_ref().map(|(i, _)| i.my_node_num)
    }

    pub fn metadata(&self) -> Option<proto::DeviceMetadata> {
        self.read().metadata.as_ref().map(|(m, _)| m.clone())
    }

    pub fn identity(&self) -> Option<Arc<LocalIdentity>> {
        self.read().identity.clone()
    }

    /// Build and install the local identity from captured state.
    pub fn finish_capture(&self) -> Option<Arc<LocalIdentity>> {
        let mut st = self.write();
        let (my_info, _) = st.my_info.as_ref()?;
        let node_num = my_info.my_node_num;
        let reboot_count = my_info.reboot_count;
        let user = st
            .nodes
            .get(&node_num)
            .and_then(|e| e.info.user.clone())
            .unwrap_or_default();
        let identity = Arc::new(LocalIdentity {
            node_num,
            node_id: node_id(node_num),
            long_name: user.long_name,
            short_name: user.short_name,
            firmware_version: st
                .metadata
                .as_ref()
                .map(|(m, _)| m.firmware_version.clone())
                .filter(|v| !v.is_empty()),
            reboot_count,
        });
        st.identity = Some(identity.clone());
        Some(identity)
    }

    pub fn device_config(&self) -> DeviceConfigView {
        let st = self.read();
        DeviceConfigView {
            channels: st.channels.values().map(|(c, _)| c.clone()).collect(),
            configs: st.configs.values().map(|(c, _)| c.clone()).collect(),
            module_configs: st.module_configs.values().map(|(c, _)| c.clone()).collect(),
            metadata: st.metadata.as_ref().map(|(m, _)| m.clone()),
        }
    }

    /// FromRadio payloads answering a client's `want_config_id`, in firmware order:
    /// my_info, own node, metadata, channels, configs, module configs, other nodes,
    /// then `config_complete_id`. Before a capture only the completion is returned.
    pub fn replay_frames(&self, config_id: u32) -> Vec<Bytes> {
        let st = self.read();
        let mut out = Vec::new();
        if let (Some(identity), Some((_, my_raw))) = (st.identity.as_ref(), st.my_info.as_ref()) {
            out.push(my_raw.clone());
            let node_frame = |e: &NodeEntry| {
                e.raw.clone().unwrap_or_else(|| {
                    encode_from_radio(FromRadioVariant::NodeInfo((*e.info).clone()))
                })
            };
            if let Some(own) = st.nodes.get(&identity.node_num) {
                out.push(node_frame(own));
            }
            if let Some((_, raw)) = st.metadata.as_ref() {
                out.push(raw.clone());
            }
            out.extend(st.channels.values().map(|(_, raw)| raw.clone()));
            out.extend(st.configs.values().map(|(_, raw)| raw.clone()));
            out.extend(st.module_configs.values().map(|(_, raw)| raw.clone()));
            let mut others: Vec<&NodeEntry> = st
                .nodes
                .iter()
                .filter(|(num, _)| **num != identity.node_num)
                .map(|(_, e)| e)
                .collect();
            others.sort_by_key(|e| e.info.num);
            out.extend(others.into_iter().map(node_frame));
        }
        out.push(encode_from_radio(FromRadioVariant::ConfigCompleteId(config_id)));
        out
    }
}
