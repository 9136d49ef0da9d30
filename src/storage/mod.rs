//! # Storage - persistence collaborators
//!
//! The bridge is not the system of record for nodes, messages or settings; it calls out
//! through the [`Persistence`] trait and keeps its own working copy in the device
//! snapshot. Two implementations ship with the crate:
//!
//! - [`MemoryStore`]: process-local maps, used by tests and `probe`.
//! - [`JsonStore`]: a single JSON document under the data directory, rewritten
//!   atomically (temp file + rename) on every change.
//!
//! ```text
//! data/
//! └── bridge.json   ← nodes, messages, settings, audit, traceroutes, neighbors
//! ```
//!
//! Calls are synchronous and cheap; the router invokes them inline while handling a
//! frame and only logs failures.
use std::collections::{HashMap, VecDeque};
use std::fs::{self as sfs, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::logutil::node_id;
use crate::protobuf::meshtastic_generated as proto;

const MAX_MESSAGES: usize = 2000;
const MAX_AUDIT: usize = 1000;
const MAX_TRACEROUTES: usize = 500;
const MAX_NEIGHBOR_REPORTS: usize = 500;

/// Persisted view of one mesh node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub num: u32,
    pub node_id: String,
    #[serde(default)]
    pub long_name: String,
    #[serde(default)]
    pub short_name: String,
    #[serde(default)]
    pub hw_model: i32,
    #[serde(default)]
    pub role: i32,
    #[serde(default)]
    pub last_heard: u32,
    #[serde(default)]
    pub snr: f32,
    #[serde(default)]
    pub hops_away: Option<u32>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub altitude: Option<i32>,
    #[serde(default)]
    pub battery_level: Option<u32>,
    #[serde(default)]
    pub voltage: Option<f32>,
    #[serde(default)]
    pub is_favorite: bool,
    pub first_seen: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NodeRecord {
    pub fn from_node_info(info: &proto::NodeInfo) -> Self {
        let now = Utc::now();
        let user = info.user.clone().unwrap_or_default();
        let position = info.position.as_ref();
        let metrics = info.device_metrics.as_ref();
        Self {
            num: info.num,
            node_id: node_id(info.num),
            long_name: user.long_name,
            short_name: user.short_name,
            hw_model: user.hw_model,
            role: user.role,
            last_heard: info.last_heard,
            snr: info.snr,
            hops_away: info.hops_away,
            latitude: position.and_then(|p| p.latitude_i).map(|v| v as f64 * 1e-7),
            longitude: position.and_then(|p| p.longitude_i).map(|v| v as f64 * 1e-7),
            altitude: position.and_then(|p| p.altitude),
            battery_level: metrics.and_then(|m| m.battery_level),
            voltage: metrics.and_then(|m| m.voltage),
            is_favorite: info.is_favorite,
            first_seen: now,
            updated_at: now,
        }
    }

    pub fn to_node_info(&self) -> proto::NodeInfo {
        let has_names = !self.long_name.is_empty() || !self.short_name.is_empty();
        let has_position = self.latitude.is_some() || self.longitude.is_some();
        let has_metrics = self.battery_level.is_some() || self.voltage.is_some();
        proto::NodeInfo {
            num: self.num,
            user: has_names.then(|| proto::User {
                id: self.node_id.clone(),
                long_name: self.long_name.clone(),
                short_name: self.short_name.clone(),
                hw_model: self.hw_model,
                role: self.role,
                ..Default::default()
            }),
            position: has_position.then(|| proto::Position {
                latitude_i: self.latitude.map(|v| (v * 1e7).round() as i32),
                longitude_i: self.longitude.map(|v| (v * 1e7).round() as i32),
                altitude: self.altitude,
                ..Default::default()
            }),
            snr: self.snr,
            last_heard: self.last_heard,
            device_metrics: has_metrics.then(|| proto::DeviceMetrics {
                battery_level: self.battery_level,
                voltage: self.voltage,
                ..Default::default()
            }),
            hops_away: self.hops_away,
            is_favorite: self.is_favorite,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub packet_id: u32,
    pub from: u32,
    pub to: u32,
    pub channel: u32,
    pub text: String,
    pub direction: Direction,
    #[serde(default)]
    pub reply_id: Option<u32>,
    #[serde(default)]
    pub emoji: bool,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub rx_snr: Option<f32>,
    #[serde(default)]
    pub hops_away: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracerouteRecord {
    pub request_id: u32,
    pub from: u32,
    pub to: u32,
    pub route: Vec<u32>,
    pub route_back: Vec<u32>,
    /// dB, already divided by 4 from the on-air representation
    pub snr_towards: Vec<f32>,
    pub snr_back: Vec<f32>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborLink {
    pub node: u32,
    pub snr: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborRecord {
    pub reporter: u32,
    pub neighbors: Vec<NeighborLink>,
    pub broadcast_interval_secs: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub detail: String,
}

/// Interface the bridge uses to reach its external system of record.
pub trait Persistence: Send + Sync {
    fn upsert_node(&self, node: &NodeRecord) -> Result<()>;
    fn insert_message(&self, message: &StoredMessage) -> Result<()>;
    fn get_node(&self, num: u32) -> Result<Option<NodeRecord>>;
    fn get_all_nodes(&self) -> Result<Vec<NodeRecord>>;
    fn get_setting(&self, key: &str) -> Result<Option<String>>;
    fn set_setting(&self, key: &str, value: &str) -> Result<()>;
    fn audit_log(&self, action: &str, detail: &str) -> Result<()>;
    fn insert_traceroute(&self, record: &TracerouteRecord) -> Result<()>;
    fn insert_neighbor_info(&self, record: &NeighborRecord) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    nodes: HashMap<u32, NodeRecord>,
    #[serde(default)]
    messages: VecDeque<StoredMessage>,
    #[serde(default)]
    settings: HashMap<String, String>,
    #[serde(default)]
    audit: VecDeque<AuditEntry>,
    #[serde(default)]
    traceroutes: VecDeque<TracerouteRecord>,
    #[serde(default)]
    neighbors: VecDeque<NeighborRecord>,
    #[serde(default = "Utc::now")]
    last_updated: DateTime<Utc>,
}

fn push_capped<T>(queue: &mut VecDeque<T>, item: T, cap: usize) {
    queue.push_back(item);
    while queue.len() > cap {
        queue.pop_front();
    }
}

impl StoreData {
    fn upsert_node(&mut self, node: &NodeRecord) {
        let mut next = node.clone();
        if let Some(prev) = self.nodes.get(&node.num) {
            next.first_seen = prev.first_seen;
        }
        next.updated_at = Utc::now();
        self.nodes.insert(node.num, next);
    }

    fn messages(&self) -> Vec<StoredMessage> {
        self.messages.iter().cloned().collect()
    }

    fn sorted_nodes(&self) -> Vec<NodeRecord> {
        let mut nodes: Vec<NodeRecord> = self.nodes.values().cloned().collect();
        nodes.sort_by_key(|n| n.num);
        nodes
    }
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<StoreData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreData> {
        self.data.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn messages(&self) -> Vec<StoredMessage> {
        self.lock().messages()
    }

    pub fn traceroutes(&self) -> Vec<TracerouteRecord> {
        self.lock().traceroutes.iter().cloned().collect()
    }

    pub fn neighbor_reports(&self) -> Vec<NeighborRecord> {
        self.lock().neighbors.iter().cloned().collect()
    }

    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.lock().audit.iter().cloned().collect()
    }
}

impl Persistence for MemoryStore {
    fn upsert_node(&self, node: &NodeRecord) -> Result<()> {
        self.lock().upsert_node(node);
        Ok(())
    }

    fn insert_message(&self, message: &StoredMessage) -> Result<()> {
        push_capped(&mut self.lock().messages, message.clone(), MAX_MESSAGES);
        Ok(())
    }

    fn get_node(&self, num: u32) -> Result<Option<NodeRecord>> {
        Ok(self.lock().nodes.get(&num).cloned())
    }

    fn get_all_nodes(&self) -> Result<Vec<NodeRecord>> {
        Ok(self.lock().sorted_nodes())
    }

    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock().settings.get(key).cloned())
    }

    fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.lock().settings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn audit_log(&self, action: &str, detail: &str) -> Result<()> {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            action: action.to_string(),
            detail: detail.to_string(),
        };
        push_capped(&mut self.lock().audit, entry, MAX_AUDIT);
        Ok(())
    }

    fn insert_traceroute(&self, record: &TracerouteRecord) -> Result<()> {
        push_capped(&mut self.lock().traceroutes, record.clone(), MAX_TRACEROUTES);
        Ok(())
    }

    fn insert_neighbor_info(&self, record: &NeighborRecord) -> Result<()> {
        push_capped(&mut self.lock().neighbors, record.clone(), MAX_NEIGHBOR_REPORTS);
        Ok(())
    }
}

/// JSON-file store; every mutation rewrites the document atomically.
pub struct JsonStore {
    path: PathBuf,
    data: Mutex<StoreData>,
}

impl JsonStore {
    pub const FILE_NAME: &'static str = "bridge.json";

    /// Open (or create) the store in `data_dir`.
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let dir = data_dir.as_ref();
        sfs::create_dir_all(dir)
            .with_context(|| format!("creating data directory {}", dir.display()))?;
        let path = dir.join(Self::FILE_NAME);
        let data = if path.exists() {
            let content = sfs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            // Guard against accidental leading NULs from previous partial writes
            let cleaned = content.trim_start_matches('\0');
            match serde_json::from_str::<StoreData>(cleaned) {
                Ok(d) => {
                    info!(
                        "Loaded {} nodes and {} messages from {}",
                        d.nodes.len(),
                        d.messages.len(),
                        path.display()
                    );
                    d
                }
                Err(e) => {
                    let bad = path.with_extension("json.corrupt");
                    warn!(
                        "Store {} unreadable ({}); moved aside to {}",
                        path.display(),
                        e,
                        bad.display()
                    );
                    let _ = sfs::rename(&path, &bad);
                    StoreData::default()
                }
            }
        } else {
            StoreData::default()
        };
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, StoreData> {
        self.data.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn mutate<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut StoreData),
    {
        let mut data = self.lock();
        f(&mut data);
        data.last_updated = Utc::now();
        let content = serde_json::to_string_pretty(&*data)?;
        write_atomic(&self.path, content.as_bytes())
    }

    pub fn messages(&self) -> Vec<StoredMessage> {
        self.lock().messages()
    }
}

/// Write `content` to a unique temp file beside `path`, then rename over it.
fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let base = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(JsonStore::FILE_NAME);
    let mut counter = 0u32;
    let tmp_path = loop {
        let candidate = dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), counter));
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(mut tmp) => {
                tmp.write_all(content)?;
                tmp.flush()?;
                let _ = tmp.sync_all();
                break candidate;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                counter = counter.saturating_add(1);
                continue;
            }
            Err(e) => {
                return Err(anyhow!(
                    "Failed to create temp file for atomic write: {}",
                    e
                ))
            }
        }
    };

    sfs::rename(&tmp_path, path)?;
    if let Ok(dir_file) = File::open(dir) {
        let _ = dir_file.sync_all();
    }
    debug!("Saved {}", path.display());
    Ok(())
}

impl Persistence for JsonStore {
    fn upsert_node(&self, node: &NodeRecord) -> Result<()> {
        self.mutate(|d| d.upsert_node(node))
    }

    fn insert_message(&self, message: &StoredMessage) -> Result<()> {
        self.mutate(|d| push_capped(&mut d.messages, message.clone(), MAX_MESSAGES))
    }

    fn get_node(&self, num: u32) -> Result<Option<NodeRecord>> {
        Ok(self.lock().nodes.get(&num).cloned())
    }

    fn get_all_nodes(&self) -> Result<Vec<NodeRecord>> {
        Ok(self.lock().sorted_nodes())
    }

    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock().settings.get(key).cloned())
    }

    fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.mutate(|d| {
            d.settings.insert(key.to_string(), value.to_string());
        })
    }

    fn audit_log(&self, action: &str, detail: &str) -> Result<()> {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            action: action.to_string(),
            detail: detail.to_string(),
        };
        self.mutate(|d| push_capped(&mut d.audit, entry, MAX_AUDIT))
    }

    fn insert_traceroute(&self, record: &TracerouteRecord) -> Result<()> {
        self.mutate(|d| push_capped(&mut d.traceroutes, record.clone(), MAX_TRACEROUTES))
    }

    fn insert_neighbor_info(&self, record: &NeighborRecord) -> Result<()> {
        self.mutate(|d| push_capped(&mut d.neighbors, record.clone(), MAX_NEIGHBOR_REPORTS))
    }
}
