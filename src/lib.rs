//! # meshbridge - Protocol Bridge for Meshtastic Devices
//!
//! meshbridge keeps a long-lived connection to a single Meshtastic radio (TCP or
//! serial), mirrors its state, and exposes a typed async API on top of the raw
//! protobuf stream. Third-party clients can attach to the bridge over TCP as if it
//! were the radio itself.
//!
//! ## Features
//!
//! - **Resilient Link**: framed stream codec, heartbeats, and a reconnect state machine
//!   with capped exponential backoff.
//! - **Correlated Admin Requests**: pipelined requests matched to responses by packet id,
//!   with per-request timeouts and session passkey caching for remote nodes.
//! - **Config Transactions**: `begin_edit_settings`/`commit_edit_settings` batching so
//!   the device reboots once per batch.
//! - **Delivery Tracking**: per-message `Pending → Sent → Delivered/Confirmed` or `Failed`.
//! - **Virtual Node**: TCP fan-out with config replay for attached clients.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshbridge::bridge::MeshBridge;
//! use meshbridge::config::Config;
//! use meshbridge::storage::MemoryStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let bridge = MeshBridge::new(config, Arc::new(MemoryStore::new()))?;
//!     bridge.connect().await;
//!     let mut capture = bridge.config_capture();
//!     if let Some((_, me)) = capture.next().await {
//!         bridge.send_text_message("hello mesh", 0, None, None, false, None).await?;
//!         println!("sent as {}", me.node_id);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`meshtastic`] - frame codec, device connectors and the transport state machine
//! - [`bridge`] - request correlation, sessions, transactions, delivery, routing
//! - [`virtual_node`] - TCP server for third-party clients
//! - [`storage`] - persistence seam with in-memory and JSON-file stores
//! - [`config`] - TOML configuration and validation
//! - [`protobuf`] - generated Meshtastic protobuf types
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐
//! │  Virtual Node   │ ──► │   MeshBridge    │ ← typed API
//! └─────────────────┘     └─────────────────┘
//!                                  │
//!                         ┌─────────────────┐
//!                         │    Transport    │ ← framing, reconnect
//!                         └─────────────────┘
//!                                  │
//!                         ┌─────────────────┐
//!                         │   Persistence   │ ← nodes, messages, settings
//!                         └─────────────────┘
//! ```

pub mod bridge;
pub mod config;
pub mod logutil;
pub mod meshtastic;
pub mod metrics;
pub mod protobuf;
pub mod storage;
pub mod virtual_node;
