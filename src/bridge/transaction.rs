//! Batched configuration edits on the local node.
//!
//! Between `begin_edit_settings` and `commit_edit_settings` the firmware buffers writes
//! and applies them together (one reboot instead of one per write). Only one batch can be
//! open at a time; a link drop abandons the open batch since the device discards it too.
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::Mutex;

use super::admin::AdminClient;
use super::error::{BridgeError, BridgeResult};
use crate::protobuf::meshtastic_generated as proto;
use proto::admin_message::PayloadVariant as AdminVariant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionPhase {
    Idle,
    Editing,
}

#[derive(Debug)]
pub struct TransactionState {
    phase: TransactionPhase,
    writes: usize,
}

impl Default for TransactionState {
    fn default() -> Self {
        Self {
            phase: TransactionPhase::Idle,
            writes: 0,
        }
    }
}

impl TransactionState {
    pub fn phase(&self) -> TransactionPhase {
        self.phase
    }

    pub fn writes(&self) -> usize {
        self.writes
    }

    pub fn try_begin(&mut self) -> BridgeResult<()> {
        if self.phase == TransactionPhase::Editing {
            return Err(BridgeError::TransactionConflict);
        }
        self.phase = TransactionPhase::Editing;
        self.writes = 0;
        Ok(())
    }

    /// Count a write; returns true if it joined an open batch.
    pub fn record_write(&mut self) -> bool {
        if self.phase == TransactionPhase::Editing {
            self.writes += 1;
            true
        } else {
            false
        }
    }

    /// Close the batch. Returns the number of buffered writes, or `None` if none was open.
    pub fn finish(&mut self) -> Option<usize> {
        if self.phase == TransactionPhase::Idle {
            return None;
        }
        self.phase = TransactionPhase::Idle;
        Some(std::mem::take(&mut self.writes))
    }
}

pub struct ConfigTransactions {
    state: Mutex<TransactionState>,
    admin: AdminClient,
}

impl ConfigTransactions {
    pub fn new(admin: AdminClient) -> Self {
        Self {
            state: Mutex::new(TransactionState::default()),
            admin,
        }
    }

    pub async fn phase(&self) -> TransactionPhase {
        self.state.lock().await.phase()
    }

    pub async fn begin(&self) -> BridgeResult<()> {
        let local = self.admin.local_node()?;
        let mut state = self.state.lock().await;
        state.try_begin()?;
        let msg = proto::AdminMessage {
            payload_variant: Some(AdminVariant::BeginEditSettings(true)),
            ..Default::default()
        };
        if let Err(e) = self.admin.send(local, msg).await {
            state.finish();
            return Err(e);
        }
        info!("Config edit transaction started");
        Ok(())
    }

    /// Send a settings write to the local node, counting it against an open batch.
    pub async fn write(&self, admin: proto::AdminMessage) -> BridgeResult<u32> {
        let local = self.admin.local_node()?;
        let mut state = self.state.lock().await;
        let id = self.admin.send(local, admin).await?;
        if state.record_write() {
            debug!("Buffered config write #{} in open transaction", state.writes());
        }
        Ok(id)
    }

    /// Commit the open batch. Returns `Ok(false)` when nothing was open. The batch is
    /// closed even if the commit frame fails to send.
    pub async fn commit(&self) -> BridgeResult<bool> {
        let mut state = self.state.lock().await;
        let Some(writes) = state.finish() else {
            debug!("Commit requested with no open transaction");
            return Ok(false);
        };
        let local = self.admin.local_node()?;
        let msg = proto::AdminMessage {
            payload_variant: Some(AdminVariant::CommitEditSettings(true)),
            ..Default::default()
        };
        self.admin.send(local, msg).await?;
        info!("Config edit transaction committed ({} writes)", writes);
        Ok(true)
    }

    /// Abandon any open batch (link lost or user disconnect).
    pub async fn reset(&self) {
        if let Some(writes) = self.state.lock().await.finish() {
            warn!(
                "Abandoned open config transaction with {} buffered writes",
                writes
            );
        }
    }
}
