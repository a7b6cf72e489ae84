//! Outbound notifications for dependency changes that must be re-processed
//! elsewhere
//!
//! ```text
//! LegacyDependencyStore        MessageBus            consumer
//!     │                            │                     │
//!     ├─ put_edge(X → Y) ─────────►│ DescentUpdate(A) ──►│ re-walk A's subtree
//!     │   (A depends on X)         │                     │
//! ```

use std::sync::{Mutex, PoisonError};

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

use super::{Connection, LegacyTree};
use crate::error::{GraphError, Result};

/// Change to one connection of one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionChange {
    /// Node whose connection list changed
    pub ephemera_id: String,
    pub connection: Connection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    AncestryUpdate,
    DescentUpdate,
}

impl From<LegacyTree> for MessageType {
    fn from(tree: LegacyTree) -> Self {
        match tree {
            LegacyTree::Ancestry => MessageType::AncestryUpdate,
            LegacyTree::Descent => MessageType::DescentUpdate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Node that has to re-process its tree
    pub ephemera_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub put_item: Option<ConnectionChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_item: Option<ConnectionChange>,
}

pub trait MessageBus: Send + Sync {
    fn send(&self, message: DependencyMessage) -> Result<()>;
}

/// Bus backed by an unbounded crossbeam channel
pub struct ChannelMessageBus {
    sender: Sender<DependencyMessage>,
}

impl ChannelMessageBus {
    pub fn unbounded() -> (Self, Receiver<DependencyMessage>) {
        let (sender, receiver) = unbounded();
        (Self { sender }, receiver)
    }
}

impl MessageBus for ChannelMessageBus {
    fn send(&self, message: DependencyMessage) -> Result<()> {
        self.sender
            .send(message)
            .map_err(|e| GraphError::Io(format!("message bus closed: {}", e)))
    }
}

/// Keeps every message in memory
#[derive(Debug, Default)]
pub struct RecordingMessageBus {
    messages: Mutex<Vec<DependencyMessage>>,
}

impl RecordingMessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages sent so far, emptying the record
    pub fn take(&self) -> Vec<DependencyMessage> {
        std::mem::take(&mut *self.messages.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl MessageBus for RecordingMessageBus {
    fn send(&self, message: DependencyMessage) -> Result<()> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
        Ok(())
    }
}
