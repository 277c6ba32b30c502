//! A single comm: one named bidirectional channel over IOPub/shell.

use serde_json::{json, Value};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;

use super::CommManager;
use crate::envelope::MessageType;
use crate::kernel::CallbackList;
use crate::types::{CommId, Error, Result};

/// Payload of a comm message, open or close.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommData {
    pub data: Value,
    pub buffers: Vec<Vec<u8>>,
}

impl CommData {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            buffers: Vec::new(),
        }
    }

    pub fn with_buffers(mut self, buffers: Vec<Vec<u8>>) -> Self {
        self.buffers = buffers;
        self
    }

    /// `data` field of inbound comm content (missing becomes `{}`).
    pub(crate) fn from_content(content: &Value, buffers: &[Vec<u8>]) -> Self {
        Self {
            data: content.get("data").cloned().unwrap_or_else(|| json!({})),
            buffers: buffers.to_vec(),
        }
    }
}

/// Comm handle. Owned by the [`CommManager`]; closing removes it there.
pub struct Comm {
    id: CommId,
    target: String,
    open: AtomicBool,
    message_callbacks: CallbackList<CommData>,
    close_callbacks: CallbackList<CommData>,
    manager: Weak<CommManager>,
}

impl Comm {
    pub(crate) fn new(id: CommId, target: String, manager: Weak<CommManager>) -> Self {
        Self {
            id,
            target,
            open: AtomicBool::new(true),
            message_callbacks: CallbackList::new(),
            close_callbacks: CallbackList::new(),
            manager,
        }
    }

    pub fn id(&self) -> &CommId {
        &self.id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::CommClosed(self.id.clone()))
        }
    }

    fn manager(&self) -> Result<std::sync::Arc<CommManager>> {
        self.manager
            .upgrade()
            .ok_or_else(|| Error::CommClosed(self.id.clone()))
    }

    /// Send `data` to the peer side of this comm.
    pub fn send(&self, data: Value, buffers: Vec<Vec<u8>>) -> Result<()> {
        self.ensure_open()?;
        self.manager()?.publish(
            MessageType::CommMsg,
            json!({ "comm_id": self.id, "data": data }),
            buffers,
        )
    }

    /// Listen for inbound data. Fails once the comm is closed.
    pub fn on_message<F>(&self, callback: F) -> Result<()>
    where
        F: Fn(&CommData) -> Result<()> + Send + Sync + 'static,
    {
        self.ensure_open()?;
        self.message_callbacks.add(callback);
        Ok(())
    }

    /// Listen for the close. Fails once the comm is closed.
    pub fn on_close<F>(&self, callback: F) -> Result<()>
    where
        F: Fn(&CommData) -> Result<()> + Send + Sync + 'static,
    {
        self.ensure_open()?;
        self.close_callbacks.add(callback);
        Ok(())
    }

    /// Close locally and notify the peer. A second close fails.
    pub fn close(&self, data: CommData) -> Result<()> {
        self.ensure_open()?;
        self.manager()?.close_comm(&self.id, data)
    }

    /// Flip to closed. Exactly one caller wins.
    pub(crate) fn mark_closed(&self) -> Result<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::CommClosed(self.id.clone()))
        }
    }

    pub(crate) fn dispatch_message(&self, data: &CommData) {
        if self.message_callbacks.is_empty() {
            tracing::debug!("Comm {} has no message listeners; dropping data", self.id);
            return;
        }
        self.message_callbacks.dispatch(data, "comm message");
    }

    /// Fire close listeners, then drop every listener.
    pub(crate) fn fire_close(&self, data: &CommData) {
        self.close_callbacks.dispatch(data, "comm close");
        self.message_callbacks.clear();
        self.close_callbacks.clear();
    }
}

impl fmt::Debug for Comm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Comm")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("open", &self.is_open())
            .finish()
    }
}
