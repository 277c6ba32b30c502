//! Comm session manager.
//!
//! Comms are named virtual channels between front-end extensions and code
//! running in the kernel. Each comm id goes `OPEN -> CLOSED`; a closed comm
//! is removed from every registry and its handle fails fast afterwards.
//!
//! Registries:
//!   - comm id -> comm
//!   - target name -> open handler (latest registration wins)
//!   - target name -> ids of the comms opened against it
//!
//! All three are internally synchronized; callers never lock anything.

use serde_json::{json, Map, Value};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, Weak};

use crate::envelope::MessageType;
use crate::kernel::callbacks::{read, write};
use crate::kernel::with_recovery;
use crate::types::{CommId, Error, PipelineStage, Result, StageError};

mod handle;

pub use handle::{Comm, CommData};

/// Outbound side of the comm protocol (IOPub in a running kernel).
#[cfg_attr(test, mockall::automock)]
pub trait CommPublisher: Send + Sync {
    fn publish(&self, msg_type: MessageType, content: Value, buffers: Vec<Vec<u8>>) -> Result<()>;
}

/// Called when the peer opens a comm against a registered target.
pub trait CommOpenHandler: Send + Sync {
    fn on_open(&self, comm: &Arc<Comm>, data: &CommData) -> Result<()>;
}

impl<F> CommOpenHandler for F
where
    F: Fn(&Arc<Comm>, &CommData) -> Result<()> + Send + Sync,
{
    fn on_open(&self, comm: &Arc<Comm>, data: &CommData) -> Result<()> {
        self(comm, data)
    }
}

fn comm_id_field(content: &Value) -> Result<CommId> {
    let raw = content
        .get("comm_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::validation("comm message without comm_id"))?;
    CommId::from_string(raw.to_string()).map_err(Error::validation)
}

/// Owner of every comm in a kernel session.
pub struct CommManager {
    publisher: Arc<dyn CommPublisher>,
    comms: RwLock<HashMap<CommId, Arc<Comm>>>,
    targets: RwLock<HashMap<String, Arc<dyn CommOpenHandler>>>,
    by_target: RwLock<HashMap<String, Vec<CommId>>>,
    self_ref: Weak<CommManager>,
}

impl CommManager {
    pub fn new(publisher: Arc<dyn CommPublisher>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            publisher,
            comms: RwLock::new(HashMap::new()),
            targets: RwLock::new(HashMap::new()),
            by_target: RwLock::new(HashMap::new()),
            self_ref: self_ref.clone(),
        })
    }

    pub(crate) fn publish(
        &self,
        msg_type: MessageType,
        content: Value,
        buffers: Vec<Vec<u8>>,
    ) -> Result<()> {
        self.publisher.publish(msg_type, content, buffers)
    }

    // =========================================================================
    // Targets
    // =========================================================================

    /// Register the open handler for `target`, replacing any previous one.
    pub fn register_target<H>(&self, target: impl Into<String>, handler: H)
    where
        H: CommOpenHandler + 'static,
    {
        let target = target.into();
        tracing::debug!("Registered comm target: {}", target);
        write(&self.targets).insert(target, Arc::new(handler));
    }

    pub fn unregister_target(&self, target: &str) -> bool {
        let removed = write(&self.targets).remove(target).is_some();
        if removed {
            tracing::debug!("Unregistered comm target: {}", target);
        }
        removed
    }

    pub fn has_target(&self, target: &str) -> bool {
        read(&self.targets).contains_key(target)
    }

    // =========================================================================
    // Registry
    // =========================================================================

    pub fn get(&self, id: &CommId) -> Option<Arc<Comm>> {
        read(&self.comms).get(id).cloned()
    }

    pub fn len(&self) -> usize {
        read(&self.comms).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn comms_for_target(&self, target: &str) -> Vec<CommId> {
        read(&self.by_target)
            .get(target)
            .cloned()
            .unwrap_or_default()
    }

    /// `{comm_id: {target_name}}` for every open comm, optionally filtered.
    pub fn comm_info(&self, target: Option<&str>) -> Map<String, Value> {
        let by_target = read(&self.by_target);
        let mut info = Map::new();
        for (name, ids) in by_target.iter() {
            if target.is_some_and(|wanted| wanted != name) {
                continue;
            }
            for id in ids {
                info.insert(id.to_string(), json!({ "target_name": name }));
            }
        }
        info
    }

    /// Insert a new comm under `id`. Lock order: `comms`, then `by_target`.
    fn register(&self, id: CommId, target: &str) -> Result<Arc<Comm>> {
        let mut comms = write(&self.comms);
        let Entry::Vacant(slot) = comms.entry(id.clone()) else {
            return Err(Error::validation(format!("comm {} is already open", id)));
        };
        let comm = Arc::new(Comm::new(id.clone(), target.to_string(), self.self_ref.clone()));
        slot.insert(comm.clone());
        write(&self.by_target)
            .entry(target.to_string())
            .or_default()
            .push(id);
        Ok(comm)
    }

    fn unregister(&self, comm: &Comm) {
        let mut comms = write(&self.comms);
        comms.remove(comm.id());
        let mut by_target = write(&self.by_target);
        if let Some(ids) = by_target.get_mut(comm.target()) {
            ids.retain(|id| id != comm.id());
            if ids.is_empty() {
                by_target.remove(comm.target());
            }
        }
    }

    /// Close listeners first, then registry removal, then (for local closes)
    /// the outbound close.
    fn teardown(&self, comm: &Comm, data: CommData, notify_peer: bool) -> Result<()> {
        comm.mark_closed()?;
        comm.fire_close(&data);
        self.unregister(comm);
        tracing::debug!("Closed comm {} (target {})", comm.id(), comm.target());

        if notify_peer {
            self.publish(
                MessageType::CommClose,
                json!({ "comm_id": comm.id(), "data": data.data }),
                data.buffers,
            )?;
        }
        Ok(())
    }

    // =========================================================================
    // Local operations
    // =========================================================================

    /// Open a comm from the kernel side. Usable immediately; the peer does
    /// not acknowledge.
    pub fn open_comm(&self, target: &str, data: CommData) -> Result<Arc<Comm>> {
        let comm = self.register(CommId::new(), target)?;
        let content = json!({
            "comm_id": comm.id(),
            "target_name": target,
            "data": data.data,
        });

        if let Err(e) = self.publish(MessageType::CommOpen, content, data.buffers) {
            let _ = comm.mark_closed();
            self.unregister(&comm);
            return Err(e);
        }
        tracing::debug!("Opened comm {} (target {})", comm.id(), target);
        Ok(comm)
    }

    /// Close a comm from the kernel side and notify the peer.
    pub fn close_comm(&self, id: &CommId, data: CommData) -> Result<()> {
        let comm = self
            .get(id)
            .ok_or_else(|| Error::not_found(format!("comm {}", id)))?;
        self.teardown(&comm, data, true)
    }

    /// Close every comm, e.g. at shutdown.
    pub fn close_all(&self, notify_peer: bool) {
        let comms: Vec<Arc<Comm>> = read(&self.comms).values().cloned().collect();
        for comm in comms {
            if let Err(e) = self.teardown(&comm, CommData::default(), notify_peer) {
                tracing::debug!("Comm {} already closed: {}", comm.id(), e);
            }
        }
    }

    // =========================================================================
    // Peer operations
    // =========================================================================

    /// Handle an inbound `comm_open`.
    ///
    /// An unknown target is answered with a single `comm_close` carrying an
    /// error; no comm is created and no error is returned. A failing open
    /// handler closes the new comm (notifying the peer) and the failure is
    /// returned tagged with the comm-open stage.
    pub fn process_comm_open(&self, content: &Value, buffers: &[Vec<u8>]) -> Result<()> {
        let comm_id = comm_id_field(content)?;
        let target = content
            .get("target_name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::validation("comm_open without target_name"))?;
        let data = CommData::from_content(content, buffers);

        let handler = read(&self.targets).get(target).cloned();
        let Some(handler) = handler else {
            tracing::warn!("Rejecting comm {}: no target named {}", comm_id, target);
            return self.publish(
                MessageType::CommClose,
                json!({
                    "comm_id": comm_id,
                    "data": { "error": format!("Target '{}' is not registered", target) },
                }),
                Vec::new(),
            );
        };

        let comm = self.register(comm_id, target)?;
        if let Err(e) = with_recovery(|| handler.on_open(&comm, &data), "comm open") {
            tracing::warn!("Open handler for comm {} failed: {}", comm.id(), e);
            let reason = CommData::new(json!({ "error": e.to_string() }));
            if let Err(close_err) = self.teardown(&comm, reason, true) {
                tracing::debug!("Comm {} closed by its own handler: {}", comm.id(), close_err);
            }
            return Err(StageError::new(PipelineStage::CommOpen, e).into());
        }

        tracing::debug!("Peer opened comm {} (target {})", comm.id(), target);
        Ok(())
    }

    /// Handle an inbound `comm_msg`: deliver to every message listener.
    pub fn process_comm_message(&self, content: &Value, buffers: &[Vec<u8>]) -> Result<()> {
        let comm_id = comm_id_field(content)?;
        let comm = self
            .get(&comm_id)
            .ok_or_else(|| Error::not_found(format!("comm {}", comm_id)))?;
        comm.dispatch_message(&CommData::from_content(content, buffers));
        Ok(())
    }

    /// Handle an inbound `comm_close`. Nothing is sent back.
    pub fn process_comm_close(&self, content: &Value, buffers: &[Vec<u8>]) -> Result<()> {
        let comm_id = comm_id_field(content)?;
        let comm = self
            .get(&comm_id)
            .ok_or_else(|| Error::not_found(format!("comm {}", comm_id)))?;
        self.teardown(&comm, CommData::from_content(content, buffers), false)
    }
}

impl fmt::Debug for CommManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommManager")
            .field("comms", &self.len())
            .field("targets", &read(&self.targets).len())
            .finish()
    }
}
