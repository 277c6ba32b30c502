//! IOPub broadcasting and the per-request output/input bridges.

use serde_json::{json, Value};
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

use super::callbacks::{read, write};
use super::cell::{CellOutput, InputProvider};
use super::executor::TaskContext;
use crate::comm::CommPublisher;
use crate::envelope::{ExecutionState, Message, MessageType, StreamName};
use crate::ipc::{SendReceiveSocket, SendSocket};
use crate::types::{Error, Result, SessionId};

/// Publishes broadcasts on IOPub, parented to the request being handled.
#[derive(Debug)]
pub struct IopubPublisher {
    socket: SendSocket,
    session: SessionId,
    /// Last shell request seen; parent for broadcasts not tied to a request.
    parent: RwLock<Option<Message>>,
}

impl IopubPublisher {
    pub fn new(socket: SendSocket, session: SessionId) -> Self {
        Self {
            socket,
            session,
            parent: RwLock::new(None),
        }
    }

    pub fn set_parent(&self, request: &Message) {
        *write(&self.parent) = Some(request.clone());
    }

    pub fn current_parent(&self) -> Option<Message> {
        read(&self.parent).clone()
    }

    /// Publish one broadcast. Without a parent the message is addressed by
    /// its type and stamped with the kernel session.
    pub fn broadcast(
        &self,
        parent: Option<&Message>,
        msg_type: MessageType,
        content: Value,
        buffers: Vec<Vec<u8>>,
    ) -> Result<()> {
        let msg = match parent {
            Some(parent) => parent.child(msg_type, content),
            None => {
                let topic = msg_type.as_str().as_bytes().to_vec();
                Message::new(msg_type, self.session.clone(), "kernel", content)
                    .with_identities(vec![topic])
            }
        };
        self.socket.send(&msg.with_buffers(buffers))
    }

    pub fn publish_status(&self, parent: Option<&Message>, state: ExecutionState) -> Result<()> {
        self.broadcast(
            parent,
            MessageType::Status,
            json!({ "execution_state": state }),
            Vec::new(),
        )
    }
}

impl CommPublisher for IopubPublisher {
    fn publish(&self, msg_type: MessageType, content: Value, buffers: Vec<Vec<u8>>) -> Result<()> {
        let parent = self.current_parent();
        self.broadcast(parent.as_ref(), msg_type, content, buffers)
    }
}

/// Mime bundle for a result value.
pub(crate) fn mime_bundle(value: &Value) -> Value {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    json!({ "text/plain": text })
}

// =============================================================================
// Cell output
// =============================================================================

/// Routes a cell's side output to IOPub under its `execute_request`.
#[derive(Debug)]
pub struct IopubCellOutput {
    publisher: Arc<IopubPublisher>,
    parent: Message,
    silent: bool,
}

impl IopubCellOutput {
    pub fn new(publisher: Arc<IopubPublisher>, parent: Message, silent: bool) -> Self {
        Self {
            publisher,
            parent,
            silent,
        }
    }

    fn emit(&self, msg_type: MessageType, content: Value) {
        if let Err(e) = self
            .publisher
            .broadcast(Some(&self.parent), msg_type.clone(), content, Vec::new())
        {
            tracing::warn!("Failed to publish {}: {}", msg_type, e);
        }
    }
}

impl CellOutput for IopubCellOutput {
    fn started(&self, execution_count: u32, code: &str) {
        if !self.silent {
            self.emit(
                MessageType::ExecuteInput,
                json!({ "code": code, "execution_count": execution_count }),
            );
        }
    }

    fn stream(&self, name: StreamName, text: &str) {
        self.emit(MessageType::Stream, json!({ "name": name, "text": text }));
    }

    fn display(&self, data: Value) {
        self.emit(
            MessageType::DisplayData,
            json!({ "data": mime_bundle(&data), "metadata": {} }),
        );
    }
}

// =============================================================================
// Stdin
// =============================================================================

/// Asks the front-end for input over the stdin channel.
#[derive(Debug)]
pub struct StdinInput {
    stdin: Arc<SendReceiveSocket>,
    parent: Message,
    shutdown: CancellationToken,
}

impl StdinInput {
    pub fn new(stdin: Arc<SendReceiveSocket>, parent: Message, shutdown: CancellationToken) -> Self {
        Self {
            stdin,
            parent,
            shutdown,
        }
    }
}

impl InputProvider for StdinInput {
    fn read_line(&self, prompt: &str, password: bool) -> Result<String> {
        let cancel = TaskContext::current()
            .map(|task| task.cancellation_token())
            .unwrap_or_else(|| self.shutdown.clone());

        self.stdin.send(&self.parent.reply(
            MessageType::InputRequest,
            json!({ "prompt": prompt, "password": password }),
        ))?;

        loop {
            let reply = self.stdin.receive_until(&cancel).ok_or(Error::Interrupted)?;
            if *reply.msg_type() != MessageType::InputReply {
                tracing::debug!("Ignoring {} while waiting for input", reply.msg_type());
                continue;
            }
            return Ok(reply.str_field("value")?.to_string());
        }
    }
}
