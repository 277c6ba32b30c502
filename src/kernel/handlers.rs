//! Request handlers for the shell and control channels.
//!
//! Each channel owns a [`HandlerRegistry`] mapping a request type to one
//! [`MessageHandler`]. Types with no handler are logged and ignored.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use super::callbacks::{read, write};
use super::cell::{CellOutput, CellRequest};
use super::executor::ExecutionResult;
use super::iopub::{mime_bundle, IopubCellOutput, StdinInput};
use super::KernelCore;
use crate::envelope::{Message, MessageType, ReplyStatus, StreamName};
use crate::ipc::SendSocket;
use crate::types::{Error, Result};

/// Handles one request type. `reply` is the socket the request arrived on.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, kernel: &KernelCore, reply: &SendSocket, request: &Message) -> Result<()>;
}

impl<F> MessageHandler for F
where
    F: Fn(&KernelCore, &SendSocket, &Message) -> Result<()> + Send + Sync,
{
    fn handle(&self, kernel: &KernelCore, reply: &SendSocket, request: &Message) -> Result<()> {
        self(kernel, reply, request)
    }
}

/// Request type to handler mapping for one channel.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<MessageType, Arc<dyn MessageHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handlers served on the shell channel.
    pub fn shell() -> Self {
        let registry = Self::new();
        registry.register(MessageType::KernelInfoRequest, kernel_info);
        registry.register(MessageType::ExecuteRequest, execute);
        registry.register(MessageType::CommOpen, comm_open);
        registry.register(MessageType::CommMsg, comm_msg);
        registry.register(MessageType::CommClose, comm_close);
        registry.register(MessageType::CommInfoRequest, comm_info);
        registry.register(MessageType::ShutdownRequest, shutdown);
        registry
    }

    /// Handlers served on the control channel.
    pub fn control() -> Self {
        let registry = Self::new();
        registry.register(MessageType::InterruptRequest, interrupt);
        registry.register(MessageType::ShutdownRequest, shutdown);
        registry.register(MessageType::KernelInfoRequest, kernel_info);
        registry
    }

    /// Add or replace the handler for `msg_type`.
    pub fn register<H>(&self, msg_type: MessageType, handler: H)
    where
        H: MessageHandler + 'static,
    {
        write(&self.handlers).insert(msg_type, Arc::new(handler));
    }

    pub fn get(&self, msg_type: &MessageType) -> Option<Arc<dyn MessageHandler>> {
        read(&self.handlers).get(msg_type).cloned()
    }

    pub fn message_types(&self) -> Vec<MessageType> {
        let mut types: Vec<_> = read(&self.handlers).keys().cloned().collect();
        types.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        types
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("message_types", &self.message_types())
            .finish()
    }
}

// =============================================================================
// Built-in handlers
// =============================================================================

fn send_reply(reply: &SendSocket, request: &Message, content: Value) -> Result<()> {
    let reply_type = request.msg_type().reply_type().ok_or_else(|| {
        Error::internal(format!("{} has no reply type", request.msg_type()))
    })?;
    reply.send(&request.reply(reply_type, content))
}

fn kernel_info(kernel: &KernelCore, reply: &SendSocket, request: &Message) -> Result<()> {
    let info = &kernel.config().kernel_info;
    send_reply(
        reply,
        request,
        json!({
            "status": ReplyStatus::Ok,
            "protocol_version": info.protocol_version,
            "implementation": info.implementation,
            "implementation_version": info.implementation_version,
            "language_info": info.language_info,
            "banner": info.banner,
            "help_links": [],
        }),
    )
}

fn execute(kernel: &KernelCore, reply: &SendSocket, request: &Message) -> Result<()> {
    let code = match request.str_field("code") {
        Ok(code) => code.to_string(),
        Err(e) => {
            let execution_count = kernel.cells().execution_count();
            return reply_execute_error(kernel, reply, request, execution_count, &e);
        }
    };
    let silent = request.bool_field("silent", false);
    let store_history = request.bool_field("store_history", !silent) && !silent;
    let allow_stdin = request.bool_field("allow_stdin", false);

    let output = Arc::new(IopubCellOutput::new(
        kernel.iopub().clone(),
        request.clone(),
        silent,
    ));
    let mut cell = CellRequest::new(code).with_output(output.clone());
    cell.store_history = store_history;
    if allow_stdin {
        cell = cell.with_input(Arc::new(StdinInput::new(
            kernel.stdin().clone(),
            request.clone(),
            kernel.shutdown_token(),
        )));
    }

    let report = kernel.cells().execute_cell(cell);
    for failure in &report.hook_failures {
        output.stream(StreamName::Stderr, &format!("{}\n", failure));
    }

    let execution_count = report.execution_count;
    let failure = match report.outcome {
        ExecutionResult::Success(value) => {
            if let (Some(value), false) = (value, silent) {
                kernel.iopub().broadcast(
                    Some(request),
                    MessageType::ExecuteResult,
                    json!({
                        "execution_count": execution_count,
                        "data": mime_bundle(&value),
                        "metadata": {},
                    }),
                    Vec::new(),
                )?;
            }
            return send_reply(
                reply,
                request,
                json!({
                    "status": ReplyStatus::Ok,
                    "execution_count": execution_count,
                    "user_expressions": {},
                    "payload": [],
                }),
            );
        }
        ExecutionResult::Failure(e) => e,
        ExecutionResult::Interrupted => Error::Interrupted,
    };

    tracing::debug!("Cell {} failed: {}", execution_count, failure);
    reply_execute_error(kernel, reply, request, execution_count, &failure)
}

/// Publish `error` on IOPub and answer with an error `execute_reply`.
fn reply_execute_error(
    kernel: &KernelCore,
    reply: &SendSocket,
    request: &Message,
    execution_count: u32,
    error: &Error,
) -> Result<()> {
    let error = error_content(error);
    kernel
        .iopub()
        .broadcast(Some(request), MessageType::Error, error.clone(), Vec::new())?;

    let mut content = error;
    content["status"] = json!(ReplyStatus::Error);
    content["execution_count"] = json!(execution_count);
    send_reply(reply, request, content)
}

/// `ename`/`evalue`/`traceback` for a failed cell. The traceback walks the
/// error's source chain.
pub(crate) fn error_content(error: &Error) -> Value {
    let mut traceback = vec![error.to_string()];
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        traceback.push(format!("caused by: {}", cause));
        source = cause.source();
    }
    json!({
        "ename": error.ename(),
        "evalue": error.to_string(),
        "traceback": traceback,
    })
}

fn comm_open(kernel: &KernelCore, _reply: &SendSocket, request: &Message) -> Result<()> {
    kernel
        .comms()
        .process_comm_open(&request.content, &request.buffers)
}

fn comm_msg(kernel: &KernelCore, _reply: &SendSocket, request: &Message) -> Result<()> {
    kernel
        .comms()
        .process_comm_message(&request.content, &request.buffers)
}

fn comm_close(kernel: &KernelCore, _reply: &SendSocket, request: &Message) -> Result<()> {
    kernel
        .comms()
        .process_comm_close(&request.content, &request.buffers)
}

fn comm_info(kernel: &KernelCore, reply: &SendSocket, request: &Message) -> Result<()> {
    let target = request.content.get("target_name").and_then(|v| v.as_str());
    send_reply(
        reply,
        request,
        json!({
            "status": ReplyStatus::Ok,
            "comms": kernel.comms().comm_info(target),
        }),
    )
}

fn interrupt(kernel: &KernelCore, reply: &SendSocket, request: &Message) -> Result<()> {
    let interrupted = kernel.cells().engine().interrupt_execution();
    tracing::info!("Interrupt requested (task running: {})", interrupted);
    send_reply(reply, request, json!({ "status": ReplyStatus::Ok }))
}

fn shutdown(kernel: &KernelCore, reply: &SendSocket, request: &Message) -> Result<()> {
    let restart = request.bool_field("restart", false);
    send_reply(
        reply,
        request,
        json!({ "status": ReplyStatus::Ok, "restart": restart }),
    )?;
    kernel.shutdown();
    Ok(())
}
