//! Core enumerations for the message envelope.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Message type carried in the header. Unknown types survive as `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    ExecuteRequest,
    ExecuteReply,
    ExecuteInput,
    ExecuteResult,
    Error,
    Stream,
    DisplayData,
    Status,
    KernelInfoRequest,
    KernelInfoReply,
    CommOpen,
    CommMsg,
    CommClose,
    CommInfoRequest,
    CommInfoReply,
    InterruptRequest,
    InterruptReply,
    ShutdownRequest,
    ShutdownReply,
    InputRequest,
    InputReply,
    Custom(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::ExecuteRequest => "execute_request",
            MessageType::ExecuteReply => "execute_reply",
            MessageType::ExecuteInput => "execute_input",
            MessageType::ExecuteResult => "execute_result",
            MessageType::Error => "error",
            MessageType::Stream => "stream",
            MessageType::DisplayData => "display_data",
            MessageType::Status => "status",
            MessageType::KernelInfoRequest => "kernel_info_request",
            MessageType::KernelInfoReply => "kernel_info_reply",
            MessageType::CommOpen => "comm_open",
            MessageType::CommMsg => "comm_msg",
            MessageType::CommClose => "comm_close",
            MessageType::CommInfoRequest => "comm_info_request",
            MessageType::CommInfoReply => "comm_info_reply",
            MessageType::InterruptRequest => "interrupt_request",
            MessageType::InterruptReply => "interrupt_reply",
            MessageType::ShutdownRequest => "shutdown_request",
            MessageType::ShutdownReply => "shutdown_reply",
            MessageType::InputRequest => "input_request",
            MessageType::InputReply => "input_reply",
            MessageType::Custom(name) => name,
        }
    }

    /// The `*_reply` type answering a `*_request` type.
    pub fn reply_type(&self) -> Option<MessageType> {
        self.as_str()
            .strip_suffix("_request")
            .map(|base| MessageType::from(format!("{}_reply", base)))
    }
}

impl From<String> for MessageType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "execute_request" => MessageType::ExecuteRequest,
            "execute_reply" => MessageType::ExecuteReply,
            "execute_input" => MessageType::ExecuteInput,
            "execute_result" => MessageType::ExecuteResult,
            "error" => MessageType::Error,
            "stream" => MessageType::Stream,
            "display_data" => MessageType::DisplayData,
            "status" => MessageType::Status,
            "kernel_info_request" => MessageType::KernelInfoRequest,
            "kernel_info_reply" => MessageType::KernelInfoReply,
            "comm_open" => MessageType::CommOpen,
            "comm_msg" => MessageType::CommMsg,
            "comm_close" => MessageType::CommClose,
            "comm_info_request" => MessageType::CommInfoRequest,
            "comm_info_reply" => MessageType::CommInfoReply,
            "interrupt_request" => MessageType::InterruptRequest,
            "interrupt_reply" => MessageType::InterruptReply,
            "shutdown_request" => MessageType::ShutdownRequest,
            "shutdown_reply" => MessageType::ShutdownReply,
            "input_request" => MessageType::InputRequest,
            "input_reply" => MessageType::InputReply,
            _ => MessageType::Custom(value),
        }
    }
}

impl From<&str> for MessageType {
    fn from(value: &str) -> Self {
        MessageType::from(value.to_string())
    }
}

impl From<MessageType> for String {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Custom(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kernel execution state broadcast in `status` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Starting,
    Busy,
    Idle,
}

/// Status field of reply content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Error,
    Aborted,
}

/// Output stream name for `stream` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    Stdout,
    Stderr,
}
