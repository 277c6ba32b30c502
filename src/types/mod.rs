//! Core types for the kernel runtime.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (SessionId, MessageId, CommId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Connection, execution, socket and port configuration

mod config;
mod errors;
mod ids;

pub use config::{
    Config, ConnectionInfo, ExecutionConfig, KernelInfoConfig, LanguageInfo, ObservabilityConfig,
    PortConfig, SocketConfig,
};
pub use errors::{Error, PipelineStage, Result, StageError};
pub use ids::{CommId, MessageId, SessionId};
