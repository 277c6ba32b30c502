//! Configuration structures.
//!
//! Configuration is assembled from the front-end connection file plus
//! defaults for everything the connection file does not carry.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::Result;

/// Global kernel configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Transport endpoints and signing key.
    #[serde(default)]
    pub connection: ConnectionInfo,

    /// Execution engine configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Socket layer configuration.
    #[serde(default)]
    pub sockets: SocketConfig,

    /// Port negotiation configuration.
    #[serde(default)]
    pub ports: PortConfig,

    /// Values reported in `kernel_info_reply`.
    #[serde(default)]
    pub kernel_info: KernelInfoConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Build a config from a connection file, using defaults for the rest.
    pub fn from_connection_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            connection: ConnectionInfo::from_file(path)?,
            ..Self::default()
        })
    }
}

/// Connection file contents shared with the front-end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub transport: String,
    pub ip: String,
    pub shell_port: u16,
    pub iopub_port: u16,
    pub stdin_port: u16,
    pub control_port: u16,
    pub hb_port: u16,
    /// Shared signing secret. Empty disables signing.
    pub key: String,
    pub signature_scheme: String,
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self {
            transport: "tcp".to_string(),
            ip: "127.0.0.1".to_string(),
            shell_port: 0,
            iopub_port: 0,
            stdin_port: 0,
            control_port: 0,
            hb_port: 0,
            key: String::new(),
            signature_scheme: "hmac-sha256".to_string(),
        }
    }
}

impl ConnectionInfo {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    /// `ip:port` for one of the endpoints.
    pub fn address(&self, port: u16) -> String {
        format!("{}:{}", self.ip, port)
    }
}

/// Execution engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Bounded submission queue capacity. Submitters block once full.
    pub queue_capacity: usize,

    /// How long an interrupted task gets to stop cooperatively before the
    /// forced-stop capability is tried.
    #[serde(with = "humantime_serde")]
    pub interrupt_grace: Duration,

    /// Name of the dedicated execution worker thread.
    pub worker_thread_name: String,

    /// Leading character that marks a magic line.
    pub magic_marker: char,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            interrupt_grace: Duration::from_millis(100),
            worker_thread_name: "cellkernel-executor".to_string(),
            magic_marker: '%',
        }
    }
}

/// Socket layer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketConfig {
    /// Capacity of the inbound queue behind a send-receive adapter.
    pub receive_queue_capacity: usize,

    /// Maximum accepted frame size in bytes for stream transports.
    pub max_frame_bytes: u32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            receive_queue_capacity: 256,
            max_frame_bytes: 100 * 1024 * 1024,
        }
    }
}

/// Port negotiation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    pub range_start: u16,
    pub range_end: u16,
    pub max_attempts: u32,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            range_start: 32768,
            range_end: 60999,
            max_attempts: 100,
        }
    }
}

/// Language description reported to front-ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageInfo {
    pub name: String,
    pub version: String,
    pub mimetype: String,
    pub file_extension: String,
}

impl Default for LanguageInfo {
    fn default() -> Self {
        Self {
            name: "text".to_string(),
            version: String::new(),
            mimetype: "text/plain".to_string(),
            file_extension: ".txt".to_string(),
        }
    }
}

/// Values reported in `kernel_info_reply`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelInfoConfig {
    pub implementation: String,
    pub implementation_version: String,
    pub protocol_version: String,
    pub banner: String,
    #[serde(default)]
    pub language_info: LanguageInfo,
}

impl Default for KernelInfoConfig {
    fn default() -> Self {
        Self {
            implementation: "cellkernel".to_string(),
            implementation_version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: crate::envelope::PROTOCOL_VERSION.to_string(),
            banner: format!("cellkernel {}", env!("CARGO_PKG_VERSION")),
            language_info: LanguageInfo::default(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}
