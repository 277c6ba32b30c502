//! # cellkernel - runtime core of an interactive code-execution kernel
//!
//! Provides:
//! - Signed multipart message envelopes (HMAC over header, parent, metadata, content)
//! - Socket roles over pluggable transports (send-only, blocking receive,
//!   callback pump, send-receive adapter) plus heartbeat echo
//! - Port negotiation for connection files
//! - Comm sessions: bidirectional channels opened by either side against a target
//! - A single-flight execution engine with cooperative interruption
//! - Cell orchestration: magics, before/after hooks and evaluation
//!
//! ## Architecture
//!
//! ```text
//!                 ┌────────────────────────────────────────────┐
//!   shell ──────► │  HandlerRegistry ──► CellOrchestrator      │
//!   control ────► │        │                   │               │
//!   stdin ◄─────► │        ▼                   ▼               │ ──► iopub
//!   heartbeat ◄─► │   CommManager       ExecutionEngine        │
//!                 └────────────────────────────────────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

// Re-export public API
pub mod comm;
pub mod envelope;
pub mod ipc;
pub mod kernel;
pub mod types;

// Internal utilities
pub mod observability;

pub use types::{Config, Error, Result};
