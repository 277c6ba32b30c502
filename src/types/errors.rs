//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.

use std::fmt;

use thiserror::Error;

use super::CommId;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the kernel runtime.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid caller input (missing fields, bad magic arguments, ...).
    #[error("validation error: {0}")]
    Validation(String),

    /// Resource not found (unknown comm id, unknown message type, ...).
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed wire message or frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Signature mismatch or unsupported signature scheme.
    #[error("signature error: {0}")]
    Signature(String),

    /// Transport failure (closed channel, writer gone, ...).
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation on a comm that has already been closed.
    #[error("comm {0} is closed")]
    CommClosed(CommId),

    /// Magic keyword with no registered handler.
    #[error("unknown magic: {0}")]
    UnknownMagic(String),

    /// Port negotiation gave up.
    #[error("no free port in {start}..={end} after {attempts} attempts")]
    PortsExhausted { start: u16, end: u16, attempts: u32 },

    /// Execution was interrupted (cooperatively or forcibly).
    #[error("execution interrupted")]
    Interrupted,

    /// The forced-stop capability is not available on this runtime.
    #[error("forced termination is not supported: {0}")]
    ForceStopUnsupported(String),

    /// The kernel (or one of its components) is shutting down.
    #[error("kernel is shutting down")]
    Shutdown,

    /// Extension-callback failure tagged with its pipeline stage.
    #[error(transparent)]
    Stage(#[from] StageError),

    /// Internal errors, including contained panics.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Short stable name reported to front-ends as `ename`.
    pub fn ename(&self) -> &'static str {
        match self {
            Error::Validation(_) => "ValidationError",
            Error::NotFound(_) => "NotFound",
            Error::Protocol(_) => "ProtocolError",
            Error::Signature(_) => "SignatureError",
            Error::Transport(_) => "TransportError",
            Error::CommClosed(_) => "CommClosed",
            Error::UnknownMagic(_) => "UnknownMagic",
            Error::PortsExhausted { .. } => "PortsExhausted",
            Error::Interrupted => "Interrupted",
            Error::ForceStopUnsupported(_) => "ForceStopUnsupported",
            Error::Shutdown => "Shutdown",
            Error::Stage(_) => "StageError",
            Error::Internal(_) => "InternalError",
            Error::Serialization(_) => "SerializationError",
            Error::Io(_) => "IoError",
        }
    }

    /// True for the interruption signal, including one wrapped in a stage error.
    pub fn is_interrupted(&self) -> bool {
        match self {
            Error::Interrupted => true,
            Error::Stage(stage) => stage.source.is_interrupted(),
            _ => false,
        }
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn signature(msg: impl Into<String>) -> Self {
        Self::Signature(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Named stage of the cell/kernel pipeline that extension callbacks hook into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    BeforeCell,
    AfterCell,
    Magics,
    CommOpen,
    Shutdown,
}

impl PipelineStage {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStage::BeforeCell => "before-cell",
            PipelineStage::AfterCell => "after-cell",
            PipelineStage::Magics => "magics",
            PipelineStage::CommOpen => "comm-open",
            PipelineStage::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A callback failure wrapped with the stage it happened in.
#[derive(Error, Debug)]
#[error("{stage} stage failed: {source}")]
pub struct StageError {
    pub stage: PipelineStage,
    #[source]
    pub source: Box<Error>,
}

impl StageError {
    pub fn new(stage: PipelineStage, source: Error) -> Self {
        Self {
            stage,
            source: Box::new(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_stage_error_preserves_cause() {
        let err = StageError::new(PipelineStage::BeforeCell, Error::validation("bad hook"));
        assert_eq!(err.to_string(), "before-cell stage failed: validation error: bad hook");

        let cause = err.source().unwrap();
        assert_eq!(cause.to_string(), "validation error: bad hook");
    }

    #[test]
    fn test_stage_error_converts_into_error() {
        let err: Error = StageError::new(PipelineStage::Shutdown, Error::Interrupted).into();
        assert_eq!(err.ename(), "StageError");
        assert!(err.is_interrupted());
        assert!(err.to_string().starts_with("shutdown stage failed"));
    }

    #[test]
    fn test_ename_is_stable() {
        assert_eq!(Error::Interrupted.ename(), "Interrupted");
        assert_eq!(Error::UnknownMagic("x".into()).ename(), "UnknownMagic");
        assert!(!Error::Shutdown.is_interrupted());
    }
}
