//! Magics: single-line commands embedded in a cell.
//!
//! A magic line starts with the marker character (`%` by default). The first
//! whitespace-separated token after the marker is the keyword, the rest of
//! the line is one opaque argument. Every other line is code; code lines are
//! concatenated in order to form the source handed to the evaluator.

use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use super::recovery::with_recovery;
use crate::types::{Error, PipelineStage, Result, StageError};

/// One magic line found in a cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagicInvocation {
    pub keyword: String,
    pub argument: String,
    /// Zero-based line number within the cell.
    pub line: usize,
    /// Byte range of the whole line (terminator included) within the cell.
    pub span: Range<usize>,
}

/// A cell split into code and magics.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedCell {
    pub code: String,
    pub magics: Vec<MagicInvocation>,
}

/// Split `source` into magic lines and the remaining code.
pub fn scan_magics(source: &str, marker: char) -> ParsedCell {
    let mut parsed = ParsedCell::default();
    let mut offset = 0;

    for (line, text) in source.split_inclusive('\n').enumerate() {
        let span = offset..offset + text.len();
        offset = span.end;

        let Some(body) = text.strip_prefix(marker) else {
            parsed.code.push_str(text);
            continue;
        };

        let body = body.trim_end_matches(['\n', '\r']).trim_start();
        let (keyword, argument) = match body.split_once(char::is_whitespace) {
            Some((keyword, rest)) => (keyword, rest.trim()),
            None => (body, ""),
        };
        parsed.magics.push(MagicInvocation {
            keyword: keyword.to_string(),
            argument: argument.to_string(),
            line,
            span,
        });
    }

    // A magic on the last line leaves a dangling terminator on the code.
    if parsed.magics.last().is_some_and(|m| m.span.end == source.len())
        && !source.ends_with('\n')
    {
        if let Some(stripped) = parsed.code.strip_suffix('\n') {
            parsed.code.truncate(stripped.len());
        }
    }

    parsed
}

// =============================================================================
// Session state
// =============================================================================

/// Which executed code is echoed back to the front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionTracking {
    #[default]
    Off,
    /// Echo everything that is evaluated.
    All,
    /// Echo only code produced by magic handlers.
    Generated,
}

impl ExecutionTracking {
    pub fn parse(argument: &str) -> Result<Self> {
        match argument.trim() {
            "" | "all" | "-all" => Ok(ExecutionTracking::All),
            "generated" | "-generated" => Ok(ExecutionTracking::Generated),
            "off" | "-off" => Ok(ExecutionTracking::Off),
            other => Err(Error::validation(format!(
                "trackExecution: expected -all, -generated or -off, got '{}'",
                other
            ))),
        }
    }
}

/// State magic handlers act on while one cell is processed.
///
/// `tracking` carries over between cells; `generated` is per cell.
#[derive(Debug, Default)]
pub struct MagicSession {
    pub tracking: ExecutionTracking,
    generated: Vec<String>,
}

impl MagicSession {
    /// Queue code to be evaluated before the cell's own code.
    pub fn add_generated(&mut self, code: impl Into<String>) {
        self.generated.push(code.into());
    }
}

/// Handler for one magic keyword.
pub trait MagicHandler: Send + Sync {
    fn handle(&self, argument: &str, session: &mut MagicSession) -> Result<()>;
}

impl<F> MagicHandler for F
where
    F: Fn(&str, &mut MagicSession) -> Result<()> + Send + Sync,
{
    fn handle(&self, argument: &str, session: &mut MagicSession) -> Result<()> {
        self(argument, session)
    }
}

struct TrackExecutionMagic;

impl MagicHandler for TrackExecutionMagic {
    fn handle(&self, argument: &str, session: &mut MagicSession) -> Result<()> {
        session.tracking = ExecutionTracking::parse(argument)?;
        tracing::debug!("Execution tracking set to {:?}", session.tracking);
        Ok(())
    }
}

/// How strictly `process` treats bad magics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MagicOptions {
    /// Log and skip unknown keywords and failing handlers.
    pub ignore_errors: bool,
    /// Split the cell without running any handler.
    pub parse_only: bool,
}

/// Result of preprocessing one cell.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessedCell {
    pub code: String,
    pub magics: Vec<MagicInvocation>,
    /// Code queued by handlers, to run before `code`.
    pub generated: Vec<String>,
}

// =============================================================================
// Processor
// =============================================================================

/// Keyword-dispatching magics preprocessor with its session state.
///
/// Handlers run against a per-call copy of the session, without any lock
/// held, so a handler may call back into the processor.
pub struct MagicsProcessor {
    marker: char,
    handlers: RwLock<HashMap<String, Arc<dyn MagicHandler>>>,
    tracking: Mutex<ExecutionTracking>,
}

impl MagicsProcessor {
    pub const TRACK_EXECUTION: &'static str = "trackExecution";

    pub fn new(marker: char) -> Self {
        let processor = Self {
            marker,
            handlers: RwLock::new(HashMap::new()),
            tracking: Mutex::new(ExecutionTracking::default()),
        };
        processor.register(Self::TRACK_EXECUTION, TrackExecutionMagic);
        processor
    }

    fn tracking_slot(&self) -> MutexGuard<'_, ExecutionTracking> {
        self.tracking
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add or replace the handler for `keyword`.
    pub fn register<H>(&self, keyword: impl Into<String>, handler: H)
    where
        H: MagicHandler + 'static,
    {
        let keyword = keyword.into();
        tracing::debug!("Registered magic {}", keyword);
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(keyword, Arc::new(handler));
    }

    /// Registered keywords, sorted.
    pub fn keywords(&self) -> Vec<String> {
        let mut keywords: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        keywords.sort();
        keywords
    }

    pub fn tracking(&self) -> ExecutionTracking {
        *self.tracking_slot()
    }

    fn handler(&self, keyword: &str) -> Option<Arc<dyn MagicHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(keyword)
            .cloned()
    }

    /// Split `source` and run each magic's handler in order.
    pub fn process(&self, source: &str, options: MagicOptions) -> Result<ProcessedCell> {
        let parsed = scan_magics(source, self.marker);
        if options.parse_only {
            return Ok(ProcessedCell {
                code: parsed.code,
                magics: parsed.magics,
                generated: Vec::new(),
            });
        }

        let mut session = MagicSession {
            tracking: self.tracking(),
            generated: Vec::new(),
        };
        let outcome = self.dispatch(&parsed.magics, &mut session, options);
        *self.tracking_slot() = session.tracking;
        outcome?;

        Ok(ProcessedCell {
            code: parsed.code,
            magics: parsed.magics,
            generated: session.generated,
        })
    }

    fn dispatch(
        &self,
        magics: &[MagicInvocation],
        session: &mut MagicSession,
        options: MagicOptions,
    ) -> Result<()> {
        for magic in magics {
            if magic.keyword.is_empty() {
                let e = Error::validation(format!(
                    "magic marker without a keyword on line {}",
                    magic.line + 1
                ));
                if options.ignore_errors {
                    tracing::warn!("Ignoring {}", e);
                    continue;
                }
                return Err(e);
            }

            let Some(handler) = self.handler(&magic.keyword) else {
                if options.ignore_errors {
                    tracing::warn!("Ignoring unknown magic {}", magic.keyword);
                    continue;
                }
                return Err(Error::UnknownMagic(magic.keyword.clone()));
            };

            let outcome = with_recovery(
                || handler.handle(&magic.argument, &mut *session),
                &magic.keyword,
            );
            if let Err(e) = outcome {
                if options.ignore_errors {
                    tracing::warn!("Ignoring failed magic {}: {}", magic.keyword, e);
                    continue;
                }
                return Err(StageError::new(PipelineStage::Magics, e).into());
            }
        }
        Ok(())
    }
}

impl fmt::Debug for MagicsProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MagicsProcessor")
            .field("marker", &self.marker)
            .field("keywords", &self.keywords())
            .finish()
    }
}
