//! Cell orchestration: magics, hooks and evaluation on the execution engine.
//!
//! One cell runs as one engine task:
//! ```text
//! magics -> before-cell hooks -> generated code -> cell code -> after-cell hooks
//! ```
//! Hook failures are collected with their stage tag and reported next to,
//! never instead of, the cell's own outcome. After-cell hooks run whatever
//! the evaluation did.

use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use super::callbacks::PrioritizedCallbacks;
use super::executor::{ExecutionEngine, ExecutionResult, TaskContext};
use super::magics::{
    ExecutionTracking, MagicInvocation, MagicOptions, MagicsProcessor, ProcessedCell,
};
use crate::comm::CommManager;
use crate::envelope::StreamName;
use crate::types::{Error, PipelineStage, Result, StageError};

// =============================================================================
// Collaborator seams
// =============================================================================

/// Compiles and runs source against the session's accumulated state.
pub trait Evaluator: Send + Sync {
    /// Evaluate `code`. `Ok(None)` means the code produced no value.
    fn evaluate(&self, code: &str, ctx: &EvalContext) -> Result<Option<Value>>;
}

/// Reads a line of input from the front-end on behalf of running code.
pub trait InputProvider: Send + Sync {
    fn read_line(&self, prompt: &str, password: bool) -> Result<String>;
}

/// Where a running cell's side output goes (IOPub in a running kernel).
pub trait CellOutput: Send + Sync {
    /// Called once the cell has its execution count, before it is queued.
    fn started(&self, _execution_count: u32, _code: &str) {}
    fn stream(&self, name: StreamName, text: &str);
    fn display(&self, data: Value);
}

/// Output sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullOutput;

impl CellOutput for NullOutput {
    fn stream(&self, _: StreamName, _: &str) {}
    fn display(&self, _: Value) {}
}

/// What the evaluator can reach while a cell runs.
#[derive(Clone)]
pub struct EvalContext {
    pub task: TaskContext,
    pub execution_count: u32,
    pub comms: Arc<CommManager>,
    pub output: Arc<dyn CellOutput>,
    pub input: Option<Arc<dyn InputProvider>>,
}

impl EvalContext {
    pub fn print(&self, text: &str) {
        self.output.stream(StreamName::Stdout, text);
    }

    pub fn eprint(&self, text: &str) {
        self.output.stream(StreamName::Stderr, text);
    }

    /// Ask the front-end for input. Fails when the request disallowed stdin.
    pub fn read_line(&self, prompt: &str, password: bool) -> Result<String> {
        match &self.input {
            Some(input) => input.read_line(prompt, password),
            None => Err(Error::validation(
                "stdin is not available for this request",
            )),
        }
    }
}

impl fmt::Debug for EvalContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvalContext")
            .field("task", &self.task)
            .field("execution_count", &self.execution_count)
            .field("stdin", &self.input.is_some())
            .finish()
    }
}

// =============================================================================
// Hooks
// =============================================================================

/// Where a cell is when a hook sees it.
#[derive(Debug, Clone, PartialEq)]
pub enum CellStatus {
    Running,
    Completed(Option<Value>),
    Failed(String),
}

/// Payload passed to before/after-cell hooks.
#[derive(Debug, Clone)]
pub struct CellContext {
    pub execution_count: u32,
    pub code: String,
    pub status: CellStatus,
}

/// Extension hooks around cell execution and kernel shutdown.
#[derive(Debug, Default)]
pub struct HookRegistry {
    pub before_cell: PrioritizedCallbacks<CellContext>,
    pub after_cell: PrioritizedCallbacks<CellContext>,
    pub shutdown: PrioritizedCallbacks<()>,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// One cell to run.
#[derive(Clone)]
pub struct CellRequest {
    pub code: String,
    pub store_history: bool,
    pub magic_options: MagicOptions,
    pub output: Arc<dyn CellOutput>,
    pub input: Option<Arc<dyn InputProvider>>,
}

impl CellRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            store_history: true,
            magic_options: MagicOptions::default(),
            output: Arc::new(NullOutput),
            input: None,
        }
    }

    pub fn with_output(mut self, output: Arc<dyn CellOutput>) -> Self {
        self.output = output;
        self
    }

    pub fn with_input(mut self, input: Arc<dyn InputProvider>) -> Self {
        self.input = Some(input);
        self
    }
}

impl fmt::Debug for CellRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CellRequest")
            .field("code", &self.code)
            .field("store_history", &self.store_history)
            .field("magic_options", &self.magic_options)
            .finish()
    }
}

/// Everything that happened while running one cell.
#[derive(Debug)]
pub struct CellReport {
    pub execution_count: u32,
    pub outcome: ExecutionResult<Option<Value>>,
    pub magics: Vec<MagicInvocation>,
    pub hook_failures: Vec<StageError>,
}

#[derive(Default)]
struct CellTrace {
    magics: Vec<MagicInvocation>,
    hook_failures: Vec<StageError>,
}

struct OrchestratorInner {
    engine: Arc<ExecutionEngine>,
    magics: MagicsProcessor,
    hooks: HookRegistry,
    evaluator: Arc<dyn Evaluator>,
    comms: Arc<CommManager>,
    execution_count: AtomicU32,
}

/// Runs cells end to end on the execution engine.
#[derive(Clone)]
pub struct CellOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl CellOrchestrator {
    pub fn new(
        engine: Arc<ExecutionEngine>,
        evaluator: Arc<dyn Evaluator>,
        comms: Arc<CommManager>,
        magic_marker: char,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                engine,
                magics: MagicsProcessor::new(magic_marker),
                hooks: HookRegistry::default(),
                evaluator,
                comms,
                execution_count: AtomicU32::new(0),
            }),
        }
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.inner.engine
    }

    pub fn magics(&self) -> &MagicsProcessor {
        &self.inner.magics
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.inner.hooks
    }

    pub fn comms(&self) -> &Arc<CommManager> {
        &self.inner.comms
    }

    pub fn execution_count(&self) -> u32 {
        self.inner.execution_count.load(Ordering::SeqCst)
    }

    fn reserve_execution_count(&self, store_history: bool) -> u32 {
        if store_history {
            self.inner.execution_count.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            self.execution_count()
        }
    }

    /// Run one cell and block until it resolves.
    pub fn execute_cell(&self, request: CellRequest) -> CellReport {
        let execution_count = self.reserve_execution_count(request.store_history);
        request.output.started(execution_count, &request.code);
        let trace = Arc::new(Mutex::new(CellTrace::default()));

        let inner = self.inner.clone();
        let body_trace = trace.clone();
        let outcome = self.inner.engine.run_execution(
            format!("cell-{}", execution_count),
            None,
            move |task: &TaskContext| run_cell(&inner, request, execution_count, task, &body_trace),
        );

        let trace = std::mem::take(&mut *trace.lock().unwrap_or_else(|p| p.into_inner()));
        CellReport {
            execution_count,
            outcome,
            magics: trace.magics,
            hook_failures: trace.hook_failures,
        }
    }
}

impl fmt::Debug for CellOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CellOrchestrator")
            .field("execution_count", &self.execution_count())
            .field("magics", &self.inner.magics)
            .finish()
    }
}

fn record_failures(trace: &Mutex<CellTrace>, failures: Vec<StageError>) {
    if failures.is_empty() {
        return;
    }
    trace
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .hook_failures
        .extend(failures);
}

/// Body of the engine task for one cell.
fn run_cell(
    inner: &OrchestratorInner,
    request: CellRequest,
    execution_count: u32,
    task: &TaskContext,
    trace: &Mutex<CellTrace>,
) -> Result<Option<Value>> {
    let processed = inner.magics.process(&request.code, request.magic_options)?;
    trace
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .magics
        .clone_from(&processed.magics);

    let mut cell = CellContext {
        execution_count,
        code: processed.code.clone(),
        status: CellStatus::Running,
    };
    record_failures(trace, inner.hooks.before_cell.run(&cell, PipelineStage::BeforeCell));

    let ctx = EvalContext {
        task: task.clone(),
        execution_count,
        comms: inner.comms.clone(),
        output: request.output.clone(),
        input: request.input.clone(),
    };
    let evaluated = evaluate_cell(inner, &processed, &ctx);

    cell.status = match &evaluated {
        Ok(value) => CellStatus::Completed(value.clone()),
        Err(e) => CellStatus::Failed(e.to_string()),
    };
    record_failures(trace, inner.hooks.after_cell.run(&cell, PipelineStage::AfterCell));

    evaluated
}

/// Generated code first, then the cell's own code, echoing per tracking mode.
fn evaluate_cell(
    inner: &OrchestratorInner,
    processed: &ProcessedCell,
    ctx: &EvalContext,
) -> Result<Option<Value>> {
    let tracking = inner.magics.tracking();

    for generated in &processed.generated {
        ctx.task.checkpoint()?;
        if tracking != ExecutionTracking::Off {
            ctx.output.stream(StreamName::Stdout, &echo(generated));
        }
        inner.evaluator.evaluate(generated, ctx)?;
    }

    ctx.task.checkpoint()?;
    if processed.code.trim().is_empty() {
        return Ok(None);
    }
    if tracking == ExecutionTracking::All {
        ctx.output.stream(StreamName::Stdout, &echo(&processed.code));
    }
    inner.evaluator.evaluate(&processed.code, ctx)
}

fn echo(code: &str) -> String {
    if code.ends_with('\n') {
        code.to_string()
    } else {
        format!("{}\n", code)
    }
}
