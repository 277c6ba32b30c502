//! Single-flight execution engine.
//!
//! One dedicated worker thread runs every submitted body, strictly FIFO and
//! never two at once. Submission goes through a bounded queue (submitters
//! block when it is full) and each task resolves to exactly one
//! [`ExecutionResult`].
//!
//! Interruption is cooperative first: the running task's cancellation token
//! fires and the body is expected to notice via [`TaskContext::checkpoint`].
//! If the same task is still running after the grace window, the optional
//! [`ForceStop`] capability is tried; its failure is only logged.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::interrupts::{ForceStop, RunningTask, UnsupportedForceStop};
use super::recovery::with_recovery;
use crate::types::{Error, ExecutionConfig, Result};

/// Opaque per-task context value (e.g. the evaluator's session scope).
pub type Scope = Arc<dyn Any + Send + Sync>;

/// Outcome of one execution task.
#[derive(Debug)]
pub enum ExecutionResult<T> {
    Success(T),
    Failure(Error),
    Interrupted,
}

impl<T> ExecutionResult<T> {
    fn from_outcome(outcome: Result<T>) -> Self {
        match outcome {
            Ok(value) => ExecutionResult::Success(value),
            Err(e) if e.is_interrupted() => ExecutionResult::Interrupted,
            Err(e) => ExecutionResult::Failure(e),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success(_))
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, ExecutionResult::Interrupted)
    }

    pub fn into_result(self) -> Result<T> {
        match self {
            ExecutionResult::Success(value) => Ok(value),
            ExecutionResult::Failure(e) => Err(e),
            ExecutionResult::Interrupted => Err(Error::Interrupted),
        }
    }
}

// =============================================================================
// Task context
// =============================================================================

thread_local! {
    static CURRENT_TASK: RefCell<Option<TaskContext>> = const { RefCell::new(None) };
}

struct TaskInner {
    id: u64,
    name: String,
    cancel: CancellationToken,
    scope: Option<Scope>,
}

/// Handle a running body uses to learn about itself and about interruption.
#[derive(Clone)]
pub struct TaskContext {
    inner: Arc<TaskInner>,
}

impl TaskContext {
    fn new(id: u64, name: String, cancel: CancellationToken, scope: Option<Scope>) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                id,
                name,
                cancel,
                scope,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// `Err(Interrupted)` once the task has been asked to stop.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_interrupted() {
            Err(Error::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Token for bodies that wait on async work.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn scope(&self) -> Option<&Scope> {
        self.inner.scope.as_ref()
    }

    pub fn scope_as<S: Any + Send + Sync>(&self) -> Option<&S> {
        self.inner.scope.as_ref().and_then(|s| s.downcast_ref::<S>())
    }

    /// Context of the task running on this thread, if any.
    pub fn current() -> Option<TaskContext> {
        CURRENT_TASK.with(|current| current.borrow().clone())
    }

    fn enter(&self) -> CurrentGuard {
        let previous = CURRENT_TASK.with(|current| current.borrow_mut().replace(self.clone()));
        CurrentGuard { previous }
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

/// Restores the previous thread-local task on drop, panics included.
struct CurrentGuard {
    previous: Option<TaskContext>,
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_TASK.with(|current| *current.borrow_mut() = previous);
    }
}

// =============================================================================
// Pending execution
// =============================================================================

/// A submitted task whose result has not been collected yet.
#[derive(Debug)]
pub struct PendingExecution<T> {
    id: u64,
    rx: oneshot::Receiver<ExecutionResult<T>>,
}

impl<T> PendingExecution<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block until the task resolves. A task dropped unrun (engine shutdown)
    /// resolves to `Interrupted`.
    ///
    /// Panics when called from inside a tokio runtime; call it from a plain
    /// thread or wrap it in `spawn_blocking`.
    pub fn wait(self) -> ExecutionResult<T> {
        self.rx
            .blocking_recv()
            .unwrap_or(ExecutionResult::Interrupted)
    }
}

// =============================================================================
// Engine
// =============================================================================

type TaskBody = Box<dyn FnOnce(&TaskContext) + Send>;
type Job = Box<dyn FnOnce(&CancellationToken) + Send>;

struct QueuedTask {
    id: u64,
    name: String,
    scope: Option<Scope>,
    run: TaskBody,
}

struct ActiveTask {
    id: u64,
    name: String,
    cancel: CancellationToken,
}

struct EngineShared {
    config: ExecutionConfig,
    running: AtomicBool,
    active: Mutex<Option<ActiveTask>>,
    shutdown: AtomicBool,
    shutdown_token: CancellationToken,
    force_stop: Arc<dyn ForceStop>,
    next_id: AtomicU64,
}

impl EngineShared {
    fn active(&self) -> MutexGuard<'_, Option<ActiveTask>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn begin(&self, task: ActiveTask) {
        *self.active() = Some(task);
        self.running.store(true, Ordering::SeqCst);
    }

    fn finish(&self) {
        self.running.store(false, Ordering::SeqCst);
        *self.active() = None;
    }

    fn active_id(&self) -> Option<u64> {
        self.active().as_ref().map(|task| task.id)
    }
}

/// Single-worker scheduler for execution bodies.
pub struct ExecutionEngine {
    shared: Arc<EngineShared>,
    queue: Mutex<Option<mpsc::Sender<QueuedTask>>>,
    jobs: Mutex<Option<mpsc::UnboundedSender<Job>>>,
}

impl ExecutionEngine {
    /// Start the worker and the background-job thread.
    pub fn new(config: ExecutionConfig) -> Result<Self> {
        Self::with_force_stop(config, Arc::new(UnsupportedForceStop))
    }

    pub fn with_force_stop(config: ExecutionConfig, force_stop: Arc<dyn ForceStop>) -> Result<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(EngineShared {
            config,
            running: AtomicBool::new(false),
            active: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            shutdown_token: CancellationToken::new(),
            force_stop,
            next_id: AtomicU64::new(1),
        });

        let worker_shared = shared.clone();
        std::thread::Builder::new()
            .name(shared.config.worker_thread_name.clone())
            .spawn(move || worker_loop(worker_shared, queue_rx))?;

        let jobs_token = shared.shutdown_token.clone();
        std::thread::Builder::new()
            .name(format!("{}-jobs", shared.config.worker_thread_name))
            .spawn(move || jobs_loop(jobs_token, jobs_rx))?;

        tracing::info!(
            "Execution engine started (queue_capacity={})",
            shared.config.queue_capacity
        );

        Ok(Self {
            shared,
            queue: Mutex::new(Some(queue_tx)),
            jobs: Mutex::new(Some(jobs_tx)),
        })
    }

    /// Enqueue `body`; blocks only while the queue is full.
    ///
    /// Panics when called from inside a tokio runtime, like every blocking
    /// call on the engine.
    pub fn submit<T, F>(
        &self,
        name: impl Into<String>,
        scope: Option<Scope>,
        body: F,
    ) -> Result<PendingExecution<T>>
    where
        T: Send + 'static,
        F: FnOnce(&TaskContext) -> Result<T> + Send + 'static,
    {
        let sender = self
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(Error::Shutdown)?;

        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        let run: TaskBody = Box::new(move |ctx: &TaskContext| {
            let outcome = with_recovery(|| body(ctx), ctx.name());
            // The submitter may have stopped waiting; nothing to do then.
            let _ = tx.send(ExecutionResult::from_outcome(outcome));
        });

        let task = QueuedTask {
            id,
            name: name.into(),
            scope,
            run,
        };
        tracing::debug!("Submitting task {} ({})", task.name, id);
        sender.blocking_send(task).map_err(|_| Error::Shutdown)?;

        Ok(PendingExecution { id, rx })
    }

    /// Submit and block until the task resolves.
    ///
    /// Must not be called from inside a tokio runtime.
    pub fn run_execution<T, F>(
        &self,
        name: impl Into<String>,
        scope: Option<Scope>,
        body: F,
    ) -> ExecutionResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&TaskContext) -> Result<T> + Send + 'static,
    {
        match self.submit(name, scope, body) {
            Ok(pending) => pending.wait(),
            Err(e) => ExecutionResult::Failure(e),
        }
    }

    /// Whether the worker is inside a task body right now. Informational only.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn current_task(&self) -> Option<RunningTask> {
        self.shared.active().as_ref().map(|task| RunningTask {
            id: task.id,
            name: task.name.clone(),
        })
    }

    /// Interrupt the running task, if any. Returns false when idle.
    ///
    /// Blocks for the grace window when a task is running.
    pub fn interrupt_execution(&self) -> bool {
        if !self.is_running() {
            tracing::debug!("Interrupt requested with no running task");
            return false;
        }

        let target = {
            let active = self.shared.active();
            let Some(task) = active.as_ref() else {
                return false;
            };
            task.cancel.cancel();
            RunningTask {
                id: task.id,
                name: task.name.clone(),
            }
        };
        tracing::info!("Interrupting task {}", target);

        std::thread::sleep(self.shared.config.interrupt_grace);

        if self.shared.active_id() == Some(target.id) {
            tracing::warn!(
                "Task {} still running after {:?}, forcing stop",
                target,
                self.shared.config.interrupt_grace
            );
            if let Err(e) = self.shared.force_stop.force_stop(&target) {
                tracing::warn!("Forced stop of {} failed: {}", target, e);
            }
        }
        true
    }

    /// Run `job` on the background-job thread. Not ordered against cell
    /// execution; the token fires on engine shutdown.
    pub fn spawn_job<F>(&self, name: impl Into<String>, job: F) -> Result<()>
    where
        F: FnOnce(&CancellationToken) + Send + 'static,
    {
        let name = name.into();
        let sender = self
            .jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(Error::Shutdown)?;

        let job: Job = Box::new(move |token: &CancellationToken| {
            let _ = with_recovery(
                || {
                    job(token);
                    Ok(())
                },
                &name,
            );
        });
        sender.send(job).map_err(|_| Error::Shutdown)
    }

    /// Stop accepting work, drop queued tasks (they resolve `Interrupted`),
    /// interrupt the running task and cancel background jobs.
    ///
    /// Idempotent and non-blocking: the worker is never joined.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutting down execution engine");

        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        self.jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        self.shared.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }
}

impl Drop for ExecutionEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("running", &self.is_running())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

fn worker_loop(shared: Arc<EngineShared>, mut queue: mpsc::Receiver<QueuedTask>) {
    while let Some(task) = queue.blocking_recv() {
        if shared.shutdown.load(Ordering::SeqCst) {
            tracing::debug!("Dropping queued task {} after shutdown", task.name);
            continue;
        }

        // Child of the shutdown token: already cancelled if shutdown raced us.
        let cancel = shared.shutdown_token.child_token();
        let ctx = TaskContext::new(task.id, task.name.clone(), cancel.clone(), task.scope);
        shared.begin(ActiveTask {
            id: task.id,
            name: task.name.clone(),
            cancel,
        });

        let span = tracing::info_span!("execution", task = %task.name, id = task.id);
        {
            let _span = span.enter();
            let _current = ctx.enter();
            (task.run)(&ctx);
        }

        shared.finish();
    }
    tracing::debug!("Execution worker stopped");
}

fn jobs_loop(token: CancellationToken, mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = jobs.blocking_recv() {
        if token.is_cancelled() {
            continue;
        }
        job(&token);
    }
    tracing::debug!("Background job thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};
    use tracing_test::traced_test;

    fn engine() -> ExecutionEngine {
        ExecutionEngine::new(ExecutionConfig::default()).unwrap()
    }

    fn wait_until_running(engine: &ExecutionEngine) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !engine.is_running() {
            assert!(Instant::now() < deadline, "task never started");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_success_and_failure_mapping() {
        let engine = engine();
        let ok = engine.run_execution("ok", None, |_| Ok(41 + 1));
        assert!(matches!(ok, ExecutionResult::Success(42)));

        let failed: ExecutionResult<()> =
            engine.run_execution("fail", None, |_| Err(Error::validation("boom")));
        assert!(matches!(failed, ExecutionResult::Failure(Error::Validation(_))));

        let panicked: ExecutionResult<()> =
            engine.run_execution("panic", None, |_| -> Result<()> { panic!("kaboom") });
        assert!(matches!(panicked, ExecutionResult::Failure(Error::Internal(_))));

        // The worker survives a panicking body.
        assert!(engine.run_execution("after", None, |_| Ok(())).is_success());
    }

    #[test]
    fn test_tasks_run_fifo_and_never_overlap() {
        let engine = Arc::new(engine());
        let in_body = Arc::new(AtomicBool::new(false));
        let order = Arc::new(Mutex::new(Vec::new()));

        let pending: Vec<_> = (0..20)
            .map(|i| {
                let in_body = in_body.clone();
                let order = order.clone();
                engine
                    .submit(format!("task-{i}"), None, move |_| {
                        assert!(!in_body.swap(true, Ordering::SeqCst), "re-entered");
                        std::thread::sleep(Duration::from_millis(1));
                        order.lock().unwrap().push(i);
                        in_body.store(false, Ordering::SeqCst);
                        Ok(i)
                    })
                    .unwrap()
            })
            .collect();

        for (i, p) in pending.into_iter().enumerate() {
            assert!(matches!(p.wait(), ExecutionResult::Success(v) if v == i));
        }
        assert_eq!(*order.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_concurrent_submitters_are_serialized() {
        let engine = Arc::new(engine());
        let active = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let engine = engine.clone();
                let active = active.clone();
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        let active = active.clone();
                        let result = engine.run_execution("t", None, move |_| {
                            assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                            active.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        });
                        assert!(result.is_success());
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
    }

    #[test]
    fn test_interrupt_when_idle_is_noop() {
        let engine = engine();
        assert!(!engine.interrupt_execution());
    }

    #[test]
    fn test_cooperative_interrupt() {
        let engine = Arc::new(engine());
        let pending = engine
            .submit("spin", None, |ctx: &TaskContext| -> Result<()> {
                loop {
                    ctx.checkpoint()?;
                    std::thread::sleep(Duration::from_millis(2));
                }
            })
            .unwrap();

        wait_until_running(&engine);
        let started = Instant::now();
        assert!(engine.interrupt_execution());
        assert!(pending.wait().is_interrupted());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_uncooperative_task_escalates_to_force_stop() {
        let forced = Arc::new(AtomicUsize::new(0));
        let f = forced.clone();
        let release = Arc::new(AtomicBool::new(false));
        let r = release.clone();
        let stop = move |_: &RunningTask| -> Result<()> {
            f.fetch_add(1, Ordering::SeqCst);
            r.store(true, Ordering::SeqCst);
            Ok(())
        };
        let config = ExecutionConfig {
            interrupt_grace: Duration::from_millis(20),
            ..ExecutionConfig::default()
        };
        let engine = ExecutionEngine::with_force_stop(config, Arc::new(stop)).unwrap();

        let release_body = release.clone();
        let pending = engine
            .submit("stubborn", None, move |_| {
                while !release_body.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(2));
                }
                Ok(())
            })
            .unwrap();

        wait_until_running(&engine);
        assert!(engine.interrupt_execution());
        assert_eq!(forced.load(Ordering::SeqCst), 1);
        assert!(pending.wait().is_success());
    }

    #[test]
    #[traced_test]
    fn test_unsupported_force_stop_is_logged_not_raised() {
        let config = ExecutionConfig {
            interrupt_grace: Duration::from_millis(20),
            ..ExecutionConfig::default()
        };
        let engine = ExecutionEngine::new(config).unwrap();

        let release = Arc::new(AtomicBool::new(false));
        let r = release.clone();
        let pending = engine
            .submit("stubborn", None, move |_| {
                while !r.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(2));
                }
                Ok(())
            })
            .unwrap();

        wait_until_running(&engine);
        assert!(engine.interrupt_execution());
        assert!(logs_contain("Forced stop of"));

        release.store(true, Ordering::SeqCst);
        pending.wait();
        let next = engine.run_execution("next", None, |_| Ok(5));
        assert!(matches!(next, ExecutionResult::Success(5)));
    }

    #[test]
    fn test_current_context_is_set_and_restored() {
        let engine = engine();
        assert!(TaskContext::current().is_none());

        let scope: Scope = Arc::new(String::from("session-7"));
        let result = engine.run_execution("ctx", Some(scope), |ctx| {
            let current = TaskContext::current().ok_or(Error::internal("no context"))?;
            assert_eq!(current.id(), ctx.id());
            Ok(current.scope_as::<String>().cloned())
        });
        assert!(matches!(result, ExecutionResult::Success(Some(s)) if s == "session-7"));

        let after = engine.run_execution("next", None, |_| {
            Ok(TaskContext::current().map(|c| c.name().to_string()))
        });
        assert!(matches!(after, ExecutionResult::Success(Some(n)) if n == "next"));
    }

    #[test]
    fn test_shutdown_is_idempotent_and_rejects_work() {
        let engine = engine();
        engine.shutdown();
        engine.shutdown();
        assert!(engine.is_shutdown());
        assert!(matches!(
            engine.submit("late", None, |_| Ok(())),
            Err(Error::Shutdown)
        ));
        assert!(engine.spawn_job("late", |_| {}).is_err());
    }

    #[test]
    fn test_shutdown_interrupts_running_and_queued_tasks() {
        let engine = engine();
        let running = engine
            .submit("running", None, |ctx: &TaskContext| -> Result<()> {
                loop {
                    ctx.checkpoint()?;
                    std::thread::sleep(Duration::from_millis(2));
                }
            })
            .unwrap();
        let queued = engine.submit("queued", None, |_| Ok(())).unwrap();

        wait_until_running(&engine);
        engine.shutdown();

        assert!(running.wait().is_interrupted());
        assert!(queued.wait().is_interrupted());
    }

    #[test]
    fn test_background_job_sees_shutdown_token() {
        let engine = engine();
        let (tx, rx) = std::sync::mpsc::channel();
        engine
            .spawn_job("watcher", move |token| {
                let deadline = Instant::now() + Duration::from_secs(2);
                while !token.is_cancelled() && Instant::now() < deadline {
                    std::thread::sleep(Duration::from_millis(2));
                }
                tx.send(token.is_cancelled()).unwrap();
            })
            .unwrap();

        std::thread::sleep(Duration::from_millis(20));
        engine.shutdown();
        assert!(rx.recv().unwrap());
    }
}
