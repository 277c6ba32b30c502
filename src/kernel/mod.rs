//! Kernel - wires sockets, comms and the cell pipeline into a running kernel.
//!
//! ```text
//!   shell pump ──┐                       ┌── IOPub (status, streams, results, comms)
//!                ├─ HandlerRegistry ─────┤
//! control pump ──┘        │              └── shell/control replies
//!                         ▼
//!                 CellOrchestrator ── ExecutionEngine (single worker)
//!                         │
//!                   stdin adapter (input_request / input_reply)
//! ```
//! Shell and control have a pump thread each, so an `interrupt_request` on
//! control is handled while the shell pump is blocked on a running cell.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::comm::CommManager;
use crate::envelope::{ExecutionState, Message, Signer};
use crate::ipc::{
    spawn_heartbeat, CallbackSocket, KernelTransports, ReceiveSocket, SendReceiveSocket,
    SendSocket, SocketRole, Transport,
};
use crate::types::{Config, PipelineStage, Result, SessionId};

pub mod callbacks;
pub mod cell;
pub mod executor;
pub mod handlers;
pub mod interrupts;
pub mod iopub;
pub mod magics;
mod recovery;

pub use callbacks::{Callback, CallbackList, PrioritizedCallbacks};
pub use cell::{
    CellContext, CellOrchestrator, CellOutput, CellReport, CellRequest, CellStatus, EvalContext,
    Evaluator, HookRegistry, InputProvider, NullOutput,
};
pub use executor::{ExecutionEngine, ExecutionResult, PendingExecution, Scope, TaskContext};
pub use handlers::{HandlerRegistry, MessageHandler};
pub use interrupts::{ForceStop, InterruptSignal, RunningTask, UnsupportedForceStop};
pub use iopub::{IopubCellOutput, IopubPublisher, StdinInput};
pub use magics::{
    scan_magics, ExecutionTracking, MagicHandler, MagicInvocation, MagicOptions, MagicSession,
    MagicsProcessor, ParsedCell, ProcessedCell,
};
pub use recovery::with_recovery;

// =============================================================================
// Shared state
// =============================================================================

/// State shared by every handler of a running kernel.
#[derive(Debug)]
pub struct KernelCore {
    config: Config,
    session: SessionId,
    iopub: Arc<IopubPublisher>,
    stdin: Arc<SendReceiveSocket>,
    cells: CellOrchestrator,
    comms: Arc<CommManager>,
    shutdown: CancellationToken,
    shutting_down: AtomicBool,
}

impl KernelCore {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn iopub(&self) -> &Arc<IopubPublisher> {
        &self.iopub
    }

    pub fn stdin(&self) -> &Arc<SendReceiveSocket> {
        &self.stdin
    }

    pub fn cells(&self) -> &CellOrchestrator {
        &self.cells
    }

    pub fn comms(&self) -> &Arc<CommManager> {
        &self.comms
    }

    /// Fires once the kernel has shut down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Run shutdown hooks, close every comm without notifying the peer, stop
    /// the engine, then stop the pumps and the heartbeat. Idempotent.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Kernel {} shutting down", self.session);

        let failures = self.cells.hooks().shutdown.run(&(), PipelineStage::Shutdown);
        if !failures.is_empty() {
            tracing::warn!("{} shutdown hook(s) failed", failures.len());
        }
        self.comms.close_all(false);
        self.cells.engine().shutdown();
        self.shutdown.cancel();
    }

    fn publish_status(&self, parent: Option<&Message>, state: ExecutionState) {
        if let Err(e) = self.iopub.publish_status(parent, state) {
            tracing::warn!("Failed to publish status {:?}: {}", state, e);
        }
    }

    /// Route one request to its handler, bracketed by busy/idle on IOPub.
    fn dispatch(
        &self,
        role: SocketRole,
        handlers: &HandlerRegistry,
        reply: &SendSocket,
        request: &Message,
    ) {
        let Some(handler) = handlers.get(request.msg_type()) else {
            tracing::warn!("Ignoring unhandled {} message: {}", role, request.msg_type());
            return;
        };

        if role == SocketRole::Shell {
            self.iopub.set_parent(request);
        }
        self.publish_status(Some(request), ExecutionState::Busy);
        if let Err(e) = handler.handle(self, reply, request) {
            tracing::warn!("{} handler for {} failed: {}", role, request.msg_type(), e);
        }
        self.publish_status(Some(request), ExecutionState::Idle);
    }
}

// =============================================================================
// Kernel
// =============================================================================

/// A running kernel. Dropping it shuts it down.
#[derive(Debug)]
pub struct Kernel {
    core: Arc<KernelCore>,
    shell_handlers: Arc<HandlerRegistry>,
    control_handlers: Arc<HandlerRegistry>,
    handle: Handle,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    heartbeat: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Kernel {
    /// Start a kernel over `transports`. Transport I/O runs on `handle`.
    ///
    /// Must be called from outside the runtime's async context.
    pub fn start(
        config: Config,
        transports: KernelTransports,
        evaluator: Arc<dyn Evaluator>,
        handle: Handle,
    ) -> Result<Self> {
        Self::start_with_force_stop(
            config,
            transports,
            evaluator,
            Arc::new(UnsupportedForceStop),
            handle,
        )
    }

    /// Like [`start`](Self::start), with a forced-stop capability for
    /// cells that ignore interrupts.
    pub fn start_with_force_stop(
        config: Config,
        transports: KernelTransports,
        evaluator: Arc<dyn Evaluator>,
        force_stop: Arc<dyn ForceStop>,
        handle: Handle,
    ) -> Result<Self> {
        let signer = Arc::new(Signer::new(
            &config.connection.signature_scheme,
            config.connection.key.as_bytes(),
        )?);
        let session = SessionId::new();
        let shutdown = CancellationToken::new();

        let receiver = |role: SocketRole, transport: &Arc<dyn Transport>| {
            Arc::new(CallbackSocket::new(
                ReceiveSocket::new(role, transport.clone(), signer.clone(), handle.clone())
                    .with_cancellation(shutdown.child_token()),
            ))
        };
        let sender = |role: SocketRole, transport: &Arc<dyn Transport>| {
            SendSocket::new(role, transport.clone(), signer.clone(), &handle)
        };

        let shell = receiver(SocketRole::Shell, &transports.shell);
        let control = receiver(SocketRole::Control, &transports.control);
        let stdin_pump = receiver(SocketRole::Stdin, &transports.stdin);
        let stdin = Arc::new(SendReceiveSocket::new(
            sender(SocketRole::Stdin, &transports.stdin),
            &stdin_pump,
            config.sockets.receive_queue_capacity,
            handle.clone(),
        ));
        let iopub = Arc::new(IopubPublisher::new(
            sender(SocketRole::IoPub, &transports.iopub),
            session.clone(),
        ));

        let comms = CommManager::new(iopub.clone());
        let engine = Arc::new(ExecutionEngine::with_force_stop(
            config.execution.clone(),
            force_stop,
        )?);
        let cells = CellOrchestrator::new(
            engine,
            evaluator,
            comms.clone(),
            config.execution.magic_marker,
        );

        let core = Arc::new(KernelCore {
            config,
            session,
            iopub,
            stdin,
            cells,
            comms,
            shutdown: shutdown.clone(),
            shutting_down: AtomicBool::new(false),
        });

        let shell_handlers = Arc::new(HandlerRegistry::shell());
        let control_handlers = Arc::new(HandlerRegistry::control());
        serve(
            &shell,
            core.clone(),
            shell_handlers.clone(),
            sender(SocketRole::Shell, &transports.shell),
        );
        serve(
            &control,
            core.clone(),
            control_handlers.clone(),
            sender(SocketRole::Control, &transports.control),
        );

        let heartbeat = spawn_heartbeat(transports.heartbeat.clone(), &handle, shutdown.child_token());
        let pumps = vec![
            shell.spawn_pump()?,
            control.spawn_pump()?,
            stdin_pump.spawn_pump()?,
        ];

        core.publish_status(None, ExecutionState::Starting);
        tracing::info!("Kernel {} started", core.session);

        Ok(Self {
            core,
            shell_handlers,
            control_handlers,
            handle,
            pumps: Mutex::new(pumps),
            heartbeat: Mutex::new(Some(heartbeat)),
        })
    }

    /// Bind the ports of `config.connection`, wait for the front-end to
    /// connect, then start.
    pub fn launch(config: Config, evaluator: Arc<dyn Evaluator>, handle: Handle) -> Result<Self> {
        let transports = handle.block_on(KernelTransports::bind_tcp(
            &config.connection,
            config.sockets.max_frame_bytes,
        ))?;
        Self::start(config, transports, evaluator, handle)
    }

    /// [`launch`](Self::launch) from a connection file.
    pub fn launch_from_file(
        path: impl AsRef<Path>,
        evaluator: Arc<dyn Evaluator>,
        handle: Handle,
    ) -> Result<Self> {
        Self::launch(Config::from_connection_file(path)?, evaluator, handle)
    }

    pub fn core(&self) -> &Arc<KernelCore> {
        &self.core
    }

    pub fn session(&self) -> &SessionId {
        self.core.session()
    }

    pub fn cells(&self) -> &CellOrchestrator {
        self.core.cells()
    }

    pub fn comms(&self) -> &Arc<CommManager> {
        self.core.comms()
    }

    pub fn hooks(&self) -> &HookRegistry {
        self.core.cells().hooks()
    }

    pub fn magics(&self) -> &MagicsProcessor {
        self.core.cells().magics()
    }

    pub fn shell_handlers(&self) -> &HandlerRegistry {
        &self.shell_handlers
    }

    pub fn control_handlers(&self) -> &HandlerRegistry {
        &self.control_handlers
    }

    pub fn shutdown(&self) {
        self.core.shutdown();
    }

    pub fn is_shutdown(&self) -> bool {
        self.core.is_shutdown()
    }

    /// Block until the kernel shuts down, then join the pumps and heartbeat.
    ///
    /// Must not be called from a pump thread or from inside the runtime.
    pub fn wait_for_shutdown(&self) {
        let token = self.core.shutdown_token();
        self.handle.block_on(token.cancelled());

        let pumps = std::mem::take(&mut *self.pumps.lock().unwrap_or_else(|p| p.into_inner()));
        for pump in pumps {
            let name = pump.thread().name().unwrap_or("pump").to_string();
            if pump.join().is_err() {
                tracing::warn!("{} panicked", name);
            }
        }

        let heartbeat = self.heartbeat.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(heartbeat) = heartbeat {
            if let Err(e) = self.handle.block_on(heartbeat) {
                tracing::warn!("heartbeat task failed: {}", e);
            }
        }
        tracing::info!("Kernel {} stopped", self.core.session);
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.core.shutdown();
    }
}

/// Dispatch every request received on `socket` through `handlers`.
fn serve(
    socket: &CallbackSocket,
    core: Arc<KernelCore>,
    handlers: Arc<HandlerRegistry>,
    reply: SendSocket,
) {
    let role = socket.role();
    socket.add_listener(move |request: &Message| {
        core.dispatch(role, &handlers, &reply, request);
        Ok(())
    });
}
