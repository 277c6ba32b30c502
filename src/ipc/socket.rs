//! Logical socket roles on top of a [`Transport`].
//!
//! Sockets are used from plain threads (pumps, the execution worker, caller
//! threads). Transport I/O runs on the tokio runtime behind `handle`; the
//! blocking calls here must not be made from inside an async context.
//!
//! - [`SendSocket`]: sign and enqueue; a writer task drains the queue in order.
//! - [`ReceiveSocket`]: blocking receive, `None` on transport failure or interrupt.
//! - [`CallbackSocket`]: a pump thread receives and dispatches to listeners.
//! - [`SendReceiveSocket`]: callback socket plus a bounded inbound queue.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::transport::{Frames, Transport};
use crate::envelope::{Message, Signer};
use crate::kernel::CallbackList;
use crate::types::{Error, Result};

/// Which kernel channel a socket serves. Used for thread names and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketRole {
    Shell,
    Control,
    Stdin,
    IoPub,
    Heartbeat,
}

impl SocketRole {
    pub fn as_str(self) -> &'static str {
        match self {
            SocketRole::Shell => "shell",
            SocketRole::Control => "control",
            SocketRole::Stdin => "stdin",
            SocketRole::IoPub => "iopub",
            SocketRole::Heartbeat => "heartbeat",
        }
    }
}

impl fmt::Display for SocketRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Send-only
// =============================================================================

/// Send-only socket. `send` never blocks on the transport.
#[derive(Debug, Clone)]
pub struct SendSocket {
    role: SocketRole,
    signer: Arc<Signer>,
    tx: mpsc::UnboundedSender<Frames>,
}

impl SendSocket {
    pub fn new(
        role: SocketRole,
        transport: Arc<dyn Transport>,
        signer: Arc<Signer>,
        handle: &Handle,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Frames>();
        handle.spawn(async move {
            while let Some(frames) = rx.recv().await {
                if let Err(e) = transport.send(frames).await {
                    tracing::warn!("{} send failed: {}", role, e);
                }
            }
            tracing::debug!("{} writer stopped", role);
        });

        Self { role, signer, tx }
    }

    pub fn role(&self) -> SocketRole {
        self.role
    }

    /// Sign `msg` and queue it for the writer. Messages leave in call order.
    pub fn send(&self, msg: &Message) -> Result<()> {
        let parts = msg.to_parts(&self.signer)?;
        tracing::debug!("{} -> {}", self.role, msg.msg_type());
        self.tx
            .send(parts)
            .map_err(|_| Error::transport(format!("{} writer is gone", self.role)))
    }
}

// =============================================================================
// Blocking receive
// =============================================================================

/// Outcome of one receive attempt.
#[derive(Debug)]
pub(crate) enum Received {
    Message(Message),
    /// A frame arrived but could not be used (transport error, bad signature, bad format).
    Skipped,
    /// Transport closed or socket interrupted.
    Closed,
}

/// Blocking-receive socket.
#[derive(Debug)]
pub struct ReceiveSocket {
    role: SocketRole,
    transport: Arc<dyn Transport>,
    signer: Arc<Signer>,
    handle: Handle,
    cancel: CancellationToken,
}

impl ReceiveSocket {
    pub fn new(
        role: SocketRole,
        transport: Arc<dyn Transport>,
        signer: Arc<Signer>,
        handle: Handle,
    ) -> Self {
        Self {
            role,
            transport,
            signer,
            handle,
            cancel: CancellationToken::new(),
        }
    }

    /// Tie this socket to an outer token (e.g. kernel shutdown).
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn role(&self) -> SocketRole {
        self.role
    }

    /// Block until the next valid message.
    ///
    /// Returns `None` when the transport fails, the message cannot be
    /// verified or parsed, the peer is gone, or the socket was interrupted.
    pub fn receive(&self) -> Option<Message> {
        match self.receive_next() {
            Received::Message(msg) => Some(msg),
            Received::Skipped | Received::Closed => None,
        }
    }

    /// Wake any blocked receive; later receives return `None` immediately.
    pub fn interrupt(&self) {
        self.cancel.cancel();
    }

    pub fn is_interrupted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn receive_next(&self) -> Received {
        let outcome = self.handle.block_on(async {
            tokio::select! {
                _ = self.cancel.cancelled() => None,
                frames = self.transport.recv() => Some(frames),
            }
        });

        match outcome {
            None => Received::Closed,
            Some(Ok(None)) => {
                tracing::debug!("{} transport closed", self.role);
                Received::Closed
            }
            Some(Err(e)) => {
                tracing::warn!("{} receive failed: {}", self.role, e);
                Received::Skipped
            }
            Some(Ok(Some(parts))) => match Message::from_parts(parts, &self.signer) {
                Ok(msg) => {
                    tracing::debug!("{} <- {}", self.role, msg.msg_type());
                    Received::Message(msg)
                }
                Err(e) => {
                    tracing::warn!("{} dropped invalid message: {}", self.role, e);
                    Received::Skipped
                }
            },
        }
    }
}

// =============================================================================
// Callback-based
// =============================================================================

/// Callback-based socket: one pump per socket delivers to every listener.
#[derive(Debug)]
pub struct CallbackSocket {
    receiver: ReceiveSocket,
    listeners: CallbackList<Message>,
}

impl CallbackSocket {
    pub fn new(receiver: ReceiveSocket) -> Self {
        Self {
            receiver,
            listeners: CallbackList::new(),
        }
    }

    pub fn role(&self) -> SocketRole {
        self.receiver.role()
    }

    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&Message) -> Result<()> + Send + Sync + 'static,
    {
        self.listeners.add(listener);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Receive and dispatch until the transport closes or the socket is
    /// interrupted. Listener failures are logged and skipped; a listener
    /// returning [`Error::Interrupted`] stops the pump.
    pub fn run_pump(&self) {
        let role = self.role();
        tracing::debug!("{} pump started", role);
        loop {
            match self.receiver.receive_next() {
                Received::Closed => break,
                Received::Skipped => continue,
                Received::Message(msg) => {
                    let failures = self.listeners.dispatch(&msg, role.as_str());
                    if failures.iter().any(Error::is_interrupted) {
                        tracing::info!("{} pump interrupted by listener", role);
                        break;
                    }
                }
            }
        }
        tracing::debug!("{} pump stopped", role);
    }

    /// Run the pump on a dedicated thread named `<role>-pump`.
    pub fn spawn_pump(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let socket = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("{}-pump", self.role()))
            .spawn(move || socket.run_pump())?;
        Ok(handle)
    }

    /// Stop the pump after the current dispatch.
    pub fn interrupt(&self) {
        self.receiver.interrupt();
    }
}

// =============================================================================
// Send-receive adapter
// =============================================================================

/// Request/response socket synthesized from a callback socket and a bounded
/// queue. The pump blocks once the queue is full.
#[derive(Debug)]
pub struct SendReceiveSocket {
    sender: SendSocket,
    inbound: Mutex<mpsc::Receiver<Message>>,
    handle: Handle,
}

impl SendReceiveSocket {
    pub fn new(
        sender: SendSocket,
        callbacks: &CallbackSocket,
        capacity: usize,
        handle: Handle,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let role = callbacks.role();
        callbacks.add_listener(move |msg| {
            tx.blocking_send(msg.clone())
                .map_err(|_| Error::transport(format!("{} receive queue closed", role)))
        });

        Self {
            sender,
            inbound: Mutex::new(rx),
            handle,
        }
    }

    pub fn send(&self, msg: &Message) -> Result<()> {
        self.sender.send(msg)
    }

    /// Next queued message; `None` once the pump is gone.
    pub fn receive(&self) -> Option<Message> {
        self.inbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .blocking_recv()
    }

    /// Like [`receive`](Self::receive), but gives up when `cancel` fires.
    pub fn receive_until(&self, cancel: &CancellationToken) -> Option<Message> {
        let mut inbound = self
            .inbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.handle.block_on(async {
            tokio::select! {
                _ = cancel.cancelled() => None,
                msg = inbound.recv() => msg,
            }
        })
    }
}

// =============================================================================
// Heartbeat
// =============================================================================

/// Echo raw heartbeat frames back unchanged until `cancel` fires.
pub fn spawn_heartbeat(
    transport: Arc<dyn Transport>,
    handle: &Handle,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    handle.spawn(async move {
        loop {
            let frames = tokio::select! {
                _ = cancel.cancelled() => break,
                frames = transport.recv() => frames,
            };
            match frames {
                Ok(Some(frames)) => {
                    if let Err(e) = transport.send(frames).await {
                        tracing::warn!("heartbeat echo failed: {}", e);
                    }
                }
                Ok(None) => break,
                Err(e) => tracing::warn!("heartbeat receive failed: {}", e),
            }
        }
        tracing::debug!("heartbeat stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageType;
    use crate::ipc::transport::MemoryTransport;
    use crate::types::SessionId;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tracing_test::traced_test;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    fn signer() -> Arc<Signer> {
        Arc::new(Signer::new("hmac-sha256", b"socket-key").unwrap())
    }

    fn message(n: u64) -> Message {
        Message::new(
            MessageType::ExecuteRequest,
            SessionId::new(),
            "test",
            json!({ "n": n }),
        )
    }

    #[test]
    fn test_send_then_receive_preserves_order() {
        let rt = runtime();
        let (a, b) = MemoryTransport::pair();
        let sender = SendSocket::new(SocketRole::Shell, Arc::new(a), signer(), rt.handle());
        let receiver = ReceiveSocket::new(SocketRole::Shell, Arc::new(b), signer(), rt.handle().clone());

        for n in 0..50 {
            sender.send(&message(n)).unwrap();
        }
        for n in 0..50 {
            let msg = receiver.receive().unwrap();
            assert_eq!(msg.content["n"], n);
        }
    }

    #[test]
    #[traced_test]
    fn test_receive_returns_none_on_bad_signature() {
        let rt = runtime();
        let (a, b) = MemoryTransport::pair();
        let wrong = Arc::new(Signer::new("hmac-sha256", b"other").unwrap());
        let sender = SendSocket::new(SocketRole::Shell, Arc::new(a), wrong, rt.handle());
        let receiver = ReceiveSocket::new(SocketRole::Shell, Arc::new(b), signer(), rt.handle().clone());

        sender.send(&message(1)).unwrap();
        assert!(receiver.receive().is_none());
        assert!(logs_contain("dropped invalid message"));
    }

    #[test]
    fn test_interrupt_wakes_blocked_receive() {
        let rt = runtime();
        let (_a, b) = MemoryTransport::pair();
        let receiver = Arc::new(ReceiveSocket::new(
            SocketRole::Control,
            Arc::new(b),
            signer(),
            rt.handle().clone(),
        ));

        let r = receiver.clone();
        let waiter = std::thread::spawn(move || r.receive());
        std::thread::sleep(Duration::from_millis(50));
        receiver.interrupt();

        assert!(waiter.join().unwrap().is_none());
        assert!(receiver.is_interrupted());
    }

    #[test]
    fn test_pump_survives_failing_listener() {
        let rt = runtime();
        let (a, b) = MemoryTransport::pair();
        let sender = SendSocket::new(SocketRole::Shell, Arc::new(a), signer(), rt.handle());
        let socket = Arc::new(CallbackSocket::new(ReceiveSocket::new(
            SocketRole::Shell,
            Arc::new(b),
            signer(),
            rt.handle().clone(),
        )));

        let seen = Arc::new(AtomicUsize::new(0));
        socket.add_listener(|_| Err(Error::internal("listener failure")));
        let s = seen.clone();
        socket.add_listener(move |msg| {
            s.fetch_add(1, Ordering::SeqCst);
            if msg.content["n"] == 2 {
                return Err(Error::Interrupted);
            }
            Ok(())
        });

        let pump = socket.spawn_pump().unwrap();
        for n in 0..3 {
            sender.send(&message(n)).unwrap();
        }

        pump.join().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_send_receive_adapter_queues_inbound() {
        let rt = runtime();
        let (kernel_side, client_side) = MemoryTransport::pair();
        let kernel_side: Arc<dyn Transport> = Arc::new(kernel_side);
        let client_side: Arc<dyn Transport> = Arc::new(client_side);

        let callbacks = Arc::new(CallbackSocket::new(ReceiveSocket::new(
            SocketRole::Stdin,
            kernel_side.clone(),
            signer(),
            rt.handle().clone(),
        )));
        let adapter = SendReceiveSocket::new(
            SendSocket::new(SocketRole::Stdin, kernel_side, signer(), rt.handle()),
            &callbacks,
            4,
            rt.handle().clone(),
        );
        let _pump = callbacks.spawn_pump().unwrap();

        let client_tx = SendSocket::new(SocketRole::Stdin, client_side.clone(), signer(), rt.handle());
        let client_rx = ReceiveSocket::new(SocketRole::Stdin, client_side, signer(), rt.handle().clone());

        adapter.send(&message(7)).unwrap();
        let request = client_rx.receive().unwrap();
        client_tx
            .send(&request.reply(MessageType::InputReply, json!({"value": "42"})))
            .unwrap();

        let reply = adapter.receive().unwrap();
        assert_eq!(reply.content["value"], "42");

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(adapter.receive_until(&cancel).is_none());
        callbacks.interrupt();
    }

    #[test]
    fn test_send_receive_adapter_blocks_pump_when_full() {
        let rt = runtime();
        let (kernel_side, client_side) = MemoryTransport::pair();
        let kernel_side: Arc<dyn Transport> = Arc::new(kernel_side);

        let callbacks = Arc::new(CallbackSocket::new(ReceiveSocket::new(
            SocketRole::Stdin,
            kernel_side.clone(),
            signer(),
            rt.handle().clone(),
        )));
        let adapter = SendReceiveSocket::new(
            SendSocket::new(SocketRole::Stdin, kernel_side, signer(), rt.handle()),
            &callbacks,
            1,
            rt.handle().clone(),
        );
        // Runs after the adapter's listener, so it counts completed deliveries.
        let delivered = Arc::new(AtomicUsize::new(0));
        let d = delivered.clone();
        callbacks.add_listener(move |_: &Message| {
            d.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let _pump = callbacks.spawn_pump().unwrap();

        let client_tx = SendSocket::new(SocketRole::Stdin, Arc::new(client_side), signer(), rt.handle());
        for n in 0..3 {
            client_tx.send(&message(n)).unwrap();
        }

        let wait_for = |expected: usize| {
            for _ in 0..200 {
                if delivered.load(Ordering::SeqCst) >= expected {
                    return;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            panic!("pump never delivered message {expected}");
        };

        wait_for(1);
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(delivered.load(Ordering::SeqCst), 1);

        assert_eq!(adapter.receive().unwrap().content["n"], 0);
        wait_for(2);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(delivered.load(Ordering::SeqCst), 2);

        assert_eq!(adapter.receive().unwrap().content["n"], 1);
        assert_eq!(adapter.receive().unwrap().content["n"], 2);
        wait_for(3);
        callbacks.interrupt();
    }

    #[test]
    fn test_heartbeat_echoes_raw_frames() {
        let rt = runtime();
        let (kernel_side, client_side) = MemoryTransport::pair();
        let cancel = CancellationToken::new();
        let task = spawn_heartbeat(Arc::new(kernel_side), rt.handle(), cancel.clone());

        rt.block_on(async {
            client_side.send(vec![b"ping".to_vec()]).await.unwrap();
            assert_eq!(client_side.recv().await.unwrap(), Some(vec![b"ping".to_vec()]));
        });

        cancel.cancel();
        rt.block_on(task).unwrap();
    }
}
