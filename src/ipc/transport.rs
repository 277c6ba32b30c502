//! Byte-framed transports underneath the logical sockets.
//!
//! A transport moves multipart frames in both directions. Nothing above
//! this trait knows whether frames travel over TCP or an in-process channel.

use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};

use super::codec::{read_multipart, write_multipart};
use crate::types::{ConnectionInfo, Error, Result};

/// One multipart frame.
pub type Frames = Vec<Vec<u8>>;

/// Bidirectional multipart transport.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Send one frame.
    async fn send(&self, frames: Frames) -> std::io::Result<()>;

    /// Receive the next frame. `Ok(None)` once the peer is gone.
    async fn recv(&self) -> std::io::Result<Option<Frames>>;
}

// =============================================================================
// In-process transport
// =============================================================================

/// In-process transport backed by tokio channels. Created in connected pairs.
#[derive(Debug)]
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Frames>,
    rx: Mutex<mpsc::UnboundedReceiver<Frames>>,
}

impl MemoryTransport {
    /// Two connected ends: what one sends, the other receives.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: a_tx,
                rx: Mutex::new(b_rx),
            },
            Self {
                tx: b_tx,
                rx: Mutex::new(a_rx),
            },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, frames: Frames) -> std::io::Result<()> {
        self.tx.send(frames).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "memory transport peer dropped")
        })
    }

    async fn recv(&self) -> std::io::Result<Option<Frames>> {
        Ok(self.rx.lock().await.recv().await)
    }
}

// =============================================================================
// TCP transport
// =============================================================================

/// One TCP connection carrying length-prefixed multipart frames.
#[derive(Debug)]
pub struct TcpTransport {
    peer: SocketAddr,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    max_frame_bytes: u32,
}

impl TcpTransport {
    pub fn new(stream: TcpStream, max_frame_bytes: u32) -> std::io::Result<Self> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            peer,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            max_frame_bytes,
        })
    }

    pub async fn connect(addr: &str, max_frame_bytes: u32) -> std::io::Result<Self> {
        Self::new(TcpStream::connect(addr).await?, max_frame_bytes)
    }

    /// Accept exactly one peer on `listener`.
    pub async fn accept(listener: &TcpListener, max_frame_bytes: u32) -> std::io::Result<Self> {
        let (stream, peer) = listener.accept().await?;
        tracing::debug!("Transport peer connected from {}", peer);
        Self::new(stream, max_frame_bytes)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, frames: Frames) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        write_multipart(&mut *writer, &frames).await
    }

    async fn recv(&self) -> std::io::Result<Option<Frames>> {
        let mut reader = self.reader.lock().await;
        match read_multipart(&mut *reader, self.max_frame_bytes).await {
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::UnexpectedEof
                ) =>
            {
                tracing::debug!("Transport peer {} gone: {}", self.peer, e);
                Ok(None)
            }
            other => other,
        }
    }
}

// =============================================================================
// Transport bundle
// =============================================================================

/// The five transports a kernel talks over.
#[derive(Debug, Clone)]
pub struct KernelTransports {
    pub shell: Arc<dyn Transport>,
    pub control: Arc<dyn Transport>,
    pub stdin: Arc<dyn Transport>,
    pub iopub: Arc<dyn Transport>,
    pub heartbeat: Arc<dyn Transport>,
}

impl KernelTransports {
    /// In-process transports: `(kernel side, client side)`.
    pub fn memory() -> (Self, Self) {
        let (shell_k, shell_c) = MemoryTransport::pair();
        let (control_k, control_c) = MemoryTransport::pair();
        let (stdin_k, stdin_c) = MemoryTransport::pair();
        let (iopub_k, iopub_c) = MemoryTransport::pair();
        let (hb_k, hb_c) = MemoryTransport::pair();
        (
            Self {
                shell: Arc::new(shell_k),
                control: Arc::new(control_k),
                stdin: Arc::new(stdin_k),
                iopub: Arc::new(iopub_k),
                heartbeat: Arc::new(hb_k),
            },
            Self {
                shell: Arc::new(shell_c),
                control: Arc::new(control_c),
                stdin: Arc::new(stdin_c),
                iopub: Arc::new(iopub_c),
                heartbeat: Arc::new(hb_c),
            },
        )
    }

    /// Bind every port of `info` and accept one front-end connection on each.
    pub async fn bind_tcp(info: &ConnectionInfo, max_frame_bytes: u32) -> Result<Self> {
        if info.transport != "tcp" {
            return Err(Error::validation(format!(
                "unsupported transport: {}",
                info.transport
            )));
        }

        let shell = TcpListener::bind(info.address(info.shell_port)).await?;
        let control = TcpListener::bind(info.address(info.control_port)).await?;
        let stdin = TcpListener::bind(info.address(info.stdin_port)).await?;
        let iopub = TcpListener::bind(info.address(info.iopub_port)).await?;
        let heartbeat = TcpListener::bind(info.address(info.hb_port)).await?;
        tracing::info!("Kernel listening on {} (shell port {})", info.ip, info.shell_port);

        let (shell, control, stdin, iopub, heartbeat) = tokio::try_join!(
            TcpTransport::accept(&shell, max_frame_bytes),
            TcpTransport::accept(&control, max_frame_bytes),
            TcpTransport::accept(&stdin, max_frame_bytes),
            TcpTransport::accept(&iopub, max_frame_bytes),
            TcpTransport::accept(&heartbeat, max_frame_bytes),
        )?;

        Ok(Self {
            shell: Arc::new(shell),
            control: Arc::new(control),
            stdin: Arc::new(stdin),
            iopub: Arc::new(iopub),
            heartbeat: Arc::new(heartbeat),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_pair_is_bidirectional() {
        let (a, b) = MemoryTransport::pair();
        a.send(vec![b"ping".to_vec()]).await.unwrap();
        b.send(vec![b"pong".to_vec()]).await.unwrap();

        assert_eq!(b.recv().await.unwrap(), Some(vec![b"ping".to_vec()]));
        assert_eq!(a.recv().await.unwrap(), Some(vec![b"pong".to_vec()]));
    }

    #[tokio::test]
    async fn test_memory_recv_returns_none_when_peer_dropped() {
        let (a, b) = MemoryTransport::pair();
        drop(b);
        assert_eq!(a.recv().await.unwrap(), None);
        assert!(a.send(vec![]).await.is_err());
    }

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let accept = tokio::spawn(async move { TcpTransport::accept(&listener, 1 << 20).await });
        let client = TcpTransport::connect(&addr, 1 << 20).await.unwrap();
        let server = accept.await.unwrap().unwrap();

        let frames = vec![b"id".to_vec(), b"<IDS|MSG>".to_vec(), b"{}".to_vec()];
        client.send(frames.clone()).await.unwrap();
        assert_eq!(server.recv().await.unwrap(), Some(frames));

        drop(client);
        assert_eq!(server.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_bundle_connects_matching_roles() {
        let (kernel, client) = KernelTransports::memory();
        client.shell.send(vec![b"shell".to_vec()]).await.unwrap();
        client.control.send(vec![b"control".to_vec()]).await.unwrap();

        assert_eq!(kernel.shell.recv().await.unwrap(), Some(vec![b"shell".to_vec()]));
        assert_eq!(kernel.control.recv().await.unwrap(), Some(vec![b"control".to_vec()]));
    }

    #[tokio::test]
    async fn test_bind_tcp_rejects_unknown_transport() {
        let info = ConnectionInfo {
            transport: "ipc".to_string(),
            ..ConnectionInfo::default()
        };
        let err = KernelTransports::bind_tcp(&info, 1024).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
