//! Wire plumbing: framing, transports, socket roles and port negotiation.

pub mod codec;
pub mod ports;
pub mod socket;
pub mod transport;

pub use ports::{allocate_connection_info, PortRegistry};
pub use socket::{
    spawn_heartbeat, CallbackSocket, ReceiveSocket, SendReceiveSocket, SendSocket, SocketRole,
};
pub use transport::{Frames, KernelTransports, MemoryTransport, TcpTransport, Transport};
