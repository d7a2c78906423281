//! Inter-process plumbing for the tile farm: process topology, messages and
//! their wire encoding, the transports that move them, and the two-message
//! tile transfer built on top.

pub mod codec;
mod fabric;
mod mailbox;
mod message;
mod tcp;
mod tile_transfer;
mod topology;
mod transport;

pub use codec::WireError;
pub use fabric::{FabricEndpoint, LocalFabric};
pub use message::{Envelope, Message, MessageKind, MessageTag, ReceiveFilter};
pub use tcp::TcpTransport;
pub use tile_transfer::{ReceivedTile, TransferError, complete_tile, recv_tile, send_tile};
pub use topology::{COORDINATOR_RANK, ProcessTopology, Rank, TopologyError, WorkerIndex};
pub use transport::{Transport, TransportError};
