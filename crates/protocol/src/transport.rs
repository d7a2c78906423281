use std::fmt;
use std::io;
use std::time::Duration;

use crate::codec::WireError;
use crate::{Envelope, Message, MessageTag, ProcessTopology, Rank, ReceiveFilter, TopologyError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Io { kind: io::ErrorKind, message: String },
    Wire(WireError),
    Topology(TopologyError),
    UnknownRank(Rank),
    /// The peer a receive is pinned to went away.
    PeerClosed(Rank),
    /// Every peer went away, nothing can arrive anymore.
    AllPeersClosed,
    Timeout,
    Handshake(String),
    /// The coordinator stopped waiting with workers still missing.
    AcceptTimeout { joined: usize, expected: usize },
    AcceptAborted(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Io { kind, message } => {
                write!(formatter, "transport i/o failed ({kind:?}): {message}")
            }
            TransportError::Wire(error) => write!(formatter, "malformed frame: {error}"),
            TransportError::Topology(error) => write!(formatter, "bad topology: {error}"),
            TransportError::UnknownRank(rank) => write!(formatter, "no route to {rank}"),
            TransportError::PeerClosed(rank) => write!(formatter, "{rank} closed its connection"),
            TransportError::AllPeersClosed => write!(formatter, "every peer closed its connection"),
            TransportError::Timeout => write!(formatter, "receive timed out"),
            TransportError::Handshake(reason) => write!(formatter, "handshake failed: {reason}"),
            TransportError::AcceptTimeout { joined, expected } => write!(
                formatter,
                "only {joined} of {expected} workers joined before the deadline"
            ),
            TransportError::AcceptAborted(reason) => {
                write!(formatter, "stopped waiting for workers: {reason}")
            }
        }
    }
}

impl std::error::Error for TransportError {}

impl From<io::Error> for TransportError {
    fn from(error: io::Error) -> Self {
        TransportError::Io {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl From<WireError> for TransportError {
    fn from(error: WireError) -> Self {
        TransportError::Wire(error)
    }
}

impl From<TopologyError> for TransportError {
    fn from(error: TopologyError) -> Self {
        TransportError::Topology(error)
    }
}

/// Point-to-point message passing between the processes of one topology.
///
/// Shared by every pool thread of a process, so both operations take `&self`.
pub trait Transport: Sync {
    fn topology(&self) -> ProcessTopology;

    /// Returns once the message has been handed to the peer's link and
    /// flushed. Messages from one thread to one peer arrive in send order.
    fn send(
        &self,
        dest: Rank,
        frame_id: u64,
        tag: MessageTag,
        message: Message,
    ) -> Result<(), TransportError>;

    /// Blocks until an envelope matching `filter` arrives, or `timeout`
    /// elapses. Envelopes that do not match stay buffered for later receives.
    fn recv(
        &self,
        filter: ReceiveFilter,
        timeout: Option<Duration>,
    ) -> Result<Envelope, TransportError>;
}

impl<T: Transport + ?Sized> Transport for &T {
    fn topology(&self) -> ProcessTopology {
        (**self).topology()
    }

    fn send(
        &self,
        dest: Rank,
        frame_id: u64,
        tag: MessageTag,
        message: Message,
    ) -> Result<(), TransportError> {
        (**self).send(dest, frame_id, tag, message)
    }

    fn recv(
        &self,
        filter: ReceiveFilter,
        timeout: Option<Duration>,
    ) -> Result<Envelope, TransportError> {
        (**self).recv(filter, timeout)
    }
}
