use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use model::TileIndex;
use protocol::{
    Message, MessageKind, MessageTag, Rank, ReceiveFilter, Transport, TransportError, WorkerIndex,
};
use serde::{Deserialize, Serialize};

/// How the tiles of one frame are spread over the workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionPolicy {
    /// Round-robin by tile index, fixed before the frame starts.
    #[default]
    Static,
    /// Workers pull tile indices from the coordinator's counter.
    Dynamic,
}

impl fmt::Display for PartitionPolicy {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionPolicy::Static => write!(formatter, "static"),
            PartitionPolicy::Dynamic => write!(formatter, "dynamic"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignmentError {
    InvalidWorker {
        worker: WorkerIndex,
        worker_count: u32,
    },
    Transport(TransportError),
    /// The coordinator answered a tile request with something other than a
    /// grant.
    UnexpectedMessage { source: Rank, kind: MessageKind },
}

impl fmt::Display for AssignmentError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssignmentError::InvalidWorker {
                worker,
                worker_count,
            } => write!(
                formatter,
                "worker index {} is not below worker count {worker_count}",
                worker.0
            ),
            AssignmentError::Transport(error) => write!(formatter, "{error}"),
            AssignmentError::UnexpectedMessage { source, kind } => {
                write!(formatter, "expected a tile grant from {source}, got {kind:?}")
            }
        }
    }
}

impl std::error::Error for AssignmentError {}

impl From<TransportError> for AssignmentError {
    fn from(error: TransportError) -> Self {
        AssignmentError::Transport(error)
    }
}

/// Source of the tile indices one process renders in a frame.
///
/// Shared by every pool thread. Each index is yielded at most once across
/// all callers. `Ok(None)` is final for the caller that sees it.
pub trait TileAssignment: Sync {
    fn next_owned_tile(&self) -> Result<Option<TileIndex>, AssignmentError>;
}

impl<A: TileAssignment + ?Sized> TileAssignment for &A {
    fn next_owned_tile(&self) -> Result<Option<TileIndex>, AssignmentError> {
        (**self).next_owned_tile()
    }
}

/// Owner of `index` under round-robin over `worker_count` workers.
///
/// Panics if `worker_count` is zero.
pub fn static_owner(index: TileIndex, worker_count: u32) -> WorkerIndex {
    assert!(worker_count > 0, "static ownership needs at least one worker");
    WorkerIndex(index.0 % worker_count)
}

/// Round-robin ownership: worker `r` of `W` renders `r, r + W, r + 2W, ...`.
#[derive(Debug)]
pub struct StaticAssignment {
    worker: WorkerIndex,
    worker_count: u32,
    num_tiles: u32,
    step: AtomicU64,
}

impl StaticAssignment {
    pub fn new(
        worker: WorkerIndex,
        worker_count: u32,
        num_tiles: u32,
    ) -> Result<Self, AssignmentError> {
        if worker.0 >= worker_count {
            return Err(AssignmentError::InvalidWorker {
                worker,
                worker_count,
            });
        }
        Ok(Self {
            worker,
            worker_count,
            num_tiles,
            step: AtomicU64::new(0),
        })
    }

    pub fn worker(&self) -> WorkerIndex {
        self.worker
    }

    /// Every index this worker owns, independent of what was already handed
    /// out.
    pub fn owned_tiles(&self) -> impl Iterator<Item = TileIndex> + use<> {
        (self.worker.0..self.num_tiles)
            .step_by(self.worker_count as usize)
            .map(TileIndex)
    }
}

impl TileAssignment for StaticAssignment {
    fn next_owned_tile(&self) -> Result<Option<TileIndex>, AssignmentError> {
        let step = self.step.fetch_add(1, Ordering::Relaxed);
        let index = u64::from(self.worker.0) + step * u64::from(self.worker_count);
        Ok((index < u64::from(self.num_tiles)).then(|| TileIndex(index as u32)))
    }
}

/// Hands out `0..num_tiles` once in total, then only `None`.
///
/// Backs the coordinator side of dynamic balancing, and local rendering.
#[derive(Debug)]
pub struct SharedTileCounter {
    next: AtomicU64,
    num_tiles: u32,
}

impl SharedTileCounter {
    pub fn new(num_tiles: u32) -> Self {
        Self {
            next: AtomicU64::new(0),
            num_tiles,
        }
    }

    pub fn next_tile(&self) -> Option<TileIndex> {
        let next = self.next.fetch_add(1, Ordering::Relaxed);
        (next < u64::from(self.num_tiles)).then(|| TileIndex(next as u32))
    }

    pub fn granted(&self) -> u32 {
        self.next
            .load(Ordering::Relaxed)
            .min(u64::from(self.num_tiles)) as u32
    }

    pub fn num_tiles(&self) -> u32 {
        self.num_tiles
    }
}

impl TileAssignment for SharedTileCounter {
    fn next_owned_tile(&self) -> Result<Option<TileIndex>, AssignmentError> {
        Ok(self.next_tile())
    }
}

/// Worker side of dynamic balancing: every call is one request/grant round
/// trip with the coordinator.
///
/// Grants are not addressed to a particular pool thread. Each request is
/// answered by exactly one grant, so every puller still sees exactly one
/// sentinel.
pub struct RemoteAssignment<'a, T: Transport + ?Sized> {
    transport: &'a T,
    coordinator: Rank,
    frame_id: u64,
    grant_timeout: Option<Duration>,
}

impl<'a, T: Transport + ?Sized> RemoteAssignment<'a, T> {
    pub fn new(transport: &'a T, coordinator: Rank, frame_id: u64) -> Self {
        Self {
            transport,
            coordinator,
            frame_id,
            grant_timeout: None,
        }
    }

    pub fn with_grant_timeout(mut self, grant_timeout: Option<Duration>) -> Self {
        self.grant_timeout = grant_timeout;
        self
    }
}

impl<T: Transport + ?Sized> TileAssignment for RemoteAssignment<'_, T> {
    fn next_owned_tile(&self) -> Result<Option<TileIndex>, AssignmentError> {
        self.transport.send(
            self.coordinator,
            self.frame_id,
            MessageTag::CONTROL,
            Message::TileRequest,
        )?;
        let reply = self.transport.recv(
            ReceiveFilter::exact(self.coordinator, self.frame_id, MessageTag::CONTROL),
            self.grant_timeout,
        )?;
        match reply.message {
            Message::TileGrant { index } => Ok(index),
            other => Err(AssignmentError::UnexpectedMessage {
                source: reply.source,
                kind: other.kind(),
            }),
        }
    }
}
