use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use frame_scheduler::{PartitionPolicy, SharedTileCounter, static_owner};
use model::{FramebufferSize, TileCoverage, TileIndex, TileLayout};
use protocol::{
    Message, MessageKind, MessageTag, Rank, ReceiveFilter, TransferError, Transport,
    TransportError, complete_tile,
};
use tiles::{Framebuffer, FramebufferError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CollectOptions {
    /// Upper bound on each wait for the next message. `None` waits forever.
    pub recv_timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CollectReport {
    pub tiles_inserted: u32,
    pub tiles_by_worker: BTreeMap<Rank, u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectError {
    NoWorkers,
    SizeMismatch {
        layout: FramebufferSize,
        framebuffer: FramebufferSize,
    },
    Transport(TransportError),
    Transfer(TransferError),
    DuplicateTile {
        index: TileIndex,
        source: Rank,
    },
    /// A worker announced itself twice for the same dynamic frame.
    DuplicateJoin(Rank),
    /// A worker's link closed while it still owed tiles or sentinels.
    WorkerLost(Rank),
    UnexpectedMessage {
        source: Rank,
        kind: MessageKind,
    },
    Framebuffer(FramebufferError),
}

impl fmt::Display for CollectError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectError::NoWorkers => write!(formatter, "no workers to collect tiles from"),
            CollectError::SizeMismatch {
                layout,
                framebuffer,
            } => write!(
                formatter,
                "frame laid out for {}x{} but framebuffer is {}x{}",
                layout.width, layout.height, framebuffer.width, framebuffer.height
            ),
            CollectError::Transport(error) => write!(formatter, "{error}"),
            CollectError::Transfer(error) => write!(formatter, "{error}"),
            CollectError::DuplicateTile { index, source } => {
                write!(formatter, "{source} delivered {index}, which was already inserted")
            }
            CollectError::DuplicateJoin(rank) => write!(formatter, "{rank} joined the frame twice"),
            CollectError::WorkerLost(rank) => {
                write!(formatter, "{rank} went away before finishing its share of the frame")
            }
            CollectError::UnexpectedMessage { source, kind } => {
                write!(formatter, "unexpected {kind:?} from {source}")
            }
            CollectError::Framebuffer(error) => write!(formatter, "{error}"),
        }
    }
}

impl std::error::Error for CollectError {}

impl From<TransportError> for CollectError {
    fn from(error: TransportError) -> Self {
        CollectError::Transport(error)
    }
}

impl From<TransferError> for CollectError {
    fn from(error: TransferError) -> Self {
        match error {
            TransferError::Transport(error) => CollectError::Transport(error),
            error => CollectError::Transfer(error),
        }
    }
}

impl From<FramebufferError> for CollectError {
    fn from(error: FramebufferError) -> Self {
        CollectError::Framebuffer(error)
    }
}

/// Coordinator side of one frame.
///
/// Inserts tiles in arrival order from any worker. In dynamic frames it also
/// serves the workers' tile requests, and keeps going until every announced
/// puller got its sentinel, so no worker thread is left waiting on a grant.
pub struct FrameCollector<'a, T: Transport + ?Sized> {
    transport: &'a T,
    layout: TileLayout,
    frame_id: u64,
    policy: PartitionPolicy,
    options: CollectOptions,
}

struct DynamicState {
    counter: SharedTileCounter,
    joined: BTreeMap<Rank, PullerShare>,
}

/// Pool threads a worker announced, and how many of them got their sentinel.
#[derive(Clone, Copy)]
struct PullerShare {
    pullers: u32,
    sentinels: u32,
}

impl<'a, T: Transport + ?Sized> FrameCollector<'a, T> {
    pub fn new(
        transport: &'a T,
        layout: TileLayout,
        frame_id: u64,
        policy: PartitionPolicy,
        options: CollectOptions,
    ) -> Self {
        Self {
            transport,
            layout,
            frame_id,
            policy,
            options,
        }
    }

    pub fn collect<F: Framebuffer + ?Sized>(
        &self,
        framebuffer: &mut F,
    ) -> Result<CollectReport, CollectError> {
        if framebuffer.size() != self.layout.size() {
            return Err(CollectError::SizeMismatch {
                layout: self.layout.size(),
                framebuffer: framebuffer.size(),
            });
        }
        let worker_count = self.transport.topology().worker_count() as usize;
        if worker_count == 0 {
            return Err(CollectError::NoWorkers);
        }

        let num_tiles = self.layout.num_tiles();
        let mut coverage = TileCoverage::new(num_tiles);
        let mut report = CollectReport::default();
        let mut dynamic = (self.policy == PartitionPolicy::Dynamic).then(|| DynamicState {
            counter: SharedTileCounter::new(num_tiles),
            joined: BTreeMap::new(),
        });

        while !coverage.is_complete()
            || dynamic
                .as_ref()
                .is_some_and(|state| !state.is_settled(worker_count))
        {
            let received = self.transport.recv(
                ReceiveFilter::any(self.frame_id).reporting_closed(),
                self.options.recv_timeout,
            );
            let envelope = match received {
                Ok(envelope) => envelope,
                Err(TransportError::PeerClosed(rank)) => {
                    if !self.has_settled(rank, &coverage, dynamic.as_ref(), worker_count) {
                        log::warn!("frame {}: {rank} left with work outstanding", self.frame_id);
                        return Err(CollectError::WorkerLost(rank));
                    }
                    log::debug!("frame {}: {rank} left after finishing", self.frame_id);
                    continue;
                }
                Err(error) => return Err(error.into()),
            };
            let source = envelope.source;
            let kind = envelope.message.kind();
            let unexpected = || {
                log::warn!("frame {}: rejecting {kind:?} from {source}", self.frame_id);
                CollectError::UnexpectedMessage { source, kind }
            };
            match envelope.message {
                Message::TileHeader { .. } => {
                    let received = complete_tile(
                        self.transport,
                        envelope,
                        &self.layout,
                        self.options.recv_timeout,
                    )?;
                    if !coverage.mark(received.index) {
                        return Err(CollectError::DuplicateTile {
                            index: received.index,
                            source,
                        });
                    }
                    framebuffer.insert_tile(&received.tile)?;
                    report.tiles_inserted += 1;
                    *report.tiles_by_worker.entry(source).or_default() += 1;
                    log::debug!(
                        "frame {}: inserted {} from {source} ({}/{num_tiles})",
                        self.frame_id,
                        received.index,
                        coverage.seen_count()
                    );
                }
                Message::FrameJoin { pullers } => {
                    let state = dynamic.as_mut().ok_or_else(unexpected)?;
                    let share = PullerShare {
                        pullers,
                        sentinels: 0,
                    };
                    if state.joined.insert(source, share).is_some() {
                        return Err(CollectError::DuplicateJoin(source));
                    }
                    log::debug!(
                        "frame {}: {source} joined with {pullers} pullers",
                        self.frame_id
                    );
                }
                Message::TileRequest => {
                    let state = dynamic.as_mut().ok_or_else(unexpected)?;
                    // Requests never overtake the join on one link.
                    let share = state.joined.get_mut(&source).ok_or_else(unexpected)?;
                    let index = state.counter.next_tile();
                    if index.is_none() {
                        share.sentinels += 1;
                    }
                    self.transport.send(
                        source,
                        self.frame_id,
                        MessageTag::CONTROL,
                        Message::TileGrant { index },
                    )?;
                }
                _ => return Err(unexpected()),
            }
        }

        log::info!(
            "frame {} assembled: {} tiles from {} workers",
            self.frame_id,
            report.tiles_inserted,
            report.tiles_by_worker.len()
        );
        Ok(report)
    }
}

impl<T: Transport + ?Sized> FrameCollector<'_, T> {
    /// Whether `rank` has nothing left to deliver for this frame.
    fn has_settled(
        &self,
        rank: Rank,
        coverage: &TileCoverage,
        dynamic: Option<&DynamicState>,
        worker_count: usize,
    ) -> bool {
        match dynamic {
            Some(state) => state
                .joined
                .get(&rank)
                .is_some_and(|share| share.sentinels == share.pullers),
            None => {
                let Some(worker) = rank.0.checked_sub(1) else {
                    return true;
                };
                (0..self.layout.num_tiles())
                    .map(TileIndex)
                    .filter(|&index| static_owner(index, worker_count as u32).0 == worker)
                    .all(|index| coverage.contains(index))
            }
        }
    }
}

impl DynamicState {
    fn is_settled(&self, worker_count: usize) -> bool {
        self.joined.len() == worker_count
            && self
                .joined
                .values()
                .all(|share| share.sentinels == share.pullers)
    }
}
