use std::fmt;

use crossbeam_channel::{Receiver, Sender, bounded};
use model::TileIndex;
use protocol::{Rank, TransferError, Transport, send_tile};
use tiles::Tile;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    Transfer(TransferError),
    /// The consumer of a channel sink went away before the frame finished.
    Disconnected,
}

impl fmt::Display for SinkError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::Transfer(error) => write!(formatter, "{error}"),
            SinkError::Disconnected => write!(formatter, "tile consumer disconnected"),
        }
    }
}

impl std::error::Error for SinkError {}

impl From<TransferError> for SinkError {
    fn from(error: TransferError) -> Self {
        SinkError::Transfer(error)
    }
}

/// Where rendered tiles go. Called from every pool thread.
pub trait TileSink: Sync {
    fn submit(&self, index: TileIndex, tile: Tile) -> Result<(), SinkError>;
}

impl<S: TileSink + ?Sized> TileSink for &S {
    fn submit(&self, index: TileIndex, tile: Tile) -> Result<(), SinkError> {
        (**self).submit(index, tile)
    }
}

/// Ships each tile to the coordinator. `submit` returns once both messages
/// are flushed, so the tile can be dropped right after.
pub struct RemoteTileSink<'a, T: Transport + ?Sized> {
    transport: &'a T,
    coordinator: Rank,
    frame_id: u64,
}

impl<'a, T: Transport + ?Sized> RemoteTileSink<'a, T> {
    pub fn new(transport: &'a T, coordinator: Rank, frame_id: u64) -> Self {
        Self {
            transport,
            coordinator,
            frame_id,
        }
    }
}

impl<T: Transport + ?Sized> TileSink for RemoteTileSink<'_, T> {
    fn submit(&self, index: TileIndex, tile: Tile) -> Result<(), SinkError> {
        send_tile(self.transport, self.coordinator, self.frame_id, index, &tile)?;
        Ok(())
    }
}

/// Hands tiles to one consuming thread, which owns the framebuffer.
pub struct ChannelTileSink {
    sender: Sender<(TileIndex, Tile)>,
}

impl ChannelTileSink {
    /// `capacity` bounds how many rendered tiles may wait for the consumer.
    pub fn bounded(capacity: usize) -> (Self, Receiver<(TileIndex, Tile)>) {
        let (sender, receiver) = bounded(capacity);
        (Self { sender }, receiver)
    }
}

impl TileSink for ChannelTileSink {
    fn submit(&self, index: TileIndex, tile: Tile) -> Result<(), SinkError> {
        self.sender
            .send((index, tile))
            .map_err(|_| SinkError::Disconnected)
    }
}
