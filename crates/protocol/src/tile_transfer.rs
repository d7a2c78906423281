//! Moving one finished tile from a worker to the coordinator.
//!
//! A tile travels as two messages with the tile index as tag: the region
//! header, then the full pixel payload. The receiver takes the header from
//! any source and pins the payload receive to that header's source and tag,
//! so tiles arriving concurrently from different workers never mix.

use std::fmt;
use std::time::Duration;

use model::{TileIndex, TileLayout, TileLayoutError, TileRegion};
use tiles::Tile;

use crate::{
    Envelope, Message, MessageKind, MessageTag, Rank, ReceiveFilter, Transport, TransportError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    Transport(TransportError),
    UnexpectedMessage {
        source: Rank,
        tag: MessageTag,
        kind: MessageKind,
        expected: MessageKind,
    },
    /// The sender computed a different region for this index, which means
    /// the two processes disagree on the frame's layout.
    RegionMismatch {
        source: Rank,
        index: TileIndex,
        expected: TileRegion,
        received: TileRegion,
    },
    /// A tile header whose tag does not name a tile index.
    InvalidTag { source: Rank, tag: MessageTag },
    Layout(TileLayoutError),
}

impl fmt::Display for TransferError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::Transport(error) => write!(formatter, "{error}"),
            TransferError::UnexpectedMessage {
                source,
                tag,
                kind,
                expected,
            } => write!(
                formatter,
                "expected {expected:?} from {source} ({tag}), got {kind:?}"
            ),
            TransferError::RegionMismatch {
                source,
                index,
                expected,
                received,
            } => write!(
                formatter,
                "{source} sent {index} as {:?}, local layout says {:?}",
                received.bounds(),
                expected.bounds()
            ),
            TransferError::InvalidTag { source, tag } => {
                write!(formatter, "{source} sent a tile header under {tag}")
            }
            TransferError::Layout(error) => write!(formatter, "{error}"),
        }
    }
}

impl std::error::Error for TransferError {}

impl From<TransportError> for TransferError {
    fn from(error: TransportError) -> Self {
        TransferError::Transport(error)
    }
}

impl From<TileLayoutError> for TransferError {
    fn from(error: TileLayoutError) -> Self {
        TransferError::Layout(error)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedTile {
    pub source: Rank,
    pub index: TileIndex,
    pub tile: Tile,
}

/// Sends `tile` as header then payload. Returns once both are flushed.
pub fn send_tile<T: Transport + ?Sized>(
    transport: &T,
    coordinator: Rank,
    frame_id: u64,
    index: TileIndex,
    tile: &Tile,
) -> Result<(), TransferError> {
    let tag = MessageTag::tile(index);
    transport.send(
        coordinator,
        frame_id,
        tag,
        Message::TileHeader {
            bounds: tile.region.bounds(),
        },
    )?;
    transport.send(
        coordinator,
        frame_id,
        tag,
        Message::TilePayload {
            format: tile.format,
            pixels: tile.pixels().into(),
        },
    )?;
    log::debug!("sent {index} of frame {frame_id} to {coordinator}");
    Ok(())
}

/// Receives the next tile of `frame_id` from any worker.
pub fn recv_tile<T: Transport + ?Sized>(
    transport: &T,
    frame_id: u64,
    layout: &TileLayout,
    timeout: Option<Duration>,
) -> Result<ReceivedTile, TransferError> {
    let header = transport.recv(ReceiveFilter::any(frame_id), timeout)?;
    complete_tile(transport, header, layout, timeout)
}

/// Given an already received header envelope, receives the matching payload
/// from the same source and tag and rebuilds the tile.
pub fn complete_tile<T: Transport + ?Sized>(
    transport: &T,
    header: Envelope,
    layout: &TileLayout,
    timeout: Option<Duration>,
) -> Result<ReceivedTile, TransferError> {
    let Envelope {
        source,
        frame_id,
        tag,
        message,
    } = header;
    let Message::TileHeader { bounds } = message else {
        return Err(TransferError::UnexpectedMessage {
            source,
            tag,
            kind: message.kind(),
            expected: MessageKind::TileHeader,
        });
    };
    let Some(index) = tag.tile_index() else {
        return Err(TransferError::InvalidTag { source, tag });
    };
    let expected = layout.tile_region(index)?;
    let received = TileRegion::from_bounds(bounds);
    if received != expected {
        return Err(TransferError::RegionMismatch {
            source,
            index,
            expected,
            received,
        });
    }

    let payload = transport.recv(ReceiveFilter::exact(source, frame_id, tag), timeout)?;
    let Message::TilePayload { format, pixels } = payload.message else {
        return Err(TransferError::UnexpectedMessage {
            source,
            tag,
            kind: payload.message.kind(),
            expected: MessageKind::TilePayload,
        });
    };
    Ok(ReceivedTile {
        source,
        index,
        tile: Tile::with_pixels(received, format, pixels, layout),
    })
}
