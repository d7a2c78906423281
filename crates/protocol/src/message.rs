use std::fmt;

use model::TileIndex;
use tiles::{Rgba8, TileFormat};

use crate::Rank;

/// Correlates the messages of one tile, or marks balancing traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageTag(pub u32);

impl MessageTag {
    /// Tag of every message that is not tied to a tile.
    pub const CONTROL: MessageTag = MessageTag(u32::MAX);

    pub const fn tile(index: TileIndex) -> Self {
        MessageTag(index.0)
    }

    pub const fn tile_index(self) -> Option<TileIndex> {
        if self.0 == Self::CONTROL.0 {
            None
        } else {
            Some(TileIndex(self.0))
        }
    }
}

impl fmt::Display for MessageTag {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::CONTROL {
            write!(formatter, "tag:control")
        } else {
            write!(formatter, "tag:{}", self.0)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Hello,
    TileHeader,
    TilePayload,
    FrameJoin,
    TileRequest,
    TileGrant,
}

#[derive(Clone, PartialEq, Eq)]
pub enum Message {
    /// First frame on every byte connection, worker to coordinator.
    Hello { rank: Rank, size: u32 },
    /// `[lower.x, lower.y, upper.x, upper.y]` of the tile's region.
    TileHeader { bounds: [i32; 4] },
    /// Full `TILE_EDGE * TILE_EDGE` pixel block of the tile.
    TilePayload {
        format: TileFormat,
        pixels: Box<[Rgba8]>,
    },
    /// A worker joins a dynamically balanced frame with `pullers` threads.
    FrameJoin { pullers: u32 },
    TileRequest,
    /// `None` once every tile of the frame has been handed out.
    TileGrant { index: Option<TileIndex> },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Hello { .. } => MessageKind::Hello,
            Message::TileHeader { .. } => MessageKind::TileHeader,
            Message::TilePayload { .. } => MessageKind::TilePayload,
            Message::FrameJoin { .. } => MessageKind::FrameJoin,
            Message::TileRequest => MessageKind::TileRequest,
            Message::TileGrant { .. } => MessageKind::TileGrant,
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Hello { rank, size } => formatter
                .debug_struct("Hello")
                .field("rank", rank)
                .field("size", size)
                .finish(),
            Message::TileHeader { bounds } => formatter
                .debug_struct("TileHeader")
                .field("bounds", bounds)
                .finish(),
            Message::TilePayload { format, pixels } => formatter
                .debug_struct("TilePayload")
                .field("format", format)
                .field("pixels", &pixels.len())
                .finish(),
            Message::FrameJoin { pullers } => formatter
                .debug_struct("FrameJoin")
                .field("pullers", pullers)
                .finish(),
            Message::TileRequest => formatter.write_str("TileRequest"),
            Message::TileGrant { index } => formatter
                .debug_struct("TileGrant")
                .field("index", index)
                .finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub source: Rank,
    pub frame_id: u64,
    pub tag: MessageTag,
    pub message: Message,
}

/// Selects which envelope a receive accepts. Source and tag are wildcards
/// when `None`; the frame always has to match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveFilter {
    pub source: Option<Rank>,
    pub frame_id: u64,
    pub tag: Option<MessageTag>,
    /// Fail with `PeerClosed` once per frame for every peer that has gone
    /// away, instead of waiting on the remaining peers only.
    pub report_closed: bool,
}

impl ReceiveFilter {
    pub fn any(frame_id: u64) -> Self {
        Self {
            source: None,
            frame_id,
            tag: None,
            report_closed: false,
        }
    }

    pub fn exact(source: Rank, frame_id: u64, tag: MessageTag) -> Self {
        Self {
            source: Some(source),
            frame_id,
            tag: Some(tag),
            report_closed: false,
        }
    }

    pub fn reporting_closed(self) -> Self {
        Self {
            report_closed: true,
            ..self
        }
    }

    pub fn matches(&self, envelope: &Envelope) -> bool {
        envelope.frame_id == self.frame_id
            && self.source.is_none_or(|source| source == envelope.source)
            && self.tag.is_none_or(|tag| tag == envelope.tag)
    }
}
