//! Per-process side of a frame: who owns which tiles, and the thread pool
//! that renders them.

mod assignment;
mod scheduler;
mod sink;

pub use assignment::{
    AssignmentError, PartitionPolicy, RemoteAssignment, SharedTileCounter, StaticAssignment,
    TileAssignment, static_owner,
};
pub use scheduler::{LocalFrameReport, ScheduleError, SchedulerConfig, TileScheduler};
pub use sink::{ChannelTileSink, RemoteTileSink, SinkError, TileSink};
