use std::fmt;
use std::panic;
use std::thread;
use std::time::Duration;

use frame_scheduler::{
    AssignmentError, ChannelTileSink, LocalFrameReport, PartitionPolicy, RemoteAssignment,
    RemoteTileSink, ScheduleError, SchedulerConfig, SharedTileCounter, StaticAssignment,
    TileScheduler,
};
use model::{TileLayout, TileLayoutError};
use protocol::{Message, MessageTag, ProcessTopology, Transport, TransportError};
use tiles::{Framebuffer, FramebufferError, RenderJob, TileRenderer};

use crate::{CollectError, CollectOptions, CollectReport, FrameCollector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DriverConfig {
    pub policy: PartitionPolicy,
    pub scheduler: SchedulerConfig,
    /// Bounds every wait on a peer. `None` blocks until the peer answers or
    /// its link closes.
    pub recv_timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// This process holds the complete frame.
    Assembled(CollectReport),
    /// This process rendered and shipped its share.
    Contributed(LocalFrameReport),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    TopologyMismatch {
        expected: ProcessTopology,
        transport: ProcessTopology,
    },
    Layout(TileLayoutError),
    Collect(CollectError),
    Schedule(ScheduleError),
    Assignment(AssignmentError),
    Transport(TransportError),
    Framebuffer(FramebufferError),
}

impl fmt::Display for FrameError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::TopologyMismatch {
                expected,
                transport,
            } => write!(
                formatter,
                "driver expects {} of {} but transport is {} of {}",
                expected.self_rank(),
                expected.size(),
                transport.self_rank(),
                transport.size()
            ),
            FrameError::Layout(error) => write!(formatter, "{error}"),
            FrameError::Collect(error) => write!(formatter, "{error}"),
            FrameError::Schedule(error) => write!(formatter, "{error}"),
            FrameError::Assignment(error) => write!(formatter, "{error}"),
            FrameError::Transport(error) => write!(formatter, "{error}"),
            FrameError::Framebuffer(error) => write!(formatter, "{error}"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<TileLayoutError> for FrameError {
    fn from(error: TileLayoutError) -> Self {
        FrameError::Layout(error)
    }
}

impl From<CollectError> for FrameError {
    fn from(error: CollectError) -> Self {
        FrameError::Collect(error)
    }
}

impl From<ScheduleError> for FrameError {
    fn from(error: ScheduleError) -> Self {
        FrameError::Schedule(error)
    }
}

impl From<AssignmentError> for FrameError {
    fn from(error: AssignmentError) -> Self {
        FrameError::Assignment(error)
    }
}

impl From<TransportError> for FrameError {
    fn from(error: TransportError) -> Self {
        FrameError::Transport(error)
    }
}

impl From<FramebufferError> for FrameError {
    fn from(error: FramebufferError) -> Self {
        FrameError::Framebuffer(error)
    }
}

/// Entry point every process calls once per frame.
///
/// The role follows from the topology: the coordinator collects, workers
/// render and ship their tiles, and a lone process renders everything
/// itself. Frame ids advance on every call, so all processes must render the
/// same sequence of frames.
pub struct FrameDriver<T: Transport> {
    topology: ProcessTopology,
    transport: T,
    config: DriverConfig,
    scheduler: TileScheduler,
    next_frame_id: u64,
}

impl<T: Transport> FrameDriver<T> {
    pub fn new(
        topology: ProcessTopology,
        transport: T,
        config: DriverConfig,
    ) -> Result<Self, FrameError> {
        if transport.topology() != topology {
            return Err(FrameError::TopologyMismatch {
                expected: topology,
                transport: transport.topology(),
            });
        }
        Ok(Self {
            topology,
            transport,
            config,
            scheduler: TileScheduler::new(config.scheduler),
            next_frame_id: 0,
        })
    }

    pub fn topology(&self) -> ProcessTopology {
        self.topology
    }

    pub fn config(&self) -> DriverConfig {
        self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn next_frame_id(&self) -> u64 {
        self.next_frame_id
    }

    /// Blocks until this process's part of the frame is done: assembled in
    /// `framebuffer` on the coordinator, rendered and flushed on a worker.
    /// A worker only reads the framebuffer's size.
    pub fn render_frame<F, J>(
        &mut self,
        framebuffer: &mut F,
        job: &J,
    ) -> Result<FrameOutcome, FrameError>
    where
        F: Framebuffer + ?Sized,
        J: RenderJob + ?Sized,
    {
        let frame_id = self.next_frame_id;
        self.next_frame_id += 1;
        let layout = TileLayout::new(framebuffer.size())?;
        log::info!(
            "{} frame {frame_id}: {}x{} in {} tiles, {} partitioning",
            self.topology.self_rank(),
            layout.size().width,
            layout.size().height,
            layout.num_tiles(),
            self.config.policy
        );

        if self.topology.size() == 1 {
            return self.render_locally(&layout, framebuffer, job);
        }
        if self.topology.is_coordinator() {
            let collector = FrameCollector::new(
                &self.transport,
                layout,
                frame_id,
                self.config.policy,
                CollectOptions {
                    recv_timeout: self.config.recv_timeout,
                },
            );
            return Ok(FrameOutcome::Assembled(collector.collect(framebuffer)?));
        }
        self.contribute(&layout, frame_id, job)
    }

    /// Creates this frame's job through `renderer`, then renders it.
    pub fn render_frame_with<F, R>(
        &mut self,
        framebuffer: &mut F,
        renderer: &R,
    ) -> Result<FrameOutcome, FrameError>
    where
        F: Framebuffer + ?Sized,
        R: TileRenderer + ?Sized,
    {
        let job = renderer.create_render_job(framebuffer.size());
        self.render_frame(framebuffer, &job)
    }

    fn contribute<J: RenderJob + ?Sized>(
        &self,
        layout: &TileLayout,
        frame_id: u64,
        job: &J,
    ) -> Result<FrameOutcome, FrameError> {
        let worker = self
            .topology
            .worker_index()
            .expect("non-coordinator ranks have a worker index");
        let coordinator = self.topology.coordinator();
        let sink = RemoteTileSink::new(&self.transport, coordinator, frame_id);

        let report = match self.config.policy {
            PartitionPolicy::Static => {
                let assignment =
                    StaticAssignment::new(worker, self.topology.worker_count(), layout.num_tiles())?;
                self.scheduler.run(layout, &assignment, job, &sink)?
            }
            PartitionPolicy::Dynamic => {
                let pullers = u32::try_from(self.scheduler.threads()).unwrap_or(u32::MAX);
                self.transport.send(
                    coordinator,
                    frame_id,
                    MessageTag::CONTROL,
                    Message::FrameJoin { pullers },
                )?;
                let assignment = RemoteAssignment::new(&self.transport, coordinator, frame_id)
                    .with_grant_timeout(self.config.recv_timeout);
                self.scheduler.run(layout, &assignment, job, &sink)?
            }
        };
        log::info!(
            "{} frame {frame_id}: sent {} tiles",
            self.topology.self_rank(),
            report.rendered_tiles
        );
        Ok(FrameOutcome::Contributed(report))
    }

    /// Pool threads render, the calling thread inserts. Nothing else ever
    /// touches the framebuffer.
    fn render_locally<F, J>(
        &self,
        layout: &TileLayout,
        framebuffer: &mut F,
        job: &J,
    ) -> Result<FrameOutcome, FrameError>
    where
        F: Framebuffer + ?Sized,
        J: RenderJob + ?Sized,
    {
        let counter = SharedTileCounter::new(layout.num_tiles());
        let (sink, tiles) = ChannelTileSink::bounded(self.scheduler.threads() * 2);
        let scheduler = &self.scheduler;

        let inserted = thread::scope(|scope| -> Result<u32, FrameError> {
            let pool = thread::Builder::new()
                .name("tile_farm_local".to_owned())
                .spawn_scoped(scope, move || scheduler.run(layout, &counter, job, &sink))
                .map_err(|error| ScheduleError::Spawn {
                    kind: error.kind(),
                    message: error.to_string(),
                })?;

            let mut inserted = 0u32;
            let mut insert_error = None;
            for (_, tile) in tiles.iter() {
                if let Err(error) = framebuffer.insert_tile(&tile) {
                    insert_error = Some(error);
                    break;
                }
                inserted += 1;
            }
            // Unblocks the pool if insertion stopped early.
            drop(tiles);
            let rendered = pool
                .join()
                .unwrap_or_else(|payload| panic::resume_unwind(payload));
            if let Some(error) = insert_error {
                return Err(FrameError::from(error));
            }
            rendered?;
            Ok(inserted)
        })?;

        let mut report = CollectReport {
            tiles_inserted: inserted,
            ..CollectReport::default()
        };
        report
            .tiles_by_worker
            .insert(self.topology.self_rank(), inserted);
        log::info!("frame rendered locally: {inserted} tiles");
        Ok(FrameOutcome::Assembled(report))
    }
}
