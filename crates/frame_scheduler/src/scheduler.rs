use std::fmt;
use std::io;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;

use model::{TileIndex, TileLayout, TileLayoutError};
use tiles::{RenderJob, RenderJobError, Tile};

use crate::{AssignmentError, SinkError, TileAssignment, TileSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedulerConfig {
    /// Pool threads per process. Zero picks the available parallelism.
    pub threads: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalFrameReport {
    pub rendered_tiles: usize,
    pub threads: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    Assignment(AssignmentError),
    Layout(TileLayoutError),
    Render {
        index: TileIndex,
        error: RenderJobError,
    },
    Sink {
        index: TileIndex,
        error: SinkError,
    },
    Spawn {
        kind: io::ErrorKind,
        message: String,
    },
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleError::Assignment(error) => write!(formatter, "{error}"),
            ScheduleError::Layout(error) => write!(formatter, "{error}"),
            ScheduleError::Render { index, error } => write!(formatter, "{index}: {error}"),
            ScheduleError::Sink { index, error } => {
                write!(formatter, "handing off {index} failed: {error}")
            }
            ScheduleError::Spawn { message, .. } => {
                write!(formatter, "failed to spawn pool thread: {message}")
            }
        }
    }
}

impl std::error::Error for ScheduleError {}

impl From<AssignmentError> for ScheduleError {
    fn from(error: AssignmentError) -> Self {
        ScheduleError::Assignment(error)
    }
}

impl From<TileLayoutError> for ScheduleError {
    fn from(error: TileLayoutError) -> Self {
        ScheduleError::Layout(error)
    }
}

/// Renders one process's share of a frame on a pool of scoped threads.
///
/// The assignment is the work queue: each thread pulls an index, renders a
/// fresh tile and hands it to the sink until the assignment runs dry. The
/// scope join is the completion barrier.
#[derive(Debug, Clone)]
pub struct TileScheduler {
    threads: usize,
}

impl TileScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let threads = match config.threads {
            0 => thread::available_parallelism().map_or(1, NonZeroUsize::get),
            threads => threads,
        };
        Self { threads }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Returns after every tile the assignment yields has been rendered and
    /// submitted, or with the first failure of any thread. A failure stops
    /// the other threads from pulling further work.
    pub fn run<A, J, S>(
        &self,
        layout: &TileLayout,
        assignment: &A,
        job: &J,
        sink: &S,
    ) -> Result<LocalFrameReport, ScheduleError>
    where
        A: TileAssignment + ?Sized,
        J: RenderJob + ?Sized,
        S: TileSink + ?Sized,
    {
        let abort = AtomicBool::new(false);
        let rendered = AtomicUsize::new(0);
        let first_error = Mutex::new(None);
        let fail = |error: ScheduleError| {
            abort.store(true, Ordering::Release);
            let mut slot = first_error.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                *slot = Some(error);
            }
        };

        thread::scope(|scope| {
            for worker in 0..self.threads {
                let spawned = thread::Builder::new()
                    .name(format!("tile_pool_{worker}"))
                    .spawn_scoped(scope, || {
                        while !abort.load(Ordering::Acquire) {
                            match render_next(layout, assignment, job, sink) {
                                Ok(true) => {
                                    rendered.fetch_add(1, Ordering::Relaxed);
                                }
                                Ok(false) => break,
                                Err(error) => {
                                    fail(error);
                                    break;
                                }
                            }
                        }
                    });
                if let Err(error) = spawned {
                    fail(ScheduleError::Spawn {
                        kind: error.kind(),
                        message: error.to_string(),
                    });
                    break;
                }
            }
        });

        if let Some(error) = first_error
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
        {
            log::warn!("local frame aborted: {error}");
            return Err(error);
        }
        Ok(LocalFrameReport {
            rendered_tiles: rendered.into_inner(),
            threads: self.threads,
        })
    }
}

impl Default for TileScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

fn render_next<A, J, S>(
    layout: &TileLayout,
    assignment: &A,
    job: &J,
    sink: &S,
) -> Result<bool, ScheduleError>
where
    A: TileAssignment + ?Sized,
    J: RenderJob + ?Sized,
    S: TileSink + ?Sized,
{
    let Some(index) = assignment.next_owned_tile()? else {
        return Ok(false);
    };
    let mut tile = Tile::new(layout.tile_region(index)?, layout);
    job.render_tile(&mut tile)
        .map_err(|error| ScheduleError::Render { index, error })?;
    sink.submit(index, tile)
        .map_err(|error| ScheduleError::Sink { index, error })?;
    log::debug!("rendered {index}");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{SharedTileCounter, StaticAssignment};
    use model::FramebufferSize;
    use protocol::WorkerIndex;

    /// Paints every pixel with the low byte of the tile index.
    struct IndexPainter {
        tiles_per_row: u32,
    }

    impl RenderJob for IndexPainter {
        fn render_tile(&self, tile: &mut Tile) -> Result<(), RenderJobError> {
            let column = tile.region.lower.x as u32 / model::TILE_EDGE;
            let row = tile.region.lower.y as u32 / model::TILE_EDGE;
            let index = (row * self.tiles_per_row + column) as u8;
            tile.pixels_mut().fill([index, 0, 0, 255]);
            Ok(())
        }
    }

    struct FailOn(TileIndex, IndexPainter);

    impl RenderJob for FailOn {
        fn render_tile(&self, tile: &mut Tile) -> Result<(), RenderJobError> {
            self.1.render_tile(tile)?;
            if tile.pixel(0, 0)[0] == self.0.0 as u8 {
                return Err(RenderJobError::new("kernel diverged"));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct Collected(Mutex<BTreeMap<TileIndex, Tile>>);

    impl TileSink for Collected {
        fn submit(&self, index: TileIndex, tile: Tile) -> Result<(), SinkError> {
            let previous = self.0.lock().expect("collected").insert(index, tile);
            assert!(previous.is_none(), "{index} submitted twice");
            Ok(())
        }
    }

    fn layout() -> TileLayout {
        TileLayout::new(FramebufferSize::new(130, 70)).expect("layout")
    }

    #[test]
    fn zero_threads_resolves_to_available_parallelism() {
        assert!(TileScheduler::new(SchedulerConfig { threads: 0 }).threads() >= 1);
        assert_eq!(TileScheduler::new(SchedulerConfig { threads: 3 }).threads(), 3);
    }

    #[test]
    fn renders_exactly_the_owned_tiles() {
        let layout = layout();
        let job = IndexPainter {
            tiles_per_row: layout.tiles_per_row(),
        };
        let assignment =
            StaticAssignment::new(WorkerIndex(1), 2, layout.num_tiles()).expect("assignment");
        let sink = Collected::default();

        let report = TileScheduler::new(SchedulerConfig { threads: 4 })
            .run(&layout, &assignment, &job, &sink)
            .expect("frame");

        assert_eq!(report.rendered_tiles, 3);
        let collected = sink.0.into_inner().expect("collected");
        assert_eq!(
            collected.keys().map(|index| index.0).collect::<Vec<_>>(),
            vec![1, 3, 5]
        );
        for (index, tile) in &collected {
            assert_eq!(tile.region, layout.tile_region(*index).expect("region"));
            assert_eq!(tile.pixel(0, 0), [index.0 as u8, 0, 0, 255]);
        }
    }

    #[test]
    fn more_tiles_than_threads_are_all_rendered() {
        let layout = TileLayout::new(FramebufferSize::new(640, 480)).expect("layout");
        let job = IndexPainter {
            tiles_per_row: layout.tiles_per_row(),
        };
        let counter = SharedTileCounter::new(layout.num_tiles());
        let sink = Collected::default();

        let report = TileScheduler::new(SchedulerConfig { threads: 3 })
            .run(&layout, &counter, &job, &sink)
            .expect("frame");

        assert_eq!(report.rendered_tiles, layout.num_tiles() as usize);
        assert_eq!(report.threads, 3);
        assert_eq!(sink.0.into_inner().expect("collected").len(), 80);
    }

    #[test]
    fn render_failure_aborts_the_frame() {
        let layout = layout();
        let job = FailOn(
            TileIndex(2),
            IndexPainter {
                tiles_per_row: layout.tiles_per_row(),
            },
        );
        let counter = SharedTileCounter::new(layout.num_tiles());
        let sink = Collected::default();

        let error = TileScheduler::new(SchedulerConfig { threads: 1 })
            .run(&layout, &counter, &job, &sink)
            .expect_err("render failure");

        assert_eq!(
            error,
            ScheduleError::Render {
                index: TileIndex(2),
                error: RenderJobError::new("kernel diverged"),
            }
        );
        // The single thread stops pulling right after the failure.
        assert_eq!(counter.granted(), 3);
        assert_eq!(sink.0.into_inner().expect("collected").len(), 2);
    }

    #[test]
    fn sink_failure_is_reported_with_its_tile() {
        struct Refusing;
        impl TileSink for Refusing {
            fn submit(&self, _: TileIndex, _: Tile) -> Result<(), SinkError> {
                Err(SinkError::Disconnected)
            }
        }

        let layout = layout();
        let job = IndexPainter {
            tiles_per_row: layout.tiles_per_row(),
        };
        let counter = SharedTileCounter::new(layout.num_tiles());
        let error = TileScheduler::new(SchedulerConfig { threads: 2 })
            .run(&layout, &counter, &job, &Refusing)
            .expect_err("sink failure");
        assert!(matches!(
            error,
            ScheduleError::Sink {
                error: SinkError::Disconnected,
                ..
            }
        ));
    }
}
