use std::net::TcpListener;
use std::thread;
use std::time::Duration;

use frame_scheduler::{PartitionPolicy, ScheduleError, SchedulerConfig};
use model::{FramebufferSize, TileIndex};
use protocol::{
    COORDINATOR_RANK, FabricEndpoint, LocalFabric, Rank, TcpTransport, TransferError, Transport,
    TransportError,
};
use tiles::{Framebuffer, RenderJob, RenderJobError, Rgba8Framebuffer, Tile, TileRenderer};

use crate::{CollectError, DriverConfig, FrameDriver, FrameError, FrameOutcome};

/// Colour is a pure function of the absolute pixel position and frame seed.
struct Gradient {
    seed: u8,
}

impl RenderJob for Gradient {
    fn render_tile(&self, tile: &mut Tile) -> Result<(), RenderJobError> {
        let region = tile.region;
        for y in region.lower.y..region.upper.y {
            for x in region.lower.x..region.upper.x {
                let local_x = (x - region.lower.x) as u32;
                let local_y = (y - region.lower.y) as u32;
                *tile.pixel_mut(local_x, local_y) = gradient_pixel(self.seed, x, y);
            }
        }
        Ok(())
    }
}

struct GradientRenderer {
    seed: u8,
}

impl TileRenderer for GradientRenderer {
    type Job = Gradient;

    fn create_render_job(&self, _size: FramebufferSize) -> Gradient {
        Gradient { seed: self.seed }
    }
}

fn gradient_pixel(seed: u8, x: i32, y: i32) -> [u8; 4] {
    [x as u8, y as u8, seed, 255]
}

fn assert_gradient(framebuffer: &Rgba8Framebuffer, seed: u8) {
    let size = framebuffer.size();
    for y in 0..size.height {
        for x in 0..size.width {
            assert_eq!(
                framebuffer.pixel(x, y),
                gradient_pixel(seed, x as i32, y as i32),
                "pixel ({x}, {y})"
            );
        }
    }
}

struct FailingJob;

impl RenderJob for FailingJob {
    fn render_tile(&self, _tile: &mut Tile) -> Result<(), RenderJobError> {
        Err(RenderJobError::new("out of samples"))
    }
}

fn config(policy: PartitionPolicy, threads: usize) -> DriverConfig {
    DriverConfig {
        policy,
        scheduler: SchedulerConfig { threads },
        recv_timeout: Some(Duration::from_secs(10)),
    }
}

fn driver<T: Transport>(transport: T, config: DriverConfig) -> FrameDriver<T> {
    FrameDriver::new(transport.topology(), transport, config).expect("driver")
}

/// Runs `frames` frames on an in-memory cluster. Returns the coordinator's
/// outcomes and framebuffer, plus every worker's outcomes.
fn run_fabric_cluster(
    size: u32,
    frame_size: FramebufferSize,
    frames: u8,
    config: DriverConfig,
) -> (Vec<FrameOutcome>, Rgba8Framebuffer, Vec<Vec<FrameOutcome>>) {
    let mut endpoints = LocalFabric::new(size).into_iter();
    let coordinator = endpoints.next().expect("rank 0");

    thread::scope(|scope| {
        let workers: Vec<_> = endpoints
            .map(|endpoint: FabricEndpoint| {
                scope.spawn(move || {
                    let mut driver = driver(endpoint, config);
                    let mut scratch = Rgba8Framebuffer::new(frame_size);
                    (0..frames)
                        .map(|seed| {
                            driver
                                .render_frame_with(&mut scratch, &GradientRenderer { seed })
                                .expect("worker frame")
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut driver = driver(coordinator, config);
        let mut framebuffer = Rgba8Framebuffer::new(frame_size);
        let mut outcomes = Vec::new();
        for seed in 0..frames {
            outcomes.push(
                driver
                    .render_frame_with(&mut framebuffer, &GradientRenderer { seed })
                    .expect("coordinator frame"),
            );
        }
        let worker_outcomes = workers
            .into_iter()
            .map(|handle| handle.join().expect("worker thread"))
            .collect();
        (outcomes, framebuffer, worker_outcomes)
    })
}

fn assembled(outcome: &FrameOutcome) -> &crate::CollectReport {
    match outcome {
        FrameOutcome::Assembled(report) => report,
        FrameOutcome::Contributed(_) => panic!("coordinator only assembles"),
    }
}

#[test]
fn static_frame_assembles_on_the_coordinator() {
    let size = FramebufferSize::new(130, 70);
    let (outcomes, framebuffer, workers) =
        run_fabric_cluster(3, size, 1, config(PartitionPolicy::Static, 2));

    let report = assembled(&outcomes[0]);
    assert_eq!(report.tiles_inserted, 6);
    assert_eq!(report.tiles_by_worker.get(&Rank(1)), Some(&3));
    assert_eq!(report.tiles_by_worker.get(&Rank(2)), Some(&3));
    assert_gradient(&framebuffer, 0);

    for outcomes in workers {
        match &outcomes[0] {
            FrameOutcome::Contributed(report) => assert_eq!(report.rendered_tiles, 3),
            FrameOutcome::Assembled(_) => panic!("workers only contribute"),
        }
    }
}

#[test]
fn dynamic_frames_assemble_and_release_every_puller() {
    let size = FramebufferSize::new(300, 200);
    let frames = 3;
    let (outcomes, framebuffer, workers) =
        run_fabric_cluster(4, size, frames, config(PartitionPolicy::Dynamic, 3));

    for outcome in &outcomes {
        let report = assembled(outcome);
        assert_eq!(report.tiles_inserted, 20);
        assert_eq!(report.tiles_by_worker.values().sum::<u32>(), 20);
    }
    assert_gradient(&framebuffer, frames - 1);

    // Workers returning at all shows each pool thread received its sentinel.
    let rendered: usize = workers
        .iter()
        .flatten()
        .map(|outcome| match outcome {
            FrameOutcome::Contributed(report) => report.rendered_tiles,
            FrameOutcome::Assembled(_) => panic!("workers only contribute"),
        })
        .sum();
    assert_eq!(rendered, 20 * usize::from(frames));
}

#[test]
fn idle_workers_still_complete_static_frames() {
    // One tile, three workers: two of them own nothing.
    let (outcomes, framebuffer, workers) = run_fabric_cluster(
        4,
        FramebufferSize::new(10, 10),
        1,
        config(PartitionPolicy::Static, 1),
    );
    assert_eq!(assembled(&outcomes[0]).tiles_inserted, 1);
    assert_gradient(&framebuffer, 0);
    assert_eq!(workers.len(), 3);
}

#[test]
fn single_process_renders_locally() {
    let mut endpoints = LocalFabric::new(1);
    let endpoint = endpoints.pop().expect("rank 0");
    let mut driver = driver(endpoint, config(PartitionPolicy::Static, 4));
    let mut framebuffer = Rgba8Framebuffer::new(FramebufferSize::new(200, 130));

    let outcome = driver
        .render_frame(&mut framebuffer, &Gradient { seed: 7 })
        .expect("local frame");

    let report = assembled(&outcome);
    assert_eq!(report.tiles_inserted, 12);
    assert_eq!(report.tiles_by_worker.get(&COORDINATOR_RANK), Some(&12));
    assert_gradient(&framebuffer, 7);
    assert_eq!(driver.next_frame_id(), 1);
}

#[test]
fn local_render_failure_aborts_the_frame() {
    let mut endpoints = LocalFabric::new(1);
    let mut driver = driver(endpoints.pop().expect("rank 0"), config(PartitionPolicy::Static, 2));
    let mut framebuffer = Rgba8Framebuffer::new(FramebufferSize::new(200, 130));
    assert!(matches!(
        driver.render_frame(&mut framebuffer, &FailingJob),
        Err(FrameError::Schedule(ScheduleError::Render { .. }))
    ));
}

#[test]
fn worker_render_failure_aborts_both_sides() {
    let size = FramebufferSize::new(130, 70);
    let mut endpoints = LocalFabric::new(2);
    let worker = endpoints.pop().expect("rank 1");
    let coordinator = endpoints.pop().expect("rank 0");

    thread::scope(|scope| {
        let worker = scope.spawn(move || {
            let mut driver = driver(worker, config(PartitionPolicy::Static, 2));
            driver.render_frame(&mut Rgba8Framebuffer::new(size), &FailingJob)
            // Dropping the endpoint closes the worker's link.
        });

        let mut driver = driver(coordinator, DriverConfig::default());
        let result = driver.render_frame(&mut Rgba8Framebuffer::new(size), &Gradient { seed: 0 });
        assert_eq!(
            result,
            Err(FrameError::Collect(CollectError::Transport(
                TransportError::AllPeersClosed
            )))
        );

        assert!(matches!(
            worker.join().expect("worker thread"),
            Err(FrameError::Schedule(ScheduleError::Render { .. }))
        ));
    });
}

#[test]
fn one_failed_worker_fails_the_frame_while_another_stays_connected() {
    let size = FramebufferSize::new(130, 70);
    let mut endpoints = LocalFabric::new(3);
    let healthy = endpoints.pop().expect("rank 2");
    let failing = endpoints.pop().expect("rank 1");
    let coordinator = endpoints.pop().expect("rank 0");
    let (release, released) = crossbeam_channel::bounded::<()>(0);

    thread::scope(|scope| {
        let failing = scope.spawn(move || {
            let mut driver = driver(failing, config(PartitionPolicy::Static, 2));
            driver.render_frame(&mut Rgba8Framebuffer::new(size), &FailingJob)
        });
        scope.spawn(move || {
            let mut driver = driver(healthy, config(PartitionPolicy::Static, 2));
            driver
                .render_frame(&mut Rgba8Framebuffer::new(size), &Gradient { seed: 0 })
                .expect("healthy worker sends its tiles");
            // Keeps the link open until the coordinator has given up.
            let _ = released.recv();
        });

        let mut driver = driver(coordinator, DriverConfig::default());
        let result = driver.render_frame(&mut Rgba8Framebuffer::new(size), &Gradient { seed: 0 });
        drop(release);
        assert_eq!(
            result,
            Err(FrameError::Collect(CollectError::WorkerLost(Rank(1))))
        );
        assert!(matches!(
            failing.join().expect("failing worker thread"),
            Err(FrameError::Schedule(ScheduleError::Render { .. }))
        ));
    });
}

#[test]
fn dynamic_frames_fail_when_a_worker_dies_between_frames() {
    let size = FramebufferSize::new(130, 70);
    let mut endpoints = LocalFabric::new(3);
    let healthy = endpoints.pop().expect("rank 2");
    let leaving = endpoints.pop().expect("rank 1");
    let coordinator = endpoints.pop().expect("rank 0");
    let config = config(PartitionPolicy::Dynamic, 2);

    thread::scope(|scope| {
        scope.spawn(move || {
            let mut driver = driver(leaving, config);
            driver
                .render_frame(&mut Rgba8Framebuffer::new(size), &Gradient { seed: 0 })
                .expect("first frame");
        });
        let healthy = scope.spawn(move || {
            let mut driver = driver(healthy, config);
            let mut scratch = Rgba8Framebuffer::new(size);
            let first = driver.render_frame(&mut scratch, &Gradient { seed: 0 });
            let second = driver.render_frame(&mut scratch, &Gradient { seed: 1 });
            (first, second)
        });

        let mut driver = driver(coordinator, DriverConfig::default());
        let mut framebuffer = Rgba8Framebuffer::new(size);
        driver
            .render_frame(&mut framebuffer, &Gradient { seed: 0 })
            .expect("both workers finish the first frame");
        assert_gradient(&framebuffer, 0);
        assert_eq!(
            driver.render_frame(&mut framebuffer, &Gradient { seed: 1 }),
            Err(FrameError::Collect(CollectError::WorkerLost(Rank(1))))
        );
        drop(driver);

        let (first, _second) = healthy.join().expect("healthy worker thread");
        assert!(first.is_ok());
    });
}

#[test]
fn layout_disagreement_is_detected_by_the_coordinator() {
    let mut endpoints = LocalFabric::new(2);
    let worker = endpoints.pop().expect("rank 1");
    let coordinator = endpoints.pop().expect("rank 0");

    thread::scope(|scope| {
        scope.spawn(move || {
            let mut driver = driver(worker, config(PartitionPolicy::Static, 1));
            // Wider frame: tile 2 is a full tile here but clipped on rank 0.
            let _ = driver.render_frame(
                &mut Rgba8Framebuffer::new(FramebufferSize::new(192, 70)),
                &Gradient { seed: 0 },
            );
        });

        let mut driver = driver(coordinator, config(PartitionPolicy::Static, 1));
        let result = driver.render_frame(
            &mut Rgba8Framebuffer::new(FramebufferSize::new(130, 70)),
            &Gradient { seed: 0 },
        );
        assert!(matches!(
            result,
            Err(FrameError::Collect(CollectError::Transfer(
                TransferError::RegionMismatch {
                    index: TileIndex(2),
                    ..
                }
            )))
        ));
    });
}

#[test]
fn driver_rejects_a_foreign_topology() {
    let mut endpoints = LocalFabric::new(2);
    let endpoint = endpoints.pop().expect("rank 1");
    let other = endpoints[0].topology();
    assert!(matches!(
        FrameDriver::new(other, endpoint, DriverConfig::default()),
        Err(FrameError::TopologyMismatch { .. })
    ));
}

fn run_tcp_cluster(workers: u32, policy: PartitionPolicy) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");
    let size = workers + 1;
    let frame_size = FramebufferSize::new(257, 129);
    let config = config(policy, 2);

    thread::scope(|scope| {
        for rank in 1..size {
            scope.spawn(move || {
                let transport =
                    TcpTransport::worker(addr, Rank(rank), size, Duration::from_secs(10))
                        .expect("worker connects");
                let mut driver = driver(transport, config);
                let mut scratch = Rgba8Framebuffer::new(frame_size);
                for seed in 0..2 {
                    driver
                        .render_frame(&mut scratch, &Gradient { seed })
                        .expect("worker frame");
                }
            });
        }

        let transport = TcpTransport::coordinator(listener, size, Duration::from_secs(10))
            .expect("coordinator");
        let mut driver = driver(transport, config);
        let mut framebuffer = Rgba8Framebuffer::new(frame_size);
        for seed in 0..2 {
            let outcome = driver
                .render_frame(&mut framebuffer, &Gradient { seed })
                .expect("coordinator frame");
            assert_eq!(assembled(&outcome).tiles_inserted, 15);
            assert_gradient(&framebuffer, seed);
        }
    });
}

#[test]
fn static_frames_over_tcp_loopback() {
    run_tcp_cluster(2, PartitionPolicy::Static);
}

#[test]
fn dynamic_frames_over_tcp_loopback() {
    run_tcp_cluster(3, PartitionPolicy::Dynamic);
}
