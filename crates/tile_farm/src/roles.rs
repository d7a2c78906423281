use std::env;
use std::net::TcpListener;
use std::process::{Child, Command};

use anyhow::{Context, Result, bail};
use engine::{FrameDriver, FrameOutcome};
use protocol::{LocalFabric, Rank, TcpTransport, Transport};
use tiles::Rgba8Framebuffer;

use crate::cli::worker_command_line;
use crate::config::FarmConfig;
use crate::demo::SphereScene;
use crate::output::{frame_path, write_png};

pub fn run_local(config: &FarmConfig) -> Result<()> {
    let mut endpoints = LocalFabric::new(1);
    let endpoint = endpoints.pop().context("single-rank fabric has an endpoint")?;
    render_frames(endpoint, config)
}

pub fn run_coordinator(config: &FarmConfig) -> Result<()> {
    let listener = TcpListener::bind(config.listen)
        .with_context(|| format!("listen on {}", config.listen))?;
    coordinate(listener, config, || Ok(()))
}

pub fn run_worker(config: &FarmConfig, rank: u32) -> Result<()> {
    let transport = TcpTransport::worker(
        config.coordinator,
        Rank(rank),
        config.size,
        config.connect_timeout(),
    )
    .with_context(|| format!("join coordinator at {} as rank {rank}", config.coordinator))?;
    render_frames(transport, config)
}

/// Spawns `workers` copies of this executable as workers, then
/// coordinates them on the same listener.
pub fn launch(config: &FarmConfig, workers: u32) -> Result<()> {
    if workers == 0 {
        bail!("launch needs at least one worker, use `local` otherwise");
    }
    let config = FarmConfig {
        size: workers + 1,
        ..config.clone()
    };
    let listener = TcpListener::bind(config.listen)
        .with_context(|| format!("listen on {}", config.listen))?;
    // Resolves port 0 to the port actually bound.
    let addr = listener.local_addr().context("resolve listen address")?;
    let executable = env::current_exe().context("locate own executable")?;

    let mut children: Vec<(u32, Child)> = Vec::new();
    for rank in 1..config.size {
        let spawned = Command::new(&executable)
            .args(worker_command_line(&config, rank, addr))
            .spawn()
            .with_context(|| format!("spawn worker rank {rank}"));
        match spawned {
            Ok(child) => children.push((rank, child)),
            Err(error) => {
                stop_children(&mut children);
                return Err(error);
            }
        }
    }
    log::info!("launched {workers} workers against {addr}");

    // A worker that exits before joining would otherwise leave us waiting
    // for the accept deadline.
    let result = coordinate(listener, &config, || unjoined_exit(&mut children));
    if result.is_err() {
        stop_children(&mut children);
    }
    for (rank, mut child) in children {
        let status = child
            .wait()
            .with_context(|| format!("wait for worker rank {rank}"))?;
        if !status.success() && result.is_ok() {
            bail!("worker rank {rank} exited with {status}");
        }
    }
    result
}

fn coordinate<F>(listener: TcpListener, config: &FarmConfig, watch: F) -> Result<()>
where
    F: FnMut() -> Result<(), String>,
{
    log::info!(
        "waiting for {} workers on {}",
        config.size.saturating_sub(1),
        listener.local_addr().context("resolve listen address")?
    );
    let transport = TcpTransport::coordinator_watching(
        listener,
        config.size,
        config.connect_timeout(),
        watch,
    )
    .context("accept workers")?;
    render_frames(transport, config)
}

/// Fails if any child has already exited. Only called while workers are
/// still joining, so even a clean exit means that worker never will.
fn unjoined_exit(children: &mut [(u32, Child)]) -> Result<(), String> {
    for (rank, child) in children.iter_mut() {
        match child.try_wait() {
            Ok(Some(status)) => return Err(format!("worker rank {rank} exited with {status}")),
            Ok(None) => {}
            Err(error) => return Err(format!("cannot poll worker rank {rank}: {error}")),
        }
    }
    Ok(())
}

fn render_frames<T: Transport>(transport: T, config: &FarmConfig) -> Result<()> {
    let mut driver = FrameDriver::new(transport.topology(), transport, config.driver_config())
        .context("set up frame driver")?;
    let mut framebuffer = Rgba8Framebuffer::new(config.frame_size());

    for frame in 0..config.frames {
        let scene = SphereScene::new(frame, config.frames);
        let outcome = driver
            .render_frame_with(&mut framebuffer, &scene)
            .with_context(|| format!("render frame {frame}"))?;
        match outcome {
            FrameOutcome::Assembled(report) => {
                log::info!(
                    "frame {frame}: {} tiles, per worker {:?}",
                    report.tiles_inserted,
                    report.tiles_by_worker
                );
                write_png(&framebuffer, &frame_path(&config.output, frame, config.frames))?;
            }
            FrameOutcome::Contributed(report) => log::info!(
                "frame {frame}: rendered {} tiles on {} threads",
                report.rendered_tiles,
                report.threads
            ),
        }
    }
    Ok(())
}

fn stop_children(children: &mut [(u32, Child)]) {
    for (rank, child) in children {
        if let Err(error) = child.kill() {
            log::warn!("could not stop worker rank {rank}: {error}");
        }
    }
}
