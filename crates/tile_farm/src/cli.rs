use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use frame_scheduler::PartitionPolicy;

use crate::config::FarmConfig;

#[derive(Debug, Parser)]
#[command(author, version, about = "Render frames on a farm of tile workers")]
pub struct Arguments {
    /// TOML file with farm settings. Flags override its values.
    #[arg(long, short = 'c', global = true, value_parser)]
    pub config: Option<PathBuf>,
    #[command(flatten)]
    pub overrides: Overrides,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Accept workers, assemble frames and write them as PNG.
    Coordinator {
        #[arg(long)]
        listen: Option<SocketAddr>,
        /// Processes in the farm, the coordinator included.
        #[arg(long)]
        size: Option<u32>,
    },
    /// Connect to a coordinator and render this rank's share of each frame.
    Worker {
        #[arg(long)]
        rank: u32,
        #[arg(long)]
        coordinator: Option<SocketAddr>,
        #[arg(long)]
        size: Option<u32>,
    },
    /// Start `workers` worker processes of this executable and coordinate
    /// them.
    Launch {
        #[arg(long)]
        workers: u32,
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
    /// Render in this process only.
    Local,
}

#[derive(Debug, Default, Args)]
pub struct Overrides {
    #[arg(long, global = true)]
    pub threads: Option<usize>,
    #[arg(long, global = true, value_enum)]
    pub policy: Option<PolicyArgument>,
    #[arg(long, global = true)]
    pub width: Option<u32>,
    #[arg(long, global = true)]
    pub height: Option<u32>,
    #[arg(long, global = true)]
    pub frames: Option<u32>,
    #[arg(long, short = 'o', global = true, value_parser)]
    pub output: Option<PathBuf>,
    #[arg(long, global = true)]
    pub recv_timeout_ms: Option<u64>,
    #[arg(long, global = true)]
    pub connect_timeout_ms: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum PolicyArgument {
    Static,
    Dynamic,
}

impl From<PolicyArgument> for PartitionPolicy {
    fn from(policy: PolicyArgument) -> Self {
        match policy {
            PolicyArgument::Static => PartitionPolicy::Static,
            PolicyArgument::Dynamic => PartitionPolicy::Dynamic,
        }
    }
}

impl Overrides {
    pub fn apply(&self, config: &mut FarmConfig) {
        if let Some(threads) = self.threads {
            config.threads = threads;
        }
        if let Some(policy) = self.policy {
            config.policy = policy.into();
        }
        if let Some(width) = self.width {
            config.width = width;
        }
        if let Some(height) = self.height {
            config.height = height;
        }
        if let Some(frames) = self.frames {
            config.frames = frames;
        }
        if let Some(output) = &self.output {
            config.output = output.clone();
        }
        if let Some(recv_timeout_ms) = self.recv_timeout_ms {
            config.recv_timeout_ms = Some(recv_timeout_ms);
        }
        if let Some(connect_timeout_ms) = self.connect_timeout_ms {
            config.connect_timeout_ms = connect_timeout_ms;
        }
    }
}

/// Command line that makes a child process join as worker `rank`, carrying
/// every setting that has to agree across the farm.
pub fn worker_command_line(
    config: &FarmConfig,
    rank: u32,
    coordinator: SocketAddr,
) -> Vec<String> {
    let mut arguments = vec![
        "worker".to_owned(),
        format!("--rank={rank}"),
        format!("--coordinator={coordinator}"),
        format!("--size={}", config.size),
        format!("--threads={}", config.threads),
        format!("--policy={}", config.policy),
        format!("--width={}", config.width),
        format!("--height={}", config.height),
        format!("--frames={}", config.frames),
        format!("--connect-timeout-ms={}", config.connect_timeout_ms),
    ];
    if let Some(recv_timeout_ms) = config.recv_timeout_ms {
        arguments.push(format!("--recv-timeout-ms={recv_timeout_ms}"));
    }
    arguments
}
