use std::fs;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use engine::DriverConfig;
use frame_scheduler::{PartitionPolicy, SchedulerConfig};
use model::FramebufferSize;
use serde::Deserialize;

const DEFAULT_ADDR: SocketAddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7878));

/// Settings of one farm process, read from TOML and then overridden by
/// command line flags.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FarmConfig {
    /// Where the coordinator accepts workers.
    pub listen: SocketAddr,
    /// Where workers find the coordinator.
    pub coordinator: SocketAddr,
    /// Processes in the farm, the coordinator included.
    pub size: u32,
    /// Pool threads per process, 0 for one per core.
    pub threads: usize,
    pub policy: PartitionPolicy,
    pub width: u32,
    pub height: u32,
    pub frames: u32,
    /// PNG written by the assembling process. With several frames, the frame
    /// number is appended to the file stem.
    pub output: PathBuf,
    pub recv_timeout_ms: Option<u64>,
    /// How long workers retry connecting, and how long the coordinator
    /// waits for all of them to join.
    pub connect_timeout_ms: u64,
}

impl Default for FarmConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_ADDR,
            coordinator: DEFAULT_ADDR,
            size: 1,
            threads: 0,
            policy: PartitionPolicy::Static,
            width: 640,
            height: 480,
            frames: 1,
            output: PathBuf::from("tile_farm.png"),
            recv_timeout_ms: None,
            connect_timeout_ms: 10_000,
        }
    }
}

impl FarmConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            bail!("size must count at least the coordinator");
        }
        if self.width == 0 || self.height == 0 {
            bail!("frame size {}x{} has no pixels", self.width, self.height);
        }
        if self.frames == 0 {
            bail!("frames must be at least 1");
        }
        Ok(())
    }

    pub fn frame_size(&self) -> FramebufferSize {
        FramebufferSize::new(self.width, self.height)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            policy: self.policy,
            scheduler: SchedulerConfig {
                threads: self.threads,
            },
            recv_timeout: self.recv_timeout_ms.map(Duration::from_millis),
        }
    }
}
