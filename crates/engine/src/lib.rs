//! Frame-level orchestration: the coordinator's collector and the driver
//! that picks each process's role for a frame.

mod collector;
mod driver;

pub use collector::{CollectError, CollectOptions, CollectReport, FrameCollector};
pub use driver::{DriverConfig, FrameDriver, FrameError, FrameOutcome};

#[cfg(test)]
mod tests;
