mod cli;
mod config;
mod demo;
mod output;
mod roles;

use anyhow::Result;
use clap::Parser;
use env_logger::Env;

use crate::cli::{Arguments, Command};
use crate::config::FarmConfig;

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let arguments = Arguments::parse();

    let mut config = match &arguments.config {
        Some(path) => FarmConfig::load(path)?,
        None => FarmConfig::default(),
    };
    arguments.overrides.apply(&mut config);

    match arguments.command {
        Command::Coordinator { listen, size } => {
            if let Some(listen) = listen {
                config.listen = listen;
            }
            if let Some(size) = size {
                config.size = size;
            }
            config.validate()?;
            roles::run_coordinator(&config)
        }
        Command::Worker {
            rank,
            coordinator,
            size,
        } => {
            if let Some(coordinator) = coordinator {
                config.coordinator = coordinator;
            }
            if let Some(size) = size {
                config.size = size;
            }
            config.validate()?;
            roles::run_worker(&config, rank)
        }
        Command::Launch { workers, listen } => {
            if let Some(listen) = listen {
                config.listen = listen;
            }
            config.validate()?;
            roles::launch(&config, workers)
        }
        Command::Local => {
            config.size = 1;
            config.validate()?;
            roles::run_local(&config)
        }
    }
}
