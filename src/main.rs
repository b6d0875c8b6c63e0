//! CLI entry point for scan-daq
//!
//! # Usage
//!
//! Acquire a few frames from simulated hardware:
//! ```bash
//! scan-daq simulate --config config/scan.toml --frames 5 --detectors 2 --counters 1
//! ```
//!
//! Show what a dwell time negotiates to:
//! ```bash
//! scan-daq negotiate --dwell 3.3e-6 --channels 2
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use daq_scan::{PeriodNegotiator, SimHardware};
use humantime_serde::re::humantime::parse_duration;
use mimalloc::MiMalloc;
use scan_daq::config::{EngineConfig, DEFAULT_CONFIG_PATH};
use scan_daq::simulate::{self, SimulateOptions};
use scan_daq::tracing_setup::{self, TracingConfig};
use serde::Serialize;
use tracing::info;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "scan-daq")]
#[command(about = "Scanning-beam acquisition engine on simulated hardware", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire frames from simulated hardware and log them
    Simulate {
        /// Frames to collect per detector
        #[arg(long, default_value_t = 3)]
        frames: usize,

        /// Analog detectors (input channels 0..N)
        #[arg(long, default_value_t = 1)]
        detectors: u32,

        /// Counting detectors (counters 0..N)
        #[arg(long, default_value_t = 0)]
        counters: u32,

        /// Longest wait for a single frame
        #[arg(long, default_value = "10s", value_parser = parse_duration)]
        frame_timeout: Duration,
    },

    /// Print the timing a dwell time negotiates to
    Negotiate {
        /// Requested dwell time in seconds
        #[arg(long)]
        dwell: f64,

        /// Analog input channels sampled per position
        #[arg(long, default_value_t = 1)]
        channels: usize,
    },
}

#[derive(Serialize)]
struct TimingReport {
    requested: f64,
    dwell_time: f64,
    ao_osr: u32,
    ai_osr: u32,
    ao_period: f64,
    ai_period: f64,
    do_period: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = EngineConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    config.validate()?;
    let tracing = TracingConfig::from_application(&config.application).map_err(|e| anyhow!(e))?;
    tracing_setup::init(tracing).map_err(|e| anyhow!(e))?;
    info!(name = %config.application.name, config = %cli.config.display(), "Starting");

    match cli.command {
        Commands::Simulate {
            frames,
            detectors,
            counters,
            frame_timeout,
        } => {
            let options = SimulateOptions {
                frames,
                analog: detectors,
                counting: counters,
                frame_timeout,
            };
            let report = simulate::run(&config, &options).await?;
            println!(
                "{} frame(s) at {:e} s dwell, {} delivered, {} continuous, {} synchronized",
                report.frames.len(),
                report.dwell_time,
                report.stats.frames_delivered,
                report.stats.continuous_frames,
                report.stats.synchronized_frames,
            );
        }
        Commands::Negotiate { dwell, channels } => {
            let hardware = SimHardware::new(config.hardware.sim_config());
            let negotiation = config.acquisition.tuning.negotiation;
            let timing = PeriodNegotiator::with_config(&hardware, negotiation)
                .negotiate(dwell, channels)
                .with_context(|| format!("No timing for {dwell:e} s on {channels} channel(s)"))?;
            let report = TimingReport {
                requested: dwell,
                dwell_time: timing.dwell_time,
                ao_osr: timing.ao_osr,
                ai_osr: timing.ai_osr,
                ao_period: timing.ao_period,
                ai_period: timing.ai_period,
                do_period: timing.do_period,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
