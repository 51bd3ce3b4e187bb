//! Command-line front end of the light-sheet acquisition engine.
//!
//! - `plan`: geometry, tile plan, laser pre-flight and time estimate
//! - `registration`: write the registration document only
//! - `run`: acquire, on hardware or with `--simulate`
//! - `config`: print the effective configuration after environment overrides

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};

use lsm_daq::config::ScanConfig;
use lsm_daq::data::pyramid::PyramidBackend;
use lsm_daq::hardware::mock::SimulatedFactory;
use lsm_daq::logging::{self, LogFormat};
use lsm_daq::scan::rig::{DeviceFactory, HardwareFactory};
use lsm_daq::scan::sequencer::{
    cancellation, CancelToken, PreparedScan, RunOptions, ScanReport, ScanSequencer,
};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Light-sheet microscope acquisition
#[derive(Parser, Debug)]
#[command(name = "lsm_daq")]
#[command(version)]
struct Args {
    /// Scan configuration (TOML, overridable with LSM_* variables)
    #[arg(short, long, global = true, default_value = "config/scan.toml")]
    config: PathBuf,

    /// Emit log lines as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show geometry, tile plan and laser drive range without touching hardware
    Plan,

    /// Write the registration document for the configured volume
    Registration,

    /// Acquire the configured volume
    Run {
        /// Use simulated devices
        #[arg(long)]
        simulate: bool,

        /// Continue when the codec runtime environment does not match
        #[arg(long)]
        allow_codec_env_mismatch: bool,

        /// Log a preview of every Nth frame
        #[arg(long)]
        preview_every: Option<usize>,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(if args.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Text
    });

    let config = ScanConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    match args.command {
        Command::Plan => show_plan(&config),
        Command::Registration => write_registration(&config),
        Command::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Run {
            simulate,
            allow_codec_env_mismatch,
            preview_every,
        } => {
            let factory: Box<dyn DeviceFactory> = if simulate {
                info!("Using simulated devices");
                Box::new(SimulatedFactory::default())
            } else {
                Box::new(HardwareFactory)
            };
            let options = RunOptions {
                allow_codec_env_mismatch,
            };
            run_all(&config, factory.as_ref(), &options, preview_every).await
        }
    }
}

fn show_plan(config: &ScanConfig) -> Result<()> {
    for (well, run) in config.well_runs() {
        let prepared = PreparedScan::prepare(&run)?;
        let g = &prepared.geometry;
        if let Some(number) = well {
            println!("== well {} ==", number);
        }
        println!(
            "tiles: {} lateral x {} depth x {} wavelengths = {}",
            g.y_tiles,
            g.z_tiles,
            run.channels.len(),
            prepared.plan.len()
        );
        println!(
            "tile: {:.4} x {:.4} mm, {} frames at {:.4} mm/s",
            g.y_width, g.z_width, g.frames_per_tile, g.scan_speed_mm_s
        );
        println!(
            "chunk: {:?}, block: {} frames, waveform: {} samples",
            g.chunk.0, g.block_size, prepared.samples_per_period
        );
        for drive in &prepared.drives {
            println!(
                "laser {}: {:.3} at surface, {:.3} at depth (limit {:.3})",
                drive.wavelength, drive.surface, drive.deepest, drive.limit
            );
        }
        println!("sweep time: {:.0?}", prepared.estimated_duration());
    }
    Ok(())
}

fn write_registration(config: &ScanConfig) -> Result<()> {
    for (_, run) in config.well_runs() {
        let prepared = PreparedScan::prepare(&run)?;
        std::fs::create_dir_all(&run.experiment.output_dir)?;
        let path = run.registration_path();
        prepared.registration.write_to(&path)?;
        println!("{}", path.display());
    }
    Ok(())
}

async fn run_all(
    config: &ScanConfig,
    factory: &dyn DeviceFactory,
    options: &RunOptions,
    preview_every: Option<usize>,
) -> Result<()> {
    let (handle, token) = cancellation();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, stopping after the current frame");
            handle.cancel();
        }
    });

    for (well, run) in config.well_runs() {
        if token.is_cancelled() {
            break;
        }
        if let Some(number) = well {
            info!("Starting well {}", number);
        }
        let report = acquire(run, factory, options, token.clone(), preview_every).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

#[cfg(feature = "storage_hdf5")]
async fn acquire(
    config: ScanConfig,
    factory: &dyn DeviceFactory,
    options: &RunOptions,
    cancel: CancelToken,
    preview_every: Option<usize>,
) -> Result<ScanReport> {
    std::fs::create_dir_all(&config.experiment.output_dir)?;
    let backend = lsm_daq::data::hdf5_pyramid::Hdf5Pyramid::open(&config.data_path())?;
    acquire_into(config, backend, factory, options, cancel, preview_every).await
}

#[cfg(not(feature = "storage_hdf5"))]
async fn acquire(
    config: ScanConfig,
    factory: &dyn DeviceFactory,
    options: &RunOptions,
    cancel: CancelToken,
    preview_every: Option<usize>,
) -> Result<ScanReport> {
    warn!("Built without storage_hdf5: frames are kept in memory and discarded on exit");
    let backend = lsm_daq::data::memory::MemoryPyramid::new();
    acquire_into(config, backend, factory, options, cancel, preview_every).await
}

async fn acquire_into<B: PyramidBackend>(
    config: ScanConfig,
    backend: B,
    factory: &dyn DeviceFactory,
    options: &RunOptions,
    cancel: CancelToken,
    preview_every: Option<usize>,
) -> Result<ScanReport> {
    let mut sequencer = ScanSequencer::new(config, backend, options.clone(), cancel)?;
    if let Some(nth) = preview_every {
        let mut previews = sequencer.add_preview_tap(nth);
        tokio::spawn(async move {
            while let Some(preview) = previews.recv().await {
                let mean = preview.pixels.iter().map(|&v| f64::from(v)).sum::<f64>()
                    / preview.pixels.len().max(1) as f64;
                info!(
                    "Preview tile {} frame {}: mean {:.1} DN",
                    preview.tile_index, preview.frame, mean
                );
            }
        });
    }
    Ok(sequencer.run(factory).await?)
}
