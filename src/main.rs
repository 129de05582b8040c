//! CLI entry point for scope-daq
//!
//! ```bash
//! scope-daq identify
//! scope-daq capture --id bench --count 10 --channels C1,C2
//! scope-daq trigger --id bench --source C1 --level 0.2 --slope falling
//! scope-daq dmm --id bench --mode ac-rms
//! scope-daq snapshot --id bench > bench.json
//! scope-daq restore --id bench bench.json
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use scope_core::{MultimeterMode, Waveform};
use scope_daq::config::ScopeConfig;
use scope_daq::{logging, InstrumentRegistry};
use scope_drivers::{EdgeSlope, InstrumentConfig, Oscilloscope, ScopeDriver, Trigger};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "scope-daq")]
#[command(about = "Remote control and capture for bench oscilloscopes", long_about = None)]
struct Cli {
    /// Configuration file (default: scope-daq.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and describe each configured instrument
    Identify,

    /// Capture waveforms and print a summary of each
    Capture {
        #[arg(long)]
        id: String,
        /// Number of captures
        #[arg(long, default_value = "1")]
        count: usize,
        /// Channels to enable, by hardware name
        #[arg(long, value_delimiter = ',')]
        channels: Vec<String>,
        /// Force a trigger instead of waiting for one
        #[arg(long)]
        force: bool,
        /// Give up after this many seconds
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Set an edge trigger, or print the current trigger
    Trigger {
        #[arg(long)]
        id: String,
        #[arg(long)]
        source: Option<String>,
        #[arg(long, default_value = "0")]
        level: f64,
        #[arg(long, value_enum, default_value = "rising")]
        slope: Slope,
    },

    /// Read the built-in voltmeter
    Dmm {
        #[arg(long)]
        id: String,
        #[arg(long, value_enum, default_value = "dc")]
        mode: MeterMode,
        /// Input channel, by hardware name
        #[arg(long)]
        channel: Option<String>,
    },

    /// Print the instrument configuration as JSON
    Snapshot {
        #[arg(long)]
        id: String,
    },

    /// Apply a configuration written by `snapshot`
    Restore {
        #[arg(long)]
        id: String,
        file: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Slope {
    Rising,
    Falling,
    Any,
}

impl From<Slope> for EdgeSlope {
    fn from(slope: Slope) -> Self {
        match slope {
            Slope::Rising => EdgeSlope::Rising,
            Slope::Falling => EdgeSlope::Falling,
            Slope::Any => EdgeSlope::Any,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum MeterMode {
    Dc,
    DcRms,
    AcRms,
    Frequency,
}

impl From<MeterMode> for MultimeterMode {
    fn from(mode: MeterMode) -> Self {
        match mode {
            MeterMode::Dc => MultimeterMode::DcVoltage,
            MeterMode::DcRms => MultimeterMode::DcRmsAmplitude,
            MeterMode::AcRms => MultimeterMode::AcRmsAmplitude,
            MeterMode::Frequency => MultimeterMode::Frequency,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ScopeConfig::load_from(path)?,
        None => ScopeConfig::load()?,
    };
    config.validate()?;
    logging::init_from_config(&config)?;

    let registry = InstrumentRegistry::new();
    match cli.command {
        Commands::Identify => identify(&registry, &config).await,
        Commands::Capture {
            id,
            count,
            channels,
            force,
            timeout,
        } => {
            let scope = connect(&registry, &config, &id).await?;
            let poll = Duration::from_millis(config.acquisition.poll_interval_ms);
            capture(scope, &channels, count, force, poll, Duration::from_secs(timeout)).await
        }
        Commands::Trigger {
            id,
            source,
            level,
            slope,
        } => {
            let scope = connect(&registry, &config, &id).await?;
            trigger(&scope, source.as_deref(), level, slope.into()).await
        }
        Commands::Dmm { id, mode, channel } => {
            let scope = connect(&registry, &config, &id).await?;
            dmm(&scope, mode.into(), channel.as_deref()).await
        }
        Commands::Snapshot { id } => {
            let scope = connect(&registry, &config, &id).await?;
            let snapshot = scope.pull_config().await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(())
        }
        Commands::Restore { id, file } => {
            let scope = connect(&registry, &config, &id).await?;
            let text = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let snapshot: InstrumentConfig = serde_json::from_str(&text)?;
            scope.push_config(&snapshot).await?;
            println!("Applied {} channel settings", snapshot.channels.len());
            Ok(())
        }
    }
}

async fn connect(
    registry: &InstrumentRegistry,
    config: &ScopeConfig,
    id: &str,
) -> Result<Arc<ScopeDriver>> {
    let instrument = config
        .instrument(id)
        .with_context(|| format!("No instrument '{}' in configuration", id))?;
    Ok(registry.connect(config, instrument).await?)
}

fn channel_index(scope: &ScopeDriver, hwname: &str) -> Result<usize> {
    scope
        .channel_by_name(hwname)
        .with_context(|| format!("No channel '{}' on {}", hwname, scope.family()))
}

async fn identify(registry: &InstrumentRegistry, config: &ScopeConfig) -> Result<()> {
    registry.connect_all(config).await?;
    for id in registry.ids() {
        let Some(scope) = registry.get(&id) else {
            continue;
        };
        let identity = scope.identity();
        println!(
            "{}: {} {} (serial {}, firmware {})",
            id, identity.vendor, identity.model, identity.serial, identity.firmware
        );
        println!("  family: {}  via {}", scope.family(), scope.transport_name());
        println!("  provides: {:?}", scope.instrument_types());
        for channel in scope.channels() {
            println!("  [{:>2}] {:<16} {:?}", channel.index, channel.hwname, channel.kind);
        }
    }
    Ok(())
}

async fn capture(
    scope: Arc<ScopeDriver>,
    channels: &[String],
    count: usize,
    force: bool,
    poll: Duration,
    limit: Duration,
) -> Result<()> {
    for name in channels {
        scope.enable_channel(channel_index(&scope, name)?).await?;
    }

    let deadline = tokio::time::Instant::now() + limit;
    scope.start().await?;
    if force {
        scope.force_trigger().await?;
    }
    let mut received = 0;
    while received < count {
        if tokio::time::Instant::now() > deadline {
            scope.stop().await?;
            anyhow::bail!("Timed out after {} of {} captures", received, count);
        }
        if !scope.acquire_data().await? {
            tokio::time::sleep(poll).await;
            continue;
        }
        while let Some(set) = scope.pop_pending() {
            received += 1;
            println!("capture {}", received);
            for (index, waveform) in set.iter() {
                let name = scope
                    .channel(index)
                    .map(|c| c.hwname)
                    .unwrap_or_else(|| index.to_string());
                let timing = waveform.timing();
                let (kind, stats) = match waveform {
                    Waveform::Analog(w) => ("analog", summarize(w.samples.as_slice())),
                    Waveform::Spectrum(w) => ("spectrum", summarize(w.samples.as_slice())),
                    Waveform::Digital(w) => {
                        let edges = w.len().saturating_sub(1);
                        ("digital", format!("{} edges", edges))
                    }
                };
                println!(
                    "  {:<16} {:<8} {:>9} samples  {} fs/sample  start {}.{:015}  {}",
                    name,
                    kind,
                    waveform.len(),
                    timing.timescale,
                    timing.start_timestamp,
                    timing.start_femtoseconds,
                    stats
                );
            }
        }
        if scope.dropped_waveform_count() > 0 {
            tracing::warn!(dropped = scope.dropped_waveform_count(), "Output queue overflowed");
        }
        if force && scope.is_armed() {
            scope.force_trigger().await?;
        }
    }
    scope.stop().await?;
    Ok(())
}

/// min / max / mean of a sample block.
fn summarize(samples: &[f32]) -> String {
    if samples.is_empty() {
        return String::from("empty");
    }
    let (min, max, sum) = samples.iter().fold(
        (f32::INFINITY, f32::NEG_INFINITY, 0.0f64),
        |(lo, hi, sum), &v| (lo.min(v), hi.max(v), sum + f64::from(v)),
    );
    format!(
        "min {:.4}  max {:.4}  mean {:.4}",
        min,
        max,
        sum / samples.len() as f64
    )
}

async fn trigger(
    scope: &ScopeDriver,
    source: Option<&str>,
    level: f64,
    slope: EdgeSlope,
) -> Result<()> {
    if let Some(name) = source {
        let trigger = Trigger::edge(channel_index(scope, name)?, level, slope);
        scope.set_trigger(trigger).await?;
    }
    let current = scope.pull_trigger().await?;
    let source = scope
        .channel(current.source())
        .map(|c| c.hwname)
        .unwrap_or_default();
    println!(
        "{:?} on {} at {} V",
        current.kind(),
        source,
        current.level()
    );
    Ok(())
}

async fn dmm(scope: &ScopeDriver, mode: MultimeterMode, channel: Option<&str>) -> Result<()> {
    let meter = scope.multimeter()?;
    if let Some(name) = channel {
        meter.set_meter_channel(channel_index(scope, name)?).await?;
    }
    meter.set_meter_mode(mode).await?;
    meter.start_meter().await?;
    // the meter integrates over roughly one display update
    tokio::time::sleep(Duration::from_millis(250)).await;
    let value = meter.meter_value().await?;
    let unit = if mode == MultimeterMode::Frequency { "Hz" } else { "V" };
    println!(
        "{:.*} {}",
        meter.meter_digits() as usize,
        value,
        unit
    );
    Ok(())
}
