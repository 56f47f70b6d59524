//! CLI entry point for hallprobe-daq.
//!
//! Manual axis commands and scans on the field-mapping rig. Every command
//! goes through the [`ScanEngine`] so manual moves never interleave with a
//! running scan.
//!
//! # Usage
//!
//! ```bash
//! hallprobe-daq positions
//! hallprobe-daq move x 12.5
//! hallprobe-daq --simulate scan raster --x 0:10:1 --y 0:5:1 --z 0:0:1
//! hallprobe-daq scan fly --x -20:20:0.5 --y 0:4:1 --speed 2
//! ```

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use hallprobe_daq::config::Settings;
use hallprobe_daq::data::storage::CsvRecordSink;
use hallprobe_daq::experiment::{
    AxisOrder, AxisRange, ScanEngine, ScanEvent, ScanMode, ScanPlan, SessionState, SessionSummary,
};
use hallprobe_daq::hardware::axis::MoveOptions;
use hallprobe_daq::hardware::capabilities::FieldSampler;
use hallprobe_daq::hardware::mock::{BlankFieldSampler, MockFieldSampler, SimulatedController};
use hallprobe_daq::hardware::rig::Rig;
use hallprobe_daq::tracing_setup::{self, OutputFormat, TracingConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

// Use mimalloc for the long-running scan process
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "hallprobe-daq")]
#[command(about = "Hall probe field-mapping rig control", long_about = None)]
struct Cli {
    /// Configuration file (default: config/default.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Run against the simulated controller instead of the serial port
    #[arg(long, global = true)]
    simulate: bool,

    /// Log output format: pretty, compact or json
    #[arg(long, global = true, default_value = "pretty")]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the actual position of every axis
    Positions,
    /// Move one axis
    Move {
        /// Axis name or alias
        axis: String,
        /// Target position (or distance with --relative)
        #[arg(allow_negative_numbers = true)]
        target: f64,
        /// Move by `target` instead of to it
        #[arg(long)]
        relative: bool,
        /// Return once the controller accepted the move
        #[arg(long)]
        no_wait: bool,
    },
    /// Stop every axis
    Stop,
    /// Reset every axis after a fault
    Reset,
    /// Show or change the soft limits of an axis
    Limits {
        /// Axis name or alias
        axis: String,
        /// New limits
        #[arg(long, num_args = 2, value_names = ["LOWER", "UPPER"], allow_negative_numbers = true)]
        set: Option<Vec<f64>>,
        /// Disable the soft limits
        #[arg(long, conflicts_with = "set")]
        disable: bool,
    },
    /// Show or change the slew speed of an axis
    Speed {
        /// Axis name or alias
        axis: String,
        /// New speed in units/s
        value: Option<f64>,
        /// Select the maximum speed
        #[arg(long, conflicts_with = "value")]
        max: bool,
    },
    /// Run a scan
    #[command(subcommand)]
    Scan(ScanCommand),
}

#[derive(Subcommand)]
enum ScanCommand {
    /// Full serpentine raster
    Raster(ScanArgs),
    /// Rastered end planes, perimeter-only interior planes
    Boundary(ScanArgs),
    /// Uniform random points inside the volume
    Random {
        #[command(flatten)]
        args: ScanArgs,
        /// Number of points
        #[arg(long)]
        points: usize,
        /// RNG seed
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Rings in x/y at every z of the z range
    Circular {
        #[command(flatten)]
        args: ScanArgs,
        /// Circle center x
        #[arg(long, allow_negative_numbers = true)]
        center_x: f64,
        /// Circle center y
        #[arg(long, allow_negative_numbers = true)]
        center_y: f64,
        /// Radius
        #[arg(long)]
        radius: f64,
        /// Angular steps per ring
        #[arg(long)]
        steps: usize,
    },
    /// Continuous sweeps of the fast axis, sampled on trigger pulses
    Fly {
        #[command(flatten)]
        args: ScanArgs,
        /// Sweep speed in units/s
        #[arg(long)]
        speed: f64,
    },
}

#[derive(Args)]
struct ScanArgs {
    /// x range as START:END:STEP
    #[arg(long, value_parser = parse_range, default_value = "0:0:1", allow_hyphen_values = true)]
    x: AxisRange,
    /// y range as START:END:STEP
    #[arg(long, value_parser = parse_range, default_value = "0:0:1", allow_hyphen_values = true)]
    y: AxisRange,
    /// z range as START:END:STEP
    #[arg(long, value_parser = parse_range, default_value = "0:0:1", allow_hyphen_values = true)]
    z: AxisRange,
    /// Axis order, fastest first (xyz, xzy, yzx, yxz, zxy, zyx)
    #[arg(long, default_value = "xyz")]
    order: AxisOrder,
    /// Output directory (default from configuration)
    #[arg(long)]
    output: Option<PathBuf>,
}

fn parse_range(s: &str) -> Result<AxisRange, String> {
    let parts: Vec<&str> = s.split(':').collect();
    let [start, end, step] = parts.as_slice() else {
        return Err(format!("expected START:END:STEP, got '{s}'"));
    };
    let number = |v: &str| {
        v.trim()
            .parse::<f64>()
            .map_err(|e| format!("'{v}' in '{s}': {e}"))
    };
    Ok(AxisRange::new(number(start)?, number(end)?, number(step)?))
}

impl ScanCommand {
    fn into_plan(self) -> (ScanPlan, Option<PathBuf>) {
        let (args, mode) = match self {
            ScanCommand::Raster(args) => (args, ScanMode::Raster),
            ScanCommand::Boundary(args) => (args, ScanMode::Boundary),
            ScanCommand::Random { args, points, seed } => {
                (args, ScanMode::RandomSample { points, seed })
            }
            ScanCommand::Circular {
                args,
                center_x,
                center_y,
                radius,
                steps,
            } => (
                args,
                ScanMode::Circular {
                    center_x,
                    center_y,
                    radius,
                    steps,
                },
            ),
            ScanCommand::Fly { args, speed } => (args, ScanMode::OnTheFly { scan_speed: speed }),
        };
        let plan = ScanPlan::raster(args.x, args.y, args.z)
            .with_order(args.order)
            .with_mode(mode);
        (plan, args.output)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::load_from(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => Settings::load().context("Failed to load configuration")?,
    };
    let tracing_config = TracingConfig::from_settings(&settings)
        .map_err(anyhow::Error::msg)?
        .with_format(cli.log_format);
    tracing_setup::init(tracing_config).map_err(anyhow::Error::msg)?;

    let engine = build_engine(&settings, cli.simulate)?;
    match cli.command {
        Commands::Positions => {
            let positions = engine.with_rig(|rig| Box::pin(rig.positions())).await?;
            for (name, position) in positions {
                println!("{name:>4} = {position:.3}");
            }
        }
        Commands::Move {
            axis,
            target,
            relative,
            no_wait,
        } => {
            let options = MoveOptions {
                relative,
                wait: !no_wait,
                ..MoveOptions::default()
            };
            engine
                .with_rig(move |rig| {
                    Box::pin(async move { rig.axis(&axis)?.move_to(target, options).await })
                })
                .await?;
            println!("✅ Move complete");
        }
        Commands::Stop => {
            engine.with_rig(|rig| Box::pin(rig.stop_all())).await?;
            println!("🛑 All axes stopped");
        }
        Commands::Reset => {
            engine.reset_axes().await?;
            println!("✅ All axes reset");
        }
        Commands::Limits { axis, set, disable } => {
            let change = match (set, disable) {
                (Some(v), _) if v.len() == 2 => Some(Some((v[0], v[1]))),
                (Some(_), _) => bail!("--set takes LOWER and UPPER"),
                (None, true) => Some(None),
                (None, false) => None,
            };
            let limits = engine
                .with_rig(move |rig| {
                    Box::pin(async move {
                        let mut handle = rig.axis(&axis)?;
                        if let Some(change) = change {
                            handle.set_limits(change).await?;
                        }
                        handle.query_limits().await
                    })
                })
                .await?;
            match limits {
                Some(limits) => println!("Soft limits: {limits}"),
                None => println!("Soft limits disabled"),
            }
        }
        Commands::Speed { axis, value, max } => {
            let speed = engine
                .with_rig(move |rig| {
                    Box::pin(async move {
                        let mut handle = rig.axis(&axis)?;
                        if value.is_some() || max {
                            handle.set_speed(value).await?;
                        }
                        handle.speed().await
                    })
                })
                .await?;
            println!("Speed: {speed:.3} units/s");
        }
        Commands::Scan(command) => {
            let (plan, output) = command.into_plan();
            let output = output.unwrap_or_else(|| settings.scan.output_dir.clone());
            let state = run_scan(&engine, plan, output).await?;
            if state != SessionState::Completed {
                bail!("Scan ended {state}");
            }
        }
    }
    Ok(())
}

fn build_engine(settings: &Settings, simulate: bool) -> Result<ScanEngine> {
    let (rig, sampler): (Rig, Arc<dyn FieldSampler>) = if simulate {
        info!("Using simulated controller");
        let (sim, _) = SimulatedController::new(settings);
        (
            Rig::from_channel(Box::new(sim), settings),
            Arc::new(MockFieldSampler::default()),
        )
    } else {
        warn!("No field sensor driver configured, fields will read zero");
        (
            Rig::open(settings).context("Failed to open the motor controller")?,
            Arc::new(BlankFieldSampler),
        )
    };
    Ok(ScanEngine::new(rig.into_shared(), sampler, settings.clone()))
}

async fn run_scan(engine: &ScanEngine, plan: ScanPlan, output: PathBuf) -> Result<SessionState> {
    let started = Local::now();
    let data_file = output.join(format!(
        "{}_{}.csv",
        plan.mode.name(),
        started.format("%Y%m%d_%H%M%S")
    ));
    let sink = CsvRecordSink::at_path(&data_file);
    let mut handle = engine.start(plan.clone(), Box::new(sink))?;
    let run_id = handle.run_id();
    println!("▶️  Scan {run_id} started ({}), Ctrl+C to cancel", plan.mode.name());

    let mut error = None;
    let mut cancel_sent = false;
    loop {
        tokio::select! {
            event = handle.next_event() => match event {
                Some(ScanEvent::Result { index, position, field, .. }) => {
                    println!("  [{index:>5}] {position}  {field}");
                }
                Some(ScanEvent::Progress(p)) => info!(progress = p, "Progress"),
                Some(ScanEvent::Error { kind, detail }) => {
                    eprintln!("❌ {kind}: {detail}");
                    error = Some(detail);
                }
                Some(ScanEvent::Finished { state }) => info!(%state, "Session finished"),
                Some(ScanEvent::Started { .. }) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !cancel_sent => {
                println!("⏹  Cancelling scan...");
                handle.cancel();
                cancel_sent = true;
            }
        }
    }
    let state = handle.wait().await;

    let status = engine.status();
    let summary = SessionSummary {
        run_id,
        started,
        finished: Local::now(),
        plan,
        state,
        planned: status.planned,
        measured: status.measured,
        error,
        data_file: data_file
            .exists()
            .then(|| data_file.display().to_string()),
    };
    let summary_path = data_file.with_extension("json");
    summary
        .save(&summary_path)
        .with_context(|| format!("Failed to save session summary for {run_id}"))?;

    println!(
        "Scan {state}: {} of {} points, summary in {}",
        status.measured,
        status.planned,
        summary_path.display()
    );
    Ok(state)
}
