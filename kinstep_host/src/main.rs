// src/main.rs - kinstep host command line
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use kinstep_host::motion::{self, AxisInputShaper, StepEvent, StepGenerator};
use kinstep_host::trsync::{StatusOutcome, TrDispatch, TrsyncState, TrsyncWindow, REASON_ENDSTOP_HIT};
use kinstep_shared::clock::ClockEstimate;
use kinstep_shared::config::{self, Config};
use kinstep_shared::transport::{CommandQueueId, OutgoingMessage, SerialQueue};
use kinstep_shared::trapq::{Coord, TrapQueue};
use tokio::sync::mpsc;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

const MSG_TRSYNC_SET_TIMEOUT: u32 = 0x40;
const MSG_TRSYNC_TRIGGER: u32 = 0x41;
const MSG_TRSYNC_STATE: u32 = 0x42;
/// Clock ticks between simulated trsync_state reports
const STATUS_INTERVAL: u64 = 5_000;
const SIM_MCU_FREQ: f64 = 1_000_000.0;

#[derive(Parser, Debug)]
#[command(name = "kinstep-host", version, about = "Step time generation and homing trigger dispatch")]
struct Cli {
    /// Path to the printer TOML
    #[arg(short, long, value_name = "FILE", default_value = "printer.toml")]
    config: PathBuf,

    /// Console log level (error|warn|info|debug|trace)
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate the steps for one straight move from the origin
    Move {
        #[arg(long, default_value_t = 50.0)]
        x: f64,
        #[arg(long, default_value_t = 0.0)]
        y: f64,
        #[arg(long, default_value_t = 0.0)]
        z: f64,
        /// Filament to extrude along the move
        #[arg(long, default_value_t = 0.0)]
        e: f64,
        /// Print every step as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },
    /// Run a homing trigger dispatch against simulated MCUs
    Homing {
        /// Endstop trip time in ms, one per MCU
        #[arg(long = "trip-ms", num_args = 1.., default_values_t = vec![40.0, 55.0])]
        trip_ms: Vec<f64>,
    },
    /// Switch power on a USB hub port
    HubPower {
        hub: usize,
        port: u16,
        #[arg(long)]
        off: bool,
    },
}

fn run_move(config: &Config, target: Coord, e: f64, json: bool) -> Result<(), BoxError> {
    let mut sg = StepGenerator::new(TrapQueue::new().into_shared());
    for mut stepper in motion::build_steppers(config)? {
        stepper.set_position(0.0, 0.0, 0.0);
        sg.add_stepper(stepper);
    }
    let extruder_queue = match &config.extruder {
        Some(ec) => {
            let mut extruder = motion::build_extruder(ec)?;
            let queue = TrapQueue::new().into_shared();
            extruder.set_trapq(Some(Arc::clone(&queue)));
            sg.add_stepper(extruder);
            Some(queue)
        }
        None => None,
    };
    if let Some(isc) = &config.input_shaper {
        let mut shapers = AxisInputShaper::from_config(isc)?;
        sg.configure_input_shaper(&mut shapers)?;
    }
    let print_time = 0.1;
    let (end_time, timing) = sg.queue_move(
        print_time,
        Coord::default(),
        target,
        config.printer.max_velocity,
        config.printer.max_accel,
    )?;
    if let Some(queue) = &extruder_queue {
        StepGenerator::queue_extrude(queue, print_time, &timing, 0.0, e)?;
    }
    tracing::info!(
        distance = timing.distance,
        cruise_v = timing.cruise_v,
        duration = timing.total_time(),
        "move queued"
    );
    let mut all: BTreeMap<String, Vec<StepEvent>> = BTreeMap::new();
    let mut flush_time = print_time;
    while flush_time < end_time + 2.0 * sg.kin_flush_delay() {
        flush_time += 0.05;
        for (name, steps) in sg.flush(flush_time)? {
            all.entry(name).or_default().extend(steps);
        }
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&all)?);
        return Ok(());
    }
    for stepper in sg.steppers() {
        let steps = all.get(stepper.name()).map(Vec::as_slice).unwrap_or_default();
        let net: i64 = steps.iter().map(|s| i64::from(s.dir)).sum();
        println!(
            "{:<16} {:>8} steps  net {:>+8}  position {:>10.4}",
            stepper.name(),
            steps.len(),
            net,
            stepper.commanded_pos()
        );
    }
    Ok(())
}

async fn run_homing(config: &Config, trip_ms: &[f64]) -> Result<(), BoxError> {
    let td = TrDispatch::new();
    let (tx, mut rx) = mpsc::unbounded_channel::<OutgoingMessage>();
    let transport: Arc<dyn SerialQueue> = Arc::new(tx);
    let ce = ClockEstimate::from_frequency(SIM_MCU_FREQ);
    let mut endpoints = Vec::with_capacity(trip_ms.len());
    for oid in 0..trip_ms.len() as u32 {
        let tdm = td.mcu_alloc(
            Arc::clone(&transport),
            CommandQueueId(oid),
            oid,
            MSG_TRSYNC_SET_TIMEOUT,
            MSG_TRSYNC_TRIGGER,
            MSG_TRSYNC_STATE,
        )?;
        TrsyncWindow::for_move(&config.trsync, trip_ms.len(), 0.0, &ce).apply(&tdm, ce)?;
        endpoints.push(tdm);
    }
    td.start(REASON_ENDSTOP_HIT)?;

    let mut tasks = Vec::new();
    for (tdm, &trip) in endpoints.into_iter().zip(trip_ms) {
        let trip_clock = ce.seconds_to_clock(trip / 1000.0);
        tasks.push(tokio::spawn(async move {
            let oid = tdm.index() as u32;
            let mut clock = 0u64;
            while tdm.dispatch().is_active()? {
                clock += STATUS_INTERVAL;
                let tripped = clock >= trip_clock;
                let state = TrsyncState {
                    oid,
                    can_trigger: !tripped,
                    trigger_reason: if tripped { REASON_ENDSTOP_HIT } else { 0 },
                    clock: clock as u32,
                };
                if let StatusOutcome::Triggered(event) = tdm.handle_trsync_state(state)? {
                    tracing::info!(oid, clock = event.clock, "endstop won the race");
                }
                tokio::task::yield_now().await;
            }
            Ok::<_, kinstep_host::trsync::DispatchError>(())
        }));
    }
    for task in tasks {
        task.await??;
    }
    td.stop()?;

    let mut sent: BTreeMap<&'static str, usize> = BTreeMap::new();
    while let Ok(msg) = rx.try_recv() {
        let name = match msg.msg.msgtag() {
            Some(MSG_TRSYNC_SET_TIMEOUT) => "trsync_set_timeout",
            Some(MSG_TRSYNC_TRIGGER) => "trsync_trigger",
            _ => "other",
        };
        *sent.entry(name).or_default() += 1;
    }
    println!("{}", serde_json::to_string_pretty(&td.trigger_result()?)?);
    for (name, count) in sent {
        println!("{:<20} {}", name, count);
    }
    Ok(())
}

#[cfg(all(target_os = "linux", feature = "usbfs"))]
fn run_hub_power(hub: usize, port: u16, on: bool) -> Result<(), BoxError> {
    let mut backend = kinstep_host::hardware::usbfs::UsbfsBackend::default();
    kinstep_host::hardware::set_power(&mut backend, hub, port, on).map_err(|e| {
        tracing::error!(code = e.code(), "{}", e);
        Box::new(e) as BoxError
    })
}

#[cfg(not(all(target_os = "linux", feature = "usbfs")))]
fn run_hub_power(_hub: usize, _port: u16, _on: bool) -> Result<(), BoxError> {
    Err("kinstep-host was built without the usbfs feature".into())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    let level: tracing::Level = cli
        .log_level
        .parse()
        .map_err(|_| format!("invalid log level '{}'", cli.log_level))?;
    tracing_subscriber::fmt().with_max_level(level).init();

    tracing::info!("Starting kinstep host {}", env!("CARGO_PKG_VERSION"));

    let load = || {
        let path = cli.config.to_string_lossy();
        tracing::info!("Loading configuration from: {}", path);
        config::load_config(&path).map_err(|e| {
            tracing::error!("Failed to load config from '{}': {}", path, e);
            Box::new(e) as BoxError
        })
    };

    match &cli.command {
        Commands::Move { x, y, z, e, json } => {
            let config = load()?;
            tracing::info!(
                "Printer: {} ({})",
                config.printer.printer_name.as_deref().unwrap_or("Unknown"),
                config.printer.kinematics
            );
            run_move(&config, Coord::new(*x, *y, *z), *e, *json)
        }
        Commands::Homing { trip_ms } => {
            let config = if cli.config.exists() { load()? } else { Config::default() };
            run_homing(&config, trip_ms).await
        }
        Commands::HubPower { hub, port, off } => run_hub_power(*hub, *port, !*off),
    }
}
