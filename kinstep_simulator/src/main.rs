// src/main.rs - homing simulation harness
use std::fs::{self, File};
use std::path::PathBuf;

use clap::Parser;
use kinstep_simulator::{load_scenario, HomingSimulator};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Parser, Debug)]
#[command(name = "sim-harness", version, about = "Replay a multi-MCU homing scenario")]
struct Cli {
    /// Scenario TOML
    #[arg(short, long, value_name = "FILE")]
    scenario: PathBuf,

    /// Directory for messages.csv and summary.json
    #[arg(short, long, value_name = "DIR", default_value = "sim_output")]
    output: PathBuf,

    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    log_level: String,
}

fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    let level: tracing::Level = cli
        .log_level
        .parse()
        .map_err(|_| format!("invalid log level '{}'", cli.log_level))?;
    tracing_subscriber::fmt().with_max_level(level).init();

    let scenario = load_scenario(&cli.scenario)?;
    let mut sim = HomingSimulator::new(scenario)?;
    let report = sim.run()?;

    fs::create_dir_all(&cli.output)?;
    let csv_path = cli.output.join("messages.csv");
    sim.write_csv(File::create(&csv_path)?)?;
    let summary_path = cli.output.join("summary.json");
    fs::write(&summary_path, serde_json::to_string_pretty(&report)?)?;

    match (&report.trigger_mcu, &report.lapse) {
        (Some(mcu), _) => println!("triggered by {} at {:.6}s", mcu, report.trigger.map_or(0.0, |t| t.host_time)),
        (None, Some(lapse)) => println!("aborted: {}", lapse),
        (None, None) => println!("no trigger, stopped by host: {}", report.stopped_by_host),
    }
    tracing::info!(
        messages = sim.messages().len(),
        "wrote {} and {}",
        csv_path.display(),
        summary_path.display()
    );
    Ok(())
}
