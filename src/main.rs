mod clock;
mod config;
mod cuesheet;
mod error;
mod eventlog;
mod radio;
mod scheduler;
mod sim;
mod tracker;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc::{self, UnboundedSender};

use config::{Bandwidth, ExperimentConfig, RunConfig, Station};
use error::{ModjamError, Result};
use eventlog::EventLog;
use radio::{reconnect, Radio, RadioEvent, RetryPolicy};
use scheduler::{pump_radio_events, Scheduler};
use sim::SimRadio;
use tracker::TxTracker;

#[derive(Parser)]
#[command(name = "modjam", about = "Synchronized LoRa modulation jamming experiment")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Build the cuesheet and run it from the next start boundary
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Total duration in seconds of each test case, including padding
    #[arg(long, default_value_t = 600)]
    test_case_duration: u64,

    /// Seconds between the active parts of two test cases
    #[arg(long, default_value_t = 60)]
    test_case_padding: u64,

    /// Seconds between two test transmissions
    #[arg(long, default_value_t = 2)]
    transmission_padding: u64,

    /// Center frequency in MHz. Repeat to test several frequencies.
    #[arg(long)]
    frequency: Vec<f64>,

    /// Bandwidth in kHz (62 for 62.5 kHz). Repeat to test several.
    #[arg(long, value_parser = parse_bandwidth)]
    bandwidth: Vec<Bandwidth>,

    /// Spread factor. Repeat to test several.
    #[arg(long, value_parser = clap::value_parser!(u8).range(5..=12))]
    spread_factor: Vec<u8>,

    /// Coding rate denominator (4/5 .. 4/8). Repeat to test several.
    #[arg(long, value_parser = clap::value_parser!(u8).range(5..=8))]
    coding_rate: Vec<u8>,

    /// Total payload size in bytes. Repeat to test several. Default 40.
    #[arg(long)]
    payload_size: Vec<usize>,

    /// Transmit power in dBm. Repeat to test several. Default 22.
    #[arg(long, allow_negative_numbers = true)]
    power: Vec<i32>,

    /// Start at the next minute of the hour that is a multiple of this
    #[arg(long, default_value_t = 5)]
    start_at: u32,

    /// Identifier of a participating station. Repeat for each station.
    #[arg(long, value_parser = parse_station)]
    stations: Vec<Station>,

    /// Identifier of this station
    #[arg(long, value_parser = parse_station)]
    this_station: Station,

    /// Device path of a hardware node. Not supported yet; omit it to run
    /// against the emulated node.
    #[arg(long)]
    port: Option<String>,

    /// Directory for the JSONL event log
    #[arg(long, default_value = ".")]
    log_dir: PathBuf,

    /// Give up after this many reconnect attempts (0 retries forever)
    #[arg(long, default_value_t = 0)]
    reconnect_attempts: u32,
}

impl RunArgs {
    fn experiment_config(&self) -> ExperimentConfig {
        ExperimentConfig {
            test_case_duration: self.test_case_duration,
            test_case_padding: self.test_case_padding,
            transmission_padding: self.transmission_padding,
            frequency: self.frequency.clone(),
            bandwidth: self.bandwidth.clone(),
            spread_factor: self.spread_factor.clone(),
            coding_rate: self.coding_rate.clone(),
            payload_size: self.payload_size.clone(),
            power: self.power.clone(),
            start_at: self.start_at,
            stations: self.stations.clone(),
        }
        .with_defaults()
    }

    fn run_config(&self) -> RunConfig {
        RunConfig {
            this_station: self.this_station,
            port: self.port.clone(),
            log_dir: self.log_dir.clone(),
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: (self.reconnect_attempts > 0).then_some(self.reconnect_attempts),
            ..RetryPolicy::default()
        }
    }
}

fn parse_bandwidth(s: &str) -> Result<Bandwidth, String> {
    Bandwidth::from_name(s).ok_or_else(|| {
        format!(
            "unknown bandwidth '{}'. Valid: {}",
            s,
            Bandwidth::all_names().join(", ")
        )
    })
}

fn parse_station(s: &str) -> Result<Station, String> {
    Station::from_name(s).ok_or_else(|| {
        format!(
            "unknown station '{}'. Valid: {}",
            s,
            Station::all_names().join(", ")
        )
    })
}

/// Pick the radio backend. Only the emulated node exists, so a device path
/// is refused rather than silently simulated.
fn open_radio(port: Option<&str>, events: UnboundedSender<RadioEvent>) -> Result<SimRadio> {
    match port {
        Some(port) => Err(ModjamError::Config(format!(
            "no hardware backend for port '{}'; omit --port to use the emulated node",
            port
        ))),
        None => Ok(SimRadio::new("sim", events)),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Init logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();

    let result = match cli.command {
        Command::Run(args) => run(args).await,
    };
    if let Err(e) = result {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let config = args.experiment_config();
    config.validate()?;
    let run_config = args.run_config();
    let retry = args.retry_policy();

    let (radio_tx, radio_rx) = mpsc::unbounded_channel();
    let mut radio = open_radio(run_config.port.as_deref(), radio_tx)?;

    // Confirm the node is reachable before committing to a start time
    reconnect(&mut radio, &retry).await?;

    log::info!(
        "Station {} on {}, experiment {}",
        run_config.this_station,
        radio.device_path(),
        serde_json::to_string(&config)?
    );

    // Built before sleeping so the timing is visible up front
    let cuesheet = cuesheet::build_cuesheet(&config);
    if cuesheet.is_empty() {
        log::warn!("Cuesheet is empty, nothing to run");
        return Ok(());
    }
    if let (Some(first), Some(last)) = (cuesheet.scenarios().next(), cuesheet.scenarios().last()) {
        log::debug!("First scenario: {:?}", first);
        log::debug!("Last scenario: {:?}", last);
    }
    log::info!(
        "{} scenarios over {} radio configurations, {} s total",
        cuesheet.len(),
        cuesheet.permutations(),
        cuesheet.total_secs()
    );

    clock::sleep_until_start(config.start_at).await;

    let events = EventLog::create(&run_config.log_dir, run_config.this_station)
        .await?
        .shared();
    let tracker = Arc::new(TxTracker::default());
    tokio::spawn(pump_radio_events(
        radio_rx,
        Arc::clone(&tracker),
        Arc::clone(&events),
    ));

    let mut scheduler = Scheduler::new(
        radio,
        Arc::clone(&tracker),
        Arc::clone(&events),
        run_config.this_station,
    )
    .with_retry_policy(retry);

    tokio::select! {
        result = scheduler.run(cuesheet) => {
            result?;
            let event_log = events.lock().await;
            log::info!(
                "Run complete on {}: {} packets, {} events in {}",
                scheduler.radio().device_path(),
                scheduler.num_packets(),
                event_log.records(),
                event_log.path().display()
            );
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!(
                "Shutting down... (tracker {:?}, {} unclaimed confirmations)",
                tracker.state(),
                tracker.pending()
            );
        }
    }
    Ok(())
}
