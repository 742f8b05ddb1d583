// Protocol runner example
//
// Connects to a DMF control board, optionally reloads its stored calibration,
// and runs a short protocol that actuates a row of electrodes while
// measuring the force on the droplet.

use clap::Parser;
use dmf_control_rs::{
    ControlBoardConfig, DmfControlBoard, FeedbackAction, ProtocolOutcome, ProtocolStep, RetryPolicy,
};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "run_protocol")]
#[command(version = "0.1")]
#[command(about = "Run a short actuation protocol on a DMF control board")]
struct Args {
    /// Serial port of the board; scans all ports when omitted
    #[arg(short, long)]
    port: Option<String>,

    /// Configuration as TOML text
    #[arg(short, long)]
    config: Option<String>,

    /// Actuation voltage (V RMS)
    #[arg(long, default_value_t = 100.0)]
    voltage: f64,

    /// Actuation frequency (Hz)
    #[arg(long, default_value_t = 10e3)]
    frequency: f64,

    /// Number of electrodes to step across
    #[arg(long, default_value_t = 4)]
    electrodes: usize,

    /// Area of one electrode (mm²)
    #[arg(long, default_value_t = 4.0)]
    electrode_area: f64,

    /// Reload the calibration stored on the board before running
    #[arg(long)]
    reload_calibration: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let config = match &args.config {
        Some(text) => ControlBoardConfig::from_toml_str(text)?,
        None => ControlBoardConfig::default(),
    };
    let mut board = DmfControlBoard::new(config)?;
    board.set_realtime_mode(true)?;

    let handshake = match &args.port {
        Some(port) => board.connect(port)?,
        None => board.connect_any()?,
    };
    println!(
        "Connected to board {} (firmware {}, {} channels)",
        handshake.serial_number, handshake.firmware_version, handshake.channel_count
    );

    if args.reload_calibration {
        let profile = board.reload_calibration()?;
        println!("Using stored calibration: gain {:.1}", profile.amplifier_gain);
    }

    let steps: Vec<ProtocolStep> = (0..args.electrodes)
        .map(|electrode| {
            let mut channels = vec![false; args.electrodes];
            channels[electrode] = true;
            ProtocolStep::new(args.voltage, args.frequency, Duration::from_millis(500))
                .with_samples(25)
                .with_channels(channels, args.electrode_area)
                .with_feedback(FeedbackAction::Retry(RetryPolicy {
                    max_attempts: 3,
                    acceptable_force: (10.0, 60.0),
                    increase_voltage: 10.0,
                }))
        })
        .collect();

    let report = board.run_protocol(&steps);
    for step in &report.steps {
        match step.last_measurement() {
            Some(result) => println!(
                "Step {}: {:?} after {} attempts, force {:.2} µN/mm at {:.1} V",
                step.index,
                step.status,
                step.attempts,
                result.force_estimate,
                result.mean_actuation_voltage().unwrap_or_default()
            ),
            None => println!("Step {}: {:?}, no samples", step.index, step.status),
        }
    }
    if let Some(warning) = &report.tolerance_warning {
        println!("Warning: {warning}");
    }
    if let ProtocolOutcome::Aborted { step, error } = &report.outcome {
        println!("Protocol aborted in step {step}: {error}");
    }

    board.set_realtime_mode(false)?;
    Ok(())
}
