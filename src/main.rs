use std::io::Read;
use std::path::PathBuf;
use std::process::exit;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::RecvTimeoutError;
use log::info;

use leaf_telemetry::logging;
use leaf_telemetry::{
    find_preferred_port, list_ports, run_diagnosis, AcquisitionSession, EngineConfig,
    RecordMetadata, SessionEvent,
};

#[derive(Parser, Debug)]
#[command(
    name = "leafscope",
    about = "Stream, record and diagnose leaf profile telemetry over serial"
)]
struct Args {
    /// Engine configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct PortArgs {
    /// Serial port; defaults to the first port matching the configured keywords
    #[arg(long)]
    port: Option<String>,
    /// Baud rate; defaults to the configured rate
    #[arg(long)]
    baud: Option<u32>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports and show which one would be picked
    Ports,
    /// Stream samples to stdout, optionally saving them to a record file
    Stream {
        #[command(flatten)]
        port: PortArgs,
        /// Stop after this many samples
        #[arg(long)]
        count: Option<usize>,
        /// Stop after this many seconds
        #[arg(long, default_value_t = 10)]
        seconds: u64,
        /// Record file to write when streaming ends
        #[arg(long)]
        output: Option<PathBuf>,
        /// Model written into the record file header
        #[arg(long, default_value = "Unknown")]
        model: String,
    },
    /// Request one pin status snapshot
    Pins {
        #[command(flatten)]
        port: PortArgs,
    },
    /// Send a raw command line to the device
    Send {
        #[command(flatten)]
        port: PortArgs,
        command: String,
    },
    /// Analyze a device log for known crash signatures (stdin if no file)
    Diagnose { file: Option<PathBuf> },
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    logging::init_logging_with(logging::parse_level(args.log_level.as_deref()));

    let config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => EngineConfig::default(),
    };

    match args.command {
        Command::Ports => show_ports(&config),
        Command::Stream {
            port,
            count,
            seconds,
            output,
            model,
        } => stream(&config, &port, count, Duration::from_secs(seconds), output, model),
        Command::Pins { port } => {
            let session = open_session(&config, &port)?;
            let pins = session.poll_pins().context("Pin poll failed")?;
            for (name, level) in pins.iter() {
                println!("{name:>4} {level}");
            }
            Ok(())
        }
        Command::Send { port, command } => {
            let session = open_session(&config, &port)?;
            session.send_command(&command).context("Failed to send command")?;
            println!("Sent: {command}");
            Ok(())
        }
        Command::Diagnose { file } => {
            let text = match file {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                None => {
                    let mut buf = String::new();
                    std::io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };
            println!("{}", run_diagnosis(&text));
            Ok(())
        }
    }
}

fn show_ports(config: &EngineConfig) -> Result<()> {
    let ports = list_ports().context("Failed to enumerate serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found.");
        return Ok(());
    }
    let preferred = find_preferred_port(&ports, &config.port_keywords).map(|p| p.name.clone());
    for p in &ports {
        let marker = if Some(&p.name) == preferred.as_ref() { "*" } else { " " };
        println!("{marker} {:<20} {}", p.name, p.description);
    }
    Ok(())
}

fn resolve_port(config: &EngineConfig, args: &PortArgs) -> Result<String> {
    if let Some(port) = &args.port {
        return Ok(port.clone());
    }
    let ports = list_ports().context("Failed to enumerate serial ports")?;
    match find_preferred_port(&ports, &config.port_keywords) {
        Some(p) => Ok(p.name.clone()),
        None => bail!(
            "No serial port matches {:?}. Connect the device or pass --port.",
            config.port_keywords
        ),
    }
}

fn open_session(config: &EngineConfig, args: &PortArgs) -> Result<AcquisitionSession> {
    let port = resolve_port(config, args)?;
    let baud = args.baud.unwrap_or(config.baud_rate);
    let session = AcquisitionSession::new(config.clone())?;
    session
        .connect(&port, baud)
        .with_context(|| format!("Failed to connect to {port}"))?;
    info!("Connected to {port} at {baud} baud");
    Ok(session)
}

fn stream(
    config: &EngineConfig,
    port: &PortArgs,
    count: Option<usize>,
    duration: Duration,
    output: Option<PathBuf>,
    model: String,
) -> Result<()> {
    let session = open_session(config, port)?;
    let events = session.events();
    session.start_streaming().context("Failed to start streaming")?;

    let deadline = Instant::now() + duration;
    let mut received = 0usize;
    loop {
        if count.is_some_and(|n| received >= n) {
            break;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match events.recv_timeout(remaining) {
            Ok(SessionEvent::Sample { sample, staleness }) => {
                received += 1;
                let tag = if staleness.is_stale() { " (stale)" } else { "" };
                println!("{},{}{tag}", sample.x, sample.y);
            }
            Ok(SessionEvent::StatusChanged(status)) => info!("status: {status:?}"),
            Ok(SessionEvent::LinkFault(reason)) => bail!("Link failed: {reason}"),
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) => break,
            Err(RecvTimeoutError::Disconnected) => bail!("Acquisition worker stopped"),
        }
    }

    if let Err(e) = session.stop_streaming() {
        eprintln!("Warning: STOP not acknowledged: {e}");
    }
    println!(
        "Received {received} samples ({} stored, {} rejected lines)",
        session.sample_count(),
        session.parse_errors()
    );

    if let Some(path) = output {
        session
            .export(&path, &RecordMetadata::with_model(model))
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Saved to {}", path.display());
    }
    Ok(())
}
