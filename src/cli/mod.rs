//! Command-line interface
//!
//! Thin presentation layer over the library: argument types for the binary
//! and one handler per subcommand. The flash handler runs the session on a
//! background worker thread and renders the event stream it produces; the
//! orchestration itself never touches the terminal.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread,
};

use clap::Args;
use comfy_table::{modifiers, presets::UTF8_FULL, Attribute, Cell, Color, Table};
use crossterm::style::Stylize;
use miette::{IntoDiagnostic, Result};

use crate::{
    config::Config,
    esptool::EspTool,
    history::HistoryLog,
    ports::detect_serial_ports,
    registry::{DeviceRecord, DeviceRegistry},
    session::{Event, FlashOrchestrator, JobStatus},
    Error,
};

#[derive(Debug, Args)]
pub struct FlashArgs {
    /// Firmware binary to write to each device
    pub image: PathBuf,

    /// Serial port to flash; repeat for multiple devices, flashed in the
    /// given order
    #[arg(short, long = "port", value_name = "PORT")]
    pub ports: Vec<String>,

    /// Flash every detected serial port
    #[arg(long, conflicts_with = "ports")]
    pub all: bool,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    /// Show only the device last flashed on this port
    pub port: Option<String>,
}

/// List the attached serial ports, joined with registry provenance.
pub fn list_ports(config: &Config) -> Result<()> {
    let ports = detect_serial_ports()?;
    if ports.is_empty() {
        println!("No serial ports detected");
        return Ok(());
    }

    let registry = DeviceRegistry::load(config.registry_path());

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(modifiers::UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Port").add_attribute(Attribute::Bold),
            Cell::new("Description").add_attribute(Attribute::Bold),
            Cell::new("MAC").add_attribute(Attribute::Bold),
            Cell::new("Last flashed").add_attribute(Attribute::Bold),
        ]);

    for port in &ports {
        let record = registry.find_by_port(&port.name);
        table.add_row(vec![
            Cell::new(&port.name).fg(Color::Green),
            Cell::new(port.description.as_deref().unwrap_or("-")),
            Cell::new(
                record
                    .and_then(|r| r.mac.as_deref())
                    .unwrap_or("-"),
            ),
            Cell::new(record.map(|r| r.last_flashed.as_str()).unwrap_or("never")),
        ]);
    }

    println!("{table}");
    Ok(())
}

/// Flash the selected ports sequentially, rendering the session's event
/// stream as it arrives.
pub fn flash(args: FlashArgs, config: &Config) -> Result<()> {
    let ports = if args.all {
        let detected = detect_serial_ports()?;
        if detected.is_empty() {
            return Err(Error::NoSerial.into());
        }
        detected.into_iter().map(|port| port.name).collect()
    } else {
        args.ports
    };

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            eprintln!("\nCancelling; the device currently being flashed will be aborted");
            cancel.store(true, Ordering::Relaxed);
        })
        .into_diagnostic()?;
    }

    let tool = EspTool::from_config(config);
    let registry = DeviceRegistry::load(config.registry_path());
    let history = HistoryLog::new(config.history_log_path());
    let mut orchestrator = FlashOrchestrator::new(tool, registry, history);

    let (tx, rx) = mpsc::channel();
    let worker = {
        let cancel = cancel.clone();
        let image = args.image.clone();
        thread::spawn(move || orchestrator.run(&image, &ports, &tx, &cancel))
    };

    // The worker owns the sender; this loop ends when the session is done.
    for event in rx {
        match event {
            Event::LogLine(line) => println!("{line}"),
            Event::JobStarted { port, index, total } => {
                println!(
                    "{}",
                    format!("[{}/{total}] Flashing device on {port}...", index + 1).bold()
                );
            }
            Event::JobFinished {
                port,
                status,
                mac,
                warning,
            } => {
                let mac = mac.as_deref().unwrap_or("unknown MAC");
                match status {
                    JobStatus::Succeeded => {
                        println!("{}", format!("{port} ({mac}): success").green())
                    }
                    status => println!("{}", format!("{port}: {status}").red()),
                }
                if let Some(warning) = warning {
                    eprintln!("{}", format!("warning: {warning}").yellow());
                }
            }
            Event::Progress(fraction) => {
                println!("Progress: {:.0}%", fraction * 100.0);
            }
            Event::Summary(summary) => println!("\nFlashing complete. {summary}"),
        }
    }

    let summary = worker.join().expect("flash worker thread panicked")?;

    if summary.succeeded < summary.total {
        miette::bail!(
            "{} of {} devices failed to flash",
            summary.total - summary.succeeded,
            summary.total
        );
    }

    Ok(())
}

/// Show the device provenance registry, optionally narrowed to one port.
pub fn history(args: HistoryArgs, config: &Config) -> Result<()> {
    let registry = DeviceRegistry::load(config.registry_path());

    let records: Vec<&DeviceRecord> = match &args.port {
        Some(port) => registry.find_by_port(port).into_iter().collect(),
        None => registry.all().iter().collect(),
    };

    if records.is_empty() {
        match &args.port {
            Some(port) => println!("No device has been flashed on {port}"),
            None => println!("No devices have been flashed yet"),
        }
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(modifiers::UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("MAC address").add_attribute(Attribute::Bold),
            Cell::new("First seen").add_attribute(Attribute::Bold),
            Cell::new("Last flashed").add_attribute(Attribute::Bold),
            Cell::new("Flash count").add_attribute(Attribute::Bold),
            Cell::new("Last firmware").add_attribute(Attribute::Bold),
            Cell::new("Ports").add_attribute(Attribute::Bold),
        ]);

    for record in records {
        table.add_row(vec![
            Cell::new(record.mac.as_deref().unwrap_or("unknown")).fg(Color::Green),
            Cell::new(&record.first_seen),
            Cell::new(&record.last_flashed),
            Cell::new(record.flash_count),
            Cell::new(&record.last_firmware),
            Cell::new(record.port_history.join(", ")),
        ]);
    }

    println!("{table}");
    Ok(())
}
