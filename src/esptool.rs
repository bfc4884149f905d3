//! External flashing tool invocation
//!
//! The low-level flashing protocol is delegated entirely to an external tool
//! (esptool by default), invoked once per port as a subprocess. This module
//! owns the argument template, streams the tool's merged stdout/stderr line
//! by line as it arrives, and extracts the device MAC address from the
//! output.

use std::{
    io::{BufRead, BufReader, Read},
    path::Path,
    process::{Command, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, LazyLock,
    },
    thread,
    time::{Duration, Instant},
};

use log::{debug, warn};
use regex::Regex;

use crate::config::Config;

/// Captures the colon-separated hex run following the `MAC:` marker. The run
/// is validated against [`MAC_EXACT`] afterwards so that truncated or
/// overlong sequences never yield an identifier.
static MAC_SCAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"MAC: ([0-9A-Fa-f:]+)").unwrap());

static MAC_EXACT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9A-Fa-f]{2}(?::[0-9A-Fa-f]{2}){5}$").unwrap());

/// Extract a MAC address from one line of tool output.
///
/// Only the exact form `MAC: xx:xx:xx:xx:xx:xx` (six 2-hex-digit groups)
/// matches; anything shorter, longer, or malformed is rejected.
pub(crate) fn extract_mac(line: &str) -> Option<String> {
    let token = MAC_SCAN.captures(line)?.get(1)?.as_str();
    MAC_EXACT.is_match(token).then(|| token.to_string())
}

/// Terminal result of one tool invocation
#[derive(Debug, Clone)]
pub struct FlashOutcome {
    /// Whether the tool exited with status zero
    pub success: bool,
    /// First MAC address seen in the output, if any
    pub mac: Option<String>,
    /// Combined stdout/stderr of the run
    pub output: String,
}

impl FlashOutcome {
    fn failed(output: String) -> Self {
        Self {
            success: false,
            mac: None,
            output,
        }
    }
}

/// Abstraction over the external flashing tool, so the orchestrator can be
/// exercised without spawning real subprocesses.
pub trait FlashTool {
    /// Flash `firmware` onto the device attached to `port`, feeding each
    /// output line to `sink` as it arrives.
    ///
    /// Implementations never return an error: a tool that cannot be launched
    /// is a failed flash, not a fatal condition, so the batch can continue
    /// with the remaining ports.
    fn flash(
        &self,
        port: &str,
        firmware: &Path,
        sink: &mut dyn FnMut(&str),
        cancel: &AtomicBool,
    ) -> FlashOutcome;
}

/// The real esptool subprocess adapter
#[derive(Debug, Clone)]
pub struct EspTool {
    tool: String,
    chip: String,
    baud: u32,
    flash_addr: String,
    timeout: Option<Duration>,
}

impl EspTool {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tool: config.tool.clone(),
            chip: config.chip.clone(),
            baud: config.baud,
            flash_addr: config.flash_addr.clone(),
            timeout: (config.timeout_secs > 0)
                .then(|| Duration::from_secs(config.timeout_secs)),
        }
    }
}

impl FlashTool for EspTool {
    fn flash(
        &self,
        port: &str,
        firmware: &Path,
        sink: &mut dyn FnMut(&str),
        cancel: &AtomicBool,
    ) -> FlashOutcome {
        let mut command = Command::new(&self.tool);
        command
            .arg("--chip")
            .arg(&self.chip)
            .arg("--port")
            .arg(port)
            .arg("--baud")
            .arg(self.baud.to_string())
            .arg("write_flash")
            .arg(&self.flash_addr)
            .arg(firmware)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!("Spawning {command:?}");

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to launch '{}': {e}", self.tool);
                return FlashOutcome::failed(String::new());
            }
        };

        // stdout and stderr are drained on their own threads into a single
        // channel, which both merges the streams and gives this thread a
        // bounded wait between lines for timeout and cancellation checks.
        let (tx, rx) = mpsc::channel::<String>();
        let readers: Vec<_> = [
            child.stdout.take().map(|s| Box::new(s) as Box<dyn Read + Send>),
            child.stderr.take().map(|s| Box::new(s) as Box<dyn Read + Send>),
        ]
        .into_iter()
        .flatten()
        .map(|stream| {
            let tx = tx.clone();
            thread::spawn(move || {
                for line in BufReader::new(stream).lines() {
                    let Ok(line) = line else { break };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            })
        })
        .collect();
        drop(tx);

        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut mac = None;
        let mut output = String::new();
        let mut aborted = None;

        loop {
            if cancel.load(Ordering::Relaxed) {
                aborted = Some("cancelled");
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                aborted = Some("timed out");
                break;
            }

            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(line) => {
                    sink(&line);
                    if mac.is_none() {
                        mac = extract_mac(&line);
                    }
                    output.push_str(&line);
                    output.push('\n');
                }
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                // Both reader threads finished, so the process is done
                // writing; all that remains is to collect its exit status.
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        if let Some(reason) = aborted {
            warn!("Flash on {port} {reason}; killing '{}'", self.tool);
            let _ = child.kill();
        }
        let status = child.wait();
        for reader in readers {
            let _ = reader.join();
        }

        let success = aborted.is_none() && status.map(|s| s.success()).unwrap_or(false);
        FlashOutcome {
            success,
            mac,
            output,
        }
    }
}
