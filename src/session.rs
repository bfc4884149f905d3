//! Flash session orchestration
//!
//! A session is an ordered batch of per-port flash jobs triggered by one
//! user request. Jobs run strictly sequentially: the external tool and the
//! serial bus are treated as exclusively owned by one flash operation at a
//! time, and interleaving two subprocess output streams would make log
//! attribution ambiguous. The orchestrator is the only writer of the device
//! registry and the only spawner of flashing subprocesses.
//!
//! The presentation layer is decoupled through an [`Event`] channel: the
//! session runs on a worker thread and emits structured events (log lines,
//! progress, job results, the final summary) that the caller consumes at its
//! own pace.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::{atomic::AtomicBool, mpsc::Sender},
};

use chrono::Local;
use log::{info, warn};

use crate::{
    error::Error,
    esptool::FlashTool,
    history::HistoryLog,
    registry::DeviceRegistry,
};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Terminal state of one flash job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Succeeded,
    Failed(String),
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// One attempt to write firmware to one port
#[derive(Debug, Clone)]
pub struct FlashJob {
    pub port: String,
    pub firmware: PathBuf,
    pub status: JobStatus,
    /// MAC address extracted from the tool output, when found
    pub mac: Option<String>,
    /// Combined tool output captured for this job
    pub log: String,
    /// Non-fatal provenance persistence problem, surfaced to the caller
    pub warning: Option<String>,
}

/// Result of a completed session
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub succeeded: usize,
    pub total: usize,
    pub jobs: Vec<FlashJob>,
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} devices successfully flashed",
            self.succeeded, self.total
        )
    }
}

/// Structured events emitted by a running session
#[derive(Debug, Clone)]
pub enum Event {
    /// One line of external tool output, verbatim
    LogLine(String),
    /// A job is about to start; `index` is zero-based
    JobStarted {
        port: String,
        index: usize,
        total: usize,
    },
    /// A job finished, successfully or not
    JobFinished {
        port: String,
        status: JobStatus,
        mac: Option<String>,
        warning: Option<String>,
    },
    /// Fraction of jobs completed; exactly k/N after job k of N
    Progress(f64),
    /// The session is complete
    Summary(SessionSummary),
}

/// Drives one flash session: validation, the sequential job loop, and
/// reconciliation of results into the device registry.
pub struct FlashOrchestrator<T: FlashTool> {
    tool: T,
    registry: DeviceRegistry,
    history: HistoryLog,
}

impl<T: FlashTool> FlashOrchestrator<T> {
    pub fn new(tool: T, registry: DeviceRegistry, history: HistoryLog) -> Self {
        Self {
            tool,
            registry,
            history,
        }
    }

    /// Run one session over `ports`, in the given order.
    ///
    /// Validation fails closed: with no ports selected or a firmware path
    /// that does not resolve to a file, no job is attempted and nothing is
    /// mutated. Afterwards every selected port is attempted; a failing device
    /// never aborts the batch. Registry updates for job *i* land before job
    /// *i+1* starts and before the summary is emitted.
    ///
    /// Event send failures are ignored: a caller that stopped listening does
    /// not affect the session's outcome.
    pub fn run(
        &mut self,
        firmware: &Path,
        ports: &[String],
        events: &Sender<Event>,
        cancel: &AtomicBool,
    ) -> Result<SessionSummary, Error> {
        if ports.is_empty() {
            return Err(Error::NoPortsSelected);
        }
        if !firmware.is_file() {
            return Err(Error::FirmwareNotFound(firmware.to_path_buf()));
        }

        let total = ports.len();
        let mut jobs = Vec::with_capacity(total);
        let mut succeeded = 0;

        for (index, port) in ports.iter().enumerate() {
            let mut job = FlashJob {
                port: port.clone(),
                firmware: firmware.to_path_buf(),
                status: JobStatus::Pending,
                mac: None,
                log: String::new(),
                warning: None,
            };

            if cancel.load(std::sync::atomic::Ordering::Relaxed) {
                job.status = JobStatus::Failed("session cancelled".into());
                jobs.push(job);
                continue;
            }

            let _ = events.send(Event::JobStarted {
                port: port.clone(),
                index,
                total,
            });
            info!("Flashing device on {port}...");

            let outcome = {
                let mut sink = |line: &str| {
                    let _ = events.send(Event::LogLine(line.to_string()));
                };
                self.tool.flash(port, firmware, &mut sink, cancel)
            };
            job.mac = outcome.mac.clone();
            job.log = outcome.output;

            if outcome.success {
                job.status = JobStatus::Succeeded;
                succeeded += 1;
                job.warning = self.record_provenance(port, outcome.mac.as_deref(), firmware);
                info!("Device on {port} flashed successfully");
            } else {
                job.status = JobStatus::Failed("flashing tool reported an error".into());
                warn!("Failed to flash device on {port}");
            }

            let _ = events.send(Event::JobFinished {
                port: port.clone(),
                status: job.status.clone(),
                mac: job.mac.clone(),
                warning: job.warning.clone(),
            });
            let _ = events.send(Event::Progress((index + 1) as f64 / total as f64));

            jobs.push(job);
        }

        let summary = SessionSummary {
            succeeded,
            total,
            jobs,
        };
        info!("Flashing complete. {summary}");
        let _ = events.send(Event::Summary(summary.clone()));

        Ok(summary)
    }

    /// Update the registry and history log after a successful flash.
    ///
    /// An IO failure here is returned as a warning rather than an error: the
    /// in-memory registry update is kept, and losing one provenance write is
    /// preferable to aborting the batch.
    fn record_provenance(
        &mut self,
        port: &str,
        mac: Option<&str>,
        firmware: &Path,
    ) -> Option<String> {
        let timestamp = Local::now().format(TIMESTAMP_FORMAT).to_string();
        let firmware_name = firmware
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| firmware.display().to_string());

        let mut warning = None;
        if let Err(e) = self
            .registry
            .record_flash(port, mac, &firmware_name, &timestamp)
        {
            warn!("Failed to persist device registry: {e}");
            warning = Some(format!("device registry not updated: {e}"));
        }
        if let Err(e) = self.history.append(&timestamp, port, mac, firmware) {
            warn!("Failed to append flash history: {e}");
            let message = format!("flash history not updated: {e}");
            warning = Some(match warning {
                Some(existing) => format!("{existing}; {message}"),
                None => message,
            });
        }

        warning
    }

    /// Registry state, reflecting all updates applied so far
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            mpsc, Mutex,
        },
    };

    use super::*;
    use crate::esptool::FlashOutcome;

    /// Scripted tool: plays back one canned outcome per invocation.
    struct StubTool {
        outcomes: Mutex<Vec<FlashOutcome>>,
        calls: AtomicUsize,
    }

    impl StubTool {
        fn new(outcomes: Vec<FlashOutcome>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
                calls: AtomicUsize::new(0),
            }
        }

        fn always_succeeding(n: usize, mac: &str) -> Self {
            Self::new(vec![
                FlashOutcome {
                    success: true,
                    mac: Some(mac.to_string()),
                    output: String::new(),
                };
                n
            ])
        }
    }

    impl FlashTool for StubTool {
        fn flash(
            &self,
            _port: &str,
            _firmware: &Path,
            sink: &mut dyn FnMut(&str),
            _cancel: &AtomicBool,
        ) -> FlashOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let outcome = self.outcomes.lock().unwrap().remove(0);
            for line in outcome.output.lines() {
                sink(line);
            }
            outcome
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        firmware: PathBuf,
    }

    impl Fixture {
        fn new(firmware_name: &str) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let firmware = dir.path().join(firmware_name);
            fs::write(&firmware, b"\xe9firmware").unwrap();
            Self { dir, firmware }
        }

        fn orchestrator(&self, tool: StubTool) -> FlashOrchestrator<StubTool> {
            FlashOrchestrator::new(
                tool,
                DeviceRegistry::load(self.registry_path()),
                HistoryLog::new(self.history_path()),
            )
        }

        fn registry_path(&self) -> PathBuf {
            self.dir.path().join("devices.json")
        }

        fn history_path(&self) -> PathBuf {
            self.dir.path().join("flash_log.txt")
        }
    }

    fn ports(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_port_selection_aborts_without_side_effects() {
        let fixture = Fixture::new("fw.bin");
        let tool = StubTool::new(Vec::new());
        let mut orchestrator = fixture.orchestrator(tool);
        let (tx, rx) = mpsc::channel();

        let result = orchestrator.run(&fixture.firmware, &[], &tx, &AtomicBool::new(false));

        assert!(matches!(result, Err(Error::NoPortsSelected)));
        assert_eq!(orchestrator.tool.calls.load(Ordering::SeqCst), 0);
        assert!(!fixture.registry_path().exists());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_missing_firmware_aborts_before_any_invocation() {
        let fixture = Fixture::new("fw.bin");
        let tool = StubTool::new(Vec::new());
        let mut orchestrator = fixture.orchestrator(tool);
        let (tx, _rx) = mpsc::channel();

        let result = orchestrator.run(
            &fixture.dir.path().join("missing.bin"),
            &ports(&["COM1"]),
            &tx,
            &AtomicBool::new(false),
        );

        assert!(matches!(result, Err(Error::FirmwareNotFound(_))));
        assert_eq!(orchestrator.tool.calls.load(Ordering::SeqCst), 0);
        assert!(!fixture.registry_path().exists());
    }

    #[test]
    fn test_mixed_success_and_failure() {
        let fixture = Fixture::new("fw.bin");
        let tool = StubTool::new(vec![
            FlashOutcome {
                success: true,
                mac: Some("AA:BB:CC:DD:EE:FF".into()),
                output: "Writing at 0x0...\nMAC: AA:BB:CC:DD:EE:FF\n".into(),
            },
            FlashOutcome {
                success: false,
                mac: None,
                output: "A fatal error occurred\n".into(),
            },
        ]);
        let mut orchestrator = fixture.orchestrator(tool);
        let (tx, _rx) = mpsc::channel();

        let summary = orchestrator
            .run(
                &fixture.firmware,
                &ports(&["COM1", "COM2"]),
                &tx,
                &AtomicBool::new(false),
            )
            .unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.total, 2);
        assert_eq!(summary.jobs[0].status, JobStatus::Succeeded);
        assert!(matches!(summary.jobs[1].status, JobStatus::Failed(_)));

        // One record, flashed once, on COM1 only.
        let registry = DeviceRegistry::load(fixture.registry_path());
        assert_eq!(registry.all().len(), 1);
        assert_eq!(registry.all()[0].flash_count, 1);
        assert_eq!(registry.all()[0].port_history, vec!["COM1"]);

        // One history line, for COM1 only.
        let history = fs::read_to_string(fixture.history_path()).unwrap();
        let lines: Vec<&str> = history.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("COM1"));
        assert!(lines[0].contains("AA:BB:CC:DD:EE:FF"));
        assert!(!history.contains("COM2"));
    }

    #[test]
    fn test_repeat_sessions_accumulate_flash_count() {
        let fixture = Fixture::new("fw.bin");

        for _ in 0..2 {
            let tool = StubTool::always_succeeding(1, "AA:BB:CC:DD:EE:FF");
            let mut orchestrator = fixture.orchestrator(tool);
            let (tx, _rx) = mpsc::channel();
            orchestrator
                .run(
                    &fixture.firmware,
                    &ports(&["COM1"]),
                    &tx,
                    &AtomicBool::new(false),
                )
                .unwrap();
        }

        let registry = DeviceRegistry::load(fixture.registry_path());
        assert_eq!(registry.all().len(), 1);
        assert_eq!(registry.all()[0].flash_count, 2);
        assert_eq!(registry.all()[0].port_history, vec!["COM1"]);
    }

    #[test]
    fn test_progress_is_exact() {
        for n in [1usize, 5, 20] {
            let fixture = Fixture::new("fw.bin");
            let tool = StubTool::always_succeeding(n, "AA:BB:CC:DD:EE:FF");
            let mut orchestrator = fixture.orchestrator(tool);
            let (tx, rx) = mpsc::channel();

            let port_names: Vec<String> = (0..n).map(|i| format!("COM{i}")).collect();
            orchestrator
                .run(&fixture.firmware, &port_names, &tx, &AtomicBool::new(false))
                .unwrap();
            drop(tx);

            let progress: Vec<f64> = rx
                .iter()
                .filter_map(|event| match event {
                    Event::Progress(fraction) => Some(fraction),
                    _ => None,
                })
                .collect();

            assert_eq!(progress.len(), n);
            for (k, fraction) in progress.iter().enumerate() {
                assert_eq!(*fraction, (k + 1) as f64 / n as f64);
            }
            assert_eq!(*progress.last().unwrap(), 1.0);
        }
    }

    #[test]
    fn test_streamed_lines_become_log_events() {
        let fixture = Fixture::new("fw.bin");
        let tool = StubTool::new(vec![FlashOutcome {
            success: true,
            mac: Some("AA:BB:CC:DD:EE:FF".into()),
            output: "line one\nline two\n".into(),
        }]);
        let mut orchestrator = fixture.orchestrator(tool);
        let (tx, rx) = mpsc::channel();

        orchestrator
            .run(
                &fixture.firmware,
                &ports(&["COM1"]),
                &tx,
                &AtomicBool::new(false),
            )
            .unwrap();
        drop(tx);

        let lines: Vec<String> = rx
            .iter()
            .filter_map(|event| match event {
                Event::LogLine(line) => Some(line),
                _ => None,
            })
            .collect();
        assert_eq!(lines, vec!["line one", "line two"]);
    }

    #[test]
    fn test_cancelled_session_skips_remaining_jobs() {
        let fixture = Fixture::new("fw.bin");
        let tool = StubTool::always_succeeding(2, "AA:BB:CC:DD:EE:FF");
        let mut orchestrator = fixture.orchestrator(tool);
        let (tx, _rx) = mpsc::channel();

        let cancel = AtomicBool::new(true);
        let summary = orchestrator
            .run(&fixture.firmware, &ports(&["COM1", "COM2"]), &tx, &cancel)
            .unwrap();

        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.total, 2);
        assert_eq!(orchestrator.tool.calls.load(Ordering::SeqCst), 0);
        assert!(summary
            .jobs
            .iter()
            .all(|job| matches!(job.status, JobStatus::Failed(_))));
    }
}
