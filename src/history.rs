//! Append-only flash history log
//!
//! One line per successful flash: `timestamp,port,mac,firmware`. The log is
//! never rewritten, so it survives registry corruption and doubles as an
//! audit trail for the production bench.

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use crate::error::Error;

#[derive(Debug)]
pub struct HistoryLog {
    path: PathBuf,
}

impl HistoryLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Append one flash entry, creating the log (and its parent directory) on
    /// first use. A missing identifier is written as `unknown`.
    pub fn append(
        &self,
        timestamp: &str,
        port: &str,
        mac: Option<&str>,
        firmware: &Path,
    ) -> Result<(), Error> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(
            file,
            "{timestamp},{port},{},{}",
            mac.unwrap_or("unknown"),
            firmware.display()
        )?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_appends_one_line_per_flash() {
        let dir = tempfile::tempdir().unwrap();
        let log = HistoryLog::new(dir.path().join("flash_log.txt"));

        log.append(
            "2024-05-01 10:00:00",
            "COM1",
            Some("AA:BB:CC:DD:EE:FF"),
            Path::new("fw.bin"),
        )
        .unwrap();
        log.append("2024-05-01 10:01:00", "COM2", None, Path::new("fw.bin"))
            .unwrap();

        let contents = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(
            lines,
            vec![
                "2024-05-01 10:00:00,COM1,AA:BB:CC:DD:EE:FF,fw.bin",
                "2024-05-01 10:01:00,COM2,unknown,fw.bin",
            ]
        );
    }
}
