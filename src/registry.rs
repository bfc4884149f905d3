//! Persisted device provenance registry
//!
//! Every device is identified by the MAC address it reports while being
//! flashed. The registry is a single JSON document holding one record per
//! known device; it is rewritten in full after every successful flash, which
//! is fine at the scale of a production bench (dozens to low hundreds of
//! devices).

use std::{
    fs,
    path::{Path, PathBuf},
};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Provenance record for one physical device
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceRecord {
    /// MAC address reported during flashing; `None` when extraction failed
    pub mac: Option<String>,
    /// When this device was first flashed
    pub first_seen: String,
    /// When this device was most recently flashed
    pub last_flashed: String,
    /// Number of successful flashes ever recorded for this device
    pub flash_count: u32,
    /// File name of the most recently written firmware image
    pub last_firmware: String,
    /// Every port this device has been flashed on, in order of first use
    pub port_history: Vec<String>,
}

/// The device registry, loaded in full and rewritten in full.
///
/// A single orchestration thread is the only writer, so no file locking is
/// needed.
#[derive(Debug)]
pub struct DeviceRegistry {
    path: PathBuf,
    records: Vec<DeviceRecord>,
}

impl DeviceRegistry {
    /// Load the registry from `path`. A missing or unreadable document yields
    /// an empty registry rather than an error: provenance tracking degrades
    /// gracefully instead of blocking flashing.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = match fs::read_to_string(&path) {
            Ok(data) => match serde_json::from_str(&data) {
                Ok(records) => records,
                Err(e) => {
                    warn!(
                        "Device registry '{}' is malformed ({e}); starting from an empty registry",
                        path.display()
                    );
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };

        Self { path, records }
    }

    /// Record one successful flash.
    ///
    /// When `mac` matches an existing record, that record is updated:
    /// `flash_count` is incremented, `last_flashed` and `last_firmware` are
    /// replaced, and `port` is appended to its port history if not already
    /// present. Otherwise a fresh record is created. A missing identifier
    /// never matches anything, including records that themselves have no
    /// identifier, so distinct unidentified devices are never merged into one
    /// record.
    ///
    /// The whole document is persisted before returning; the in-memory update
    /// is kept even when persistence fails, so the caller can surface the IO
    /// error as a warning and retry on the next flash.
    pub fn record_flash(
        &mut self,
        port: &str,
        mac: Option<&str>,
        firmware_name: &str,
        timestamp: &str,
    ) -> Result<(), Error> {
        let existing = mac.and_then(|mac| {
            self.records
                .iter_mut()
                .find(|record| record.mac.as_deref() == Some(mac))
        });

        match existing {
            Some(record) => {
                record.flash_count += 1;
                record.last_flashed = timestamp.to_string();
                record.last_firmware = firmware_name.to_string();
                if !record.port_history.iter().any(|p| p == port) {
                    record.port_history.push(port.to_string());
                }
            }
            None => self.records.push(DeviceRecord {
                mac: mac.map(str::to_string),
                first_seen: timestamp.to_string(),
                last_flashed: timestamp.to_string(),
                flash_count: 1,
                last_firmware: firmware_name.to_string(),
                port_history: vec![port.to_string()],
            }),
        }

        self.persist()
    }

    /// Find the record of the device most recently flashed on `port`.
    ///
    /// Ports get reused across devices over time, so several records can list
    /// the same port; the record updated last wins.
    pub fn find_by_port(&self, port: &str) -> Option<&DeviceRecord> {
        self.records
            .iter()
            .filter(|record| record.port_history.iter().any(|p| p == port))
            .max_by(|a, b| a.last_flashed.cmp(&b.last_flashed))
    }

    /// All known device records, in registry order
    pub fn all(&self) -> &[DeviceRecord] {
        &self.records
    }

    fn persist(&self) -> Result<(), Error> {
        let data = serde_json::to_string_pretty(&self.records)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, data)?;
        Ok(())
    }

    /// Location of the on-disk document
    pub fn path(&self) -> &Path {
        &self.path
    }
}
