//! Library and application errors

use std::{io, path::PathBuf};

use miette::Diagnostic;
use thiserror::Error;

/// All session-fatal errors returned by espbatch.
///
/// Per-device flash failures are deliberately absent here: a single device
/// failing never aborts a batch, so those travel as
/// [`JobStatus::Failed`](crate::session::JobStatus) on the job instead.
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("No ports selected")]
    #[diagnostic(
        code(espbatch::no_ports_selected),
        help("Pass one or more `--port` arguments, or use `--all` to flash every detected port")
    )]
    NoPortsSelected,

    #[error("Firmware image '{}' does not exist", .0.display())]
    #[diagnostic(
        code(espbatch::firmware_not_found),
        help("Check the path to the firmware binary; it must be a readable file")
    )]
    FirmwareNotFound(PathBuf),

    #[error("No serial ports could be detected")]
    #[diagnostic(
        code(espbatch::no_serial),
        help("Make sure at least one device is connected to the host system")
    )]
    NoSerial,

    #[error("Failed to enumerate serial ports")]
    #[diagnostic(code(espbatch::serial_port_enumeration))]
    SerialPortEnumeration(#[from] serialport::Error),

    #[error("Failed to parse configuration file '{}'", path.display())]
    #[diagnostic(
        code(espbatch::invalid_config),
        help("Fix or delete the configuration file and try again")
    )]
    InvalidConfig {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error(transparent)]
    #[diagnostic(code(espbatch::io_error))]
    IoError(#[from] io::Error),

    #[error("Failed to serialize the device registry")]
    #[diagnostic(code(espbatch::registry_serialize))]
    RegistrySerialize(#[from] serde_json::Error),
}
