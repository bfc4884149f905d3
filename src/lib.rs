//! Batch production flasher for Espressif devices.
//!
//! Writes one firmware image to many serial-attached boards, one port at a
//! time, by driving an external flashing tool as a subprocess, and keeps a
//! persisted provenance registry keyed by the MAC address each device
//! reports while being flashed.

pub mod cli;
pub mod config;
pub mod error;
pub mod esptool;
pub mod history;
pub mod logging;
pub mod ports;
pub mod registry;
pub mod session;

pub use config::Config;
pub use error::Error;
pub use registry::{DeviceRecord, DeviceRegistry};
pub use session::{Event, FlashOrchestrator, SessionSummary};
