//! Error types for the Pavlok service.
//!
//! Only the transport layer and the daemon plumbing return these errors.
//! Everything above `TransportSession` folds them into `bool`/`Option`
//! results and reports the cause through the log.

use bluer::Address;
use thiserror::Error;
use uuid::Uuid;

/// Main error type for the Pavlok service.
#[derive(Error, Debug)]
pub enum PavlokError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Device not found: {0}")]
   DeviceNotFound(Address),

   #[error("Device not connected")]
   DeviceNotConnected,

   #[error("Link reported disconnected after settle delay")]
   LinkNotReady,

   #[error("Characteristic not found: {0}")]
   CharacteristicNotFound(Uuid),

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Invalid device address: {0:?}")]
   InvalidAddress(String),

   #[error("Shutdown requested")]
   ShutdownRequested,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Device context is not running")]
   ContextUnavailable,
}

/// Convenience type alias for Results with `PavlokError`.
pub type Result<T> = std::result::Result<T, PavlokError>;
