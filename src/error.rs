//! Error types for the heartrate-bridge crate.

use std::net::SocketAddr;

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// The device handed to `connect` is not known to the central.
    #[error("Device not found: {identifier}")]
    DeviceNotFound {
        /// The identifier that was looked up.
        identifier: String,
    },

    /// Operation requires a connection but the sensor is not connected.
    #[error("Sensor not connected")]
    NotConnected,

    /// Failed to establish a connection to the sensor.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// The connection to the sensor was lost.
    #[error("Connection lost")]
    ConnectionLost,

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// File or socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The broadcast listener could not be bound.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// The address that was requested.
        addr: SocketAddr,
        /// The underlying socket error.
        source: std::io::Error,
    },

    /// `run` was called on a session whose loop is already active.
    #[error("Device session is already running")]
    AlreadyRunning,

    /// The monitor has already been shut down and cannot be started again.
    #[error("Monitor has been shut down")]
    ShutDown,
}

impl Error {
    /// Whether the session should treat this error as a lost link rather than a failed attempt.
    pub fn is_link_loss(&self) -> bool {
        matches!(self, Self::ConnectionLost | Self::NotConnected)
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(Error::ShutDown.to_string(), "Monitor has been shut down");
        assert_eq!(
            Error::CharacteristicNotFound {
                uuid: "2a37".to_string()
            }
            .to_string(),
            "Characteristic not found: 2a37"
        );
    }

    #[test]
    fn test_link_loss_classification() {
        assert!(Error::ConnectionLost.is_link_loss());
        assert!(Error::NotConnected.is_link_loss());
        assert!(!Error::ConnectionFailed {
            reason: "timeout".to_string()
        }
        .is_link_loss());
    }
}
