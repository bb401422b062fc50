// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # heartrate-bridge
//!
//! Connects to a Bluetooth Low Energy heart-rate strap and fans every
//! measurement out to a set of outputs:
//!
//! - a single-record text file holding `"<bpm> bpm"` (for streaming overlays)
//! - a per-run CSV log of `timestamp,bpm` rows
//! - any number of TCP subscribers receiving `"<bpm>\n"` once per second
//! - stdout
//!
//! The device session keeps the strap connected: every discovery miss,
//! connection failure or link loss leads to a short backoff and a fresh scan.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use heartrate_bridge::{Monitor, MonitorConfig, PlatformCentral, Result};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let central = PlatformCentral::new().await?;
//!     let config = MonitorConfig {
//!         enable_file: true,
//!         enable_broadcast: true,
//!         ..MonitorConfig::default()
//!     };
//!
//!     let monitor = Monitor::new(config, Arc::new(central));
//!     let shutdown = CancellationToken::new();
//!
//!     let signal = shutdown.clone();
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         signal.cancel();
//!     });
//!
//!     monitor.run(shutdown).await
//! }
//! ```
//!
//! ## Testing without hardware
//!
//! [`SimulatedCentral`] provides in-process peripherals that can be fed
//! notification payloads and made to drop their link.
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission for the terminal or bundled app.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization of [`HeartRateSample`]

pub mod ble;
pub mod config;
pub mod data;
pub mod dispatch;
pub mod error;
pub mod monitor;
pub mod protocol;
pub mod session;
pub mod sink;

pub use ble::{
    DiscoveredDevice, HeartRateCentral, HeartRateLink, PlatformCentral, SimulatedCentral,
    SimulatedPeripheral, HEART_RATE_MEASUREMENT_UUID, HEART_RATE_SERVICE_UUID,
};
pub use config::MonitorConfig;
pub use data::HeartRateSample;
pub use dispatch::{LatestSample, SampleDispatcher};
pub use error::{Error, Result};
pub use monitor::Monitor;
pub use protocol::{decode, DecodeError, ValueFormat};
pub use session::{DeviceSession, SessionConfig, SessionState};
pub use sink::{
    BroadcastServer, ConsoleSink, FileSink, LogSink, Sink, SinkHandle, SubscriberRegistry,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        let _ = std::any::TypeId::of::<Monitor>();
        let _ = std::any::TypeId::of::<DeviceSession>();
        let _ = std::any::TypeId::of::<Error>();
        let _ = std::any::TypeId::of::<HeartRateSample>();
        let _ = std::any::TypeId::of::<SubscriberRegistry>();
        let _ = std::any::TypeId::of::<SimulatedCentral>();
    }

    #[test]
    fn test_decode_reexport() {
        assert_eq!(decode(&[0x00, 0x46]), Ok(70));
    }
}
