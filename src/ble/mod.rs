//! BLE communication module.
//!
//! This module provides the Bluetooth Low Energy seam used by the device
//! session, a `btleplug` implementation of it and an in-process simulator.

pub mod platform;
pub mod simulated;
pub mod transport;
pub mod uuids;

pub use platform::{PlatformCentral, PlatformLink};
pub use simulated::{SimulatedCentral, SimulatedLink, SimulatedPeripheral};
pub use transport::{
    name_matches, DiscoveredDevice, HeartRateCentral, HeartRateLink, NotificationStream,
};
pub use uuids::*;
