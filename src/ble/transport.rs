//! BLE transport traits.
//!
//! The device session only talks to the BLE stack through these two traits,
//! so the same session logic runs against `btleplug` and against the
//! in-process simulator.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;

/// Stream of raw notification payloads from one characteristic.
///
/// The stream ends when the stack reports the link as gone.
pub type NotificationStream = BoxStream<'static, Vec<u8>>;

/// A device reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Stack-specific identifier used to connect.
    pub identifier: String,
    /// Advertised local name.
    pub name: String,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
}

impl std::fmt::Display for DiscoveredDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.identifier)
    }
}

/// Case-insensitive substring match of an advertised name against a filter.
pub fn name_matches(name: &str, filter: &str) -> bool {
    name.to_lowercase().contains(&filter.to_lowercase())
}

/// BLE central role: discovery and connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HeartRateCentral: Send + Sync {
    /// Scan for up to `timeout` and return the first device whose name matches `name_filter`.
    ///
    /// `Ok(None)` means the discovery window elapsed without a match.
    async fn discover(&self, name_filter: &str, timeout: Duration)
        -> Result<Option<DiscoveredDevice>>;

    /// Stop a scan left running by a `discover` call that was dropped before it finished.
    async fn stop_discovery(&self) -> Result<()> {
        Ok(())
    }

    /// Connect to a previously discovered device.
    async fn connect(&self, device: &DiscoveredDevice) -> Result<Box<dyn HeartRateLink>>;
}

/// An established connection to a heart-rate sensor.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HeartRateLink: Send + Sync {
    /// Enable notifications on `characteristic` and return the payload stream.
    async fn subscribe_notifications(&self, characteristic: Uuid) -> Result<NotificationStream>;

    /// Disable notifications on `characteristic`.
    async fn unsubscribe(&self, characteristic: Uuid) -> Result<()>;

    /// Ask the stack whether the link is still up.
    async fn is_connected(&self) -> bool;

    /// Tear down the connection.
    async fn disconnect(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_matches_case_insensitive() {
        assert!(name_matches("XYZ-H6M-1234", "h6m"));
        assert!(name_matches("xyz-h6m-1234", "H6M"));
        assert!(!name_matches("Polar H10", "H6M"));
        assert!(name_matches("anything", ""));
    }

    #[test]
    fn test_discovered_device_display() {
        let device = DiscoveredDevice {
            identifier: "AA:BB".to_string(),
            name: "XYZ-H6M-1234".to_string(),
            rssi: Some(-60),
        };
        assert_eq!(device.to_string(), "XYZ-H6M-1234 (AA:BB)");
    }
}
