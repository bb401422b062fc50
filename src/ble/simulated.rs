//! In-process BLE simulator.
//!
//! Provides named heart-rate peripherals that can be discovered, connected,
//! fed notification payloads and made to drop their link, entirely
//! in-process. Used for integration testing without real BLE hardware.

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use crate::ble::transport::{
    name_matches, DiscoveredDevice, HeartRateCentral, HeartRateLink, NotificationStream,
};
use crate::ble::uuids::HEART_RATE_MEASUREMENT_UUID;
use crate::error::{Error, Result};

/// Mutable link-layer state of one simulated peripheral.
#[derive(Default)]
struct LinkState {
    advertising: bool,
    connected: bool,
    /// Bumped on every successful connect so stale links can tell they are stale.
    generation: u64,
    notify_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    pending_connect_failures: u32,
    connect_count: u32,
}

struct PeripheralInner {
    identifier: String,
    name: String,
    state: Mutex<LinkState>,
    /// Count of notification subscriptions made so far.
    subscriptions: watch::Sender<u32>,
}

/// Handle to a simulated heart-rate strap.
///
/// Cloning the handle shares the same peripheral.
#[derive(Clone)]
pub struct SimulatedPeripheral {
    inner: Arc<PeripheralInner>,
}

impl SimulatedPeripheral {
    fn new(identifier: String, name: String) -> Self {
        let (subscriptions, _) = watch::channel(0);
        Self {
            inner: Arc::new(PeripheralInner {
                identifier,
                name,
                state: Mutex::new(LinkState {
                    advertising: true,
                    ..LinkState::default()
                }),
                subscriptions,
            }),
        }
    }

    /// Get the advertised name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Get the identifier used for connecting.
    pub fn identifier(&self) -> &str {
        &self.inner.identifier
    }

    /// Push a notification payload to the current subscriber.
    ///
    /// Returns `false` if nobody is subscribed.
    pub fn notify(&self, data: impl Into<Vec<u8>>) -> bool {
        let state = self.inner.state.lock();
        match &state.notify_tx {
            Some(tx) if state.connected => tx.unbounded_send(data.into()).is_ok(),
            _ => false,
        }
    }

    /// Drop the link: the notification stream ends and `is_connected` turns false.
    pub fn drop_link(&self) {
        let mut state = self.inner.state.lock();
        state.connected = false;
        state.notify_tx = None;
    }

    /// Report the link as down without ending the notification stream.
    ///
    /// Only a liveness check can notice this kind of loss.
    pub fn lose_link_silently(&self) {
        self.inner.state.lock().connected = false;
    }

    /// Start or stop advertising. Non-advertising peripherals are not discovered.
    pub fn set_advertising(&self, advertising: bool) {
        self.inner.state.lock().advertising = advertising;
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.inner.state.lock().pending_connect_failures = count;
    }

    /// Number of successful connections so far.
    pub fn connection_count(&self) -> u32 {
        self.inner.state.lock().connect_count
    }

    /// Whether a live link currently has notifications enabled.
    pub fn is_subscribed(&self) -> bool {
        let state = self.inner.state.lock();
        state.connected && state.notify_tx.is_some()
    }

    /// Wait until at least `count` subscriptions have been made in total.
    pub async fn wait_for_subscriptions(&self, count: u32) {
        let mut rx = self.inner.subscriptions.subscribe();
        let _ = rx.wait_for(|n| *n >= count).await;
    }
}

/// A simulated BLE central that sees every peripheral added to it.
#[derive(Default)]
pub struct SimulatedCentral {
    peripherals: RwLock<Vec<SimulatedPeripheral>>,
    scanning: AtomicBool,
}

impl SimulatedCentral {
    /// Create an empty simulated central.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an advertising peripheral with the given name.
    pub fn add_peripheral(&self, name: &str) -> SimulatedPeripheral {
        let mut peripherals = self.peripherals.write();
        let identifier = format!("SIM:{:02X}", peripherals.len());
        let peripheral = SimulatedPeripheral::new(identifier, name.to_string());
        peripherals.push(peripheral.clone());
        peripheral
    }

    /// Whether a discovery window is open and has not been stopped.
    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    fn find_advertising(&self, name_filter: &str) -> Option<DiscoveredDevice> {
        self.peripherals
            .read()
            .iter()
            .filter(|p| p.inner.state.lock().advertising)
            .find(|p| name_matches(p.name(), name_filter))
            .map(|p| DiscoveredDevice {
                identifier: p.identifier().to_string(),
                name: p.name().to_string(),
                rssi: Some(-55),
            })
    }
}

#[async_trait]
impl HeartRateCentral for SimulatedCentral {
    async fn discover(
        &self,
        name_filter: &str,
        timeout: Duration,
    ) -> Result<Option<DiscoveredDevice>> {
        if let Some(device) = self.find_advertising(name_filter) {
            return Ok(Some(device));
        }
        self.scanning.store(true, Ordering::SeqCst);
        tokio::time::sleep(timeout).await;
        self.scanning.store(false, Ordering::SeqCst);
        Ok(self.find_advertising(name_filter))
    }

    async fn stop_discovery(&self) -> Result<()> {
        self.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(&self, device: &DiscoveredDevice) -> Result<Box<dyn HeartRateLink>> {
        let peripheral = self
            .peripherals
            .read()
            .iter()
            .find(|p| p.identifier() == device.identifier)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound {
                identifier: device.identifier.clone(),
            })?;

        let generation = {
            let mut state = peripheral.inner.state.lock();
            if state.pending_connect_failures > 0 {
                state.pending_connect_failures -= 1;
                return Err(Error::ConnectionFailed {
                    reason: "simulated connection failure".to_string(),
                });
            }
            state.connected = true;
            state.generation += 1;
            state.connect_count += 1;
            state.generation
        };

        Ok(Box::new(SimulatedLink {
            peripheral,
            generation,
        }))
    }
}

/// Connection to a [`SimulatedPeripheral`].
pub struct SimulatedLink {
    peripheral: SimulatedPeripheral,
    generation: u64,
}

impl SimulatedLink {
    fn is_current(&self, state: &LinkState) -> bool {
        state.connected && state.generation == self.generation
    }
}

#[async_trait]
impl HeartRateLink for SimulatedLink {
    async fn subscribe_notifications(&self, characteristic: Uuid) -> Result<NotificationStream> {
        if characteristic != HEART_RATE_MEASUREMENT_UUID {
            return Err(Error::CharacteristicNotFound {
                uuid: characteristic.to_string(),
            });
        }

        let rx = {
            let mut state = self.peripheral.inner.state.lock();
            if !self.is_current(&state) {
                return Err(Error::NotConnected);
            }
            let (tx, rx) = mpsc::unbounded();
            state.notify_tx = Some(tx);
            rx
        };

        self.peripheral.inner.subscriptions.send_modify(|n| *n += 1);

        Ok(rx.boxed())
    }

    async fn unsubscribe(&self, _characteristic: Uuid) -> Result<()> {
        let mut state = self.peripheral.inner.state.lock();
        if state.generation == self.generation {
            state.notify_tx = None;
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.is_current(&self.peripheral.inner.state.lock())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.peripheral.inner.state.lock();
        if state.generation == self.generation {
            state.connected = false;
            state.notify_tx = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_discover_matches_name() {
        let central = SimulatedCentral::new();
        central.add_peripheral("Polar H10");
        let strap = central.add_peripheral("XYZ-H6M-1234");

        let device = central
            .discover("h6m", Duration::from_millis(10))
            .await
            .unwrap()
            .expect("device should be found");

        assert_eq!(device.name, "XYZ-H6M-1234");
        assert_eq!(device.identifier, strap.identifier());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_miss_waits_for_timeout() {
        let central = SimulatedCentral::new();
        let strap = central.add_peripheral("XYZ-H6M-1234");
        strap.set_advertising(false);

        let start = tokio::time::Instant::now();
        let device = central
            .discover("h6m", Duration::from_secs(5))
            .await
            .unwrap();

        assert!(device.is_none());
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(!central.is_scanning());
    }

    #[tokio::test]
    async fn test_notifications_flow_until_link_drops() {
        let central = SimulatedCentral::new();
        let strap = central.add_peripheral("XYZ-H6M-1234");
        let device = central
            .discover("H6M", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        let link = central.connect(&device).await.unwrap();
        let mut stream = link
            .subscribe_notifications(HEART_RATE_MEASUREMENT_UUID)
            .await
            .unwrap();

        assert!(strap.notify(vec![0x00, 0x4B]));
        assert_eq!(stream.next().await, Some(vec![0x00, 0x4B]));

        strap.drop_link();
        assert!(!strap.notify(vec![0x00, 0x4C]));
        assert_eq!(stream.next().await, None);
        assert!(!link.is_connected().await);
    }

    #[tokio::test]
    async fn test_connect_failures_then_success() {
        let central = SimulatedCentral::new();
        let strap = central.add_peripheral("XYZ-H6M-1234");
        strap.fail_next_connects(1);
        let device = central
            .discover("H6M", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(
            central.connect(&device).await,
            Err(Error::ConnectionFailed { .. })
        ));
        assert!(central.connect(&device).await.is_ok());
        assert_eq!(strap.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_link_reports_disconnected() {
        let central = SimulatedCentral::new();
        central.add_peripheral("XYZ-H6M-1234");
        let device = central
            .discover("H6M", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        let first = central.connect(&device).await.unwrap();
        let second = central.connect(&device).await.unwrap();

        assert!(!first.is_connected().await);
        assert!(second.is_connected().await);
    }
}
