//! `btleplug` implementation of the BLE transport traits.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::transport::{
    name_matches, DiscoveredDevice, HeartRateCentral, HeartRateLink, NotificationStream,
};
use crate::ble::uuids::HEART_RATE_SERVICE_UUID;
use crate::error::{Error, Result};

/// BLE central backed by the first system Bluetooth adapter.
pub struct PlatformCentral {
    /// The BLE adapter used for scanning and connecting.
    adapter: Adapter,
    /// Peripherals returned by discovery, keyed by identifier.
    discovered: Arc<RwLock<HashMap<String, Peripheral>>>,
}

impl PlatformCentral {
    /// Open the first available Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Create a central with a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            discovered: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Check a peripheral's advertised name against the filter and remember it on a match.
    async fn check_peripheral(
        &self,
        peripheral: &Peripheral,
        name_filter: &str,
    ) -> Option<DiscoveredDevice> {
        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return None,
        };

        let identifier = peripheral.id().to_string();
        let name = properties.local_name?;

        debug!(
            "Device seen: {} ({}) rssi={:?}",
            name, identifier, properties.rssi
        );

        if !name_matches(&name, name_filter) {
            return None;
        }

        self.discovered
            .write()
            .insert(identifier.clone(), peripheral.clone());

        Some(DiscoveredDevice {
            identifier,
            name,
            rssi: properties.rssi,
        })
    }

    async fn scan_for(
        &self,
        name_filter: &str,
        timeout: Duration,
    ) -> Result<Option<DiscoveredDevice>> {
        let mut events = self.adapter.events().await.map_err(Error::Bluetooth)?;

        // Peripherals the adapter already knows about from earlier scans.
        for peripheral in self.adapter.peripherals().await.map_err(Error::Bluetooth)? {
            if let Some(device) = self.check_peripheral(&peripheral, name_filter).await {
                return Ok(Some(device));
            }
        }

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => return Ok(None),
                event = events.next() => match event {
                    Some(CentralEvent::DeviceDiscovered(id))
                    | Some(CentralEvent::DeviceUpdated(id)) => {
                        trace!("Device discovered/updated: {:?}", id);
                        let Ok(peripheral) = self.adapter.peripheral(&id).await else {
                            continue;
                        };
                        let matched = self.check_peripheral(&peripheral, name_filter).await;
                        if let Some(device) = matched {
                            return Ok(Some(device));
                        }
                    }
                    Some(_) => {}
                    None => {
                        debug!("Adapter event stream ended");
                        return Ok(None);
                    }
                },
            }
        }
    }
}

#[async_trait]
impl HeartRateCentral for PlatformCentral {
    async fn discover(
        &self,
        name_filter: &str,
        timeout: Duration,
    ) -> Result<Option<DiscoveredDevice>> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(Error::Bluetooth)?;

        let result = self.scan_for(name_filter, timeout).await;

        if let Err(e) = self.adapter.stop_scan().await {
            debug!("Failed to stop scan: {}", e);
        }

        result
    }

    async fn stop_discovery(&self) -> Result<()> {
        self.adapter.stop_scan().await.map_err(Error::Bluetooth)
    }

    async fn connect(&self, device: &DiscoveredDevice) -> Result<Box<dyn HeartRateLink>> {
        let peripheral = self
            .discovered
            .read()
            .get(&device.identifier)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound {
                identifier: device.identifier.clone(),
            })?;

        peripheral
            .connect()
            .await
            .map_err(|e| Error::ConnectionFailed {
                reason: e.to_string(),
            })?;

        if let Err(e) = peripheral.discover_services().await {
            warn!("Failed to discover services: {}", e);
        }

        if !peripheral
            .services()
            .iter()
            .any(|s| s.uuid == HEART_RATE_SERVICE_UUID)
        {
            warn!("{} does not expose the Heart Rate service", device);
        }

        Ok(Box::new(PlatformLink::new(peripheral)))
    }
}

/// A live `btleplug` connection.
pub struct PlatformLink {
    peripheral: Peripheral,
}

impl PlatformLink {
    /// Wrap a connected peripheral.
    pub fn new(peripheral: Peripheral) -> Self {
        Self { peripheral }
    }

    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| {
                for c in self.peripheral.characteristics() {
                    debug!("  Available characteristic: {}", c.uuid);
                }
                Error::CharacteristicNotFound {
                    uuid: uuid.to_string(),
                }
            })
    }
}

#[async_trait]
impl HeartRateLink for PlatformLink {
    async fn subscribe_notifications(&self, characteristic: Uuid) -> Result<NotificationStream> {
        let c = self.characteristic(characteristic)?;

        // Take the stream before enabling notifications so the first frame is not missed.
        let notifications = self
            .peripheral
            .notifications()
            .await
            .map_err(Error::Bluetooth)?;

        self.peripheral
            .subscribe(&c)
            .await
            .map_err(Error::Bluetooth)?;

        debug!("Subscribed to notifications from {}", characteristic);

        Ok(notifications
            .filter_map(move |n| async move { (n.uuid == characteristic).then_some(n.value) })
            .boxed())
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<()> {
        let c = self.characteristic(characteristic)?;
        self.peripheral
            .unsubscribe(&c)
            .await
            .map_err(Error::Bluetooth)?;
        debug!("Unsubscribed from notifications from {}", characteristic);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await.map_err(Error::Bluetooth)
    }
}
