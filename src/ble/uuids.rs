//! BLE Service and Characteristic UUIDs.
//!
//! Standard Bluetooth SIG assigned numbers used for heart-rate sensors.

use uuid::Uuid;

/// Standard Heart Rate Service UUID (0x180D).
pub const HEART_RATE_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_180d_0000_1000_8000_00805f9b34fb);
/// Heart Rate Measurement characteristic UUID (0x2A37, Notify).
pub const HEART_RATE_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x0000_2a37_0000_1000_8000_00805f9b34fb);
