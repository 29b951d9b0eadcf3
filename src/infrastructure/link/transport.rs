//! GATT transport seam.
//!
//! The operating-system BLE stack lives behind this trait. Every method is a
//! non-blocking request; whatever the stack reports back arrives later as a
//! [`GattEvent`] on the control loop. Events are assumed to arrive in the
//! order the stack emitted them - the state machine relies on that ordering
//! and does not re-check it.

use crate::domain::models::ScannedDevice;
use anyhow::Result;

/// GATT status convention: zero is success, anything else is the stack's
/// error number, surfaced verbatim in diagnostics.
pub const GATT_SUCCESS: i32 = 0;

pub trait GattTransport {
    /// Start advertising-based discovery, filtered to the given service.
    fn start_scan(&mut self, service_uuid: u128) -> Result<()>;

    fn stop_scan(&mut self);

    /// Open a connection to the device at `address`. Completion arrives as
    /// [`GattEvent::Connected`] or [`GattEvent::ConnectionError`].
    fn connect(&mut self, address: u64) -> Result<()>;

    /// Ask for high-priority connection parameters.
    fn request_high_priority(&mut self) -> Result<()>;

    /// Kick off service discovery; the result arrives as
    /// [`GattEvent::ServicesDiscovered`].
    fn discover_services(&mut self) -> Result<()>;

    /// Register for value-change notifications on a characteristic.
    fn subscribe(&mut self, char_uuid: u128) -> Result<()>;

    /// Write a descriptor; acknowledged by [`GattEvent::DescriptorWritten`].
    fn write_descriptor(
        &mut self,
        char_uuid: u128,
        descriptor_uuid: u128,
        value: &[u8],
    ) -> Result<()>;

    /// Fire-and-forget characteristic write. There is no acknowledgement at
    /// the attribute level; the only completion signal is
    /// [`GattEvent::WriteCompleted`].
    fn write_command(&mut self, char_uuid: u128, payload: &[u8]) -> Result<()>;

    /// Request a signal-strength reading; the result arrives as
    /// [`GattEvent::RssiRead`].
    fn read_rssi(&mut self) -> Result<()>;

    /// Release the connection. Safe to call repeatedly.
    fn close(&mut self);
}

/// Asynchronous reports from the BLE stack.
#[derive(Debug, Clone)]
pub enum GattEvent {
    DeviceFound(ScannedDevice),
    Connected,
    /// The connection ended cleanly from the stack's point of view.
    Disconnected,
    /// The connection failed or dropped with an error status.
    ConnectionError { status: i32 },
    ServicesDiscovered {
        status: i32,
        inventory: GattInventory,
    },
    DescriptorWritten { status: i32 },
    WriteCompleted { status: i32 },
    /// A value-change notification on the subscribed characteristic.
    Notification { payload: Vec<u8> },
    RssiRead { status: i32, rssi: i16 },
}

/// Snapshot of the peer's GATT table, taken at discovery time.
#[derive(Debug, Clone, Default)]
pub struct GattInventory {
    pub services: Vec<GattServiceInfo>,
}

impl GattInventory {
    pub fn service(&self, uuid: u128) -> Option<&GattServiceInfo> {
        self.services.iter().find(|s| s.uuid == uuid)
    }
}

#[derive(Debug, Clone)]
pub struct GattServiceInfo {
    pub uuid: u128,
    pub characteristics: Vec<GattCharacteristicInfo>,
}

impl GattServiceInfo {
    pub fn characteristic(&self, uuid: u128) -> Option<&GattCharacteristicInfo> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

#[derive(Debug, Clone)]
pub struct GattCharacteristicInfo {
    pub uuid: u128,
    /// The characteristic accepts writes without attribute-level
    /// acknowledgement.
    pub write_without_response: bool,
    pub supports_notify: bool,
    pub descriptors: Vec<u128>,
}

impl GattCharacteristicInfo {
    pub fn has_descriptor(&self, uuid: u128) -> bool {
        self.descriptors.contains(&uuid)
    }
}
