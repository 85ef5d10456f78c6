// blecentral Source Code File
//
// Copyright 2023 the blecentral developers. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! The `api` module contains the platform-independent vocabulary of the
//! library: the adapter status enumeration, characteristic property flags,
//! write types, scan filters, the per-device callback bundle, and the
//! Bluetooth device address type.

pub(crate) mod bdaddr;
pub mod bleuuid;

use std::fmt::{self, Debug, Display, Formatter};

use bitflags::bitflags;
use uuid::Uuid;

pub use self::bdaddr::{BDAddr, ParseBDAddrError};

/// Power/availability state of the local Bluetooth adapter.
///
/// The numeric encoding is stable because the status is stored as an integer
/// property on the adapter record in the state tree.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum AdapterStatus {
    /// No usable adapter, or the backend failed to start.
    #[default]
    Disabled = 0,
    /// An adapter exists but its radio is off.
    PoweredOff = 1,
    /// The adapter is powered and ready for commands.
    PoweredOn = 2,
    /// The OS denied this process access to Bluetooth.
    Unauthorized = 3,
}

impl AdapterStatus {
    pub fn from_i64(value: i64) -> Option<AdapterStatus> {
        match value {
            0 => Some(AdapterStatus::Disabled),
            1 => Some(AdapterStatus::PoweredOff),
            2 => Some(AdapterStatus::PoweredOn),
            3 => Some(AdapterStatus::Unauthorized),
            _ => None,
        }
    }
}

impl Display for AdapterStatus {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let name = match self {
            AdapterStatus::Disabled => "Disabled",
            AdapterStatus::PoweredOff => "PoweredOff",
            AdapterStatus::PoweredOn => "PoweredOn",
            AdapterStatus::Unauthorized => "Unauthorized",
        };
        f.write_str(name)
    }
}

bitflags! {
    /// A set of properties that indicate what operations are supported by a
    /// characteristic. The bit layout matches the GATT characteristic
    /// properties field.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct CharPropFlags: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

/// The type of write operation to use.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteType {
    /// A write operation where the device is expected to respond with a
    /// confirmation or error. Also known as a request.
    WithResponse,
    /// A write-without-response, also known as a command.
    WithoutResponse,
}

/// The filter used when scanning for BLE devices.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ScanFilter {
    /// If the filter contains at least one service UUID, only devices
    /// advertising at least one of the given services will be reported.
    pub services: Vec<Uuid>,
}

impl ScanFilter {
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Callback invoked with each incoming notification or indication payload.
/// The byte slice is only valid for the duration of the call.
pub type ValueChangedHandler = Box<dyn FnMut(Uuid, &[u8]) + Send>;

/// Callback invoked when a queued write completes, with `true` on success.
pub type CharacteristicWrittenHandler = Box<dyn FnMut(Uuid, bool) + Send>;

/// The callback bundle registered for a device when connecting to it.
///
/// Both callbacks are invoked on the dispatcher task, in the order the
/// corresponding events arrived from the OS; they should not block.
pub struct DeviceCallbacks {
    pub value_changed: ValueChangedHandler,
    pub characteristic_written: CharacteristicWrittenHandler,
}

impl DeviceCallbacks {
    pub fn new(
        value_changed: impl FnMut(Uuid, &[u8]) + Send + 'static,
        characteristic_written: impl FnMut(Uuid, bool) + Send + 'static,
    ) -> Self {
        DeviceCallbacks {
            value_changed: Box::new(value_changed),
            characteristic_written: Box::new(characteristic_written),
        }
    }
}

impl Default for DeviceCallbacks {
    fn default() -> Self {
        DeviceCallbacks::new(|_, _| {}, |_, _| {})
    }
}

impl Debug for DeviceCallbacks {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str("DeviceCallbacks")
    }
}

/// Events emitted on the adapter's broadcast channel, for hosts that prefer
/// an async stream over tree listeners. Devices are identified by the same
/// address string stored on their tree record.
#[derive(Clone, Debug)]
pub enum CentralEvent {
    AdapterStatusChanged(AdapterStatus),
    DeviceDiscovered(String),
    DeviceUpdated(String),
    DeviceConnected(String),
    DeviceDisconnected(String),
    ServicesDiscovered(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_status_encoding_is_stable() {
        for status in [
            AdapterStatus::Disabled,
            AdapterStatus::PoweredOff,
            AdapterStatus::PoweredOn,
            AdapterStatus::Unauthorized,
        ] {
            assert_eq!(AdapterStatus::from_i64(status as i64), Some(status));
        }
        assert_eq!(AdapterStatus::from_i64(4), None);
        assert_eq!(AdapterStatus::Disabled as i64, 0);
        assert_eq!(AdapterStatus::Unauthorized as i64, 3);
    }
}
