//! Utilities for dealing with BLE UUIDs, converting to and from their short
//! formats.

use uuid::Uuid;

const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;
const BLUETOOTH_BASE_MASK: u128 = 0x00000000_ffff_ffff_ffff_ffffffffffff;

/// Convert a 32-bit BLE short UUID to a full 128-bit UUID by filling in the
/// standard Bluetooth Base UUID.
pub const fn uuid_from_u32(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Convert a 16-bit BLE short UUID to a full 128-bit UUID by filling in the
/// standard Bluetooth Base UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    uuid_from_u32(short as u32)
}

/// If the UUID is a valid BLE short UUID then return its 32-bit short form.
pub fn to_ble_u32(uuid: &Uuid) -> Option<u32> {
    let value = uuid.as_u128();
    if value & BLUETOOTH_BASE_MASK == BLUETOOTH_BASE_UUID {
        Some((value >> 96) as u32)
    } else {
        None
    }
}
