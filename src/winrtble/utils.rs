// blecentral Source Code File
//
// Copyright 2023 the blecentral developers. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

use uuid::Uuid;
use windows::core::GUID;
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristicProperties, GattCommunicationStatus,
};

use crate::api::CharPropFlags;
use crate::{Error, Result};

pub fn winrt_error<E: std::fmt::Debug>(error: E) -> Error {
    Error::Other(format!("{:?}", error).into())
}

pub fn to_error(status: GattCommunicationStatus) -> Result<()> {
    match status {
        GattCommunicationStatus::Success => Ok(()),
        GattCommunicationStatus::AccessDenied => Err(Error::PermissionDenied),
        GattCommunicationStatus::Unreachable => Err(Error::NotConnected),
        GattCommunicationStatus::ProtocolError => {
            Err(Error::NotSupported("ProtocolError".to_string()))
        }
        GattCommunicationStatus(other) => {
            Err(Error::Other(format!("communication error: {}", other).into()))
        }
    }
}

pub fn to_uuid(guid: &GUID) -> Uuid {
    Uuid::from_u128(guid.to_u128())
}

pub fn to_guid(uuid: &Uuid) -> GUID {
    GUID::from_u128(uuid.as_u128())
}

/// The WinRT characteristic property bits match the GATT layout in the low
/// byte; the extended bits have no counterpart in [`CharPropFlags`].
pub fn to_char_props(properties: &GattCharacteristicProperties) -> CharPropFlags {
    CharPropFlags::from_bits_truncate(properties.0 as u8)
}
