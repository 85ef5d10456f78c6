// blecentral Source Code File
//
// Copyright 2023 the blecentral developers. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! The Objective-C delegate receiving Core Bluetooth callbacks.
//!
//! One object implements both `CBCentralManagerDelegate` and
//! `CBPeripheralDelegate`; every callback is reduced to a [`DelegateEvent`]
//! and pushed into the internal loop's channel. No Core Bluetooth state is
//! touched from the delegate itself.

use objc2::rc::Retained;
use objc2::runtime::AnyObject;
use objc2::{declare_class, msg_send_id, mutability, ClassType, DeclaredClass, Message as _};
use objc2_core_bluetooth::{
    CBAdvertisementDataLocalNameKey, CBAdvertisementDataServiceUUIDsKey, CBCentralManager,
    CBCentralManagerDelegate, CBCharacteristic, CBManagerState, CBPeripheral,
    CBPeripheralDelegate, CBService, CBUUID,
};
use objc2_foundation::{
    NSArray, NSDictionary, NSError, NSNumber, NSObject, NSObjectProtocol, NSString,
};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::api::bleuuid::{uuid_from_u16, uuid_from_u32};

/// A `CBPeripheral` crossing from the delegate queue to the internal
/// thread. Core Bluetooth objects tolerate being messaged from the thread
/// that ends up owning them; only the internal loop ever does.
pub struct PeripheralHandle(pub Retained<CBPeripheral>);

unsafe impl Send for PeripheralHandle {}

pub enum DelegateEvent {
    DidUpdateState(CBManagerState),
    DidDiscoverPeripheral {
        peripheral: PeripheralHandle,
        id: String,
        name: Option<String>,
        rssi: Option<i16>,
        services: Vec<Uuid>,
    },
    DidConnect {
        id: String,
    },
    DidFailToConnect {
        id: String,
    },
    DidDisconnect {
        id: String,
    },
    DidDiscoverServices {
        id: String,
        ok: bool,
    },
    DidDiscoverCharacteristics {
        id: String,
        service: Uuid,
        ok: bool,
    },
    DidUpdateValue {
        id: String,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    DidUpdateNotificationState {
        id: String,
        characteristic: Uuid,
        enabled: bool,
    },
    DidWriteValue {
        id: String,
        characteristic: Uuid,
        ok: bool,
    },
}

pub struct Ivars {
    sender: mpsc::UnboundedSender<DelegateEvent>,
}

declare_class!(
    pub struct CentralDelegate;

    unsafe impl ClassType for CentralDelegate {
        type Super = NSObject;
        type Mutability = mutability::InteriorMutable;
        const NAME: &'static str = "BlecentralCentralDelegate";
    }

    impl DeclaredClass for CentralDelegate {
        type Ivars = Ivars;
    }

    unsafe impl NSObjectProtocol for CentralDelegate {}

    unsafe impl CBCentralManagerDelegate for CentralDelegate {
        #[method(centralManagerDidUpdateState:)]
        fn delegate_central_manager_did_update_state(&self, central: &CBCentralManager) {
            let state = unsafe { central.state() };
            self.send(DelegateEvent::DidUpdateState(state));
        }

        #[method(centralManager:didDiscoverPeripheral:advertisementData:RSSI:)]
        fn delegate_did_discover_peripheral(
            &self,
            _central: &CBCentralManager,
            peripheral: &CBPeripheral,
            advertisement_data: &NSDictionary<NSString, AnyObject>,
            rssi: &NSNumber,
        ) {
            let rssi = match rssi.shortValue() {
                // Core Bluetooth reports 127 when the RSSI is unavailable.
                127 => None,
                value => Some(value),
            };
            self.send(DelegateEvent::DidDiscoverPeripheral {
                peripheral: PeripheralHandle(peripheral.retain()),
                id: peripheral_id(peripheral),
                name: advertised_name(advertisement_data),
                rssi,
                services: advertised_services(advertisement_data),
            });
        }

        #[method(centralManager:didConnectPeripheral:)]
        fn delegate_did_connect_peripheral(
            &self,
            _central: &CBCentralManager,
            peripheral: &CBPeripheral,
        ) {
            self.send(DelegateEvent::DidConnect {
                id: peripheral_id(peripheral),
            });
        }

        #[method(centralManager:didFailToConnectPeripheral:error:)]
        fn delegate_did_fail_to_connect_peripheral(
            &self,
            _central: &CBCentralManager,
            peripheral: &CBPeripheral,
            _error: Option<&NSError>,
        ) {
            self.send(DelegateEvent::DidFailToConnect {
                id: peripheral_id(peripheral),
            });
        }

        #[method(centralManager:didDisconnectPeripheral:error:)]
        fn delegate_did_disconnect_peripheral(
            &self,
            _central: &CBCentralManager,
            peripheral: &CBPeripheral,
            _error: Option<&NSError>,
        ) {
            self.send(DelegateEvent::DidDisconnect {
                id: peripheral_id(peripheral),
            });
        }
    }

    unsafe impl CBPeripheralDelegate for CentralDelegate {
        #[method(peripheral:didDiscoverServices:)]
        fn delegate_did_discover_services(
            &self,
            peripheral: &CBPeripheral,
            error: Option<&NSError>,
        ) {
            self.send(DelegateEvent::DidDiscoverServices {
                id: peripheral_id(peripheral),
                ok: error.is_none(),
            });
        }

        #[method(peripheral:didDiscoverCharacteristicsForService:error:)]
        fn delegate_did_discover_characteristics(
            &self,
            peripheral: &CBPeripheral,
            service: &CBService,
            error: Option<&NSError>,
        ) {
            self.send(DelegateEvent::DidDiscoverCharacteristics {
                id: peripheral_id(peripheral),
                service: cbuuid_to_uuid(unsafe { &service.UUID() }),
                ok: error.is_none(),
            });
        }

        #[method(peripheral:didUpdateValueForCharacteristic:error:)]
        fn delegate_did_update_value(
            &self,
            peripheral: &CBPeripheral,
            characteristic: &CBCharacteristic,
            error: Option<&NSError>,
        ) {
            if error.is_some() {
                return;
            }
            let value = unsafe { characteristic.value() }
                .map(|data| data.bytes().to_vec())
                .unwrap_or_default();
            self.send(DelegateEvent::DidUpdateValue {
                id: peripheral_id(peripheral),
                characteristic: cbuuid_to_uuid(unsafe { &characteristic.UUID() }),
                value,
            });
        }

        #[method(peripheral:didUpdateNotificationStateForCharacteristic:error:)]
        fn delegate_did_update_notification_state(
            &self,
            peripheral: &CBPeripheral,
            characteristic: &CBCharacteristic,
            error: Option<&NSError>,
        ) {
            let enabled = error.is_none() && unsafe { characteristic.isNotifying() };
            self.send(DelegateEvent::DidUpdateNotificationState {
                id: peripheral_id(peripheral),
                characteristic: cbuuid_to_uuid(unsafe { &characteristic.UUID() }),
                enabled,
            });
        }

        #[method(peripheral:didWriteValueForCharacteristic:error:)]
        fn delegate_did_write_value(
            &self,
            peripheral: &CBPeripheral,
            characteristic: &CBCharacteristic,
            error: Option<&NSError>,
        ) {
            self.send(DelegateEvent::DidWriteValue {
                id: peripheral_id(peripheral),
                characteristic: cbuuid_to_uuid(unsafe { &characteristic.UUID() }),
                ok: error.is_none(),
            });
        }
    }
);

impl CentralDelegate {
    pub fn new(sender: mpsc::UnboundedSender<DelegateEvent>) -> Retained<Self> {
        let this = Self::alloc().set_ivars(Ivars { sender });
        unsafe { msg_send_id![super(this), init] }
    }

    fn send(&self, event: DelegateEvent) {
        // The internal loop going away just means shutdown is in progress.
        let _ = self.ivars().sender.send(event);
    }
}

/// The stable device identifier: the peripheral's NSUUID in its canonical
/// upper-case dashed form.
pub fn peripheral_id(peripheral: &CBPeripheral) -> String {
    unsafe { peripheral.identifier().UUIDString().to_string() }
}

/// Core Bluetooth hands out 16-bit and 32-bit short UUIDs as 4 or 8 hex
/// digits; expand them with the Bluetooth base UUID.
pub fn cbuuid_to_uuid(cbuuid: &CBUUID) -> Uuid {
    let text = unsafe { cbuuid.UUIDString() }.to_string();
    match text.len() {
        4 => u16::from_str_radix(&text, 16)
            .map(uuid_from_u16)
            .unwrap_or_default(),
        8 => u32::from_str_radix(&text, 16)
            .map(uuid_from_u32)
            .unwrap_or_default(),
        _ => Uuid::parse_str(&text).unwrap_or_default(),
    }
}

fn advertised_name(advertisement_data: &NSDictionary<NSString, AnyObject>) -> Option<String> {
    let key = unsafe { CBAdvertisementDataLocalNameKey };
    let object = advertisement_data.get(key)?;
    if object.is_kind_of::<NSString>() {
        let name = unsafe { &*(object as *const AnyObject as *const NSString) };
        return Some(name.to_string());
    }
    None
}

fn advertised_services(advertisement_data: &NSDictionary<NSString, AnyObject>) -> Vec<Uuid> {
    let key = unsafe { CBAdvertisementDataServiceUUIDsKey };
    let Some(object) = advertisement_data.get(key) else {
        return Vec::new();
    };
    if !object.is_kind_of::<NSArray>() {
        return Vec::new();
    }
    let array = unsafe { &*(object as *const AnyObject as *const NSArray<CBUUID>) };
    array.iter().map(|cbuuid| cbuuid_to_uuid(cbuuid)).collect()
}
