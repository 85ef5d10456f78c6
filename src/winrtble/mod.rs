// blecentral Source Code File
//
// Copyright 2023 the blecentral developers. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! The Windows driver, built on the WinRT Bluetooth APIs.
//!
//! Radio enumeration provides the adapter power state, a
//! `BluetoothLEAdvertisementWatcher` in Active mode delivers
//! advertisements, and `BluetoothLEDevice` plus a `GattSession` per
//! connection carry the GATT traffic. WinRT invokes its handlers on
//! arbitrary threads; everything is forwarded through the core's event
//! channel untouched.

mod ble;
mod utils;

use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, trace};
use windows::{
    Devices::Bluetooth::GenericAttributeProfile::GattDeviceService,
    Devices::Radios::{Radio, RadioKind, RadioState},
    Foundation::TypedEventHandler,
};

use crate::api::{AdapterStatus, BDAddr, ScanFilter, WriteType};
use crate::backend::{
    AdapterInfo, Advertisement, Backend, BackendEvent, BackendRef, CharacteristicSpec,
    ConnectionInfo, EventSender, ServiceSpec, Subscription,
};
use crate::{Error, Result};

use self::ble::characteristic::BLECharacteristic;
use self::ble::device::BLEDevice;
use self::ble::watcher::BLEWatcher;

fn radio_status(radio: &Radio) -> AdapterStatus {
    match radio.State().unwrap_or(RadioState::Unknown) {
        RadioState::On => AdapterStatus::PoweredOn,
        RadioState::Off => AdapterStatus::PoweredOff,
        RadioState::Disabled => AdapterStatus::Unauthorized,
        _ => AdapterStatus::Disabled,
    }
}

pub(crate) struct WinrtBackend {
    events: EventSender,
    radio: Mutex<Option<Radio>>,
    watcher: Mutex<Option<BLEWatcher>>,
    devices: DashMap<String, BLEDevice>,
    services: DashMap<BackendRef, (String, GattDeviceService)>,
    characteristics: DashMap<BackendRef, BLECharacteristic>,
}

impl WinrtBackend {
    pub(crate) async fn create(events: EventSender) -> Result<std::sync::Arc<WinrtBackend>> {
        Ok(std::sync::Arc::new(WinrtBackend {
            events,
            radio: Mutex::new(None),
            watcher: Mutex::new(None),
            devices: DashMap::new(),
            services: DashMap::new(),
            characteristics: DashMap::new(),
        }))
    }

    fn post(&self, event: BackendEvent) {
        if self.events.send(event).is_err() {
            trace!("core dropped its event channel");
        }
    }

    async fn bluetooth_radio(&self) -> Result<Option<Radio>> {
        if let Some(radio) = self.radio.lock().unwrap().clone() {
            return Ok(Some(radio));
        }
        let radios = Radio::GetRadiosAsync()
            .map_err(utils::winrt_error)?
            .await
            .map_err(utils::winrt_error)?;
        for radio in radios {
            if radio.Kind() == Ok(RadioKind::Bluetooth) {
                self.radio.lock().unwrap().replace(radio.clone());
                return Ok(Some(radio));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Backend for WinrtBackend {
    async fn open(&self) -> Result<AdapterInfo> {
        let Some(radio) = self.bluetooth_radio().await? else {
            return Ok(AdapterInfo {
                status: AdapterStatus::Disabled,
                name: None,
            });
        };

        let events = self.events.clone();
        let handler = TypedEventHandler::new(move |sender: windows::core::Ref<'_, Radio>, _| {
            if let Some(radio) = sender.as_ref() {
                let _ = events.send(BackendEvent::StatusChanged(radio_status(radio)));
            }
            Ok(())
        });
        radio.StateChanged(&handler).map_err(utils::winrt_error)?;

        let name = radio.Name().map(|name| name.to_string()).ok();
        Ok(AdapterInfo {
            status: radio_status(&radio),
            name,
        })
    }

    async fn scan_start(&self, filter: &ScanFilter) -> Result<()> {
        let mut slot = self.watcher.lock().unwrap();
        let watcher = BLEWatcher::new(filter)?;
        let events = self.events.clone();
        watcher.start(Box::new(move |advertisement: Advertisement| {
            let _ = events.send(BackendEvent::Advertisement(advertisement));
        }))?;
        slot.replace(watcher);
        Ok(())
    }

    async fn scan_stop(&self) -> Result<()> {
        if let Some(watcher) = self.watcher.lock().unwrap().take() {
            watcher.stop()?;
        }
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<ConnectionInfo> {
        let addr: BDAddr = address.parse()?;
        let events = self.events.clone();
        let event_address = address.to_owned();
        let device = BLEDevice::new(
            u64::from(addr),
            Box::new(move |is_connected| {
                if !is_connected {
                    let _ = events.send(BackendEvent::DeviceDisconnected {
                        address: event_address.clone(),
                    });
                }
            }),
        )
        .await?;
        device.connect().await?;

        let max_pdu_size = device.max_pdu_size().ok();
        let events = self.events.clone();
        let event_address = address.to_owned();
        device.on_max_pdu_size_changed(Box::new(move |mtu| {
            let _ = events.send(BackendEvent::MaxPduSizeChanged {
                address: event_address.clone(),
                max_pdu_size: mtu.saturating_sub(3),
            });
        }))?;

        self.devices.insert(address.to_owned(), device);
        Ok(ConnectionInfo {
            max_pdu_size: max_pdu_size.map(|mtu| mtu.saturating_sub(3)),
        })
    }

    async fn disconnect(&self, address: &str) -> Result<()> {
        // Dropping the BLEDevice closes the underlying WinRT device and
        // session, which tears the link down once no one else holds it.
        match self.devices.remove(address) {
            Some(_) => Ok(()),
            None => Err(Error::NotConnected),
        }
    }

    async fn discover_services(&self, address: &str) -> Result<Vec<ServiceSpec>> {
        let device = self
            .devices
            .get(address)
            .map(|entry| entry.value().clone())
            .ok_or(Error::NotConnected)?;
        let services = device.discover_services().await?;
        let mut specs = Vec::with_capacity(services.len());
        for service in services {
            let uuid = utils::to_uuid(&service.Uuid().map_err(utils::winrt_error)?);
            let handle_start = service.AttributeHandle().ok();
            let backend_ref = format!("{}/{}", address, uuid);
            self.services
                .insert(backend_ref.clone(), (address.to_owned(), service));
            specs.push(ServiceSpec {
                uuid,
                handle_start,
                // WinRT exposes only the group's starting handle.
                handle_end: None,
                backend_ref,
            });
        }
        Ok(specs)
    }

    async fn discover_characteristics(
        &self,
        service: &BackendRef,
    ) -> Result<Vec<CharacteristicSpec>> {
        let (address, gatt_service) = self
            .services
            .get(service)
            .map(|entry| entry.value().clone())
            .ok_or(Error::DeviceNotFound)?;
        let characteristics = BLEDevice::get_characteristics(&gatt_service).await?;
        let mut specs = Vec::with_capacity(characteristics.len());
        for characteristic in characteristics {
            let uuid = utils::to_uuid(&characteristic.Uuid().map_err(utils::winrt_error)?);
            let properties = utils::to_char_props(
                &characteristic
                    .CharacteristicProperties()
                    .map_err(utils::winrt_error)?,
            );
            let handle = characteristic.AttributeHandle().ok();
            let backend_ref = format!("{}/{}", service, uuid);
            self.characteristics.insert(
                backend_ref.clone(),
                BLECharacteristic::new(characteristic, address.clone(), uuid),
            );
            specs.push(CharacteristicSpec {
                uuid,
                properties,
                handle,
                value_handle: None,
                backend_ref,
            });
        }
        Ok(specs)
    }

    async fn subscribe(
        &self,
        characteristic: &BackendRef,
        subscription: Subscription,
    ) -> Result<()> {
        let entry = self
            .characteristics
            .get(characteristic)
            .map(|entry| entry.value().clone())
            .ok_or(Error::NoSuchCharacteristic)?;
        let events = self.events.clone();
        entry
            .subscribe(
                subscription,
                Box::new(move |address, uuid, value| {
                    let _ = events.send(BackendEvent::ValueChanged {
                        address,
                        uuid,
                        value,
                    });
                }),
            )
            .await
    }

    async fn write(
        &self,
        characteristic: &BackendRef,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        let entry = self
            .characteristics
            .get(characteristic)
            .map(|entry| entry.value().clone())
            .ok_or(Error::NoSuchCharacteristic)?;
        entry.write_value(data, write_type).await
    }
}

impl Drop for WinrtBackend {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.lock().unwrap().take() {
            if let Err(err) = watcher.stop() {
                debug!("stopping the advertisement watcher failed: {}", err);
            }
        }
    }
}
