// blecentral Source Code File
//
// Copyright 2023 the blecentral developers. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! The Linux driver: BLE central over the BlueZ D-Bus service, through the
//! bluez-async session layer.
//!
//! BlueZ publishes devices, services and characteristics as objects on the
//! system bus; those object paths double as this driver's opaque backend
//! references. Unsolicited D-Bus signals are pumped from the session's event
//! stream into the core's event channel.
//!
//! `connect` resolves once BlueZ reports `ServicesResolved`, not when the
//! bare link comes up, so a `DISCOVER_SERVICES` issued as soon as
//! `is_connected` turns true cannot race BlueZ's own service enumeration.

use std::sync::Arc;

use async_trait::async_trait;
use bluez_async::{
    AdapterEvent, BluetoothError, BluetoothEvent, BluetoothSession, CharacteristicEvent,
    CharacteristicFlags, CharacteristicId, DeviceEvent, DeviceId, DeviceInfo, DiscoveryFilter,
    ServiceId, Transport, WriteOptions,
};
use dashmap::DashMap;
use futures::stream::{Stream, StreamExt};
use log::{debug, trace, warn};
use uuid::Uuid;

use crate::api::{AdapterStatus, CharPropFlags, ScanFilter, WriteType};
use crate::backend::{
    AdapterInfo, Advertisement, Backend, BackendEvent, BackendRef, CharacteristicSpec,
    ConnectionInfo, EventSender, ServiceSpec, Subscription,
};
use crate::{Error, Result};

#[derive(Clone, Debug)]
struct ServiceRecord {
    id: ServiceId,
    address: String,
}

#[derive(Clone, Debug)]
struct CharacteristicRecord {
    id: CharacteristicId,
    address: String,
    uuid: Uuid,
}

pub(crate) struct BluezBackend {
    session: BluetoothSession,
    events: EventSender,
    /// Known devices by canonical MAC string.
    devices: DashMap<String, DeviceId>,
    /// Devices this driver connected; consulted from the event pump.
    connected: DashMap<String, DeviceId>,
    services: DashMap<BackendRef, ServiceRecord>,
    characteristics: DashMap<BackendRef, CharacteristicRecord>,
    /// Characteristics with an active notification session.
    subscriptions: DashMap<CharacteristicId, (String, Uuid)>,
}

impl BluezBackend {
    pub(crate) async fn create(events: EventSender) -> Result<Arc<BluezBackend>> {
        let (dbus_task, session) = BluetoothSession::new().await?;
        tokio::spawn(async move {
            if let Err(err) = dbus_task.await {
                warn!("lost the D-Bus connection to BlueZ: {}", err);
            }
        });

        let backend = Arc::new(BluezBackend {
            session,
            events,
            devices: DashMap::new(),
            connected: DashMap::new(),
            services: DashMap::new(),
            characteristics: DashMap::new(),
            subscriptions: DashMap::new(),
        });

        let stream = backend.session.event_stream().await?;
        tokio::spawn(pump_events(backend.clone(), stream));
        Ok(backend)
    }

    fn post(&self, event: BackendEvent) {
        if self.events.send(event).is_err() {
            trace!("core dropped its event channel");
        }
    }

    fn post_advertisement(&self, info: DeviceInfo) {
        let address = info.mac_address.to_string();
        self.devices.insert(address.clone(), info.id);
        self.post(BackendEvent::Advertisement(Advertisement {
            address,
            name: info.name,
            rssi: info.rssi,
            services: info.services,
            connected: info.connected,
        }));
    }

    fn device_id(&self, address: &str) -> Result<DeviceId> {
        self.devices
            .get(address)
            .map(|entry| entry.value().clone())
            .ok_or(Error::DeviceNotFound)
    }

    fn characteristic_record(&self, backend_ref: &str) -> Result<CharacteristicRecord> {
        self.characteristics
            .get(backend_ref)
            .map(|entry| entry.value().clone())
            .ok_or(Error::NoSuchCharacteristic)
    }

    async fn handle_event(&self, event: BluetoothEvent) {
        match event {
            BluetoothEvent::Adapter { event, .. } => {
                if let AdapterEvent::Powered { powered } = event {
                    let status = if powered {
                        AdapterStatus::PoweredOn
                    } else {
                        AdapterStatus::PoweredOff
                    };
                    self.post(BackendEvent::StatusChanged(status));
                }
            }
            BluetoothEvent::Device { id, event } => self.handle_device_event(id, event).await,
            BluetoothEvent::Characteristic { id, event } => {
                let CharacteristicEvent::Value { value } = event else {
                    return;
                };
                if let Some(entry) = self.subscriptions.get(&id) {
                    let (address, uuid) = entry.value().clone();
                    drop(entry);
                    self.post(BackendEvent::ValueChanged {
                        address,
                        uuid,
                        value,
                    });
                }
            }
        }
    }

    async fn handle_device_event(&self, id: DeviceId, event: DeviceEvent) {
        match event {
            // A fresh object appeared in the object manager; report its
            // advertised identity.
            DeviceEvent::Discovered => self.refresh_device(&id).await,
            // BlueZ batches advertisement data into property changes; an
            // RSSI change is the per-advertisement heartbeat.
            DeviceEvent::Rssi { .. } => self.refresh_device(&id).await,
            DeviceEvent::Connected { connected: false } => {
                let address = self
                    .connected
                    .iter()
                    .find(|entry| entry.value() == &id)
                    .map(|entry| entry.key().clone());
                if let Some(address) = address {
                    self.connected.remove(&address);
                    self.post(BackendEvent::DeviceDisconnected { address });
                }
            }
            // The connection is surfaced from connect() once services
            // resolve; the raw link-up signal is not interesting.
            DeviceEvent::Connected { connected: true } => {}
            _ => {}
        }
    }

    async fn refresh_device(&self, id: &DeviceId) {
        match self.session.get_device_info(id).await {
            Ok(info) => self.post_advertisement(info),
            Err(err) => debug!("failed to read properties of {}: {}", id, err),
        }
    }
}

async fn pump_events<S>(backend: Arc<BluezBackend>, mut stream: S)
where
    S: Stream<Item = BluetoothEvent> + Send + Unpin + 'static,
{
    while let Some(event) = stream.next().await {
        backend.handle_event(event).await;
    }
    debug!("BlueZ event stream ended");
}

#[async_trait]
impl Backend for BluezBackend {
    async fn open(&self) -> Result<AdapterInfo> {
        let adapters = self.session.get_adapters().await?;
        let Some(adapter) = adapters.into_iter().next() else {
            return Ok(AdapterInfo {
                status: AdapterStatus::Disabled,
                name: None,
            });
        };
        if !adapter.powered {
            // The session layer has no standalone power switch; starting
            // discovery powers the adapter on. Stop right away, the host
            // drives the actual scanning.
            self.session.start_discovery_on_adapter(&adapter.id).await?;
            self.session.stop_discovery_on_adapter(&adapter.id).await?;
        }
        // Surface devices BlueZ already holds a connection to.
        if let Ok(devices) = self.session.get_devices().await {
            for info in devices.into_iter().filter(|device| device.connected) {
                self.post_advertisement(info);
            }
        }
        Ok(AdapterInfo {
            status: AdapterStatus::PoweredOn,
            name: Some(adapter.name),
        })
    }

    async fn scan_start(&self, filter: &ScanFilter) -> Result<()> {
        let discovery_filter = DiscoveryFilter {
            service_uuids: filter.services.clone(),
            transport: Some(Transport::Le),
            // Duplicate reports keep RSSI and last-seen fresh.
            duplicate_data: Some(true),
            ..DiscoveryFilter::default()
        };
        match self
            .session
            .start_discovery_with_filter(&discovery_filter)
            .await
        {
            Ok(()) => Ok(()),
            Err(BluetoothError::DbusError(err))
                if err.name() == Some("org.bluez.Error.InProgress") =>
            {
                trace!("discovery already running");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn scan_stop(&self) -> Result<()> {
        self.session.stop_discovery().await?;
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<ConnectionInfo> {
        let id = self.device_id(address)?;
        self.session.connect(&id).await?;
        self.connected.insert(address.to_owned(), id);
        // BlueZ does not expose the negotiated ATT MTU over D-Bus.
        Ok(ConnectionInfo { max_pdu_size: None })
    }

    async fn disconnect(&self, address: &str) -> Result<()> {
        let id = self.device_id(address)?;
        self.session.disconnect(&id).await?;
        self.connected.remove(address);
        Ok(())
    }

    async fn discover_services(&self, address: &str) -> Result<Vec<ServiceSpec>> {
        let id = self.device_id(address)?;
        let services = self.session.get_services(&id).await?;
        let mut specs = Vec::with_capacity(services.len());
        for service in services {
            let backend_ref = service.id.to_string();
            self.services.insert(
                backend_ref.clone(),
                ServiceRecord {
                    id: service.id,
                    address: address.to_owned(),
                },
            );
            specs.push(ServiceSpec {
                uuid: service.uuid,
                // ATT handles are not part of the GATT D-Bus API.
                handle_start: None,
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
        let (service_id, address) = {
            let entry = self.services.get(service).ok_or(Error::DeviceNotFound)?;
            (entry.id.clone(), entry.address.clone())
        };
        let characteristics = self.session.get_characteristics(&service_id).await?;
        let mut specs = Vec::with_capacity(characteristics.len());
        for characteristic in characteristics {
            let backend_ref = characteristic.id.to_string();
            self.characteristics.insert(
                backend_ref.clone(),
                CharacteristicRecord {
                    id: characteristic.id,
                    address: address.clone(),
                    uuid: characteristic.uuid,
                },
            );
            specs.push(CharacteristicSpec {
                uuid: characteristic.uuid,
                properties: to_char_props(characteristic.flags),
                handle: None,
                value_handle: None,
                backend_ref,
            });
        }
        Ok(specs)
    }

    async fn subscribe(
        &self,
        characteristic: &BackendRef,
        _subscription: Subscription,
    ) -> Result<()> {
        // BlueZ picks notification or indication from the characteristic's
        // properties itself; StartNotify covers both.
        let record = self.characteristic_record(characteristic)?;
        self.subscriptions
            .insert(record.id.clone(), (record.address, record.uuid));
        if let Err(err) = self.session.start_notify(&record.id).await {
            self.subscriptions.remove(&record.id);
            return Err(err.into());
        }
        Ok(())
    }

    async fn write(
        &self,
        characteristic: &BackendRef,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        let record = self.characteristic_record(characteristic)?;
        let options = WriteOptions {
            write_type: Some(write_type.into()),
            ..WriteOptions::default()
        };
        self.session
            .write_characteristic_value_with_options(&record.id, data, options)
            .await?;
        Ok(())
    }
}

impl From<BluetoothError> for Error {
    fn from(error: BluetoothError) -> Self {
        if let BluetoothError::DbusError(dbus_error) = &error {
            match dbus_error.name() {
                Some("org.bluez.Error.NotReady") => return Error::NotReady,
                Some("org.bluez.Error.NotAuthorized") => return Error::PermissionDenied,
                _ => {}
            }
        }
        Error::Other(Box::new(error))
    }
}

impl From<WriteType> for bluez_async::WriteType {
    fn from(write_type: WriteType) -> Self {
        match write_type {
            WriteType::WithResponse => bluez_async::WriteType::WithResponse,
            WriteType::WithoutResponse => bluez_async::WriteType::WithoutResponse,
        }
    }
}

fn to_char_props(flags: CharacteristicFlags) -> CharPropFlags {
    let mut result = CharPropFlags::default();
    if flags.contains(CharacteristicFlags::BROADCAST) {
        result.insert(CharPropFlags::BROADCAST);
    }
    if flags.contains(CharacteristicFlags::READ) {
        result.insert(CharPropFlags::READ);
    }
    if flags.contains(CharacteristicFlags::WRITE_WITHOUT_RESPONSE) {
        result.insert(CharPropFlags::WRITE_WITHOUT_RESPONSE);
    }
    if flags.contains(CharacteristicFlags::WRITE) {
        result.insert(CharPropFlags::WRITE);
    }
    if flags.contains(CharacteristicFlags::NOTIFY) {
        result.insert(CharPropFlags::NOTIFY);
    }
    if flags.contains(CharacteristicFlags::INDICATE) {
        result.insert(CharPropFlags::INDICATE);
    }
    if flags.contains(CharacteristicFlags::SIGNED_WRITE) {
        result.insert(CharPropFlags::AUTHENTICATED_SIGNED_WRITES);
    }
    if flags.contains(CharacteristicFlags::EXTENDED_PROPERTIES) {
        result.insert(CharPropFlags::EXTENDED_PROPERTIES);
    }
    result
}
