// blecentral Source Code File
//
// Copyright 2023 the blecentral developers. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! The loop owning every Core Bluetooth object, running on its own thread.
//!
//! All of Core Bluetooth is asynchronous delegate callbacks, so the loop is
//! a single `select!` over two channels: request messages from the driver
//! facade and [`DelegateEvent`]s from the Objective-C delegate. Requests
//! that Core Bluetooth answers through a later callback park their reply
//! sender in [`PendingReplies`] until the matching event arrives.

use std::collections::{HashMap, HashSet};

use log::{debug, trace, warn};
use objc2::rc::Retained;
use objc2::runtime::ProtocolObject;
use objc2::{ClassType, Message as _};
use objc2_core_bluetooth::{
    CBCentralManager, CBCharacteristic, CBCharacteristicWriteType, CBManagerState, CBPeripheral,
    CBService, CBUUID,
};
use objc2_foundation::{NSArray, NSData, NSString};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::api::{AdapterStatus, CharPropFlags, ScanFilter, WriteType};
use crate::backend::{
    AdapterInfo, Advertisement, BackendEvent, BackendRef, CharacteristicSpec, ConnectionInfo,
    EventSender, ServiceSpec, Subscription,
};
use crate::{Error, Result};

use super::delegate::{cbuuid_to_uuid, CentralDelegate, DelegateEvent};

pub(super) enum Message {
    Open {
        reply: oneshot::Sender<Result<AdapterInfo>>,
    },
    ScanStart {
        filter: ScanFilter,
        reply: oneshot::Sender<Result<()>>,
    },
    ScanStop {
        reply: oneshot::Sender<Result<()>>,
    },
    Connect {
        address: String,
        reply: oneshot::Sender<Result<ConnectionInfo>>,
    },
    Disconnect {
        address: String,
        reply: oneshot::Sender<Result<()>>,
    },
    DiscoverServices {
        address: String,
        reply: oneshot::Sender<Result<Vec<ServiceSpec>>>,
    },
    DiscoverCharacteristics {
        service: BackendRef,
        reply: oneshot::Sender<Result<Vec<CharacteristicSpec>>>,
    },
    Subscribe {
        characteristic: BackendRef,
        subscription: Subscription,
        reply: oneshot::Sender<Result<()>>,
    },
    Write {
        characteristic: BackendRef,
        data: Vec<u8>,
        write_type: WriteType,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Everything known about one peripheral, keyed by the objects Core
/// Bluetooth will hand back in later callbacks.
struct PeripheralEntry {
    peripheral: Retained<CBPeripheral>,
    services: HashMap<Uuid, Retained<CBService>>,
    characteristics: HashMap<Uuid, Retained<CBCharacteristic>>,
    subscribed: HashSet<Uuid>,
}

#[derive(Default)]
struct PendingReplies {
    open: Vec<oneshot::Sender<Result<AdapterInfo>>>,
    connects: HashMap<String, oneshot::Sender<Result<ConnectionInfo>>>,
    disconnects: HashMap<String, oneshot::Sender<Result<()>>>,
    service_discoveries: HashMap<String, oneshot::Sender<Result<Vec<ServiceSpec>>>>,
    characteristic_discoveries:
        HashMap<(String, Uuid), oneshot::Sender<Result<Vec<CharacteristicSpec>>>>,
    subscriptions: HashMap<(String, Uuid), oneshot::Sender<Result<()>>>,
    writes: HashMap<(String, Uuid), oneshot::Sender<Result<()>>>,
}

struct CoreBluetoothInternal {
    manager: Retained<CBCentralManager>,
    _delegate: Retained<CentralDelegate>,
    events: EventSender,
    state: CBManagerState,
    peripherals: HashMap<String, PeripheralEntry>,
    pending: PendingReplies,
}

pub(super) fn run(messages: mpsc::UnboundedReceiver<Message>, events: EventSender) {
    let runtime = match tokio::runtime::Builder::new_current_thread().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            warn!("could not build the Core Bluetooth runtime: {}", err);
            return;
        }
    };
    runtime.block_on(event_loop(messages, events));
}

async fn event_loop(mut messages: mpsc::UnboundedReceiver<Message>, events: EventSender) {
    let (delegate_tx, mut delegate_rx) = mpsc::unbounded_channel();
    let delegate = CentralDelegate::new(delegate_tx);
    // A nil queue delivers delegate callbacks on the main dispatch queue,
    // which every Cocoa host is pumping anyway.
    let manager = unsafe {
        CBCentralManager::initWithDelegate_queue(
            CBCentralManager::alloc(),
            Some(ProtocolObject::from_ref(&*delegate)),
            None,
        )
    };
    let mut internal = CoreBluetoothInternal {
        manager,
        _delegate: delegate,
        events,
        state: CBManagerState::Unknown,
        peripherals: HashMap::new(),
        pending: PendingReplies::default(),
    };

    loop {
        tokio::select! {
            message = messages.recv() => match message {
                Some(message) => internal.handle_message(message),
                None => break,
            },
            event = delegate_rx.recv() => match event {
                Some(event) => internal.handle_delegate_event(event),
                None => break,
            },
        }
    }
    debug!("Core Bluetooth loop ended");
}

impl CoreBluetoothInternal {
    fn post(&self, event: BackendEvent) {
        if self.events.send(event).is_err() {
            trace!("core dropped its event channel");
        }
    }

    fn handle_message(&mut self, message: Message) {
        match message {
            Message::Open { reply } => {
                if self.state == CBManagerState::Unknown {
                    // The first state callback has not arrived yet.
                    self.pending.open.push(reply);
                } else {
                    let _ = reply.send(Ok(AdapterInfo {
                        status: adapter_status(self.state),
                        name: None,
                    }));
                }
            }
            Message::ScanStart { filter, reply } => {
                let _ = reply.send(self.scan_start(filter));
            }
            Message::ScanStop { reply } => {
                unsafe { self.manager.stopScan() };
                let _ = reply.send(Ok(()));
            }
            Message::Connect { address, reply } => match self.peripherals.get(&address) {
                Some(entry) => {
                    unsafe {
                        self.manager
                            .connectPeripheral_options(&entry.peripheral, None)
                    };
                    self.pending.connects.insert(address, reply);
                }
                None => {
                    let _ = reply.send(Err(Error::DeviceNotFound));
                }
            },
            Message::Disconnect { address, reply } => match self.peripherals.get(&address) {
                Some(entry) => {
                    unsafe {
                        self.manager
                            .cancelPeripheralConnection(&entry.peripheral)
                    };
                    self.pending.disconnects.insert(address, reply);
                }
                None => {
                    let _ = reply.send(Err(Error::DeviceNotFound));
                }
            },
            Message::DiscoverServices { address, reply } => match self.peripherals.get(&address) {
                Some(entry) => {
                    unsafe { entry.peripheral.discoverServices(None) };
                    self.pending.service_discoveries.insert(address, reply);
                }
                None => {
                    let _ = reply.send(Err(Error::DeviceNotFound));
                }
            },
            Message::DiscoverCharacteristics { service, reply } => {
                match self.lookup_service(&service) {
                    Some((address, service_uuid, service_object)) => {
                        let entry = &self.peripherals[&address];
                        unsafe {
                            entry
                                .peripheral
                                .discoverCharacteristics_forService(None, &service_object)
                        };
                        self.pending
                            .characteristic_discoveries
                            .insert((address, service_uuid), reply);
                    }
                    None => {
                        let _ = reply.send(Err(Error::DeviceNotFound));
                    }
                }
            }
            Message::Subscribe {
                characteristic,
                subscription,
                reply,
            } => {
                // Core Bluetooth picks notification or indication from the
                // characteristic's properties on its own.
                let _ = subscription;
                match self.lookup_characteristic(&characteristic) {
                    Some((address, uuid, characteristic_object)) => {
                        let entry = &self.peripherals[&address];
                        unsafe {
                            entry
                                .peripheral
                                .setNotifyValue_forCharacteristic(true, &characteristic_object)
                        };
                        self.pending.subscriptions.insert((address, uuid), reply);
                    }
                    None => {
                        let _ = reply.send(Err(Error::NoSuchCharacteristic));
                    }
                }
            }
            Message::Write {
                characteristic,
                data,
                write_type,
                reply,
            } => match self.lookup_characteristic(&characteristic) {
                Some((address, uuid, characteristic_object)) => {
                    let entry = &self.peripherals[&address];
                    let payload = NSData::with_bytes(&data);
                    match write_type {
                        WriteType::WithResponse => {
                            unsafe {
                                entry.peripheral.writeValue_forCharacteristic_type(
                                    &payload,
                                    &characteristic_object,
                                    CBCharacteristicWriteType::WithResponse,
                                )
                            };
                            self.pending.writes.insert((address, uuid), reply);
                        }
                        WriteType::WithoutResponse => {
                            unsafe {
                                entry.peripheral.writeValue_forCharacteristic_type(
                                    &payload,
                                    &characteristic_object,
                                    CBCharacteristicWriteType::WithoutResponse,
                                )
                            };
                            // No acknowledgement follows; accepted is done.
                            let _ = reply.send(Ok(()));
                        }
                    }
                }
                None => {
                    let _ = reply.send(Err(Error::NoSuchCharacteristic));
                }
            },
        }
    }

    fn scan_start(&mut self, filter: ScanFilter) -> Result<()> {
        if self.state != CBManagerState::PoweredOn {
            // Core Bluetooth rejects scans until the manager settles.
            return Err(Error::NotReady);
        }
        let services: Option<Retained<NSArray<CBUUID>>> = if filter.services.is_empty() {
            None
        } else {
            let uuids: Vec<Retained<CBUUID>> = filter
                .services
                .iter()
                .map(|uuid| {
                    let text = NSString::from_str(&uuid.to_string());
                    unsafe { CBUUID::UUIDWithString(&text) }
                })
                .collect();
            Some(NSArray::from_retained_slice(&uuids))
        };
        unsafe {
            self.manager
                .scanForPeripheralsWithServices_options(services.as_deref(), None)
        };
        Ok(())
    }

    fn handle_delegate_event(&mut self, event: DelegateEvent) {
        match event {
            DelegateEvent::DidUpdateState(state) => {
                self.state = state;
                let status = adapter_status(state);
                for reply in self.pending.open.drain(..) {
                    let _ = reply.send(Ok(AdapterInfo { status, name: None }));
                }
                self.post(BackendEvent::StatusChanged(status));
            }
            DelegateEvent::DidDiscoverPeripheral {
                peripheral,
                id,
                name,
                rssi,
                services,
            } => {
                let entry = self
                    .peripherals
                    .entry(id.clone())
                    .or_insert_with(|| PeripheralEntry {
                        peripheral: peripheral.0,
                        services: HashMap::new(),
                        characteristics: HashMap::new(),
                        subscribed: HashSet::new(),
                    });
                unsafe {
                    entry
                        .peripheral
                        .setDelegate(Some(ProtocolObject::from_ref(&*self._delegate)))
                };
                self.post(BackendEvent::Advertisement(Advertisement {
                    address: id,
                    name,
                    rssi,
                    services,
                    connected: false,
                }));
            }
            DelegateEvent::DidConnect { id } => {
                let Some(reply) = self.pending.connects.remove(&id) else {
                    return;
                };
                let max_pdu_size = self.peripherals.get(&id).map(|entry| unsafe {
                    entry
                        .peripheral
                        .maximumWriteValueLengthForType(CBCharacteristicWriteType::WithoutResponse)
                        as u16
                });
                let _ = reply.send(Ok(ConnectionInfo { max_pdu_size }));
            }
            DelegateEvent::DidFailToConnect { id } => {
                if let Some(reply) = self.pending.connects.remove(&id) {
                    let _ = reply.send(Err(Error::NotConnected));
                }
            }
            DelegateEvent::DidDisconnect { id } => {
                if let Some(entry) = self.peripherals.get_mut(&id) {
                    entry.services.clear();
                    entry.characteristics.clear();
                    entry.subscribed.clear();
                }
                if let Some(reply) = self.pending.disconnects.remove(&id) {
                    let _ = reply.send(Ok(()));
                }
                self.post(BackendEvent::DeviceDisconnected { address: id });
            }
            DelegateEvent::DidDiscoverServices { id, ok } => {
                let Some(reply) = self.pending.service_discoveries.remove(&id) else {
                    return;
                };
                if !ok {
                    let _ = reply.send(Err(Error::Other("service discovery failed".into())));
                    return;
                }
                let _ = reply.send(Ok(self.collect_services(&id)));
            }
            DelegateEvent::DidDiscoverCharacteristics { id, service, ok } => {
                let Some(reply) = self
                    .pending
                    .characteristic_discoveries
                    .remove(&(id.clone(), service))
                else {
                    return;
                };
                if !ok {
                    let _ = reply.send(Err(Error::Other("characteristic discovery failed".into())));
                    return;
                }
                let _ = reply.send(Ok(self.collect_characteristics(&id, service)));
            }
            DelegateEvent::DidUpdateValue {
                id,
                characteristic,
                value,
            } => {
                let subscribed = self
                    .peripherals
                    .get(&id)
                    .map(|entry| entry.subscribed.contains(&characteristic))
                    .unwrap_or(false);
                if subscribed {
                    self.post(BackendEvent::ValueChanged {
                        address: id,
                        uuid: characteristic,
                        value,
                    });
                }
            }
            DelegateEvent::DidUpdateNotificationState {
                id,
                characteristic,
                enabled,
            } => {
                if enabled {
                    if let Some(entry) = self.peripherals.get_mut(&id) {
                        entry.subscribed.insert(characteristic);
                    }
                }
                if let Some(reply) = self.pending.subscriptions.remove(&(id, characteristic)) {
                    let result = if enabled {
                        Ok(())
                    } else {
                        Err(Error::NotSupported("notifications".to_owned()))
                    };
                    let _ = reply.send(result);
                }
            }
            DelegateEvent::DidWriteValue {
                id,
                characteristic,
                ok,
            } => {
                if let Some(reply) = self.pending.writes.remove(&(id, characteristic)) {
                    let result = if ok {
                        Ok(())
                    } else {
                        Err(Error::Other("write rejected by the peripheral".into()))
                    };
                    let _ = reply.send(result);
                }
            }
        }
    }

    fn collect_services(&mut self, id: &str) -> Vec<ServiceSpec> {
        let Some(entry) = self.peripherals.get_mut(id) else {
            return Vec::new();
        };
        let mut specs = Vec::new();
        if let Some(services) = unsafe { entry.peripheral.services() } {
            for service in services.iter() {
                let uuid = cbuuid_to_uuid(unsafe { &service.UUID() });
                entry.services.insert(uuid, service.retain());
                specs.push(ServiceSpec {
                    uuid,
                    // ATT handles are not part of the Core Bluetooth model.
                    handle_start: None,
                    handle_end: None,
                    backend_ref: format!("{}/{}", id, uuid),
                });
            }
        }
        specs
    }

    fn collect_characteristics(&mut self, id: &str, service_uuid: Uuid) -> Vec<CharacteristicSpec> {
        let Some(entry) = self.peripherals.get_mut(id) else {
            return Vec::new();
        };
        let Some(service) = entry.services.get(&service_uuid) else {
            return Vec::new();
        };
        let mut specs = Vec::new();
        if let Some(characteristics) = unsafe { service.characteristics() } {
            for characteristic in characteristics.iter() {
                let uuid = cbuuid_to_uuid(unsafe { &characteristic.UUID() });
                let properties = unsafe { characteristic.properties() };
                entry.characteristics.insert(uuid, characteristic.retain());
                specs.push(CharacteristicSpec {
                    uuid,
                    properties: CharPropFlags::from_bits_truncate(properties.0 as u8),
                    handle: None,
                    value_handle: None,
                    backend_ref: format!("{}/{}/{}", id, service_uuid, uuid),
                });
            }
        }
        specs
    }

    /// Resolve a `peripheral/service` backend reference.
    fn lookup_service(&self, backend_ref: &str) -> Option<(String, Uuid, Retained<CBService>)> {
        let (address, service) = backend_ref.rsplit_once('/')?;
        let service_uuid = Uuid::parse_str(service).ok()?;
        let entry = self.peripherals.get(address)?;
        let service_object = entry.services.get(&service_uuid)?.clone();
        Some((address.to_owned(), service_uuid, service_object))
    }

    /// Resolve a `peripheral/service/characteristic` backend reference.
    fn lookup_characteristic(
        &self,
        backend_ref: &str,
    ) -> Option<(String, Uuid, Retained<CBCharacteristic>)> {
        let mut parts = backend_ref.split('/');
        let address = parts.next()?;
        let _service = parts.next()?;
        let characteristic_uuid = Uuid::parse_str(parts.next()?).ok()?;
        let entry = self.peripherals.get(address)?;
        let characteristic_object = entry.characteristics.get(&characteristic_uuid)?.clone();
        Some((address.to_owned(), characteristic_uuid, characteristic_object))
    }
}

fn adapter_status(state: CBManagerState) -> AdapterStatus {
    match state {
        CBManagerState::PoweredOn => AdapterStatus::PoweredOn,
        CBManagerState::PoweredOff => AdapterStatus::PoweredOff,
        CBManagerState::Unauthorized => AdapterStatus::Unauthorized,
        _ => AdapterStatus::Disabled,
    }
}
