// blecentral Source Code File
//
// Copyright 2023 the blecentral developers. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! The platform-independent adapter core.
//!
//! [`BleAdapter`] owns the root of the state tree, the OS driver, the
//! per-device write queues, the callback registry, the scan lifecycle, and
//! the aging sweep that evicts stale advertisers. All driver events are
//! applied to the tree on a single dispatcher task spawned on the calling
//! Tokio runtime; host-facing listeners therefore run without further
//! locking.
//!
//! Commands reach the core as transient child insertions on the tree (see
//! [`crate::tree::message`]); the convenience methods on [`BleAdapter`]
//! merely construct the corresponding command nodes. Commands issued while
//! the adapter is not powered on, or against unknown or disconnected
//! devices, are dropped silently; failures surface as the expected follow-up
//! event never appearing.

pub(crate) mod scan;
pub(crate) mod write_queue;

#[cfg(test)]
mod mock;
#[cfg(test)]
mod tests;

use std::fmt::{self, Debug, Formatter};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{Stream, StreamExt};
use log::{debug, trace, warn};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::api::{AdapterStatus, CentralEvent, DeviceCallbacks, ScanFilter, WriteType};
use crate::backend::{
    self, AdapterInfo, Advertisement, Backend, BackendEvent, CharacteristicSpec, ConnectionInfo,
    EventReceiver, ServiceSpec, Subscription,
};
use crate::tree::{self, keys, ListenerId, NodeKind, TreeNode};
use crate::{Error, Result};

use self::scan::{ScanAction, ScanMachine};
use self::write_queue::{PendingWrite, WriteQueue};

const AGING_TICK: Duration = Duration::from_millis(500);
const DEVICE_TIMEOUT_MS: i64 = 5000;
const SCAN_RETRY_INTERVAL: Duration = Duration::from_millis(50);
const SCAN_START_BUDGET: Duration = Duration::from_secs(1);

/// Usable write payload size assumed when the OS does not expose the
/// negotiated ATT MTU (the BLE minimum of 23, minus the 3 byte ATT header).
pub const DEFAULT_MAX_PDU_SIZE: usize = 20;

/// Everything the dispatcher task reacts to: driver events plus the
/// completions of operations the core spawned itself.
enum InternalEvent {
    Backend(BackendEvent),
    Opened(AdapterInfo),
    ScanStarted,
    ScanStartFailed,
    ScanStopped,
    Connected {
        address: String,
        info: ConnectionInfo,
    },
    ConnectFailed {
        address: String,
    },
    Disconnected {
        address: String,
    },
    ServicesDiscovered {
        address: String,
        services: Vec<ServiceSpec>,
    },
    CharacteristicsDiscovered {
        address: String,
        service_uuid: Uuid,
        characteristics: Vec<CharacteristicSpec>,
    },
    SubscriptionActive {
        address: String,
        uuid: Uuid,
    },
    WriteComplete {
        address: String,
        uuid: Uuid,
        ok: bool,
    },
    Shutdown,
}

struct Shared {
    root: TreeNode,
    backend: Arc<dyn Backend>,
    handle: Handle,
    scan: Mutex<ScanMachine>,
    write_queues: DashMap<String, WriteQueue>,
    callbacks: DashMap<String, Arc<Mutex<DeviceCallbacks>>>,
    events_tx: mpsc::UnboundedSender<InternalEvent>,
    central_tx: broadcast::Sender<CentralEvent>,
    epoch: Instant,
}

/// The entry point of the library: the local adapter in its central role.
///
/// The adapter's observable state lives in the tree reachable through
/// [`BleAdapter::state`]; see the crate documentation for the record and
/// command vocabulary. Dropping the adapter stops any scan, disconnects
/// every device the core connected, and releases the OS handles.
pub struct BleAdapter {
    shared: Arc<Shared>,
    router: ListenerId,
}

/// Handle to a connected (or connecting) device, bound to its tree record.
#[derive(Clone, Debug)]
pub struct BleDevice {
    state: TreeNode,
    address: String,
}

impl BleDevice {
    /// The device's record in the state tree.
    pub fn state(&self) -> TreeNode {
        self.state.clone()
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Queue a characteristic write. Writes to one device go out strictly in
    /// submission order, one at a time; completion is reported through the
    /// `characteristic_written` callback registered on connect. Writes to a
    /// device that has disappeared or disconnected are dropped silently.
    ///
    /// Payloads are forwarded as-is; hosts should respect
    /// [`BleAdapter::maximum_value_length`].
    pub fn write(&self, adapter: &BleAdapter, characteristic: Uuid, data: &[u8], write_type: WriteType) {
        adapter.shared.enqueue_write(self, characteristic, data, write_type);
    }
}

impl BleAdapter {
    /// Create an adapter backed by this platform's native driver. The status
    /// of the adapter becomes known asynchronously through the tree.
    ///
    /// Must be called from within a Tokio runtime; the core spawns its
    /// dispatcher task onto it.
    pub async fn new() -> Result<BleAdapter> {
        let (events_tx, events_rx) = backend::event_channel();
        let driver = crate::platform::init(events_tx).await?;
        Ok(Self::with_backend(driver, events_rx))
    }

    /// Create an adapter on top of an explicit driver. This is how tests
    /// (and exotic embeddings) supply their own [`Backend`].
    pub fn with_backend(driver: Arc<dyn Backend>, driver_events: EventReceiver) -> BleAdapter {
        let handle = Handle::current();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (central_tx, _) = broadcast::channel(16);

        let root = TreeNode::new(NodeKind::Adapter);
        root.set_property(keys::STATUS, AdapterStatus::Disabled as i64);

        let shared = Arc::new(Shared {
            root: root.clone(),
            backend: driver,
            handle: handle.clone(),
            scan: Mutex::new(ScanMachine::default()),
            write_queues: DashMap::new(),
            callbacks: DashMap::new(),
            events_tx: events_tx.clone(),
            central_tx,
            epoch: Instant::now(),
        });

        // Commands are tree insertions; route them to the driver.
        let weak = Arc::downgrade(&shared);
        let router = root.on_child_added(move |parent, child| {
            if let Some(shared) = weak.upgrade() {
                shared.route_command(parent, child);
            }
        });

        forward_driver_events(&handle, driver_events, events_tx.clone());
        handle.spawn(dispatch_loop(shared.clone(), events_rx));

        let driver = shared.backend.clone();
        handle.spawn(async move {
            let info = match driver.open().await {
                Ok(info) => info,
                Err(err) => {
                    warn!("failed to open the adapter: {}", err);
                    AdapterInfo::default()
                }
            };
            let _ = events_tx.send(InternalEvent::Opened(info));
        });

        BleAdapter { shared, router }
    }

    /// The root of the observable state tree.
    pub fn state(&self) -> TreeNode {
        self.shared.root.clone()
    }

    /// Snapshot of the adapter status.
    pub fn status(&self) -> AdapterStatus {
        self.shared.status()
    }

    /// Start or stop scanning by dispatching a `SCAN` command. A non-empty
    /// `services` list asks the OS to only report advertisers whose
    /// advertised service UUIDs intersect it.
    pub fn scan(&self, should_start: bool, services: &[Uuid]) {
        let command = TreeNode::new(NodeKind::Scan);
        command.set_property(keys::SHOULD_START, should_start);
        for uuid in services {
            let entry = TreeNode::new(NodeKind::Service);
            entry.set_property(keys::UUID, *uuid);
            command.append_child(&entry);
        }
        tree::message_with(&self.shared.root, command);
    }

    /// Register the callback bundle for a device and initiate a connection.
    /// The returned handle is bound to the device's tree record; the
    /// connection itself completes asynchronously with `is_connected`
    /// turning true on that record.
    ///
    /// Calling this for a device that is already connected (or connecting)
    /// returns an equivalent handle without replacing the registered
    /// callbacks.
    pub fn connect(&self, device: &TreeNode, callbacks: DeviceCallbacks) -> Result<BleDevice> {
        if !device.has_type(NodeKind::Device) {
            debug_assert!(false, "connect called on a {} node", device.kind().as_str());
            return Err(Error::DeviceNotFound);
        }
        let address = device.get_string(keys::ADDRESS).ok_or(Error::DeviceNotFound)?;
        let handle = BleDevice {
            state: device.clone(),
            address: address.clone(),
        };

        if self.shared.status() != AdapterStatus::PoweredOn {
            debug!(
                "connect to {} ignored, adapter is {}",
                address,
                self.shared.status()
            );
            return Ok(handle);
        }

        match self.shared.callbacks.entry(address.clone()) {
            Entry::Occupied(_) => return Ok(handle),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(callbacks)));
            }
        }

        let driver = self.shared.backend.clone();
        let events_tx = self.shared.events_tx.clone();
        self.shared.handle.spawn(async move {
            match driver.connect(&address).await {
                Ok(info) => {
                    let _ = events_tx.send(InternalEvent::Connected { address, info });
                }
                Err(err) => {
                    debug!("connection to {} failed: {}", address, err);
                    let _ = events_tx.send(InternalEvent::ConnectFailed { address });
                }
            }
        });
        Ok(handle)
    }

    /// Request a disconnect. The device record is removed from the tree once
    /// the driver confirms.
    pub fn disconnect(&self, device: &BleDevice) {
        let address = device.address.clone();
        let driver = self.shared.backend.clone();
        let events_tx = self.shared.events_tx.clone();
        self.shared.handle.spawn(async move {
            match driver.disconnect(&address).await {
                Ok(()) => {
                    let _ = events_tx.send(InternalEvent::Disconnected { address });
                }
                Err(err) => debug!("disconnect from {} failed: {}", address, err),
            }
        });
    }

    /// The usable write payload size negotiated for this device
    /// (ATT MTU - 3), or [`DEFAULT_MAX_PDU_SIZE`] when the backend could not
    /// discover it.
    pub fn maximum_value_length(&self, device: &BleDevice) -> usize {
        device
            .state
            .get_int(keys::MAX_PDU_SIZE)
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAX_PDU_SIZE)
    }

    /// A stream of [`CentralEvent`]s mirroring the tree changes, for hosts
    /// that prefer async iteration over listeners.
    pub fn events(&self) -> Pin<Box<dyn Stream<Item = CentralEvent> + Send>> {
        let receiver = self.shared.central_tx.subscribe();
        Box::pin(BroadcastStream::new(receiver).filter_map(|event| async move { event.ok() }))
    }
}

impl Debug for BleAdapter {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("BleAdapter")
            .field("status", &self.status())
            .field("state", &self.shared.root)
            .finish()
    }
}

impl Drop for BleAdapter {
    fn drop(&mut self) {
        self.shared.root.remove_listener(self.router);
        let _ = self.shared.events_tx.send(InternalEvent::Shutdown);

        let driver = self.shared.backend.clone();
        let scanning = self.shared.scan.lock().unwrap().accepts_advertisements();
        let connected: Vec<String> = self
            .shared
            .callbacks
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        self.shared.handle.spawn(async move {
            if scanning {
                let _ = driver.scan_stop().await;
            }
            for address in connected {
                let _ = driver.disconnect(&address).await;
            }
        });
    }
}

fn forward_driver_events(
    handle: &Handle,
    mut driver_events: EventReceiver,
    events_tx: mpsc::UnboundedSender<InternalEvent>,
) {
    handle.spawn(async move {
        while let Some(event) = driver_events.recv().await {
            if events_tx.send(InternalEvent::Backend(event)).is_err() {
                break;
            }
        }
    });
}

async fn dispatch_loop(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<InternalEvent>) {
    let mut sweep = interval(AGING_TICK);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if !shared.apply(event) {
                        break;
                    }
                }
                None => break,
            },
            _ = sweep.tick() => shared.sweep_stale(),
        }
    }
}

impl Shared {
    fn status(&self) -> AdapterStatus {
        self.root
            .get_int(keys::STATUS)
            .and_then(AdapterStatus::from_i64)
            .unwrap_or_default()
    }

    fn now_ms(&self) -> i64 {
        (Instant::now() - self.epoch).as_millis() as i64
    }

    fn emit(&self, event: CentralEvent) {
        if let Err(unsent) = self.central_tx.send(event) {
            trace!("no event stream subscribers for {:?}", unsent.0);
        }
    }

    fn find_device(&self, address: &str) -> Option<TreeNode> {
        self.root.get_child_with_property(keys::ADDRESS, address)
    }

    // ---- command routing (runs on whichever thread inserted the command) --

    fn route_command(self: &Arc<Self>, parent: &TreeNode, child: &TreeNode) {
        match child.kind() {
            NodeKind::Scan if parent.has_type(NodeKind::Adapter) => {
                let should_start = child.get_bool(keys::SHOULD_START).unwrap_or(false);
                let services = child
                    .children_of_kind(NodeKind::Service)
                    .iter()
                    .filter_map(|entry| entry.get_uuid(keys::UUID))
                    .collect();
                self.command_scan(should_start, services);
            }
            NodeKind::DiscoverServices if parent.has_type(NodeKind::Device) => {
                self.command_discover_services(parent);
            }
            NodeKind::DiscoverCharacteristics if parent.has_type(NodeKind::Service) => {
                self.command_discover_characteristics(parent);
            }
            NodeKind::EnableNotifications if parent.has_type(NodeKind::Characteristic) => {
                self.command_subscribe(parent, Subscription::Notifications);
            }
            NodeKind::EnableIndications if parent.has_type(NodeKind::Characteristic) => {
                self.command_subscribe(parent, Subscription::Indications);
            }
            _ => {}
        }
    }

    fn powered_on(&self, command: &str) -> bool {
        let status = self.status();
        if status != AdapterStatus::PoweredOn {
            debug!("{} ignored, adapter is {}", command, status);
            return false;
        }
        true
    }

    fn command_scan(self: &Arc<Self>, should_start: bool, services: Vec<Uuid>) {
        if !self.powered_on("SCAN") {
            return;
        }
        let action = self
            .scan
            .lock()
            .unwrap()
            .request(should_start, ScanFilter { services });
        self.run_scan_action(action);
    }

    fn run_scan_action(self: &Arc<Self>, action: Option<ScanAction>) {
        let driver = self.backend.clone();
        let events_tx = self.events_tx.clone();
        match action {
            Some(ScanAction::Start(filter)) => {
                self.handle.spawn(async move {
                    let deadline = Instant::now() + SCAN_START_BUDGET;
                    loop {
                        match driver.scan_start(&filter).await {
                            Ok(()) => {
                                let _ = events_tx.send(InternalEvent::ScanStarted);
                                break;
                            }
                            Err(Error::NotReady) if Instant::now() + SCAN_RETRY_INTERVAL <= deadline => {
                                trace!("adapter not ready for scanning yet, retrying");
                                sleep(SCAN_RETRY_INTERVAL).await;
                            }
                            Err(err) => {
                                warn!("could not start scanning: {}", err);
                                let _ = events_tx.send(InternalEvent::ScanStartFailed);
                                break;
                            }
                        }
                    }
                });
            }
            Some(ScanAction::Stop) => {
                self.handle.spawn(async move {
                    if let Err(err) = driver.scan_stop().await {
                        debug!("scan stop reported: {}", err);
                    }
                    let _ = events_tx.send(InternalEvent::ScanStopped);
                });
            }
            None => {}
        }
    }

    fn command_discover_services(self: &Arc<Self>, device: &TreeNode) {
        if !self.powered_on("DISCOVER_SERVICES") {
            return;
        }
        if device.get_bool(keys::IS_CONNECTED) != Some(true) {
            debug!("DISCOVER_SERVICES ignored, device is not connected");
            return;
        }
        let Some(address) = device.get_string(keys::ADDRESS) else {
            return;
        };
        let driver = self.backend.clone();
        let events_tx = self.events_tx.clone();
        self.handle.spawn(async move {
            match driver.discover_services(&address).await {
                Ok(services) => {
                    let _ = events_tx.send(InternalEvent::ServicesDiscovered { address, services });
                }
                Err(err) => debug!("service discovery on {} failed: {}", address, err),
            }
        });
    }

    fn command_discover_characteristics(self: &Arc<Self>, service: &TreeNode) {
        if !self.powered_on("DISCOVER_CHARACTERISTICS") {
            return;
        }
        let Some(device) = service.find_ancestor(NodeKind::Device) else {
            return;
        };
        if device.get_bool(keys::IS_CONNECTED) != Some(true) {
            debug!("DISCOVER_CHARACTERISTICS ignored, device is not connected");
            return;
        }
        let (Some(address), Some(service_uuid)) = (
            device.get_string(keys::ADDRESS),
            service.get_uuid(keys::UUID),
        ) else {
            return;
        };
        let Some(backend_ref) = service.get_string(keys::BACKEND_REF) else {
            debug!("DISCOVER_CHARACTERISTICS ignored, service {} was never enumerated", service_uuid);
            return;
        };
        let driver = self.backend.clone();
        let events_tx = self.events_tx.clone();
        self.handle.spawn(async move {
            match driver.discover_characteristics(&backend_ref).await {
                Ok(characteristics) => {
                    let _ = events_tx.send(InternalEvent::CharacteristicsDiscovered {
                        address,
                        service_uuid,
                        characteristics,
                    });
                }
                Err(err) => debug!(
                    "characteristic discovery on {} failed: {}",
                    service_uuid, err
                ),
            }
        });
    }

    fn command_subscribe(self: &Arc<Self>, characteristic: &TreeNode, subscription: Subscription) {
        if !self.powered_on("ENABLE_NOTIFICATIONS") {
            return;
        }
        let Some(device) = characteristic.find_ancestor(NodeKind::Device) else {
            return;
        };
        if device.get_bool(keys::IS_CONNECTED) != Some(true) {
            debug!("subscription ignored, device is not connected");
            return;
        }
        let (Some(address), Some(uuid), Some(backend_ref)) = (
            device.get_string(keys::ADDRESS),
            characteristic.get_uuid(keys::UUID),
            characteristic.get_string(keys::BACKEND_REF),
        ) else {
            return;
        };
        let driver = self.backend.clone();
        let events_tx = self.events_tx.clone();
        self.handle.spawn(async move {
            match driver.subscribe(&backend_ref, subscription).await {
                Ok(()) => {
                    let _ = events_tx.send(InternalEvent::SubscriptionActive { address, uuid });
                }
                Err(err) => debug!("subscribing to {} failed: {}", uuid, err),
            }
        });
    }

    // ---- write queue -----------------------------------------------------

    fn enqueue_write(
        self: &Arc<Self>,
        device: &BleDevice,
        uuid: Uuid,
        data: &[u8],
        write_type: WriteType,
    ) {
        let state = device.state();
        if state.parent().is_none() || state.get_bool(keys::IS_CONNECTED) != Some(true) {
            debug!(
                "dropping write to {}: device is gone or not connected",
                device.address()
            );
            return;
        }
        let Some(backend_ref) =
            find_characteristic(&state, uuid).and_then(|c| c.get_string(keys::BACKEND_REF))
        else {
            debug!(
                "dropping write to {}: characteristic {} was never discovered",
                device.address(),
                uuid
            );
            return;
        };
        let write = PendingWrite {
            uuid,
            data: data.to_vec(),
            write_type,
            backend_ref,
        };
        let started = match self.write_queues.get_mut(device.address()) {
            Some(mut queue) => queue.push(write),
            None => {
                debug!("dropping write to {}: no active connection", device.address());
                return;
            }
        };
        if let Some(write) = started {
            self.start_write(device.address().to_owned(), write);
        }
    }

    fn start_write(self: &Arc<Self>, address: String, write: PendingWrite) {
        let driver = self.backend.clone();
        let events_tx = self.events_tx.clone();
        self.handle.spawn(async move {
            let ok = match driver
                .write(&write.backend_ref, &write.data, write.write_type)
                .await
            {
                Ok(()) => true,
                Err(err) => {
                    debug!("write to {} failed: {}", write.uuid, err);
                    false
                }
            };
            let _ = events_tx.send(InternalEvent::WriteComplete {
                address,
                uuid: write.uuid,
                ok,
            });
        });
    }

    // ---- event application (dispatcher task only) ------------------------

    fn apply(self: &Arc<Self>, event: InternalEvent) -> bool {
        match event {
            InternalEvent::Backend(event) => self.apply_backend(event),
            InternalEvent::Opened(info) => {
                if let Some(name) = info.name {
                    self.root.set_property(keys::NAME, name);
                }
                self.apply_status(info.status);
            }
            InternalEvent::ScanStarted => {
                let action = self.scan.lock().unwrap().started();
                self.run_scan_action(action);
            }
            InternalEvent::ScanStartFailed => {
                self.scan.lock().unwrap().failed();
                self.apply_status(AdapterStatus::Disabled);
            }
            InternalEvent::ScanStopped => self.scan.lock().unwrap().stopped(),
            InternalEvent::Connected { address, info } => self.apply_connected(address, info),
            InternalEvent::ConnectFailed { address } => {
                self.callbacks.remove(&address);
                self.write_queues.remove(&address);
            }
            InternalEvent::Disconnected { address } => self.apply_disconnected(&address),
            InternalEvent::ServicesDiscovered { address, services } => {
                self.apply_services_discovered(address, services);
            }
            InternalEvent::CharacteristicsDiscovered {
                address,
                service_uuid,
                characteristics,
            } => self.apply_characteristics_discovered(&address, service_uuid, characteristics),
            InternalEvent::SubscriptionActive { address, uuid } => {
                self.apply_subscription_active(&address, uuid);
            }
            InternalEvent::WriteComplete { address, uuid, ok } => {
                self.apply_write_complete(address, uuid, ok);
            }
            InternalEvent::Shutdown => return false,
        }
        true
    }

    fn apply_backend(self: &Arc<Self>, event: BackendEvent) {
        match event {
            BackendEvent::StatusChanged(status) => self.apply_status(status),
            BackendEvent::Advertisement(advertisement) => {
                self.apply_advertisement(advertisement);
            }
            BackendEvent::MaxPduSizeChanged {
                address,
                max_pdu_size,
            } => {
                if let Some(device) = self.find_device(&address) {
                    device.set_property(keys::MAX_PDU_SIZE, i64::from(max_pdu_size));
                }
            }
            BackendEvent::DeviceDisconnected { address } => self.apply_disconnected(&address),
            BackendEvent::ValueChanged {
                address,
                uuid,
                value,
            } => self.apply_value_changed(&address, uuid, &value),
        }
    }

    fn apply_status(&self, status: AdapterStatus) {
        if self.status() == status {
            return;
        }
        self.root.set_property(keys::STATUS, status as i64);
        self.emit(CentralEvent::AdapterStatusChanged(status));
        if status != AdapterStatus::PoweredOn {
            // A powered-down radio stops delivering advertisements. Device
            // records stay put; the aging sweep takes care of them.
            self.scan.lock().unwrap().power_lost();
        }
    }

    fn apply_advertisement(&self, advertisement: Advertisement) {
        let (accepting, filter) = {
            let scan = self.scan.lock().unwrap();
            (scan.accepts_advertisements(), scan.filter().clone())
        };
        if !accepting && !advertisement.connected {
            trace!(
                "dropping advertisement from {} outside an active scan",
                advertisement.address
            );
            return;
        }
        let filtered = !filter.is_empty();
        // The OS applies the filter too, but not every backend filters
        // reliably; reject reports whose advertised services are known not
        // to intersect it.
        if filtered
            && !advertisement.connected
            && !advertisement.services.is_empty()
            && !advertisement
                .services
                .iter()
                .any(|uuid| filter.services.contains(uuid))
        {
            trace!(
                "dropping advertisement from {} outside the service filter",
                advertisement.address
            );
            return;
        }

        let named = advertisement
            .name
            .as_deref()
            .is_some_and(|name| !name.is_empty());

        if let Some(device) = self.find_device(&advertisement.address) {
            if named {
                device.set_property(keys::NAME, advertisement.name.unwrap_or_default());
            }
            if let Some(rssi) = advertisement.rssi {
                device.set_property(keys::RSSI, i64::from(rssi));
            }
            if advertisement.connected {
                device.set_property(keys::IS_CONNECTED, true);
            }
            device.set_property(keys::LAST_SEEN, self.now_ms());
            self.emit(CentralEvent::DeviceUpdated(advertisement.address));
        } else {
            // Filtered advertisements frequently omit the local name; hold
            // the device back until a scan response supplies one.
            if filtered && !named && !advertisement.connected {
                trace!(
                    "holding back unnamed advertiser {} during a filtered scan",
                    advertisement.address
                );
                return;
            }
            let device = TreeNode::new(NodeKind::Device);
            device.set_property(keys::ADDRESS, advertisement.address.clone());
            device.set_property(keys::NAME, advertisement.name.unwrap_or_default());
            if let Some(rssi) = advertisement.rssi {
                device.set_property(keys::RSSI, i64::from(rssi));
            }
            device.set_property(keys::IS_CONNECTED, advertisement.connected);
            device.set_property(keys::LAST_SEEN, self.now_ms());
            self.root.append_child(&device);
            self.emit(CentralEvent::DeviceDiscovered(advertisement.address));
        }
    }

    fn apply_connected(self: &Arc<Self>, address: String, info: ConnectionInfo) {
        let Some(device) = self.find_device(&address) else {
            // The record aged out while the link was being established.
            debug!("{} connected but its record is gone, disconnecting", address);
            self.callbacks.remove(&address);
            let driver = self.backend.clone();
            self.handle.spawn(async move {
                let _ = driver.disconnect(&address).await;
            });
            return;
        };
        let max_pdu = info
            .max_pdu_size
            .map(usize::from)
            .unwrap_or(DEFAULT_MAX_PDU_SIZE);
        device.set_property(keys::MAX_PDU_SIZE, max_pdu as i64);
        device.set_property(keys::LAST_SEEN, self.now_ms());
        self.write_queues
            .insert(address.clone(), WriteQueue::default());
        // Set last: hosts react to this flag and expect max_pdu_size set.
        device.set_property(keys::IS_CONNECTED, true);
        self.emit(CentralEvent::DeviceConnected(address));
    }

    fn apply_disconnected(&self, address: &str) {
        let Some(device) = self.find_device(address) else {
            // The record is already gone; drop any leftovers.
            self.write_queues.remove(address);
            self.callbacks.remove(address);
            return;
        };
        if device.get_bool(keys::IS_CONNECTED) != Some(true) {
            // A link event for a device that is still connecting; the
            // connect attempt reports its own failure.
            return;
        }
        // Pending writes are discarded without callbacks; the disconnect
        // itself is the terminal event.
        self.write_queues.remove(address);
        self.callbacks.remove(address);
        self.root.remove_child(&device);
        self.emit(CentralEvent::DeviceDisconnected(address.to_owned()));
    }

    fn apply_services_discovered(&self, address: String, services: Vec<ServiceSpec>) {
        let Some(device) = self.find_device(&address) else {
            debug!("services discovered for unknown device {}", address);
            return;
        };
        for spec in services {
            let existing = device.get_child_with_property(keys::UUID, spec.uuid);
            let node = existing
                .clone()
                .unwrap_or_else(|| TreeNode::new(NodeKind::Service));
            node.set_property(keys::UUID, spec.uuid);
            if let Some(handle) = spec.handle_start {
                node.set_property(keys::HANDLE_START, handle);
            }
            if let Some(handle) = spec.handle_end {
                node.set_property(keys::HANDLE_END, handle);
            }
            node.set_property(keys::BACKEND_REF, spec.backend_ref);
            if existing.is_none() {
                device.append_child(&node);
            }
        }
        tree::message(&device, NodeKind::ServicesDiscovered);
        self.emit(CentralEvent::ServicesDiscovered(address));
    }

    fn apply_characteristics_discovered(
        &self,
        address: &str,
        service_uuid: Uuid,
        characteristics: Vec<CharacteristicSpec>,
    ) {
        let Some(service) = self
            .find_device(address)
            .and_then(|device| device.get_child_with_property(keys::UUID, service_uuid))
        else {
            debug!(
                "characteristics discovered for unknown service {} on {}",
                service_uuid, address
            );
            return;
        };
        let handle_start = service.get_int(keys::HANDLE_START);
        let handle_end = service.get_int(keys::HANDLE_END);

        for spec in characteristics {
            if let (Some(handle), Some(start), Some(end)) =
                (spec.handle, handle_start, handle_end)
            {
                if i64::from(handle) < start || i64::from(handle) > end {
                    debug!(
                        "characteristic {} handle {:#06x} lies outside its service, skipping",
                        spec.uuid, handle
                    );
                    continue;
                }
            }
            let existing = service.get_child_with_property(keys::UUID, spec.uuid);
            let node = existing
                .clone()
                .unwrap_or_else(|| TreeNode::new(NodeKind::Characteristic));
            node.set_property(keys::UUID, spec.uuid);
            node.set_property(keys::PROPERTIES, i64::from(spec.properties.bits()));
            if let Some(handle) = spec.handle {
                node.set_property(keys::HANDLE, handle);
            }
            if let Some(handle) = spec.value_handle {
                node.set_property(keys::VALUE_HANDLE, handle);
            }
            node.set_property(
                keys::CAN_WRITE_WITH_RESPONSE,
                spec.properties.contains(crate::api::CharPropFlags::WRITE),
            );
            node.set_property(
                keys::CAN_WRITE_WITHOUT_RESPONSE,
                spec.properties
                    .contains(crate::api::CharPropFlags::WRITE_WITHOUT_RESPONSE),
            );
            node.set_property(keys::BACKEND_REF, spec.backend_ref);
            if existing.is_none() {
                service.append_child(&node);
            }
        }
    }

    fn apply_subscription_active(&self, address: &str, uuid: Uuid) {
        let Some(characteristic) = self
            .find_device(address)
            .and_then(|device| find_characteristic(&device, uuid))
        else {
            return;
        };
        tree::message(&characteristic, NodeKind::NotificationsAreEnabled);
    }

    fn apply_value_changed(&self, address: &str, uuid: Uuid, value: &[u8]) {
        let Some(bundle) = self.callbacks.get(address).map(|entry| entry.value().clone()) else {
            trace!("notification from {} without registered callbacks", address);
            return;
        };
        (bundle.lock().unwrap().value_changed)(uuid, value);
    }

    fn apply_write_complete(self: &Arc<Self>, address: String, uuid: Uuid, ok: bool) {
        if let Some(bundle) = self.callbacks.get(&address).map(|entry| entry.value().clone()) {
            (bundle.lock().unwrap().characteristic_written)(uuid, ok);
        }
        let next = self
            .write_queues
            .get_mut(&address)
            .and_then(|mut queue| queue.complete());
        if let Some(write) = next {
            self.start_write(address, write);
        }
    }

    fn sweep_stale(&self) {
        let now = self.now_ms();
        for device in self.root.children_of_kind(NodeKind::Device) {
            if device.get_bool(keys::IS_CONNECTED) == Some(true) {
                continue;
            }
            let last_seen = device.get_int(keys::LAST_SEEN).unwrap_or(now);
            if now - last_seen > DEVICE_TIMEOUT_MS {
                if let Some(address) = device.get_string(keys::ADDRESS) {
                    debug!("removing stale advertiser {}", address);
                    self.write_queues.remove(&address);
                    self.callbacks.remove(&address);
                }
                self.root.remove_child(&device);
            }
        }
    }
}

fn find_characteristic(device: &TreeNode, uuid: Uuid) -> Option<TreeNode> {
    device
        .children_of_kind(NodeKind::Service)
        .into_iter()
        .find_map(|service| service.get_child_with_property(keys::UUID, uuid))
}
