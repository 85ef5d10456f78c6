// blecentral Source Code File
//
// Copyright 2023 the blecentral developers. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! End-to-end tests of the adapter core against the scriptable mock driver.
//! Timers (the aging sweep and the scan-start retry loop) run on the paused
//! test clock, so every scenario is deterministic.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::Notify;
use tokio::task::yield_now;
use tokio::time::advance;
use uuid::Uuid;

use super::mock::MockBackend;
use super::{BleAdapter, BleDevice, DEFAULT_MAX_PDU_SIZE};
use crate::api::bleuuid::uuid_from_u16;
use crate::api::{AdapterStatus, CentralEvent, CharPropFlags, DeviceCallbacks, WriteType};
use crate::backend::{Advertisement, BackendEvent, CharacteristicSpec, ServiceSpec};
use crate::tree::{self, keys, NodeKind, TreeNode};

const WAVE: &str = "AA:BB:CC:DD:EE:FF";
const HEART_RATE_SERVICE: Uuid = uuid_from_u16(0x180d);
const HEART_RATE_MEASUREMENT: Uuid = uuid_from_u16(0x2a37);

/// Let every spawned task and the dispatcher run until nothing is runnable.
async fn settle() {
    for _ in 0..64 {
        yield_now().await;
    }
}

fn advertisement(address: &str, name: Option<&str>, rssi: i16) -> Advertisement {
    Advertisement {
        address: address.to_owned(),
        name: name.map(str::to_owned),
        rssi: Some(rssi),
        services: Vec::new(),
        connected: false,
    }
}

async fn powered_adapter() -> (BleAdapter, Arc<MockBackend>) {
    let (mock, events) = MockBackend::create();
    let adapter = BleAdapter::with_backend(mock.clone(), events);
    settle().await;
    assert_eq!(adapter.status(), AdapterStatus::PoweredOn);
    (adapter, mock)
}

/// Script a heart-rate GATT database into the mock driver.
fn install_heart_rate_gatt(mock: &MockBackend) {
    mock.services.lock().unwrap().insert(
        WAVE.to_owned(),
        vec![ServiceSpec {
            uuid: HEART_RATE_SERVICE,
            handle_start: Some(0x0010),
            handle_end: Some(0x0020),
            backend_ref: "srv:180d".to_owned(),
        }],
    );
    mock.characteristics.lock().unwrap().insert(
        "srv:180d".to_owned(),
        vec![CharacteristicSpec {
            uuid: HEART_RATE_MEASUREMENT,
            properties: CharPropFlags::NOTIFY | CharPropFlags::WRITE,
            handle: Some(0x0015),
            value_handle: Some(0x0016),
            backend_ref: "chr:2a37".to_owned(),
        }],
    );
}

async fn discovered_device(adapter: &BleAdapter, mock: &MockBackend) -> TreeNode {
    adapter.scan(true, &[]);
    settle().await;
    mock.send(BackendEvent::Advertisement(advertisement(
        WAVE,
        Some("wave"),
        -54,
    )));
    settle().await;
    adapter
        .state()
        .get_child_with_property(keys::ADDRESS, WAVE)
        .expect("advertised device should have a record")
}

type WrittenLog = Arc<Mutex<Vec<(Uuid, bool)>>>;
type NotifiedLog = Arc<Mutex<Vec<(Uuid, Vec<u8>)>>>;

fn recording_callbacks() -> (DeviceCallbacks, NotifiedLog, WrittenLog) {
    let notified: NotifiedLog = Arc::new(Mutex::new(Vec::new()));
    let written: WrittenLog = Arc::new(Mutex::new(Vec::new()));
    let notified_sink = notified.clone();
    let written_sink = written.clone();
    let callbacks = DeviceCallbacks::new(
        move |uuid, data| notified_sink.lock().unwrap().push((uuid, data.to_vec())),
        move |uuid, ok| written_sink.lock().unwrap().push((uuid, ok)),
    );
    (callbacks, notified, written)
}

/// Full path from scan to a discovered heart-rate characteristic.
async fn connected_heart_rate_device(
    adapter: &BleAdapter,
    mock: &MockBackend,
) -> (BleDevice, NotifiedLog, WrittenLog) {
    install_heart_rate_gatt(mock);
    let record = discovered_device(adapter, mock).await;
    let (callbacks, notified, written) = recording_callbacks();
    let device = adapter.connect(&record, callbacks).unwrap();
    settle().await;
    assert_eq!(record.get_bool(keys::IS_CONNECTED), Some(true));

    tree::message(&record, NodeKind::DiscoverServices);
    settle().await;
    let service = record
        .get_child_with_property(keys::UUID, HEART_RATE_SERVICE)
        .expect("heart-rate service record");
    tree::message(&service, NodeKind::DiscoverCharacteristics);
    settle().await;
    assert!(service
        .get_child_with_property(keys::UUID, HEART_RATE_MEASUREMENT)
        .is_some());
    (device, notified, written)
}

#[tokio::test(start_paused = true)]
async fn adapter_status_arrives_asynchronously() {
    let (mock, events) = MockBackend::create();
    let adapter = BleAdapter::with_backend(mock.clone(), events);
    assert_eq!(adapter.status(), AdapterStatus::Disabled);
    let mut stream = adapter.events();

    settle().await;
    assert_eq!(adapter.status(), AdapterStatus::PoweredOn);
    assert_eq!(
        adapter.state().get_string(keys::NAME).as_deref(),
        Some("mock0")
    );
    assert!(matches!(
        stream.next().await,
        Some(CentralEvent::AdapterStatusChanged(AdapterStatus::PoweredOn))
    ));
}

#[tokio::test(start_paused = true)]
async fn scan_discovers_an_advertiser() {
    let (adapter, mock) = powered_adapter().await;
    let device = discovered_device(&adapter, &mock).await;

    assert_eq!(mock.calls_with_prefix("scan_start").len(), 1);
    assert_eq!(device.get_string(keys::NAME).as_deref(), Some("wave"));
    assert_eq!(device.get_string(keys::ADDRESS).as_deref(), Some(WAVE));
    assert_eq!(device.get_int(keys::RSSI), Some(-54));
    assert_eq!(device.get_bool(keys::IS_CONNECTED), Some(false));
    assert!(device.get_int(keys::LAST_SEEN).is_some());
}

#[tokio::test(start_paused = true)]
async fn repeated_advertisements_update_in_place() {
    let (adapter, mock) = powered_adapter().await;
    let device = discovered_device(&adapter, &mock).await;

    mock.send(BackendEvent::Advertisement(advertisement(WAVE, None, -61)));
    settle().await;

    assert_eq!(adapter.state().children_of_kind(NodeKind::Device).len(), 1);
    assert_eq!(device.get_int(keys::RSSI), Some(-61));
    // An advertisement without a name must not clobber the known one.
    assert_eq!(device.get_string(keys::NAME).as_deref(), Some("wave"));
}

#[tokio::test(start_paused = true)]
async fn scan_commands_are_idempotent() {
    let (adapter, mock) = powered_adapter().await;

    adapter.scan(false, &[]);
    settle().await;
    assert!(mock.calls_with_prefix("scan_stop").is_empty());

    adapter.scan(true, &[]);
    adapter.scan(true, &[]);
    settle().await;
    assert_eq!(mock.calls_with_prefix("scan_start").len(), 1);

    adapter.scan(false, &[]);
    adapter.scan(false, &[]);
    settle().await;
    assert_eq!(mock.calls_with_prefix("scan_stop").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn advertisements_after_stop_are_dropped() {
    let (adapter, mock) = powered_adapter().await;
    adapter.scan(true, &[]);
    settle().await;
    adapter.scan(false, &[]);
    settle().await;

    mock.send(BackendEvent::Advertisement(advertisement(
        WAVE,
        Some("wave"),
        -54,
    )));
    settle().await;
    assert!(adapter.state().children_of_kind(NodeKind::Device).is_empty());
}

#[tokio::test(start_paused = true)]
async fn scan_start_retries_through_transient_failures() {
    let (mock, events) = MockBackend::create();
    // Attempts at 0 ms..900 ms fail; the one at 950 ms succeeds.
    mock.scan_start_failures.store(19, std::sync::atomic::Ordering::SeqCst);
    let adapter = BleAdapter::with_backend(mock.clone(), events);
    settle().await;

    adapter.scan(true, &[]);
    settle().await;
    for _ in 0..19 {
        advance(Duration::from_millis(50)).await;
        settle().await;
    }

    assert_eq!(mock.calls_with_prefix("scan_start").len(), 20);
    assert_eq!(adapter.status(), AdapterStatus::PoweredOn);

    // The scan really is running: advertisements are accepted.
    mock.send(BackendEvent::Advertisement(advertisement(
        WAVE,
        Some("wave"),
        -54,
    )));
    settle().await;
    assert_eq!(adapter.state().children_of_kind(NodeKind::Device).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn scan_start_exhaustion_disables_the_adapter() {
    let (mock, events) = MockBackend::create();
    mock.scan_start_failures.store(usize::MAX, std::sync::atomic::Ordering::SeqCst);
    let adapter = BleAdapter::with_backend(mock.clone(), events);
    settle().await;

    adapter.scan(true, &[]);
    settle().await;
    for _ in 0..25 {
        advance(Duration::from_millis(50)).await;
        settle().await;
    }

    // One attempt every 50 ms within the 1 s budget, then give up.
    assert_eq!(mock.calls_with_prefix("scan_start").len(), 21);
    assert_eq!(adapter.status(), AdapterStatus::Disabled);
}

#[tokio::test(start_paused = true)]
async fn filtered_scan_passes_uuids_and_defers_nameless_devices() {
    let (adapter, mock) = powered_adapter().await;
    adapter.scan(true, &[HEART_RATE_SERVICE]);
    settle().await;

    let starts = mock.calls_with_prefix("scan_start");
    assert_eq!(starts.len(), 1);
    assert!(starts[0].contains("0000180d"), "filter not forwarded: {}", starts[0]);

    // An advertiser of some other service never surfaces, named or not.
    mock.send(BackendEvent::Advertisement(Advertisement {
        address: "11:22:33:44:55:66".to_owned(),
        name: Some("other".to_owned()),
        rssi: Some(-40),
        services: vec![uuid_from_u16(0x1815)],
        connected: false,
    }));
    settle().await;
    assert!(adapter.state().children_of_kind(NodeKind::Device).is_empty());

    // A matching advertisement without a name must not surface a device yet.
    mock.send(BackendEvent::Advertisement(advertisement(WAVE, None, -54)));
    settle().await;
    assert!(adapter.state().children_of_kind(NodeKind::Device).is_empty());

    // The scan response carrying the name does.
    mock.send(BackendEvent::Advertisement(advertisement(
        WAVE,
        Some("wave"),
        -54,
    )));
    settle().await;
    let device = adapter
        .state()
        .get_child_with_property(keys::ADDRESS, WAVE)
        .unwrap();
    assert_eq!(device.get_string(keys::NAME).as_deref(), Some("wave"));
}

#[tokio::test(start_paused = true)]
async fn connect_discover_and_notify() {
    let (adapter, mock) = powered_adapter().await;

    let observed = Arc::new(Mutex::new(Vec::new()));
    let observed_sink = observed.clone();
    adapter.state().on_child_added(move |parent, child| {
        if child.kind().is_command() {
            observed_sink
                .lock()
                .unwrap()
                .push((parent.kind(), child.kind()));
        }
    });

    mock.max_pdu_size.lock().unwrap().replace(244);
    let (device, notified, _written) = connected_heart_rate_device(&adapter, &mock).await;
    assert_eq!(adapter.maximum_value_length(&device), 244);

    let record = device.state();
    let service = record
        .get_child_with_property(keys::UUID, HEART_RATE_SERVICE)
        .unwrap();
    let characteristic = service
        .get_child_with_property(keys::UUID, HEART_RATE_MEASUREMENT)
        .unwrap();
    assert_eq!(
        characteristic.get_bool(keys::CAN_WRITE_WITH_RESPONSE),
        Some(true)
    );
    assert_eq!(
        characteristic.get_bool(keys::CAN_WRITE_WITHOUT_RESPONSE),
        Some(false)
    );

    tree::message(&characteristic, NodeKind::EnableNotifications);
    settle().await;
    assert_eq!(mock.calls_with_prefix("subscribe").len(), 1);
    assert!(observed
        .lock()
        .unwrap()
        .contains(&(NodeKind::Characteristic, NodeKind::NotificationsAreEnabled)));
    assert!(observed
        .lock()
        .unwrap()
        .contains(&(NodeKind::Device, NodeKind::ServicesDiscovered)));

    mock.send(BackendEvent::ValueChanged {
        address: WAVE.to_owned(),
        uuid: HEART_RATE_MEASUREMENT,
        value: vec![0x06, 72],
    });
    settle().await;
    assert_eq!(
        &*notified.lock().unwrap(),
        &[(HEART_RATE_MEASUREMENT, vec![0x06, 72])]
    );
}

#[tokio::test(start_paused = true)]
async fn repeated_service_discovery_does_not_duplicate_records() {
    let (adapter, mock) = powered_adapter().await;
    let (device, _notified, _written) = connected_heart_rate_device(&adapter, &mock).await;

    let record = device.state();
    tree::message(&record, NodeKind::DiscoverServices);
    settle().await;

    assert_eq!(record.children_of_kind(NodeKind::Service).len(), 1);
    assert_eq!(mock.calls_with_prefix("discover_services").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn out_of_range_characteristics_are_rejected() {
    let (adapter, mock) = powered_adapter().await;
    install_heart_rate_gatt(&mock);
    mock.characteristics
        .lock()
        .unwrap()
        .get_mut("srv:180d")
        .unwrap()
        .push(CharacteristicSpec {
            uuid: uuid_from_u16(0x2a38),
            properties: CharPropFlags::READ,
            // Outside the service's 0x0010..0x0020 handle range.
            handle: Some(0x0030),
            value_handle: None,
            backend_ref: "chr:2a38".to_owned(),
        });

    let record = discovered_device(&adapter, &mock).await;
    let (callbacks, _notified, _written) = recording_callbacks();
    adapter.connect(&record, callbacks).unwrap();
    settle().await;
    tree::message(&record, NodeKind::DiscoverServices);
    settle().await;
    let service = record
        .get_child_with_property(keys::UUID, HEART_RATE_SERVICE)
        .unwrap();
    tree::message(&service, NodeKind::DiscoverCharacteristics);
    settle().await;

    assert!(service
        .get_child_with_property(keys::UUID, HEART_RATE_MEASUREMENT)
        .is_some());
    assert!(service
        .get_child_with_property(keys::UUID, uuid_from_u16(0x2a38))
        .is_none());
}

#[tokio::test(start_paused = true)]
async fn connect_is_idempotent() {
    let (adapter, mock) = powered_adapter().await;
    let (device, notified, _written) = connected_heart_rate_device(&adapter, &mock).await;

    let (other_callbacks, other_notified, _) = recording_callbacks();
    let second = adapter.connect(&device.state(), other_callbacks).unwrap();
    settle().await;

    assert_eq!(mock.calls_with_prefix("connect").len(), 1);
    assert_eq!(second.address(), device.address());
    assert!(second.state().is_same_node(&device.state()));

    // The original callback bundle stays registered.
    mock.send(BackendEvent::ValueChanged {
        address: WAVE.to_owned(),
        uuid: HEART_RATE_MEASUREMENT,
        value: vec![1],
    });
    settle().await;
    assert_eq!(notified.lock().unwrap().len(), 1);
    assert!(other_notified.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn writes_are_serialized_per_device() {
    let (adapter, mock) = powered_adapter().await;
    let (device, _notified, written) = connected_heart_rate_device(&adapter, &mock).await;

    let gate = Arc::new(Notify::new());
    mock.write_gate.lock().unwrap().replace(gate.clone());

    device.write(&adapter, HEART_RATE_MEASUREMENT, &[0x01], WriteType::WithResponse);
    device.write(&adapter, HEART_RATE_MEASUREMENT, &[0x02], WriteType::WithResponse);
    settle().await;

    // The second write must not reach the OS until the first completed.
    assert_eq!(mock.calls_with_prefix("write").len(), 1);
    assert!(written.lock().unwrap().is_empty());

    gate.notify_one();
    settle().await;
    assert_eq!(&*written.lock().unwrap(), &[(HEART_RATE_MEASUREMENT, true)]);
    let writes = mock.calls_with_prefix("write");
    assert_eq!(writes.len(), 2);
    assert!(writes[0].contains("[01]"), "{}", writes[0]);
    assert!(writes[1].contains("[02]"), "{}", writes[1]);

    gate.notify_one();
    settle().await;
    assert_eq!(
        &*written.lock().unwrap(),
        &[
            (HEART_RATE_MEASUREMENT, true),
            (HEART_RATE_MEASUREMENT, true)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn disconnect_discards_queued_writes_silently() {
    let (adapter, mock) = powered_adapter().await;
    let (device, _notified, written) = connected_heart_rate_device(&adapter, &mock).await;

    let gate = Arc::new(Notify::new());
    mock.write_gate.lock().unwrap().replace(gate.clone());

    device.write(&adapter, HEART_RATE_MEASUREMENT, &[0x01], WriteType::WithResponse);
    device.write(&adapter, HEART_RATE_MEASUREMENT, &[0x02], WriteType::WithResponse);
    settle().await;

    adapter.disconnect(&device);
    settle().await;
    assert!(adapter
        .state()
        .get_child_with_property(keys::ADDRESS, WAVE)
        .is_none());

    // The in-flight write completes after the link is gone; the queued one
    // never starts, and neither produces a callback.
    gate.notify_one();
    settle().await;
    assert_eq!(mock.calls_with_prefix("write").len(), 1);
    assert!(written.lock().unwrap().is_empty());

    // Writes on the dead handle are dropped without errors.
    device.write(&adapter, HEART_RATE_MEASUREMENT, &[0x03], WriteType::WithResponse);
    settle().await;
    assert_eq!(mock.calls_with_prefix("write").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn link_loss_removes_the_device_record() {
    let (adapter, mock) = powered_adapter().await;
    let (device, _notified, _written) = connected_heart_rate_device(&adapter, &mock).await;

    let removed = Arc::new(Mutex::new(Vec::new()));
    let removed_sink = removed.clone();
    adapter.state().on_child_removed(move |_, child| {
        if child.has_type(NodeKind::Device) {
            removed_sink
                .lock()
                .unwrap()
                .push(child.get_string(keys::ADDRESS));
        }
    });

    mock.send(BackendEvent::DeviceDisconnected {
        address: WAVE.to_owned(),
    });
    settle().await;

    assert!(device.state().parent().is_none());
    assert_eq!(&*removed.lock().unwrap(), &[Some(WAVE.to_owned())]);
}

#[tokio::test(start_paused = true)]
async fn stale_advertisers_age_out() {
    let (adapter, mock) = powered_adapter().await;
    discovered_device(&adapter, &mock).await;

    advance(Duration::from_millis(4500)).await;
    settle().await;
    assert_eq!(adapter.state().children_of_kind(NodeKind::Device).len(), 1);

    advance(Duration::from_millis(1001)).await;
    settle().await;
    assert!(adapter.state().children_of_kind(NodeKind::Device).is_empty());
}

#[tokio::test(start_paused = true)]
async fn connected_devices_are_not_aged_out() {
    let (adapter, mock) = powered_adapter().await;
    let (device, _notified, _written) = connected_heart_rate_device(&adapter, &mock).await;

    advance(Duration::from_secs(30)).await;
    settle().await;
    assert!(device.state().parent().is_some());
    assert_eq!(device.state().get_bool(keys::IS_CONNECTED), Some(true));
}

#[tokio::test(start_paused = true)]
async fn power_loss_stops_the_scan_but_keeps_devices() {
    let (adapter, mock) = powered_adapter().await;
    discovered_device(&adapter, &mock).await;

    mock.send(BackendEvent::StatusChanged(AdapterStatus::PoweredOff));
    settle().await;
    assert_eq!(adapter.status(), AdapterStatus::PoweredOff);

    // The device record survives the power loss (aging will reap it).
    let device = adapter
        .state()
        .get_child_with_property(keys::ADDRESS, WAVE)
        .unwrap();

    // Late advertisements are dropped.
    mock.send(BackendEvent::Advertisement(advertisement(WAVE, None, -99)));
    settle().await;
    assert_eq!(device.get_int(keys::RSSI), Some(-54));

    // Commands are no-ops while powered off.
    adapter.scan(true, &[]);
    settle().await;
    assert_eq!(mock.calls_with_prefix("scan_start").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn commands_are_no_ops_before_power_on() {
    let (mock, events) = MockBackend::create();
    *mock.open_status.lock().unwrap() = AdapterStatus::PoweredOff;
    let adapter = BleAdapter::with_backend(mock.clone(), events);
    settle().await;
    assert_eq!(adapter.status(), AdapterStatus::PoweredOff);

    adapter.scan(true, &[]);
    settle().await;
    assert!(mock.calls_with_prefix("scan_start").is_empty());

    // connect() still hands out a handle, but nothing happens.
    let record = TreeNode::new(NodeKind::Device);
    record.set_property(keys::ADDRESS, WAVE);
    adapter.state().append_child(&record);
    let device = adapter.connect(&record, DeviceCallbacks::default()).unwrap();
    settle().await;
    assert_eq!(device.address(), WAVE);
    assert!(mock.calls_with_prefix("connect").is_empty());
    assert_ne!(record.get_bool(keys::IS_CONNECTED), Some(true));
}

#[tokio::test(start_paused = true)]
async fn system_reported_connections_surface_without_a_scan() {
    let (adapter, mock) = powered_adapter().await;

    mock.send(BackendEvent::Advertisement(Advertisement {
        address: WAVE.to_owned(),
        name: Some("wave".to_owned()),
        rssi: None,
        services: Vec::new(),
        connected: true,
    }));
    settle().await;

    let device = adapter
        .state()
        .get_child_with_property(keys::ADDRESS, WAVE)
        .unwrap();
    assert_eq!(device.get_bool(keys::IS_CONNECTED), Some(true));
}

#[tokio::test(start_paused = true)]
async fn default_max_pdu_size_applies_when_unknown() {
    let (adapter, mock) = powered_adapter().await;
    let (device, _notified, _written) = connected_heart_rate_device(&adapter, &mock).await;
    assert_eq!(adapter.maximum_value_length(&device), DEFAULT_MAX_PDU_SIZE);

    mock.send(BackendEvent::MaxPduSizeChanged {
        address: WAVE.to_owned(),
        max_pdu_size: 185,
    });
    settle().await;
    assert_eq!(adapter.maximum_value_length(&device), 185);
}
