//! Subscribe to the Heart Rate Measurement characteristic of the first
//! advertiser offering the Heart Rate service and print each reading.

use blecentral::api::bleuuid::uuid_from_u16;
use blecentral::api::{AdapterStatus, CentralEvent, DeviceCallbacks};
use blecentral::tree::{self, keys, NodeKind};
use blecentral::{BleAdapter, BleDevice};
use futures::StreamExt;
use uuid::Uuid;

const HEART_RATE_SERVICE: Uuid = uuid_from_u16(0x180d);
const HEART_RATE_MEASUREMENT: Uuid = uuid_from_u16(0x2a37);

fn heart_rate(data: &[u8]) -> Option<u16> {
    // Flag bit 0 selects a u8 or u16 measurement value.
    match data {
        [flags, value, ..] if flags & 0x01 == 0 => Some(u16::from(*value)),
        [_, low, high, ..] => Some(u16::from_le_bytes([*low, *high])),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();

    let adapter = BleAdapter::new().await?;
    let mut events = adapter.events();
    let mut device: Option<BleDevice> = None;

    // Enable notifications as soon as the characteristic shows up.
    adapter.state().on_child_added(|_, child| {
        if child.has_type(NodeKind::Characteristic)
            && child.get_uuid(keys::UUID) == Some(HEART_RATE_MEASUREMENT)
        {
            tree::message(child, NodeKind::EnableNotifications);
        }
    });

    let callbacks = DeviceCallbacks::new(
        |_, data| {
            if let Some(bpm) = heart_rate(data) {
                println!("heart rate: {} bpm", bpm);
            }
        },
        |_, _| {},
    );
    let mut callbacks = Some(callbacks);

    while let Some(event) = events.next().await {
        match event {
            CentralEvent::AdapterStatusChanged(status) => {
                // Only advertisers of the Heart Rate service are of interest.
                adapter.scan(
                    status == AdapterStatus::PoweredOn,
                    &[HEART_RATE_SERVICE],
                );
            }
            CentralEvent::DeviceDiscovered(address) | CentralEvent::DeviceUpdated(address) => {
                if device.is_some() {
                    continue;
                }
                let Some(record) = adapter
                    .state()
                    .get_child_with_property(keys::ADDRESS, address.as_str())
                else {
                    continue;
                };
                if let Some(callbacks) = callbacks.take() {
                    println!(
                        "connecting to {} ({})",
                        record.get_string(keys::NAME).unwrap_or_default(),
                        address
                    );
                    device = Some(adapter.connect(&record, callbacks)?);
                    adapter.scan(false, &[]);
                }
            }
            CentralEvent::DeviceConnected(_) => {
                if let Some(device) = &device {
                    tree::message(&device.state(), NodeKind::DiscoverServices);
                }
            }
            CentralEvent::ServicesDiscovered(_) => {
                if let Some(device) = &device {
                    if let Some(service) = device
                        .state()
                        .get_child_with_property(keys::UUID, HEART_RATE_SERVICE)
                    {
                        tree::message(&service, NodeKind::DiscoverCharacteristics);
                    }
                }
            }
            CentralEvent::DeviceDisconnected(address) => {
                println!("{} disconnected", address);
                break;
            }
        }
    }
    Ok(())
}
