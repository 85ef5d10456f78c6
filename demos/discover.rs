//! Connect to a device by name and enumerate its GATT database.
//!
//! Pass the device name (or a fragment of it) as the first argument.

use blecentral::api::{AdapterStatus, CentralEvent, DeviceCallbacks};
use blecentral::tree::{self, keys, NodeKind};
use blecentral::{BleAdapter, BleDevice};
use futures::StreamExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();
    let target = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "wave".to_owned())
        .to_lowercase();

    let adapter = BleAdapter::new().await?;
    let mut events = adapter.events();
    let mut device: Option<BleDevice> = None;

    adapter.state().on_child_added(|_, child| {
        if child.has_type(NodeKind::Characteristic) {
            println!(
                "  characteristic {}  properties {:#04x}",
                child.get_uuid(keys::UUID).unwrap_or_default(),
                child.get_int(keys::PROPERTIES).unwrap_or_default(),
            );
        }
    });

    while let Some(event) = events.next().await {
        match event {
            CentralEvent::AdapterStatusChanged(status) => {
                adapter.scan(status == AdapterStatus::PoweredOn, &[]);
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
                let name = record.get_string(keys::NAME).unwrap_or_default();
                if name.to_lowercase().contains(&target) {
                    println!("connecting to {} ({})", name, address);
                    device = Some(adapter.connect(&record, DeviceCallbacks::default())?);
                    adapter.scan(false, &[]);
                }
            }
            CentralEvent::DeviceConnected(_) => {
                if let Some(device) = &device {
                    println!("connected, discovering services...");
                    tree::message(&device.state(), NodeKind::DiscoverServices);
                }
            }
            CentralEvent::ServicesDiscovered(_) => {
                if let Some(device) = &device {
                    for service in device.state().children_of_kind(NodeKind::Service) {
                        println!("service {}", service.get_uuid(keys::UUID).unwrap_or_default());
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
