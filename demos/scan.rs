//! Scan for BLE advertisers and print them as they appear.
//!
//! Run with `RUST_LOG=debug cargo run --example scan` for driver logging.

use blecentral::api::{AdapterStatus, CentralEvent};
use blecentral::tree::{keys, NodeKind};
use blecentral::BleAdapter;
use futures::StreamExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();

    let adapter = BleAdapter::new().await?;
    let mut events = adapter.events();

    adapter.state().on_child_added(|_, child| {
        if child.has_type(NodeKind::Device) {
            println!(
                "{}  {:>4} dBm  {}",
                child.get_string(keys::ADDRESS).unwrap_or_default(),
                child.get_int(keys::RSSI).unwrap_or_default(),
                child.get_string(keys::NAME).unwrap_or_default(),
            );
        }
    });

    while let Some(event) = events.next().await {
        if let CentralEvent::AdapterStatusChanged(status) = event {
            println!("adapter is {}", status);
            adapter.scan(status == AdapterStatus::PoweredOn, &[]);
        }
    }
    Ok(())
}
