// blecentral Source Code File
//
// Copyright 2023 the blecentral developers. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

use log::trace;
use windows::{
    Devices::Bluetooth::Advertisement::{
        BluetoothLEAdvertisementFilter, BluetoothLEAdvertisementReceivedEventArgs,
        BluetoothLEAdvertisementWatcher, BluetoothLEScanningMode,
    },
    Foundation::TypedEventHandler,
};

use crate::api::{BDAddr, ScanFilter};
use crate::backend::Advertisement;
use crate::winrtble::utils;
use crate::Result;

pub type AdvertisementHandler = Box<dyn Fn(Advertisement) + Send + Sync>;

/// Owns a `BluetoothLEAdvertisementWatcher` in Active scanning mode,
/// translating each received report into an [`Advertisement`].
pub struct BLEWatcher {
    watcher: BluetoothLEAdvertisementWatcher,
}

impl BLEWatcher {
    /// Build a watcher whose OS-level filter matches any of the given
    /// service UUIDs (or everything, for an empty filter).
    pub fn new(filter: &ScanFilter) -> Result<Self> {
        let advertisement_filter =
            BluetoothLEAdvertisementFilter::new().map_err(utils::winrt_error)?;
        if !filter.services.is_empty() {
            let uuids = advertisement_filter
                .Advertisement()
                .map_err(utils::winrt_error)?
                .ServiceUuids()
                .map_err(utils::winrt_error)?;
            for uuid in &filter.services {
                uuids
                    .Append(utils::to_guid(uuid))
                    .map_err(utils::winrt_error)?;
            }
        }
        let watcher = BluetoothLEAdvertisementWatcher::Create(&advertisement_filter)
            .map_err(utils::winrt_error)?;
        Ok(BLEWatcher { watcher })
    }

    pub fn start(&self, on_received: AdvertisementHandler) -> Result<()> {
        self.watcher
            .SetScanningMode(BluetoothLEScanningMode::Active)
            .map_err(utils::winrt_error)?;
        let handler = TypedEventHandler::new(
            move |_sender,
                  args: windows::core::Ref<'_, BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    match parse_advertisement(args) {
                        Ok(advertisement) => on_received(advertisement),
                        Err(err) => trace!("discarding unparsable advertisement: {}", err),
                    }
                }
                Ok(())
            },
        );
        self.watcher
            .Received(&handler)
            .map_err(utils::winrt_error)?;
        self.watcher.Start().map_err(utils::winrt_error)?;
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        self.watcher.Stop().map_err(utils::winrt_error)?;
        Ok(())
    }
}

fn parse_advertisement(args: &BluetoothLEAdvertisementReceivedEventArgs) -> Result<Advertisement> {
    let raw_address = args.BluetoothAddress().map_err(utils::winrt_error)?;
    let address = BDAddr::try_from(raw_address)?.to_string();
    let rssi = args.RawSignalStrengthInDBm().ok();
    let advertisement = args.Advertisement().map_err(utils::winrt_error)?;
    let name = advertisement
        .LocalName()
        .ok()
        .map(|name| name.to_string())
        .filter(|name| !name.is_empty());
    let services = advertisement
        .ServiceUuids()
        .map(|uuids| uuids.into_iter().map(|guid| utils::to_uuid(&guid)).collect())
        .unwrap_or_default();
    Ok(Advertisement {
        address,
        name,
        rssi,
        services,
        connected: false,
    })
}
