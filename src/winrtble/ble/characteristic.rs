// blecentral Source Code File
//
// Copyright 2023 the blecentral developers. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

use std::sync::Arc;

use log::debug;
use uuid::Uuid;
use windows::{
    Devices::Bluetooth::GenericAttributeProfile::{
        GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
        GattValueChangedEventArgs, GattWriteOption,
    },
    Foundation::TypedEventHandler,
    Storage::Streams::{DataReader, DataWriter},
};

use crate::api::WriteType;
use crate::backend::Subscription;
use crate::winrtble::utils;
use crate::Result;

pub type ValueChangedHandler = Box<dyn Fn(String, Uuid, Vec<u8>) + Send + Sync>;

/// Owns one `GattCharacteristic` plus its notification registration.
#[derive(Clone)]
pub struct BLECharacteristic {
    characteristic: GattCharacteristic,
    address: String,
    uuid: Uuid,
    notify_token: Arc<std::sync::Mutex<Option<i64>>>,
}

impl BLECharacteristic {
    pub fn new(characteristic: GattCharacteristic, address: String, uuid: Uuid) -> Self {
        BLECharacteristic {
            characteristic,
            address,
            uuid,
            notify_token: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    pub async fn subscribe(
        &self,
        subscription: Subscription,
        on_value_changed: ValueChangedHandler,
    ) -> Result<()> {
        let address = self.address.clone();
        let uuid = self.uuid;
        let handler = TypedEventHandler::new(
            move |_sender, args: windows::core::Ref<'_, GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    if let Ok(buffer) = args.CharacteristicValue() {
                        if let Ok(value) = buffer_to_vec(&buffer) {
                            on_value_changed(address.clone(), uuid, value);
                        }
                    }
                }
                Ok(())
            },
        );
        let token = self
            .characteristic
            .ValueChanged(&handler)
            .map_err(utils::winrt_error)?;
        self.notify_token.lock().unwrap().replace(token);

        let config = match subscription {
            Subscription::Notifications => {
                GattClientCharacteristicConfigurationDescriptorValue::Notify
            }
            Subscription::Indications => {
                GattClientCharacteristicConfigurationDescriptorValue::Indicate
            }
        };
        let status = self
            .characteristic
            .WriteClientCharacteristicConfigurationDescriptorAsync(config)
            .map_err(utils::winrt_error)?
            .await
            .map_err(utils::winrt_error)?;
        utils::to_error(status)
    }

    pub async fn write_value(&self, data: &[u8], write_type: WriteType) -> Result<()> {
        let writer = DataWriter::new().map_err(utils::winrt_error)?;
        writer.WriteBytes(data).map_err(utils::winrt_error)?;
        let buffer = writer.DetachBuffer().map_err(utils::winrt_error)?;
        let option = match write_type {
            WriteType::WithResponse => GattWriteOption::WriteWithResponse,
            WriteType::WithoutResponse => GattWriteOption::WriteWithoutResponse,
        };
        let status = self
            .characteristic
            .WriteValueWithOptionAsync(&buffer, option)
            .map_err(utils::winrt_error)?
            .await
            .map_err(utils::winrt_error)?;
        utils::to_error(status)
    }
}

fn buffer_to_vec(buffer: &windows::Storage::Streams::IBuffer) -> Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer).map_err(utils::winrt_error)?;
    let length = reader.UnconsumedBufferLength().map_err(utils::winrt_error)? as usize;
    let mut value = vec![0u8; length];
    reader.ReadBytes(&mut value).map_err(utils::winrt_error)?;
    Ok(value)
}

impl Drop for BLECharacteristic {
    fn drop(&mut self) {
        // Clones share the registration; only the last one unhooks it.
        if Arc::strong_count(&self.notify_token) > 1 {
            return;
        }
        if let Some(token) = self.notify_token.lock().unwrap().take() {
            if let Err(err) = self.characteristic.RemoveValueChanged(token) {
                debug!("unhooking the value handler failed: {:?}", err);
            }
        }
    }
}
