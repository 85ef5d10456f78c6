// blecentral Source Code File
//
// Copyright 2023 the blecentral developers. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

use std::sync::Arc;

use log::{debug, trace};
use windows::{
    Devices::Bluetooth::{
        BluetoothCacheMode, BluetoothConnectionStatus, BluetoothLEDevice,
        GenericAttributeProfile::{
            GattCharacteristic, GattCommunicationStatus, GattDeviceService,
            GattDeviceServicesResult, GattSession, GattSessionStatus,
        },
    },
    Foundation::TypedEventHandler,
};

use crate::winrtble::utils;
use crate::{Error, Result};

pub type ConnectedEventHandler = Box<dyn Fn(bool) + Send + Sync>;
pub type MaxPduSizeChangedHandler = Box<dyn Fn(u16) + Send + Sync>;

/// Owns the `BluetoothLEDevice` and its `GattSession` for one connection.
/// Dropping it unhooks the handlers and closes both objects.
#[derive(Clone)]
pub struct BLEDevice {
    inner: Arc<DeviceInner>,
}

struct DeviceInner {
    device: BluetoothLEDevice,
    session: GattSession,
    connection_token: i64,
}

impl BLEDevice {
    pub async fn new(address: u64, on_connection_changed: ConnectedEventHandler) -> Result<Self> {
        let device = BluetoothLEDevice::FromBluetoothAddressAsync(address)
            .map_err(|_| Error::DeviceNotFound)?
            .await
            .map_err(|_| Error::DeviceNotFound)?;

        let handler =
            TypedEventHandler::new(move |sender: windows::core::Ref<'_, BluetoothLEDevice>, _| {
                if let Some(sender) = sender.as_ref() {
                    let is_connected = sender
                        .ConnectionStatus()
                        .map(|status| status == BluetoothConnectionStatus::Connected)
                        .unwrap_or(false);
                    trace!("connection status changed: {:?}", sender.ConnectionStatus());
                    on_connection_changed(is_connected);
                }
                Ok(())
            });
        let connection_token = device
            .ConnectionStatusChanged(&handler)
            .map_err(|_| Error::Other("could not hook the connection status".into()))?;

        let session = GattSession::FromDeviceIdAsync(
            &device.BluetoothDeviceId().map_err(utils::winrt_error)?,
        )
        .map_err(utils::winrt_error)?
        .await
        .map_err(utils::winrt_error)?;
        session
            .SetMaintainConnection(true)
            .map_err(utils::winrt_error)?;

        Ok(BLEDevice {
            inner: Arc::new(DeviceInner {
                device,
                session,
                connection_token,
            }),
        })
    }

    async fn get_gatt_services(
        &self,
        cache_mode: BluetoothCacheMode,
    ) -> Result<GattDeviceServicesResult> {
        let result = self
            .inner
            .device
            .GetGattServicesWithCacheModeAsync(cache_mode)
            .map_err(utils::winrt_error)?
            .await
            .map_err(utils::winrt_error)?;
        Ok(result)
    }

    /// Establish the connection by performing an uncached service request;
    /// WinRT has no explicit connect call.
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected()? {
            return Ok(());
        }
        let result = self.get_gatt_services(BluetoothCacheMode::Uncached).await?;
        let status = result.Status().map_err(|_| Error::DeviceNotFound)?;
        utils::to_error(status)
    }

    fn is_connected(&self) -> Result<bool> {
        let status = self
            .inner
            .device
            .ConnectionStatus()
            .map_err(utils::winrt_error)?;
        Ok(status == BluetoothConnectionStatus::Connected)
    }

    /// The ATT MTU negotiated for the session, once it is active.
    pub fn max_pdu_size(&self) -> Result<u16> {
        if self.inner.session.SessionStatus() == Ok(GattSessionStatus::Active) {
            return self.inner.session.MaxPduSize().map_err(utils::winrt_error);
        }
        Err(Error::NotConnected)
    }

    pub fn on_max_pdu_size_changed(&self, on_changed: MaxPduSizeChangedHandler) -> Result<()> {
        let handler = TypedEventHandler::new(
            move |sender: windows::core::Ref<'_, GattSession>, _| {
                if let Some(session) = sender.as_ref() {
                    if let Ok(mtu) = session.MaxPduSize() {
                        on_changed(mtu);
                    }
                }
                Ok(())
            },
        );
        self.inner
            .session
            .MaxPduSizeChanged(&handler)
            .map_err(utils::winrt_error)?;
        Ok(())
    }

    pub async fn discover_services(&self) -> Result<Vec<GattDeviceService>> {
        let result = self.get_gatt_services(BluetoothCacheMode::Cached).await?;
        let status = result.Status().map_err(utils::winrt_error)?;
        if status == GattCommunicationStatus::Success {
            // Collect into a Vec: the IVectorView is not Send and must not
            // be held across an await point.
            let services: Vec<_> = result
                .Services()
                .map_err(utils::winrt_error)?
                .into_iter()
                .collect();
            debug!("discovered {} services", services.len());
            return Ok(services);
        }
        Ok(Vec::new())
    }

    pub async fn get_characteristics(
        service: &GattDeviceService,
    ) -> Result<Vec<GattCharacteristic>> {
        let result = service
            .GetCharacteristicsWithCacheModeAsync(BluetoothCacheMode::Uncached)
            .map_err(utils::winrt_error)?
            .await
            .map_err(utils::winrt_error)?;
        let status = result.Status();
        if status == Ok(GattCommunicationStatus::Success) {
            let characteristics: Vec<_> = result
                .Characteristics()
                .map_err(utils::winrt_error)?
                .into_iter()
                .collect();
            debug!("discovered {} characteristics", characteristics.len());
            Ok(characteristics)
        } else {
            Err(Error::Other(
                format!("characteristic enumeration failed: {:?}", status).into(),
            ))
        }
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        if let Err(err) = self
            .device
            .RemoveConnectionStatusChanged(self.connection_token)
        {
            debug!("unhooking the connection status handler failed: {:?}", err);
        }
        if let Err(err) = self.session.Close() {
            debug!("closing the GATT session failed: {:?}", err);
        }
        if let Err(err) = self.device.Close() {
            debug!("closing the device failed: {:?}", err);
        }
    }
}
