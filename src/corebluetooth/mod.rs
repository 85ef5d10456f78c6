// blecentral Source Code File
//
// Copyright 2023 the blecentral developers. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! The macOS/iOS driver, built on Core Bluetooth.
//!
//! Core Bluetooth is delegate-driven and expects its objects to be used from
//! one place, so everything lives on a dedicated thread: the
//! [`internal::CoreBluetoothInternal`] loop owns the `CBCentralManager` and
//! every `CBPeripheral`, receives delegate callbacks through a channel, and
//! answers the request messages this driver sends it. Devices are identified
//! by the peripheral's `NSUUID` string; macOS never exposes the MAC address.

mod delegate;
mod internal;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::api::{ScanFilter, WriteType};
use crate::backend::{
    AdapterInfo, Backend, BackendRef, CharacteristicSpec, ConnectionInfo, EventSender,
    ServiceSpec, Subscription,
};
use crate::{Error, Result};

use self::internal::Message;

pub(crate) struct CoreBluetoothBackend {
    messages: mpsc::UnboundedSender<Message>,
}

impl CoreBluetoothBackend {
    pub(crate) async fn create(events: EventSender) -> Result<Arc<CoreBluetoothBackend>> {
        let (messages, receiver) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("blecentral-corebluetooth".to_owned())
            .spawn(move || internal::run(receiver, events))
            .map_err(|err| Error::Other(Box::new(err)))?;
        Ok(Arc::new(CoreBluetoothBackend { messages }))
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> Message,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.messages
            .send(build(reply))
            .map_err(|_| Error::RuntimeError("the Core Bluetooth thread is gone".to_owned()))?;
        response
            .await
            .map_err(|_| Error::RuntimeError("the Core Bluetooth thread dropped a request".to_owned()))?
    }
}

#[async_trait]
impl Backend for CoreBluetoothBackend {
    async fn open(&self) -> Result<AdapterInfo> {
        self.request(|reply| Message::Open { reply }).await
    }

    async fn scan_start(&self, filter: &ScanFilter) -> Result<()> {
        let filter = filter.clone();
        self.request(move |reply| Message::ScanStart { filter, reply })
            .await
    }

    async fn scan_stop(&self) -> Result<()> {
        self.request(|reply| Message::ScanStop { reply }).await
    }

    async fn connect(&self, address: &str) -> Result<ConnectionInfo> {
        let address = address.to_owned();
        self.request(move |reply| Message::Connect { address, reply })
            .await
    }

    async fn disconnect(&self, address: &str) -> Result<()> {
        let address = address.to_owned();
        self.request(move |reply| Message::Disconnect { address, reply })
            .await
    }

    async fn discover_services(&self, address: &str) -> Result<Vec<ServiceSpec>> {
        let address = address.to_owned();
        self.request(move |reply| Message::DiscoverServices { address, reply })
            .await
    }

    async fn discover_characteristics(
        &self,
        service: &BackendRef,
    ) -> Result<Vec<CharacteristicSpec>> {
        let service = service.clone();
        self.request(move |reply| Message::DiscoverCharacteristics { service, reply })
            .await
    }

    async fn subscribe(
        &self,
        characteristic: &BackendRef,
        subscription: Subscription,
    ) -> Result<()> {
        let characteristic = characteristic.clone();
        self.request(move |reply| Message::Subscribe {
            characteristic,
            subscription,
            reply,
        })
        .await
    }

    async fn write(
        &self,
        characteristic: &BackendRef,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        let characteristic = characteristic.clone();
        let data = data.to_vec();
        self.request(move |reply| Message::Write {
            characteristic,
            data,
            write_type,
            reply,
        })
        .await
    }
}
