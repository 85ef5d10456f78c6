// blecentral Source Code File
//
// Copyright 2023 the blecentral developers. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! The contract between the platform-independent core and the per-OS
//! drivers.
//!
//! A driver implements [`Backend`]: request/response operations the core
//! invokes from spawned tasks, plus a channel of unsolicited
//! [`BackendEvent`]s (advertisements, radio state changes, notification
//! payloads, link loss) the driver posts from whatever thread the OS calls
//! it on. The core applies every event on its dispatcher task; drivers never
//! touch the state tree themselves.
//!
//! Drivers own their OS handles. Services and characteristics are referred
//! to across the boundary by an opaque [`BackendRef`] key that the core
//! stores in the tree and hands back verbatim.

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::api::{AdapterStatus, CharPropFlags, ScanFilter, WriteType};
use crate::Result;

/// Opaque key a driver uses to locate its OS object for a service or
/// characteristic (a D-Bus object path on BlueZ, a map key elsewhere).
pub type BackendRef = String;

/// What a driver learned about the local adapter when opening it.
#[derive(Clone, Debug, Default)]
pub struct AdapterInfo {
    pub status: AdapterStatus,
    pub name: Option<String>,
}

/// One received advertisement (or scan response), already merged with
/// whatever identity information the OS attaches to it.
#[derive(Clone, Debug)]
pub struct Advertisement {
    /// Canonical upper-case MAC, or an opaque stable identifier on platforms
    /// that hide the hardware address.
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    /// Advertised service UUIDs, where the OS reports them.
    pub services: Vec<Uuid>,
    /// Set when the OS reports the device as already connected at the system
    /// level rather than as a fresh advertiser.
    pub connected: bool,
}

/// A discovered GATT service.
#[derive(Clone, Debug)]
pub struct ServiceSpec {
    pub uuid: Uuid,
    pub handle_start: Option<u16>,
    pub handle_end: Option<u16>,
    pub backend_ref: BackendRef,
}

/// A discovered GATT characteristic.
#[derive(Clone, Debug)]
pub struct CharacteristicSpec {
    pub uuid: Uuid,
    pub properties: CharPropFlags,
    pub handle: Option<u16>,
    pub value_handle: Option<u16>,
    pub backend_ref: BackendRef,
}

/// The outcome of a successful connection attempt.
#[derive(Clone, Debug, Default)]
pub struct ConnectionInfo {
    /// Usable write payload size (ATT MTU - 3), if the OS exposes it.
    pub max_pdu_size: Option<u16>,
}

/// Which kind of value-change subscription to request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Subscription {
    Notifications,
    Indications,
}

/// Unsolicited events a driver posts to the core.
#[derive(Clone, Debug)]
pub enum BackendEvent {
    StatusChanged(AdapterStatus),
    Advertisement(Advertisement),
    /// The ATT MTU was (re)negotiated for a connected device.
    MaxPduSizeChanged { address: String, max_pdu_size: u16 },
    /// The link to a device the core connected was lost or closed.
    DeviceDisconnected { address: String },
    /// A notification or indication payload arrived.
    ValueChanged {
        address: String,
        uuid: Uuid,
        value: Vec<u8>,
    },
}

/// Sending half of the driver→core event channel, handed to the driver when
/// it is created.
pub type EventSender = mpsc::UnboundedSender<BackendEvent>;

/// Receiving half, consumed by the core's dispatcher.
pub type EventReceiver = mpsc::UnboundedReceiver<BackendEvent>;

/// Create the driver→core event channel.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// The operations every OS driver implements. All methods take `&self`;
/// drivers synchronize internally because the core invokes them from
/// concurrently spawned tasks.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Determine whether a default adapter exists and report its state. On
    /// Linux this also powers the adapter on if it is off. Subsequent state
    /// changes arrive as [`BackendEvent::StatusChanged`].
    async fn open(&self) -> Result<AdapterInfo>;

    /// Ask the OS to start reporting advertisements, restricted to the
    /// filter's service UUIDs when non-empty. [`crate::Error::NotReady`]
    /// marks a transient failure the core will retry.
    async fn scan_start(&self, filter: &ScanFilter) -> Result<()>;

    async fn scan_stop(&self) -> Result<()>;

    /// Establish a GATT connection. Resolves once the device is usable for
    /// service discovery.
    async fn connect(&self, address: &str) -> Result<ConnectionInfo>;

    async fn disconnect(&self, address: &str) -> Result<()>;

    /// Enumerate the primary services of a connected device.
    async fn discover_services(&self, address: &str) -> Result<Vec<ServiceSpec>>;

    /// Enumerate the characteristics of a previously discovered service.
    async fn discover_characteristics(
        &self,
        service: &BackendRef,
    ) -> Result<Vec<CharacteristicSpec>>;

    /// Enable notifications or indications on a characteristic. Payloads
    /// arrive as [`BackendEvent::ValueChanged`].
    async fn subscribe(&self, characteristic: &BackendRef, subscription: Subscription)
        -> Result<()>;

    /// Write a characteristic value. For `WriteType::WithResponse` the
    /// returned future resolves once the peripheral acknowledged (or
    /// rejected) the write; for `WithoutResponse` once the OS accepted the
    /// command.
    async fn write(
        &self,
        characteristic: &BackendRef,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()>;
}
