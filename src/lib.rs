// blecentral Source Code File
//
// Copyright 2023 the blecentral developers. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! blecentral is a cross-platform Bluetooth Low Energy central-role client
//! library. It lets an application discover nearby BLE peripherals, establish
//! GATT connections, enumerate services and characteristics, subscribe to
//! notifications or indications, and write characteristic values, with one
//! native backend per supported OS (BlueZ over D-Bus on Linux, Core Bluetooth
//! on macOS/iOS, WinRT on Windows).
//!
//! Unlike callback-oriented BLE APIs, blecentral externalizes its entire
//! state as an observable tree of typed records (adapter, devices, services,
//! characteristics) and accepts commands as transient child insertions on
//! that tree. The host attaches listeners to the tree and reacts to the
//! changes the backend publishes; no operation returns its outcome
//! synchronously.
//!
//! ```no_run
//! use blecentral::tree::{keys, NodeKind};
//! use blecentral::BleAdapter;
//!
//! # async fn example() -> blecentral::Result<()> {
//! let adapter = BleAdapter::new().await?;
//! let root = adapter.state();
//!
//! root.on_child_added(move |_parent, child| {
//!     if child.has_type(NodeKind::Device) {
//!         println!(
//!             "device: {} {:?}",
//!             child.get_string(keys::ADDRESS).unwrap_or_default(),
//!             child.get_string(keys::NAME),
//!         );
//!     }
//! });
//!
//! adapter.scan(true, &[]);
//! # Ok(())
//! # }
//! ```
//!
//! All tree mutations driven by the OS are marshalled onto a single
//! dispatcher task spawned on the calling Tokio runtime, so listeners run
//! without further synchronization.

use std::time::Duration;

use thiserror::Error;

pub mod api;
pub mod backend;
pub mod central;
pub mod platform;
pub mod tree;

#[cfg(target_os = "linux")]
mod bluez;
#[cfg(target_vendor = "apple")]
mod corebluetooth;
#[cfg(target_os = "windows")]
mod winrtble;

pub use central::{BleAdapter, BleDevice};

use api::ParseBDAddrError;

/// The main error type of the library.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Permission denied")]
    PermissionDenied,

    #[error("Device not found")]
    DeviceNotFound,

    #[error("Not connected")]
    NotConnected,

    /// The adapter (or the OS radio stack) is not ready to carry out the
    /// operation yet. Scan starts that fail with this error are retried.
    #[error("Adapter not ready")]
    NotReady,

    #[error("No such characteristic")]
    NoSuchCharacteristic,

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Invalid Bluetooth address: {0}")]
    InvalidAddress(#[from] ParseBDAddrError),

    #[error("Runtime error: {0}")]
    RuntimeError(String),

    #[error("{0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

// Opaque error strings from the OS layers get wrapped rather than enumerated.
impl From<String> for Error {
    fn from(message: String) -> Self {
        Error::Other(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
