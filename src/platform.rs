// blecentral Source Code File
//
// Copyright 2023 the blecentral developers. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! Selection of the native driver compiled into this build. Exactly one
//! [`Backend`] implementation exists per supported platform.

use std::sync::Arc;

use crate::backend::{Backend, EventSender};
use crate::Result;

#[cfg(target_os = "linux")]
use crate::bluez::BluezBackend as NativeBackend;
#[cfg(target_vendor = "apple")]
use crate::corebluetooth::CoreBluetoothBackend as NativeBackend;
#[cfg(target_os = "windows")]
use crate::winrtble::WinrtBackend as NativeBackend;

// Ensure the selected driver satisfies the contract the core relies on.
#[cfg(any(target_os = "linux", target_vendor = "apple", target_os = "windows"))]
static_assertions::assert_impl_all!(NativeBackend: Backend, Send, Sync, Sized);

/// Create this platform's native driver, handing it the sending half of the
/// event channel it posts unsolicited events through.
pub async fn init(events: EventSender) -> Result<Arc<dyn Backend>> {
    #[cfg(any(target_os = "linux", target_vendor = "apple", target_os = "windows"))]
    {
        let driver = NativeBackend::create(events).await?;
        Ok(driver)
    }
    #[cfg(not(any(target_os = "linux", target_vendor = "apple", target_os = "windows")))]
    {
        let _ = events;
        Err(crate::Error::NotSupported(
            "no native BLE backend for this platform".to_owned(),
        ))
    }
}
