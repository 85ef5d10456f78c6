// blecentral Source Code File
//
// Copyright 2023 the blecentral developers. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! Thin ownership wrappers around the WinRT Bluetooth objects.

pub mod characteristic;
pub mod device;
pub mod watcher;
