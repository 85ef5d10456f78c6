// blecentral Source Code File
//
// Copyright 2023 the blecentral developers. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! A scriptable in-memory driver used by the core tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::api::{AdapterStatus, ScanFilter, WriteType};
use crate::backend::{
    event_channel, AdapterInfo, Backend, BackendEvent, BackendRef, CharacteristicSpec,
    ConnectionInfo, EventReceiver, EventSender, ServiceSpec, Subscription,
};
use crate::{Error, Result};

pub(crate) struct MockBackend {
    events: EventSender,
    calls: Mutex<Vec<String>>,
    /// How many scan starts report `NotReady` before one succeeds.
    pub scan_start_failures: AtomicUsize,
    pub open_status: Mutex<AdapterStatus>,
    pub services: Mutex<HashMap<String, Vec<ServiceSpec>>>,
    pub characteristics: Mutex<HashMap<BackendRef, Vec<CharacteristicSpec>>>,
    pub max_pdu_size: Mutex<Option<u16>>,
    /// When set, every write blocks until the Notify is released once.
    pub write_gate: Mutex<Option<Arc<Notify>>>,
}

impl MockBackend {
    pub fn create() -> (Arc<MockBackend>, EventReceiver) {
        let (events, receiver) = event_channel();
        let mock = Arc::new(MockBackend {
            events,
            calls: Mutex::new(Vec::new()),
            scan_start_failures: AtomicUsize::new(0),
            open_status: Mutex::new(AdapterStatus::PoweredOn),
            services: Mutex::new(HashMap::new()),
            characteristics: Mutex::new(HashMap::new()),
            max_pdu_size: Mutex::new(None),
            write_gate: Mutex::new(None),
        });
        (mock, receiver)
    }

    pub fn send(&self, event: BackendEvent) {
        self.events.send(event).expect("core dropped its event channel");
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.starts_with(prefix))
            .collect()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn open(&self) -> Result<AdapterInfo> {
        self.record("open".to_owned());
        Ok(AdapterInfo {
            status: *self.open_status.lock().unwrap(),
            name: Some("mock0".to_owned()),
        })
    }

    async fn scan_start(&self, filter: &ScanFilter) -> Result<()> {
        self.record(format!("scan_start {:?}", filter.services));
        let remaining = self.scan_start_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.scan_start_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::NotReady);
        }
        Ok(())
    }

    async fn scan_stop(&self) -> Result<()> {
        self.record("scan_stop".to_owned());
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<ConnectionInfo> {
        self.record(format!("connect {}", address));
        Ok(ConnectionInfo {
            max_pdu_size: *self.max_pdu_size.lock().unwrap(),
        })
    }

    async fn disconnect(&self, address: &str) -> Result<()> {
        self.record(format!("disconnect {}", address));
        Ok(())
    }

    async fn discover_services(&self, address: &str) -> Result<Vec<ServiceSpec>> {
        self.record(format!("discover_services {}", address));
        Ok(self
            .services
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .unwrap_or_default())
    }

    async fn discover_characteristics(
        &self,
        service: &BackendRef,
    ) -> Result<Vec<CharacteristicSpec>> {
        self.record(format!("discover_characteristics {}", service));
        Ok(self
            .characteristics
            .lock()
            .unwrap()
            .get(service)
            .cloned()
            .unwrap_or_default())
    }

    async fn subscribe(
        &self,
        characteristic: &BackendRef,
        subscription: Subscription,
    ) -> Result<()> {
        self.record(format!("subscribe {} {:?}", characteristic, subscription));
        Ok(())
    }

    async fn write(
        &self,
        characteristic: &BackendRef,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        self.record(format!(
            "write {} {:02x?} {:?}",
            characteristic, data, write_type
        ));
        let gate = self.write_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(())
    }
}
