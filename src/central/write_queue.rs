// blecentral Source Code File
//
// Copyright 2023 the blecentral developers. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

use std::collections::VecDeque;

use uuid::Uuid;

use crate::api::WriteType;
use crate::backend::BackendRef;

/// A characteristic write waiting to be sent.
#[derive(Debug)]
pub(crate) struct PendingWrite {
    pub uuid: Uuid,
    pub data: Vec<u8>,
    pub write_type: WriteType,
    pub backend_ref: BackendRef,
}

/// Per-device FIFO of pending writes with at most one entry in flight. The
/// queue itself never talks to the backend; the core starts the writes it
/// hands out and reports completions back.
#[derive(Debug, Default)]
pub(crate) struct WriteQueue {
    pending: VecDeque<PendingWrite>,
    in_flight: bool,
}

impl WriteQueue {
    /// Enqueue a write. Returns it back if the queue was idle, in which case
    /// the caller must start it and the queue counts it as in flight.
    pub fn push(&mut self, write: PendingWrite) -> Option<PendingWrite> {
        if self.in_flight {
            self.pending.push_back(write);
            None
        } else {
            self.in_flight = true;
            Some(write)
        }
    }

    /// The in-flight write finished (successfully or not). Returns the next
    /// write to start, which then counts as in flight.
    pub fn complete(&mut self) -> Option<PendingWrite> {
        let next = self.pending.pop_front();
        if next.is_none() {
            self.in_flight = false;
        }
        next
    }

    #[cfg(test)]
    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
