// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Creates awaiting a worker reply, and the envelope queue the worker drains

use crate::error::{BridgeError, BridgeResult};
use crate::open_instance::OpenInstance;
use crate::request::CreateIrp;
use crate::types::InstanceId;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug)]
pub struct PendingEntry {
    pub irp: Arc<CreateIrp>,
    pub instance: Arc<OpenInstance>,
    pub registered_at: Instant,
}

/// Envelope waiting to be fetched by the worker
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueuedEnvelope {
    pub serial: u64,
    pub bytes: Vec<u8>,
}

/// Work handed from an oplock continuation back to the volume
///
/// Keyed by the suspended create's open instance; the volume looks the
/// request up in its suspended set and drops work for creates that were
/// already completed elsewhere.
#[derive(Debug)]
pub enum Deferred {
    /// Replay the create from share arbitration
    Retry(InstanceId),
    /// Unwind the suspended create and fail it
    Fail(InstanceId, BridgeError),
}

pub struct PendingTable {
    entries: Mutex<HashMap<u64, PendingEntry>>,
    queue: Mutex<VecDeque<QueuedEnvelope>>,
    notify: Notify,
    next_serial: AtomicU64,
    closed: AtomicBool,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            next_serial: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn next_serial(&self) -> u64 {
        self.next_serial.fetch_add(1, Ordering::Relaxed)
    }

    /// Record a create and queue its envelope for the worker
    pub fn register(
        &self,
        serial: u64,
        irp: Arc<CreateIrp>,
        instance: Arc<OpenInstance>,
        envelope: Vec<u8>,
    ) -> BridgeResult<()> {
        {
            // `shutdown` flips `closed` under this lock, so an entry is either
            // refused here or drained there.
            let mut entries = self.entries.lock();
            if self.closed.load(Ordering::Acquire) {
                return Err(BridgeError::NoSuchDevice);
            }
            irp.set_serial(serial);
            entries.insert(
                serial,
                PendingEntry {
                    irp,
                    instance,
                    registered_at: Instant::now(),
                },
            );
            self.queue.lock().push_back(QueuedEnvelope {
                serial,
                bytes: envelope,
            });
        }
        debug!(serial, "create registered with worker queue");
        self.notify.notify_one();
        Ok(())
    }

    /// Remove an entry; whoever gets it owns the completion
    pub fn take(&self, serial: u64) -> Option<PendingEntry> {
        let mut entries = self.entries.lock();
        let entry = entries.remove(&serial)?;
        self.queue.lock().retain(|queued| queued.serial != serial);
        Some(entry)
    }

    pub fn try_next_envelope(&self) -> Option<QueuedEnvelope> {
        self.queue.lock().pop_front()
    }

    /// Wait for the next envelope; `None` once the table is shut down
    pub async fn next_envelope(&self) -> Option<QueuedEnvelope> {
        loop {
            let notified = self.notify.notified();
            if let Some(envelope) = self.try_next_envelope() {
                return Some(envelope);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Close the table and hand back every outstanding entry
    pub fn shutdown(&self) -> Vec<PendingEntry> {
        let drained: Vec<PendingEntry> = {
            let mut entries = self.entries.lock();
            self.closed.store(true, Ordering::Release);
            self.queue.lock().clear();
            entries.drain().map(|(_, entry)| entry).collect()
        };
        self.notify.notify_waiters();
        self.notify.notify_one();
        drained
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }
}
