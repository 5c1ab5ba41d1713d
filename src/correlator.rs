// Copyright 2020 Joyent, Inc.

//! Request correlation: maps an in-flight request id to the slot its response
//! will be delivered through.
//!
//! The table is shared by the receive loop and every caller, and is only ever
//! touched under its lock.  Each entry is resolved exactly once: by
//! `resolve` with the correlated packet, by `close` with `ConnectionClosed`,
//! or by the caller's `PendingRequest` going away (completion, timeout, or
//! cancellation), which removes the entry without resolving it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{DsiError, Result};
use crate::protocol::DsiPacket;

type Delivery = Result<DsiPacket>;

struct Entry {
    seq: u64,
    slot: oneshot::Sender<Delivery>,
}

struct Table {
    entries: HashMap<u16, Entry>,
    next_seq: u64,
    closed: bool,
}

pub struct Correlator {
    table: Mutex<Table>,
    limit: usize,
}

impl Correlator {
    pub fn new(limit: usize) -> Correlator {
        Correlator {
            table: Mutex::new(Table {
                entries: HashMap::new(),
                next_seq: 0,
                closed: false,
            }),
            limit,
        }
    }

    fn lock(&self) -> MutexGuard<Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a slot for `request_id`.  Returns `Ok(None)` if that id is
    /// still in flight, so the caller can draw another.
    pub fn register(
        self: &Arc<Self>,
        request_id: u16,
    ) -> Result<Option<PendingRequest>> {
        let mut table = self.lock();
        if table.closed {
            return Err(DsiError::ConnectionClosed);
        }
        if table.entries.len() >= self.limit {
            return Err(DsiError::TooManyPending { limit: self.limit });
        }
        if table.entries.contains_key(&request_id) {
            return Ok(None);
        }

        let seq = table.next_seq;
        table.next_seq += 1;
        let (slot, rx) = oneshot::channel();
        table.entries.insert(request_id, Entry { seq, slot });

        Ok(Some(PendingRequest {
            correlator: Arc::clone(self),
            request_id,
            seq,
            rx,
        }))
    }

    /// Deliver `packet` to the slot registered under its request id.
    /// Returns false when nothing is waiting for it.
    pub fn resolve(&self, packet: DsiPacket) -> bool {
        let entry = self.lock().entries.remove(&packet.header.request_id);
        match entry {
            Some(entry) => {
                // The waiter may have just given up; the packet is dropped.
                let _ = entry.slot.send(Ok(packet));
                true
            }
            None => false,
        }
    }

    fn cancel(&self, request_id: u16, seq: u64) {
        let mut table = self.lock();
        if table.entries.get(&request_id).map(|e| e.seq) == Some(seq) {
            table.entries.remove(&request_id);
        }
    }

    /// Refuse new registrations and fail everything still waiting.  Returns
    /// how many waiters were failed.
    pub fn close(&self) -> usize {
        let entries: Vec<Entry> = {
            let mut table = self.lock();
            table.closed = true;
            table.entries.drain().map(|(_, e)| e).collect()
        };
        let count = entries.len();
        for entry in entries {
            let _ = entry.slot.send(Err(DsiError::ConnectionClosed));
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A caller's claim on one correlator entry.  Dropping it removes the entry
/// if it is still outstanding.
pub struct PendingRequest {
    correlator: Arc<Correlator>,
    request_id: u16,
    seq: u64,
    rx: oneshot::Receiver<Delivery>,
}

impl PendingRequest {
    pub fn request_id(&self) -> u16 {
        self.request_id
    }

    pub async fn wait(mut self, timeout: Option<Duration>) -> Result<DsiPacket> {
        let delivery = match timeout {
            Some(limit) => tokio::time::timeout(limit, &mut self.rx)
                .await
                .map_err(|_| DsiError::Timeout)?,
            None => (&mut self.rx).await,
        };

        // A slot dropped without a value means the table went away.
        delivery.unwrap_or(Err(DsiError::ConnectionClosed))
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.correlator.cancel(self.request_id, self.seq);
    }
}
