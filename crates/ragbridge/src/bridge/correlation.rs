//! Pending-request table: matches worker responses to waiting callers.
//!
//! Entries are keyed by [`RequestId`]. A response that echoes an id is routed
//! by lookup; one without an id goes to the oldest entry, which covers
//! workers that answer strictly in order without echoing ids.
//!
//! When a caller gives up (timeout, dropped future) its entry becomes a
//! tombstone rather than disappearing. The worker still owes a response for
//! it, and the tombstone absorbs that response when it arrives so it cannot
//! be handed to the next caller in line.
//!
//! Without ids a tombstone cannot tell a late answer from the next caller's
//! answer. [`PendingTable::late_idless`] counts id-less responses swallowed by
//! tombstones so the connection can notice when it has lost sync.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::oneshot;

use super::protocol::{RequestId, Response};
use crate::error::BridgeError;

pub type ResponseSender = oneshot::Sender<Result<Response, BridgeError>>;
pub type ResponseReceiver = oneshot::Receiver<Result<Response, BridgeError>>;

enum Entry {
    Waiting {
        command: &'static str,
        sent_at: Instant,
        sender: ResponseSender,
    },
    Abandoned {
        command: &'static str,
    },
}

/// What happened to a response handed to [`PendingTable::deliver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to its waiting caller.
    Delivered {
        id: RequestId,
        command: &'static str,
        elapsed_ms: u128,
    },
    /// Matched a tombstone; dropped.
    Late { id: RequestId, command: &'static str },
    /// Matched an entry whose caller went away without abandoning it.
    ReceiverGone { id: RequestId },
    /// Nothing outstanding matches.
    Unmatched { id: Option<RequestId> },
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    entries: BTreeMap<RequestId, Entry>,
    late_idless: u64,
    closed: Option<BridgeError>,
}

#[derive(Default)]
pub struct PendingTable {
    inner: Mutex<Inner>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves the map structurally intact.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate the next id and start waiting for its response.
    ///
    /// Fails with the closing error once the table has been closed.
    pub fn register(
        &self,
        command: &'static str,
    ) -> Result<(RequestId, ResponseReceiver), BridgeError> {
        let mut inner = self.lock();
        if let Some(error) = &inner.closed {
            return Err(error.clone());
        }
        inner.next_id += 1;
        let id = RequestId::new(inner.next_id);
        let (sender, receiver) = oneshot::channel();
        inner.entries.insert(
            id,
            Entry::Waiting {
                command,
                sent_at: Instant::now(),
                sender,
            },
        );
        Ok((id, receiver))
    }

    pub fn deliver(&self, response: Response) -> Delivery {
        let mut inner = self.lock();
        let entry = match response.id {
            Some(id) => inner.entries.remove(&id).map(|entry| (id, entry)),
            None => inner.entries.pop_first(),
        };
        if response.id.is_none() && matches!(entry, Some((_, Entry::Abandoned { .. }))) {
            inner.late_idless += 1;
        }
        drop(inner);

        match entry {
            Some((
                id,
                Entry::Waiting {
                    command,
                    sent_at,
                    sender,
                },
            )) => {
                if sender.send(Ok(response)).is_err() {
                    return Delivery::ReceiverGone { id };
                }
                Delivery::Delivered {
                    id,
                    command,
                    elapsed_ms: sent_at.elapsed().as_millis(),
                }
            }
            Some((id, Entry::Abandoned { command })) => Delivery::Late { id, command },
            None => Delivery::Unmatched { id: response.id },
        }
    }

    /// Turn a waiting entry into a tombstone. No-op if it was already answered.
    pub fn abandon(&self, id: RequestId) {
        let mut inner = self.lock();
        if let Some(entry) = inner.entries.get_mut(&id)
            && let Entry::Waiting { command, .. } = entry
        {
            let command = *command;
            *entry = Entry::Abandoned { command };
        }
    }

    /// Forget an entry entirely. Used when the command never reached the
    /// worker, so no response is owed.
    pub fn cancel(&self, id: RequestId) {
        self.lock().entries.remove(&id);
    }

    /// Fail every waiting caller with `error` and refuse new registrations.
    ///
    /// Idempotent: the first error wins. Returns how many callers were failed.
    pub fn close(&self, error: BridgeError) -> usize {
        let mut inner = self.lock();
        if inner.closed.is_some() {
            return 0;
        }
        inner.closed = Some(error.clone());
        let entries = std::mem::take(&mut inner.entries);
        drop(inner);

        let mut failed = 0;
        for entry in entries.into_values() {
            if let Entry::Waiting { sender, .. } = entry {
                let _ = sender.send(Err(error.clone()));
                failed += 1;
            }
        }
        failed
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    /// Callers currently waiting for a response.
    pub fn live(&self) -> usize {
        self.lock()
            .entries
            .values()
            .filter(|e| matches!(e, Entry::Waiting { .. }))
            .count()
    }

    /// Id-less responses absorbed by tombstones so far.
    pub fn late_idless(&self) -> u64 {
        self.lock().late_idless
    }

    /// Responses still owed to callers that gave up.
    pub fn tombstones(&self) -> usize {
        self.lock()
            .entries
            .values()
            .filter(|e| matches!(e, Entry::Abandoned { .. }))
            .count()
    }
}
