//! Shared connection table for servers and clients.
//!
//! Admission, removal, and shutdown iteration are short critical sections
//! under one mutex; the `closing` flag makes admission and close-all
//! linearizable so no connection can slip in during shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::ConnHandle;

/// Outcome of an admission attempt.
pub(crate) enum Admit {
    /// Admitted under the returned id.
    Ok(u64),
    /// The table is at its connection cap.
    Full,
    /// The owner is shutting down.
    Closing,
}

struct Inner {
    closing: bool,
    next_id: u64,
    conns: HashMap<u64, ConnHandle>,
}

/// Set of live connections owned by one server or client.
pub(crate) struct ConnTable {
    inner: Mutex<Inner>,
}

impl ConnTable {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                closing: false,
                next_id: 0,
                conns: HashMap::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admit a connection if the table is below `max` and not closing.
    pub(crate) fn try_insert(&self, handle: ConnHandle, max: usize) -> Admit {
        let mut inner = self.lock();
        if inner.closing {
            return Admit::Closing;
        }
        if inner.conns.len() >= max {
            return Admit::Full;
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.conns.insert(id, handle);
        Admit::Ok(id)
    }

    pub(crate) fn remove(&self, id: u64) {
        self.lock().conns.remove(&id);
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().conns.len()
    }

    /// Flag the table as closing and close every live connection.
    pub(crate) fn close_all(&self) {
        let handles: Vec<ConnHandle> = {
            let mut inner = self.lock();
            inner.closing = true;
            inner.conns.drain().map(|(_, h)| h).collect()
        };
        for h in handles {
            h.close();
        }
    }
}
