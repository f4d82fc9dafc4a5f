//! Reference-counted handles to keyed connections
//!
//! A shared acquire for a key that already has an open shared connection joins it
//! and bumps its count; an exclusive acquire always opens a fresh connection. The
//! connection is torn down when the last handle on it is released.

use log::{debug, trace};
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{AgentError, Result};

type OpenFn<K, C> = Box<dyn Fn(&K) -> Result<C> + Send + Sync>;
type CloseFn<K, C> = Box<dyn Fn(&K, &C) + Send + Sync>;

/// A claim on one open connection
#[derive(Debug)]
pub struct Handle<K, C> {
    slot: u64,
    key: K,
    shared: bool,
    resource: Arc<C>,
}

impl<K, C> Handle<K, C> {
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Whether this handle may be joined by other shared acquires
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Whether both handles refer to the same underlying connection
    pub fn same_connection(&self, other: &Handle<K, C>) -> bool {
        self.slot == other.slot
    }
}

impl<K, C> Deref for Handle<K, C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.resource
    }
}

struct Slot<K, C> {
    key: K,
    shared: bool,
    refs: usize,
    resource: Arc<C>,
}

struct ArenaInner<K, C> {
    slots: HashMap<u64, Slot<K, C>>,
    // Key -> slot of the open shared connection for that key
    shared: HashMap<K, u64>,
}

/// Arena of connections keyed by connection identity
pub struct HandleArena<K, C> {
    open: OpenFn<K, C>,
    close: Option<CloseFn<K, C>>,
    inner: Mutex<ArenaInner<K, C>>,
    next_slot: AtomicU64,
}

impl<K, C> HandleArena<K, C>
where
    K: Eq + Hash + Clone + Display,
{
    /// Create an arena that opens connections with `open`
    pub fn new<F>(open: F) -> Self
    where
        F: Fn(&K) -> Result<C> + Send + Sync + 'static,
    {
        Self {
            open: Box::new(open),
            close: None,
            inner: Mutex::new(ArenaInner {
                slots: HashMap::new(),
                shared: HashMap::new(),
            }),
            next_slot: AtomicU64::new(1),
        }
    }

    /// Run `close` on a connection when its last handle is released
    pub fn with_teardown<F>(mut self, close: F) -> Self
    where
        F: Fn(&K, &C) + Send + Sync + 'static,
    {
        self.close = Some(Box::new(close));
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, ArenaInner<K, C>>> {
        self.inner
            .lock()
            .map_err(|_| AgentError::Other("Lock poisoned".to_string()))
    }

    fn join_shared(inner: &mut ArenaInner<K, C>, key: &K) -> Option<Handle<K, C>> {
        let slot_id = *inner.shared.get(key)?;
        let slot = inner.slots.get_mut(&slot_id)?;
        slot.refs += 1;
        trace!("Joined shared connection {} ({} handles)", key, slot.refs);
        Some(Handle {
            slot: slot_id,
            key: key.clone(),
            shared: true,
            resource: Arc::clone(&slot.resource),
        })
    }

    /// Acquire a handle for `key`
    ///
    /// The connection is opened without holding the arena lock, so a slow open
    /// does not stall acquires and releases for other keys. When two shared
    /// acquires for one key race, the later open is closed and its caller joins
    /// the connection that registered first.
    pub fn acquire(&self, key: &K, shared: bool) -> Result<Handle<K, C>> {
        if shared {
            if let Some(handle) = Self::join_shared(&mut *self.lock()?, key) {
                return Ok(handle);
            }
        }

        let opened = (self.open)(key)?;

        let mut inner = self.lock()?;
        if shared {
            if let Some(handle) = Self::join_shared(&mut inner, key) {
                drop(inner);
                if let Some(close) = &self.close {
                    close(key, &opened);
                }
                debug!("Discarded duplicate shared connection {}", key);
                return Ok(handle);
            }
        }

        let resource = Arc::new(opened);
        let slot_id = self.next_slot.fetch_add(1, Ordering::Relaxed);
        inner.slots.insert(
            slot_id,
            Slot {
                key: key.clone(),
                shared,
                refs: 1,
                resource: Arc::clone(&resource),
            },
        );
        if shared {
            inner.shared.insert(key.clone(), slot_id);
        }
        drop(inner);
        debug!(
            "Opened {} connection {}",
            if shared { "shared" } else { "exclusive" },
            key
        );

        Ok(Handle {
            slot: slot_id,
            key: key.clone(),
            shared,
            resource,
        })
    }

    /// Give up a handle; returns how many handles remain on its connection
    pub fn release(&self, handle: Handle<K, C>) -> Result<usize> {
        let mut inner = self.lock()?;

        let slot = inner.slots.get_mut(&handle.slot).ok_or_else(|| {
            AgentError::Handle(format!("connection {} is not open", handle.key))
        })?;
        slot.refs -= 1;
        let remaining = slot.refs;
        if remaining > 0 {
            trace!("Released handle on {} ({} remain)", handle.key, remaining);
            return Ok(remaining);
        }

        if let Some(slot) = inner.slots.remove(&handle.slot) {
            if slot.shared && inner.shared.get(&slot.key) == Some(&handle.slot) {
                inner.shared.remove(&slot.key);
            }
            drop(inner);
            if let Some(close) = &self.close {
                close(&slot.key, &slot.resource);
            }
            debug!("Closed connection {}", slot.key);
        }
        Ok(0)
    }

    /// Handles currently open on the connection behind `handle`
    pub fn shared_count(&self, handle: &Handle<K, C>) -> usize {
        self.lock()
            .ok()
            .and_then(|inner| inner.slots.get(&handle.slot).map(|s| s.refs))
            .unwrap_or(0)
    }

    /// Whether `key` has an open shared connection
    pub fn is_shared(&self, key: &K) -> bool {
        self.lock()
            .map(|inner| inner.shared.contains_key(key))
            .unwrap_or(false)
    }

    /// Number of open connections, shared or exclusive
    pub fn open_handles(&self) -> usize {
        self.lock().map(|inner| inner.slots.len()).unwrap_or(0)
    }
}
