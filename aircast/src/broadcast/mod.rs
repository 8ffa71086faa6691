//! Byte-stream fan-out to HTTP listeners.
//!
//! Producers (the radio and TV loops) write chunks to a named mount; every
//! listener attached to that mount receives them through a bounded channel.
//! A listener that stops draining fills its buffer and is pruned on the
//! next write, so one slow client never stalls the rest.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// One attached listener: the bounded sender side of its chunk channel.
struct Listener {
    id: u64,
    tx: mpsc::Sender<Bytes>,
}

/// Per-mount state. Each mount has its own lock so producers on different
/// mounts never block each other.
struct MountState {
    name: String,
    listeners: Mutex<Vec<Listener>>,
    next_listener_id: AtomicU64,
}

/// The receiving end handed to the HTTP adaptor for one listener.
pub struct ListenerHandle {
    /// Listener id within its mount, used for detach.
    pub id: u64,
    /// Chunk stream. Closed when the listener is pruned or the mount is
    /// removed.
    pub rx: mpsc::Receiver<Bytes>,
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle").field("id", &self.id).finish()
    }
}

/// Thread-safe broadcaster fanning byte chunks out to HTTP listeners.
pub struct StreamBroadcaster {
    mounts: RwLock<HashMap<String, Arc<MountState>>>,
    listener_buffer: usize,
}

impl StreamBroadcaster {
    /// Create a broadcaster whose listeners buffer up to
    /// `listener_buffer` chunks before being treated as stalled.
    pub fn new(listener_buffer: usize) -> Self {
        Self {
            mounts: RwLock::new(HashMap::new()),
            listener_buffer: listener_buffer.max(1),
        }
    }

    /// Create a mount point. Idempotent.
    pub fn create_mount(&self, mount: &str) {
        let mut mounts = self.mounts.write();
        if !mounts.contains_key(mount) {
            info!(mount = %mount, "creating broadcast mount");
            mounts.insert(
                mount.to_string(),
                Arc::new(MountState {
                    name: mount.to_string(),
                    listeners: Mutex::new(Vec::new()),
                    next_listener_id: AtomicU64::new(0),
                }),
            );
        }
    }

    /// Remove a mount point and close every listener attached to it.
    /// Subsequent writes to the mount are no-ops.
    pub fn remove_mount(&self, mount: &str) {
        let state = self.mounts.write().remove(mount);
        if let Some(state) = state {
            let drained = {
                let mut listeners = state.listeners.lock();
                std::mem::take(&mut *listeners)
            };
            info!(mount = %mount, listeners = drained.len(), "removed broadcast mount");
            // Dropping the senders closes the listener channels.
        }
    }

    /// Whether the mount exists (was created and not yet removed).
    pub fn is_active(&self, mount: &str) -> bool {
        self.mounts.read().contains_key(mount)
    }

    /// Attach a listener to a mount. Fails with `not_found` if the mount
    /// does not exist; creating the mount is the channel-start path's job.
    pub fn attach_listener(&self, mount: &str) -> Result<ListenerHandle> {
        let state = self
            .mounts
            .read()
            .get(mount)
            .cloned()
            .ok_or_else(|| Error::not_found("mount", mount))?;

        let (tx, rx) = mpsc::channel(self.listener_buffer);
        let id = state.next_listener_id.fetch_add(1, Ordering::Relaxed);
        state.listeners.lock().push(Listener { id, tx });
        debug!(mount = %mount, listener = id, "listener attached");
        Ok(ListenerHandle { id, rx })
    }

    /// Detach a listener explicitly (client disconnect observed by the
    /// HTTP adaptor). Unknown ids are ignored; the listener may already
    /// have been pruned.
    pub fn detach_listener(&self, mount: &str, listener_id: u64) {
        if let Some(state) = self.mounts.read().get(mount).cloned() {
            let mut listeners = state.listeners.lock();
            listeners.retain(|l| l.id != listener_id);
        }
    }

    /// Broadcast a chunk to every listener on the mount. Listeners whose
    /// buffer is full or whose receiver is gone are pruned before the walk
    /// continues. Returns `false` when the mount no longer exists, which
    /// producers treat as their exit signal.
    pub fn write(&self, mount: &str, data: Bytes) -> bool {
        // Look up the mount-state pointer under the global lock, then drop
        // it; the per-mount lock is the innermost lock of any holder.
        let state = match self.mounts.read().get(mount).cloned() {
            Some(state) => state,
            None => return false,
        };

        let mut listeners = state.listeners.lock();
        listeners.retain(|listener| match listener.tx.try_send(data.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(mount = %state.name, listener = listener.id, "pruning stalled listener");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(mount = %state.name, listener = listener.id, "pruning disconnected listener");
                false
            }
        });
        true
    }

    /// Number of listeners currently attached to a mount.
    pub fn listener_count(&self, mount: &str) -> usize {
        self.mounts
            .read()
            .get(mount)
            .map(|state| state.listeners.lock().len())
            .unwrap_or(0)
    }

    /// Total listeners across all mounts.
    pub fn total_listeners(&self) -> usize {
        let mounts: Vec<_> = self.mounts.read().values().cloned().collect();
        mounts.iter().map(|m| m.listeners.lock().len()).sum()
    }

    /// Names of all active mounts.
    pub fn mounts(&self) -> Vec<String> {
        self.mounts.read().keys().cloned().collect()
    }
}
