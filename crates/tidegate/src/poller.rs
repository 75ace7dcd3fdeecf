//! Thread-safe poll set for the WebSocket scheduler.
//!
//! File descriptors are registered with a read-ready callback. Additions and
//! removals land in pending queues guarded by small mutexes and are applied
//! at the top of the next cycle — removals first, so removing and re-adding
//! a descriptor within one cycle cannot shadow the removal. The hot dispatch
//! path holds no queue lock.

use std::{collections::HashMap, io, os::fd::RawFd, time::Duration};

use parking_lot::Mutex;
use polling::Event;
use tracing::warn;

/// Invoked when the registered descriptor is read-ready. Returning `false`
/// deregisters the descriptor.
pub(crate) type ReadyCallback = Box<dyn FnMut() -> bool + Send>;

struct Entry {
    fd: RawFd,
    callback: ReadyCallback,
}

pub(crate) struct Poller {
    inner: polling::Poller,
    pending_adds: Mutex<Vec<(usize, RawFd, ReadyCallback)>>,
    pending_removals: Mutex<Vec<usize>>,
    /// Live registrations, touched only from the cycle thread.
    entries: Mutex<HashMap<usize, Entry>>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            inner: polling::Poller::new()?,
            pending_adds: Mutex::new(Vec::new()),
            pending_removals: Mutex::new(Vec::new()),
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Queues a descriptor for polling and wakes the cycle thread so the new
    /// registration takes effect without waiting out the poll timeout.
    pub(crate) fn add(&self, key: usize, fd: RawFd, callback: ReadyCallback) {
        self.pending_adds.lock().push((key, fd, callback));
        let _ = self.inner.notify();
    }

    /// Queues a registration for removal. Unknown keys are ignored, so it is
    /// safe to remove a descriptor that already deregistered itself.
    pub(crate) fn remove(&self, key: usize) {
        self.pending_removals.lock().push(key);
    }

    /// Wakes a cycle blocked in its bounded wait.
    pub(crate) fn notify(&self) {
        let _ = self.inner.notify();
    }

    /// Drops every registration, pending or live. Only called once the
    /// cycle thread has stopped.
    pub(crate) fn clear(&self) {
        self.pending_adds.lock().clear();
        self.pending_removals.lock().clear();
        for (_, entry) in self.entries.lock().drain() {
            let _ = self.inner.delete(entry.fd);
        }
    }

    /// Runs one poll cycle: apply pending removals, then pending additions,
    /// wait up to `timeout`, and dispatch every ready descriptor's callback.
    pub(crate) fn cycle(&self, timeout: Duration) -> io::Result<usize> {
        for key in self.pending_removals.lock().drain(..) {
            if let Some(entry) = self.entries.lock().remove(&key) {
                let _ = self.inner.delete(entry.fd);
            }
        }
        for (key, fd, callback) in self.pending_adds.lock().drain(..) {
            if let Err(err) = self.inner.add(fd, Event::readable(key)) {
                warn!("failed to register fd {fd} for polling: {err}");
                continue;
            }
            self.entries.lock().insert(key, Entry { fd, callback });
        }

        let mut events = Vec::new();
        self.inner.wait(&mut events, Some(timeout))?;
        let ready = events.len();

        for event in events {
            // Take the entry out so no lock is held while the callback runs.
            let entry = self.entries.lock().remove(&event.key);
            let Some(mut entry) = entry else {
                // A notify wake-up or a key removed earlier in this cycle.
                continue;
            };
            if (entry.callback)() {
                // Registrations are oneshot; re-arm for the next read.
                match self.inner.modify(entry.fd, Event::readable(event.key)) {
                    Ok(()) => {
                        self.entries.lock().insert(event.key, entry);
                    }
                    Err(err) => {
                        warn!("failed to re-arm fd {}: {err}", entry.fd);
                        let _ = self.inner.delete(entry.fd);
                    }
                }
            } else {
                let _ = self.inner.delete(entry.fd);
            }
        }

        Ok(ready)
    }
}
