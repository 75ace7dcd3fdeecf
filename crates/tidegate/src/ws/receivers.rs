//! The receiving façade handed back by the embedder's
//! `connection_established` callback.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use super::ConnectionId;

/// Kind of a reassembled data message.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DataOpCode {
    Text,
    Binary,
}

/// Kind of a control frame notification.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ControlOpCode {
    Close,
    Ping,
    Pong,
}

type DataReceiver = Arc<dyn Fn(ConnectionId, DataOpCode, Bytes) + Send + Sync>;
type ControlReceiver = Arc<dyn Fn(ConnectionId, ControlOpCode, Bytes) + Send + Sync>;

struct Callbacks {
    data: DataReceiver,
    control: ControlReceiver,
}

/// The means of receiving from a WebSocket connection.
///
/// Fragmented data messages are reassembled by the session before delivery:
/// `receive_data` fires once per complete message, never per frame. Control
/// frames are reported through `receive_control` **for information only** —
/// the core performs the required protocol response (pong echo, close echo)
/// itself, and after a close notification the paired
/// [`Senders`](super::Senders) has already been revoked.
///
/// Both callbacks run on the WebSocket scheduler thread and must not block
/// it.
///
/// A default-constructed handle is inert: both receive methods report
/// `false`. Once the functions passed to [`Receivers::new`] are no longer
/// safe to call, invoke [`stop_receiving`](Receivers::stop_receiving); the
/// callbacks become no-ops while the handle keeps reporting live.
#[derive(Clone, Default)]
pub struct Receivers {
    inner: Option<Arc<Mutex<Option<Callbacks>>>>,
}

impl Receivers {
    /// Creates a live handle from the two receiver callbacks.
    pub fn new(
        data: impl Fn(ConnectionId, DataOpCode, Bytes) + Send + Sync + 'static,
        control: impl Fn(ConnectionId, ControlOpCode, Bytes) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Some(Arc::new(Mutex::new(Some(Callbacks {
                data: Arc::new(data),
                control: Arc::new(control),
            })))),
        }
    }

    /// Delivers one reassembled data message. Returns whether the handle is
    /// live (not default-constructed).
    pub fn receive_data(&self, id: ConnectionId, opcode: DataOpCode, payload: Bytes) -> bool {
        let Some(inner) = &self.inner else {
            return false;
        };
        // Clone the callback out so no lock is held while user code runs.
        let callback = inner.lock().as_ref().map(|c| Arc::clone(&c.data));
        if let Some(callback) = callback {
            callback(id, opcode, payload);
        }
        true
    }

    /// Delivers one control frame notification. Returns whether the handle
    /// is live.
    pub fn receive_control(&self, id: ConnectionId, opcode: ControlOpCode, payload: Bytes) -> bool {
        let Some(inner) = &self.inner else {
            return false;
        };
        let callback = inner.lock().as_ref().map(|c| Arc::clone(&c.control));
        if let Some(callback) = callback {
            callback(id, opcode, payload);
        }
        true
    }

    /// Atomically drops both callbacks so they are never invoked again.
    pub fn stop_receiving(&self) {
        if let Some(inner) = &self.inner {
            *inner.lock() = None;
        }
    }
}
