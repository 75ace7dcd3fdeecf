//! The sending façade shared between user code and the owning session.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;

use super::SendResult;
use crate::{close::CloseCode, session::Session};

/// Revocable link from user-held [`Senders`] handles to the session.
///
/// The session severs the link when the connection closes; handles that
/// outlive it keep working but report [`SendResult::Closed`]. The weak
/// reference also means user handles never keep a dead session (and its
/// socket) alive.
pub(crate) struct SendersCell {
    session: Mutex<Option<Weak<Session>>>,
}

impl SendersCell {
    pub(crate) fn new(session: Weak<Session>) -> Arc<Self> {
        Arc::new(Self {
            session: Mutex::new(Some(session)),
        })
    }

    /// Atomically detaches every handle cloned from this cell.
    pub(crate) fn revoke(&self) {
        *self.session.lock() = None;
    }
}

/// The means of writing to a WebSocket connection.
///
/// Handed to the embedder inside [`Connection`](super::Connection) at
/// upgrade time. Cloneable and callable from any thread: an internal
/// per-session mutex serializes every send, so concurrent calls — including
/// calls through different clones — are linearized and frames never
/// interleave on the wire.
///
/// A default-constructed handle returns [`SendResult::NoImplementation`]
/// from every operation; a handle whose connection has closed returns
/// [`SendResult::Closed`].
#[derive(Clone, Default)]
pub struct Senders {
    cell: Option<Arc<SendersCell>>,
}

impl Senders {
    pub(crate) fn from_cell(cell: Arc<SendersCell>) -> Self {
        Self { cell: Some(cell) }
    }

    fn with_session(&self, f: impl FnOnce(&Session) -> SendResult) -> SendResult {
        let Some(cell) = &self.cell else {
            return SendResult::NoImplementation;
        };
        // Clone the weak link out of the cell so revocation never has to
        // wait on an in-flight send.
        let session = cell.session.lock().clone();
        let Some(session) = session.and_then(|weak| weak.upgrade()) else {
            return SendResult::Closed;
        };
        f(&session)
    }

    /// Sends a complete Text message.
    ///
    /// With `max_frame_size == 0` the payload goes out as one frame.
    /// Otherwise the message is split into a Text frame followed by
    /// Continuation frames such that each frame's total encoded size —
    /// header plus payload — stays within `max_frame_size`; the last frame
    /// carries FIN. Returns [`SendResult::FrameSizeTooSmall`] when
    /// `max_frame_size` cannot fit a header plus one payload byte.
    pub fn send_data(&self, payload: impl Into<Bytes>, max_frame_size: usize) -> SendResult {
        let payload = payload.into();
        self.with_session(|session| session.send_data(payload, max_frame_size))
    }

    /// Sends a Close frame with the given status code and UTF-8 reason,
    /// then revokes all further sending on this connection. The scheduler
    /// waits up to two seconds for the peer's close echo before tearing the
    /// session down.
    pub fn send_close(&self, code: CloseCode, reason: &str) -> SendResult {
        self.with_session(|session| session.send_close(code, reason))
    }

    /// Sends a single unfragmented Ping frame. The payload must not exceed
    /// 125 bytes.
    pub fn send_ping(&self, payload: impl Into<Bytes>) -> SendResult {
        let payload = payload.into();
        self.with_session(|session| session.send_ping(payload))
    }

    /// Sends a single unfragmented Pong frame. The payload must not exceed
    /// 125 bytes.
    pub fn send_pong(&self, payload: impl Into<Bytes>) -> SendResult {
        let payload = payload.into();
        self.with_session(|session| session.send_pong(payload))
    }
}
