//! Embedder-facing WebSocket surface: connection identifiers, send results,
//! and the revocable [`Senders`] / [`Receivers`] / [`Handler`] handles.
//!
//! All three handles are lightweight shared references. User code may clone
//! them freely and keep copies beyond a connection's lifetime; the core
//! severs the link when the connection dies, after which sends report
//! [`SendResult::Closed`] and receives become no-ops.

mod handler;
mod receivers;
mod senders;

use std::sync::atomic::{AtomicU64, Ordering};

pub use handler::{Connection, Handler};
pub use receivers::{ControlOpCode, DataOpCode, Receivers};
pub(crate) use senders::SendersCell;
pub use senders::Senders;

/// Identifier of one upgraded WebSocket connection.
///
/// Ids are allocated from a single library-wide counter shared by every
/// server instance in the process, so they are unique, strictly increasing,
/// and never reused for the lifetime of the host.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

impl ConnectionId {
    /// Allocates the next id.
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The poll-set key this connection registers under.
    pub(crate) fn as_key(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Outcome of a [`Senders`] operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SendResult {
    /// The frame(s) were written to the socket.
    Success,
    /// A socket-level write failure; the session is left to be reaped by
    /// peer close or timeout.
    Failure,
    /// The connection has been closed (or is closing) and no longer accepts
    /// sends.
    Closed,
    /// The handle was default-constructed and is not attached to any
    /// connection.
    NoImplementation,
    /// `max_frame_size` was too small to fit a frame header plus at least
    /// one payload byte.
    FrameSizeTooSmall,
}
