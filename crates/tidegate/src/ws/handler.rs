//! The embedder's entry point for accepting WebSocket connections.

use std::sync::Arc;

use parking_lot::Mutex;

use super::{ConnectionId, Receivers, Senders};

/// Everything the embedder learns about a freshly upgraded connection.
pub struct Connection {
    /// Process-unique identifier of this connection.
    pub id: ConnectionId,
    /// URL path of the original upgrade request.
    pub url: String,
    /// Handle for sending on this connection; clone and keep it.
    pub senders: Senders,
}

type IsHandled = Arc<dyn Fn(&str) -> bool + Send + Sync>;
type ConnectionEstablished = Arc<dyn Fn(Connection) -> Receivers + Send + Sync>;

struct Callbacks {
    is_handled: IsHandled,
    connection_established: ConnectionEstablished,
}

/// Decides which upgrade requests are accepted and wires up new
/// connections.
///
/// A `Handler` is two functions. `is_handled` is consulted by the upgrade
/// gate with the request URL; returning `false` lets the request fall
/// through to the regular HTTP handler. After a successful protocol switch,
/// `connection_established` receives the [`Connection`] — id, url, and the
/// [`Senders`] handle — and returns the [`Receivers`] through which the
/// connection's messages will be delivered.
///
/// The handler is a lightweight shared handle; keep a clone after passing
/// it to the server. When the captured functions are about to become unsafe
/// to call (typically on destruction of their environment), call
/// [`stop_handling`](Handler::stop_handling): afterwards no URL is handled
/// and no connection is established.
#[derive(Clone)]
pub struct Handler {
    callbacks: Arc<Mutex<Option<Callbacks>>>,
}

impl Handler {
    /// Creates a handler from the two required callbacks.
    pub fn new(
        is_handled: impl Fn(&str) -> bool + Send + Sync + 'static,
        connection_established: impl Fn(Connection) -> Receivers + Send + Sync + 'static,
    ) -> Self {
        Self {
            callbacks: Arc::new(Mutex::new(Some(Callbacks {
                is_handled: Arc::new(is_handled),
                connection_established: Arc::new(connection_established),
            }))),
        }
    }

    /// Whether the embedder wants to handle a WebSocket connection for this
    /// URL. Always `false` after revocation.
    pub fn is_handled(&self, url: &str) -> bool {
        let callback = self
            .callbacks
            .lock()
            .as_ref()
            .map(|c| Arc::clone(&c.is_handled));
        match callback {
            Some(callback) => callback(url),
            None => false,
        }
    }

    /// Announces an established connection and collects the embedder's
    /// receivers. Returns an inert [`Receivers`] after revocation.
    pub fn connection_established(&self, connection: Connection) -> Receivers {
        let callback = self
            .callbacks
            .lock()
            .as_ref()
            .map(|c| Arc::clone(&c.connection_established));
        match callback {
            Some(callback) => callback(connection),
            None => Receivers::default(),
        }
    }

    /// Atomically drops both callbacks so they are never invoked again.
    pub fn stop_handling(&self) {
        *self.callbacks.lock() = None;
    }
}
