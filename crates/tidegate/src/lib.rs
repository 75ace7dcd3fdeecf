//! # tidegate
//!
//! An embeddable HTTP/1.1 + HTTPS server whose heart is an RFC 6455
//! WebSocket core: upgrade handshake, frame codec, per-connection state
//! machine, and a single-threaded scheduler that multiplexes every open
//! WebSocket in the process.
//!
//! Regular HTTP requests are dispatched to an embedder-supplied
//! [`RequestHandler`](http::RequestHandler). When a GET request satisfies the
//! WebSocket upgrade preconditions and the embedder's
//! [`ws::Handler`] claims the URL, the server answers `101 Switching
//! Protocols`, hijacks the socket, and manages a full-duplex framed session
//! until close.
//!
//! # Example
//!
//! ```no_run
//! use tidegate::{Config, Server};
//! use tidegate::http::Response;
//! use tidegate::ws::{self, Receivers, SendResult};
//!
//! fn main() -> tidegate::Result<()> {
//!     let handler = ws::Handler::new(
//!         |_url| true,
//!         |conn| {
//!             let senders = conn.senders.clone();
//!             Receivers::new(
//!                 move |_id, _opcode, payload| {
//!                     // Echo every data message back on the same connection.
//!                     if senders.send_data(payload, 0) != SendResult::Success {
//!                         eprintln!("echo failed");
//!                     }
//!                 },
//!                 |_id, _opcode, _payload| {},
//!             )
//!         },
//!     );
//!
//!     let _server = Server::new(
//!         Config { port: 2345, ..Config::default() },
//!         |_req| Response { code: 404, content: "websocket only".into() },
//!         Some(handler),
//!     )?;
//!
//!     loop {
//!         std::thread::sleep(std::time::Duration::from_secs(1));
//!     }
//! }
//! ```
//!
//! # Threading model
//!
//! Two kinds of long-lived threads exist:
//!
//! - The HTTP engine's accept loop and its per-connection handler threads.
//!   They call into the WebSocket core only once per connection, at upgrade
//!   time.
//! - A single WebSocket **scheduler thread** that polls every open session,
//!   decodes inbound frames, and drives the protocol state machine. All
//!   [`ws::Receivers`] callbacks run on this thread and must not block it.
//!
//! Outbound sends go through [`ws::Senders`] handles, which are cloneable,
//! callable from any thread, and serialized per connection by an internal
//! mutex so frames never interleave on the wire.

pub mod close;
pub mod codec;
pub mod frame;
pub mod handshake;
pub mod http;
#[doc(hidden)]
pub mod mask;
pub mod ws;

mod poller;
mod sched;
mod server;
mod session;
mod stream;

pub use server::{Config, Server};
pub use stream::MaybeTlsStream;
use thiserror::Error;

/// Result type for server and protocol operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised at construction time or by the WebSocket protocol layer.
///
/// Protocol variants are produced by the frame decoder; the session maps each
/// of them to the RFC 6455 close code sent to the peer before teardown (see
/// [`Error::close_code`]). Construction variants are the only errors an
/// embedder ever observes directly.
#[derive(Error, Debug)]
pub enum Error {
    /// The configured port was outside 1..=65535.
    #[error("invalid port number, must be in the range 1 to 65535")]
    InvalidPort,

    /// `max_socket_bytes_to_receive` was zero.
    #[error("invalid maximum socket bytes to receive, must be greater than zero")]
    InvalidReceiveChunk,

    /// A frame arrived with one of RSV1-3 set.
    #[error("reserved bits are not zero")]
    ReservedBitsNotZero,

    /// A frame header carried an opcode outside the RFC 6455 table.
    #[error("invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// A control frame arrived with FIN clear.
    #[error("control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame carried more than 125 payload bytes.
    #[error("control frame payload exceeds 125 bytes")]
    ControlFrameTooLarge,

    /// A frame payload exceeded the decoder's configured maximum.
    #[error("frame payload exceeds the configured maximum")]
    FrameTooLarge,

    /// A close reason was not valid UTF-8.
    #[error("invalid UTF-8")]
    InvalidUtf8,

    /// The PEM data handed to the HTTPS constructor held no certificate.
    #[error("no certificate found in PEM data")]
    MissingCertificate,

    /// The PEM data handed to the HTTPS constructor held no private key.
    #[error("no private key found in PEM data")]
    MissingPrivateKey,

    /// TLS configuration or handshake failure.
    #[error(transparent)]
    Tls(#[from] rustls::Error),

    /// I/O failure while starting the server.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The RFC 6455 close code a server sends after this decode failure.
    pub(crate) fn close_code(&self) -> close::CloseCode {
        match self {
            Error::FrameTooLarge => close::CloseCode::MESSAGE_TOO_BIG,
            _ => close::CloseCode::PROTOCOL_ERROR,
        }
    }
}
