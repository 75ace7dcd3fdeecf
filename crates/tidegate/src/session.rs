//! Per-connection WebSocket session: the RFC 6455 state machine.
//!
//! A session owns the hijacked socket from the moment the upgrade gate
//! installs it until the connection dies. The scheduler thread drives all
//! reads — chunked `recv`, streaming decode, message reassembly, and the
//! protocol-mandated responses (pong echo, close echo, protocol-error
//! closes). Writes arrive from arbitrary user threads through the
//! [`Senders`](crate::ws::Senders) handle and from the scheduler thread
//! itself; a single writer mutex serializes them, held from header
//! formation through the final byte so frames never interleave on the wire.
//!
//! # Close handshake
//!
//! The handshake state moves monotonically:
//!
//! - `None` → `ClientInitiated` when the peer's Close arrives first; the
//!   payload is echoed byte-exact and the session terminates.
//! - `None` → `ServerInitiated` when the embedder calls `send_close`; the
//!   scheduler keeps polling for up to two seconds awaiting the peer's echo
//!   (`Complete`), then declares the session unusable.
//! - `None` → `Complete` directly on protocol errors, peer hang-up, and
//!   scheduler teardown — nothing to wait for.
//!
//! Once the state leaves `None`, every send operation reports `Closed`.

use std::{
    io::{self, Read, Write},
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::{
    close::CloseCode,
    codec::{Decoder, Encoder},
    frame::{Frame, MAX_HEAD_SIZE, OpCode, encoded_head_size},
    stream::MaybeTlsStream,
    ws::{
        ConnectionId, ControlOpCode, DataOpCode, Receivers, SendResult, Senders, SendersCell,
    },
};

/// Close handshake progress, §7 of RFC 6455.
enum CloseHandshake {
    /// No close frame has been sent or received.
    None,
    /// We sent Close and await the peer's echo.
    ServerInitiated { sent_at: Instant },
    /// The peer sent Close and we echoed it.
    ClientInitiated,
    /// Both sides have closed.
    Complete,
}

/// What the scheduler should do with a close-pending session.
pub(crate) enum Reap {
    /// Destroy it after the current cycle.
    Now,
    /// Keep polling; a close echo is still awaited.
    Wait,
}

struct Writer {
    close: CloseHandshake,
}

/// Read-side state, touched only on the scheduler thread.
struct ReadState {
    decoder: Decoder,
    /// Unparsed tail bytes carried across socket reads.
    buf: BytesMut,
    fragmented: Option<Fragmented>,
}

/// Accumulator between the initial non-FIN data frame and its FIN
/// continuation. At most one per session.
struct Fragmented {
    opcode: DataOpCode,
    payload: BytesMut,
}

pub(crate) struct Session {
    pub(crate) id: ConnectionId,
    url: String,
    /// Read chunk size per poll-ready event.
    chunk: usize,
    io: Mutex<MaybeTlsStream>,
    writer: Mutex<Writer>,
    read: Mutex<ReadState>,
    receivers: Mutex<Receivers>,
    senders_cell: Arc<SendersCell>,
    /// Reports this session to the scheduler's close-pending set.
    on_close: Box<dyn Fn(ConnectionId) + Send + Sync>,
}

impl Session {
    pub(crate) fn new(
        id: ConnectionId,
        url: String,
        chunk: usize,
        stream: MaybeTlsStream,
        on_close: impl Fn(ConnectionId) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Session>| Session {
            id,
            url,
            chunk,
            io: Mutex::new(stream),
            writer: Mutex::new(Writer {
                close: CloseHandshake::None,
            }),
            read: Mutex::new(ReadState {
                decoder: Decoder::default(),
                buf: BytesMut::new(),
                fragmented: None,
            }),
            receivers: Mutex::new(Receivers::default()),
            senders_cell: SendersCell::new(weak.clone()),
            on_close: Box::new(on_close),
        })
    }

    /// A user-facing sending handle backed by this session.
    pub(crate) fn senders(&self) -> Senders {
        Senders::from_cell(Arc::clone(&self.senders_cell))
    }

    /// Installs the receivers returned by the embedder's
    /// `connection_established` callback. Called once, before the first
    /// byte is decoded.
    pub(crate) fn install_receivers(&self, receivers: Receivers) {
        *self.receivers.lock() = receivers;
    }

    // ================== Read path (scheduler thread) ==================

    /// One poll-ready read step. Returns `false` when the descriptor should
    /// be deregistered because the session terminated.
    pub(crate) fn read_step(&self) -> bool {
        let mut buf = vec![0u8; self.chunk];
        let read = { self.io.lock().read(&mut buf) };
        match read {
            Err(err)
                if err.kind() == io::ErrorKind::Interrupted
                    || err.kind() == io::ErrorKind::WouldBlock =>
            {
                true
            }
            Err(err) => {
                // Treated as transient; a dead socket surfaces as a
                // zero-byte read on a later cycle.
                error!(id = %self.id, "error reading from socket: {err}");
                true
            }
            Ok(0) => {
                debug!(id = %self.id, url = %self.url, "peer hung up");
                self.writer.lock().close = CloseHandshake::Complete;
                self.senders_cell.revoke();
                (self.on_close)(self.id);
                false
            }
            Ok(n) => self.feed(&buf[..n]),
        }
    }

    /// Feeds raw socket bytes through the decoder and applies the state
    /// machine to every completed frame. Also used at install time for
    /// bytes the HTTP engine over-read past the upgrade request.
    ///
    /// A panic in a receiver callback terminates this session but must not
    /// take the scheduler thread (and every other connection) with it.
    pub(crate) fn feed(&self, bytes: &[u8]) -> bool {
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| self.feed_inner(bytes))) {
            Ok(keep) => keep,
            Err(_) => {
                error!(id = %self.id, "receiver callback panicked, destroying session");
                {
                    let mut writer = self.writer.lock();
                    if matches!(writer.close, CloseHandshake::None) {
                        writer.close = CloseHandshake::Complete;
                    }
                }
                self.senders_cell.revoke();
                (self.on_close)(self.id);
                false
            }
        }
    }

    fn feed_inner(&self, bytes: &[u8]) -> bool {
        self.read.lock().buf.extend_from_slice(bytes);
        loop {
            let decoded = {
                let mut read = self.read.lock();
                let ReadState { decoder, buf, .. } = &mut *read;
                decoder.decode(buf)
            };
            match decoded {
                Ok(Some(frame)) => {
                    if !self.on_frame(frame) {
                        return false;
                    }
                }
                Ok(None) => return true,
                Err(err) => {
                    warn!(id = %self.id, "protocol violation: {err}");
                    self.abort_with(err.close_code(), &err.to_string());
                    return false;
                }
            }
        }
    }

    /// The transition table. Returns `false` when the session terminated.
    fn on_frame(&self, frame: Frame) -> bool {
        // RFC 6455 Section 5.1: the server MUST close the connection upon
        // receiving a frame that is not masked, and MAY send a close frame
        // with status code 1002 first.
        if frame.mask().is_none() {
            self.abort_with(CloseCode::PROTOCOL_ERROR, "received unmasked frame");
            return false;
        }

        let opcode = frame.opcode();
        let fin = frame.is_fin();
        let payload = frame.into_payload();

        match opcode {
            OpCode::Text | OpCode::Binary => {
                let data_opcode = if opcode == OpCode::Text {
                    DataOpCode::Text
                } else {
                    DataOpCode::Binary
                };
                {
                    let mut read = self.read.lock();
                    if read.fragmented.is_some() {
                        drop(read);
                        self.abort_with(
                            CloseCode::PROTOCOL_ERROR,
                            "unexpected data frame received, expected continuation",
                        );
                        return false;
                    }
                    if !fin {
                        // First fragment; the message is delivered when the
                        // FIN continuation arrives.
                        read.fragmented = Some(Fragmented {
                            opcode: data_opcode,
                            payload: BytesMut::from(&payload[..]),
                        });
                        return true;
                    }
                }
                self.deliver_data(data_opcode, payload);
                true
            }
            OpCode::Continuation => {
                let completed = {
                    let mut read = self.read.lock();
                    let Some(mut fragmented) = read.fragmented.take() else {
                        drop(read);
                        self.abort_with(CloseCode::PROTOCOL_ERROR, "unexpected continuation frame received");
                        return false;
                    };
                    fragmented.payload.extend_from_slice(&payload);
                    if fin {
                        Some((fragmented.opcode, fragmented.payload.freeze()))
                    } else {
                        read.fragmented = Some(fragmented);
                        None
                    }
                };
                if let Some((data_opcode, message)) = completed {
                    self.deliver_data(data_opcode, message);
                }
                true
            }
            OpCode::Ping => {
                self.deliver_control(ControlOpCode::Ping, payload.clone());
                // Parrot the payload back in a Pong, RFC 6455 Section 5.5.3.
                let writer = self.writer.lock();
                if matches!(writer.close, CloseHandshake::None) {
                    if let Err(err) = self.write_frame(Frame::pong(payload)) {
                        warn!(id = %self.id, "failed to send pong: {err}");
                    }
                }
                true
            }
            OpCode::Pong => {
                self.deliver_control(ControlOpCode::Pong, payload);
                true
            }
            OpCode::Close => {
                // Even while awaiting our own close echo the notification is
                // still passed out; it can be useful to the embedder.
                self.deliver_control(ControlOpCode::Close, payload.clone());

                let mut writer = self.writer.lock();
                match writer.close {
                    CloseHandshake::None => {
                        writer.close = CloseHandshake::ClientInitiated;
                        // Echo the payload byte-exact (RFC 6455 Section
                        // 5.5.1); the inbound frame's header cannot be
                        // reused as it carries the mask bit.
                        if let Err(err) = self.write_frame(Frame::close_raw(payload)) {
                            warn!(id = %self.id, "failed to echo close: {err}");
                        }
                        drop(writer);
                        self.senders_cell.revoke();
                        (self.on_close)(self.id);
                    }
                    CloseHandshake::ServerInitiated { .. } => {
                        // The peer's echo of our close; handshake complete.
                        writer.close = CloseHandshake::Complete;
                        drop(writer);
                        (self.on_close)(self.id);
                    }
                    CloseHandshake::ClientInitiated | CloseHandshake::Complete => {
                        // Already answered; ignore.
                    }
                }
                false
            }
        }
    }

    fn deliver_data(&self, opcode: DataOpCode, payload: Bytes) {
        let receivers = self.receivers.lock().clone();
        receivers.receive_data(self.id, opcode, payload);
    }

    fn deliver_control(&self, opcode: ControlOpCode, payload: Bytes) {
        let receivers = self.receivers.lock().clone();
        receivers.receive_control(self.id, opcode, payload);
    }

    /// Emits a Close frame and terminally closes the session, used for
    /// protocol errors where no close echo is awaited.
    fn abort_with(&self, code: CloseCode, reason: &str) {
        {
            let mut writer = self.writer.lock();
            if !matches!(writer.close, CloseHandshake::None) {
                return;
            }
            writer.close = CloseHandshake::Complete;
            if let Err(err) = self.write_frame(Frame::close(code, reason)) {
                debug!(id = %self.id, "failed to send close: {err}");
            }
        }
        self.senders_cell.revoke();
        (self.on_close)(self.id);
    }

    // ================== Write paths (any thread) ==================

    /// Sends a complete Text message, split into FIN-terminated fragments
    /// when `max_frame_size` is non-zero.
    pub(crate) fn send_data(&self, payload: Bytes, max_frame_size: usize) -> SendResult {
        let writer = self.writer.lock();
        if !matches!(writer.close, CloseHandshake::None) {
            return SendResult::Closed;
        }

        let head = encoded_head_size(payload.len(), false);
        if max_frame_size != 0 && max_frame_size <= head {
            warn!(id = %self.id, "max frame size {max_frame_size} is too low");
            return SendResult::FrameSizeTooSmall;
        }

        let result = if max_frame_size == 0 {
            self.write_frame(Frame::text(payload))
        } else {
            self.write_split(payload, max_frame_size, head)
        };
        match result {
            Ok(()) => SendResult::Success,
            Err(err) => {
                error!(id = %self.id, "failed to send data message: {err}");
                SendResult::Failure
            }
        }
    }

    /// Splits a message so every frame's encoded size (header + payload)
    /// stays within `max_frame_size`. The header size is computed once from
    /// the full payload; the final frame carries FIN.
    fn write_split(&self, mut payload: Bytes, max_frame_size: usize, head: usize) -> io::Result<()> {
        let per_frame = max_frame_size - head;
        let mut first = true;
        while payload.len() + head > max_frame_size {
            let chunk = payload.split_to(per_frame);
            let opcode = if first {
                OpCode::Text
            } else {
                OpCode::Continuation
            };
            self.write_frame(Frame::from_parts(false, opcode, None, chunk))?;
            first = false;
        }
        let opcode = if first {
            OpCode::Text
        } else {
            OpCode::Continuation
        };
        self.write_frame(Frame::from_parts(true, opcode, None, payload))
    }

    /// Initiates the close handshake. The senders are revoked immediately;
    /// the scheduler waits (bounded) for the peer's echo.
    pub(crate) fn send_close(&self, code: CloseCode, reason: &str) -> SendResult {
        let result = {
            let mut writer = self.writer.lock();
            if !matches!(writer.close, CloseHandshake::None) {
                return SendResult::Closed;
            }
            writer.close = CloseHandshake::ServerInitiated {
                sent_at: Instant::now(),
            };
            self.write_frame(Frame::close(code, reason))
        };
        self.senders_cell.revoke();
        (self.on_close)(self.id);
        match result {
            Ok(()) => SendResult::Success,
            Err(err) => {
                error!(id = %self.id, "failed to send close: {err}");
                SendResult::Failure
            }
        }
    }

    pub(crate) fn send_ping(&self, payload: Bytes) -> SendResult {
        self.send_control(Frame::ping(payload))
    }

    pub(crate) fn send_pong(&self, payload: Bytes) -> SendResult {
        self.send_control(Frame::pong(payload))
    }

    fn send_control(&self, frame: Frame) -> SendResult {
        let writer = self.writer.lock();
        if !matches!(writer.close, CloseHandshake::None) {
            return SendResult::Closed;
        }
        if frame.payload().len() > 125 {
            warn!(id = %self.id, "control frame payload exceeds 125 bytes");
            return SendResult::Failure;
        }
        match self.write_frame(frame) {
            Ok(()) => SendResult::Success,
            Err(err) => {
                error!(id = %self.id, "failed to send control frame: {err}");
                SendResult::Failure
            }
        }
    }

    /// Encodes and writes one frame. Callers hold the writer mutex; the
    /// write loop retries short writes and treats `WouldBlock` as a retry
    /// since the socket blocks.
    fn write_frame(&self, frame: Frame) -> io::Result<()> {
        let mut buf = BytesMut::with_capacity(MAX_HEAD_SIZE + frame.payload().len());
        Encoder::encode(frame, &mut buf);

        let mut io = self.io.lock();
        let mut written = 0;
        while written < buf.len() {
            match io.write(&buf[written..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket closed mid-frame",
                    ));
                }
                Ok(n) => {
                    if written + n < buf.len() {
                        debug!(id = %self.id, "did not send full frame, continuing");
                    }
                    written += n;
                }
                Err(err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::Interrupted =>
                {
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        io.flush()
    }

    // ================== Scheduler hooks ==================

    /// Whether a close-pending session can be destroyed now or is still
    /// awaiting the peer's close echo within the timeout window.
    pub(crate) fn reap_decision(&self, timeout: Duration) -> Reap {
        let mut writer = self.writer.lock();
        match writer.close {
            CloseHandshake::ServerInitiated { sent_at } => {
                if sent_at.elapsed() > timeout {
                    warn!(
                        id = %self.id,
                        "no close confirmation received within {} ms, destroying session",
                        timeout.as_millis()
                    );
                    writer.close = CloseHandshake::Complete;
                    Reap::Now
                } else {
                    Reap::Wait
                }
            }
            CloseHandshake::None => {
                warn!(id = %self.id, "close reported with no close initiated");
                Reap::Now
            }
            _ => Reap::Now,
        }
    }

    /// Scheduler teardown: a best-effort 1001 GoingAway close for sessions
    /// the clients never closed.
    pub(crate) fn shutdown(&self) {
        {
            let mut writer = self.writer.lock();
            if matches!(writer.close, CloseHandshake::None) {
                writer.close = CloseHandshake::Complete;
                if let Err(err) = self.write_frame(Frame::close(CloseCode::GOING_AWAY, "")) {
                    debug!(id = %self.id, "failed to send going-away close: {err}");
                }
            }
        }
        self.senders_cell.revoke();
    }
}
