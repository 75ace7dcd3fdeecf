//! The WebSocket scheduler: one background thread multiplexing every open
//! session.
//!
//! Each poll cycle applies pending poll-set changes, waits up to 500 ms for
//! readable sockets, dispatches the ready sessions' read steps, and then
//! consumes the close-pending set. Sessions that initiated a close and are
//! still awaiting the peer's echo stay registered until the echo arrives or
//! the 2000 ms window expires; everything else close-pending is destroyed
//! after the cycle.
//!
//! Inserts arrive from HTTP handler threads at upgrade time; removals only
//! ever happen on the scheduler thread. The two meet in the poller's
//! pending queues and the registry mutex, never on the hot read path.

use std::{
    collections::{HashMap, HashSet},
    io,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::{
    poller::Poller,
    session::{Reap, Session},
    stream::MaybeTlsStream,
    ws::{Connection, ConnectionId, Handler},
};

/// Bounded wait per poll cycle; also the upper bound on teardown latency.
const POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// How long a session that sent Close waits for the peer's echo.
const CLOSE_TIMEOUT: Duration = Duration::from_millis(2000);

struct Shared {
    running: AtomicBool,
    poller: Poller,
    sessions: Mutex<HashMap<ConnectionId, Arc<Session>>>,
    /// Ids whose sessions reported a close; drained every cycle.
    closing: Mutex<HashSet<ConnectionId>>,
}

pub(crate) struct Scheduler {
    shared: Arc<Shared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Scheduler {
    /// Starts the scheduler thread.
    pub(crate) fn start() -> io::Result<Arc<Self>> {
        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            poller: Poller::new()?,
            sessions: Mutex::new(HashMap::new()),
            closing: Mutex::new(HashSet::new()),
        });
        let thread = thread::Builder::new().name("tidegate-ws".into()).spawn({
            let shared = Arc::clone(&shared);
            move || run(shared)
        })?;
        Ok(Arc::new(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        }))
    }

    /// Installs a freshly upgraded connection: allocates its id, publishes
    /// the session, collects the embedder's receivers, replays any bytes
    /// the HTTP engine over-read past the upgrade request, and registers
    /// the socket with the poll set.
    pub(crate) fn install(
        &self,
        stream: MaybeTlsStream,
        url: &str,
        chunk: usize,
        handler: &Handler,
        extra: &[u8],
    ) {
        if !self.shared.running.load(Ordering::Relaxed) {
            debug!(%url, "scheduler stopped, dropping upgraded connection");
            return;
        }

        let id = ConnectionId::next();
        let fd = {
            use std::os::fd::AsRawFd;
            stream.as_raw_fd()
        };
        let session = Session::new(id, url.to_string(), chunk, stream, {
            let shared = Arc::downgrade(&self.shared);
            move |id| on_session_close(&shared, id)
        });
        self.shared.sessions.lock().insert(id, Arc::clone(&session));
        debug!(%id, %url, "websocket connection established");

        let connection = Connection {
            id,
            url: url.to_string(),
            senders: session.senders(),
        };
        let receivers = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            handler.connection_established(connection)
        }))
        .unwrap_or_else(|_| {
            error!(%id, "connection_established callback panicked");
            crate::ws::Receivers::default()
        });
        session.install_receivers(receivers);

        // Bytes handed over at protocol switch go through the decoder
        // before the first poll. They may even terminate the session, in
        // which case the socket is never registered and the close-pending
        // entry is reaped on the next cycle.
        if !extra.is_empty() && !session.feed(extra) {
            return;
        }

        let callback = {
            let session = Arc::clone(&session);
            Box::new(move || session.read_step())
        };
        self.shared.poller.add(id.as_key(), fd, callback);
    }

    /// Stops the scheduler thread, force-closes surviving sessions with
    /// 1001 GoingAway, and clears the registry. Idempotent.
    pub(crate) fn teardown(&self) {
        self.shared.running.store(false, Ordering::Relaxed);
        self.shared.poller.notify();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
        // Poll-set callbacks hold session references; drop them so the
        // sockets close once the registry drains below.
        self.shared.poller.clear();

        let sessions: Vec<_> = self.shared.sessions.lock().drain().collect();
        for (id, session) in sessions {
            debug!(%id, "closing websocket during teardown");
            session.shutdown();
        }
        self.shared.closing.lock().clear();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn on_session_close(shared: &Weak<Shared>, id: ConnectionId) {
    if let Some(shared) = shared.upgrade() {
        shared.closing.lock().insert(id);
        // Wake the cycle so reaping does not wait out the poll timeout.
        shared.poller.notify();
    }
}

fn run(shared: Arc<Shared>) {
    while shared.running.load(Ordering::Relaxed) {
        if let Err(err) = shared.poller.cycle(POLL_TIMEOUT) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!("error while polling websockets: {err}");
            thread::sleep(Duration::from_secs(2));
            continue;
        }
        reap_closed(&shared);
    }
}

/// Consumes the close-pending set, destroying every session that is done
/// and keeping the ones still awaiting a close echo within the timeout.
fn reap_closed(shared: &Shared) {
    let pending: Vec<ConnectionId> = shared.closing.lock().iter().copied().collect();
    for id in pending {
        let session = shared.sessions.lock().get(&id).cloned();
        let Some(session) = session else {
            warn!(%id, "close reported for an unknown websocket");
            shared.closing.lock().remove(&id);
            continue;
        };
        match session.reap_decision(CLOSE_TIMEOUT) {
            Reap::Wait => {}
            Reap::Now => {
                shared.poller.remove(id.as_key());
                shared.sessions.lock().remove(&id);
                shared.closing.lock().remove(&id);
                debug!(%id, "websocket session destroyed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::{TcpListener, TcpStream},
        sync::mpsc,
        time::Instant,
    };

    use bytes::{Bytes, BytesMut};

    use super::*;
    use crate::{
        close::CloseCode,
        codec::{Decoder, Encoder},
        frame::{Frame, OpCode},
        ws::{Receivers, SendResult, Senders},
    };

    const MASK: [u8; 4] = [9, 8, 7, 6];

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    struct Echoed {
        senders_rx: mpsc::Receiver<Senders>,
        data_rx: mpsc::Receiver<(ConnectionId, Bytes)>,
    }

    /// A handler that records senders and echoes text, wsEcho style.
    fn echo_handler() -> (Handler, Echoed) {
        let (senders_tx, senders_rx) = mpsc::channel();
        let (data_tx, data_rx) = mpsc::channel();
        let handler = Handler::new(
            |_url| true,
            move |conn| {
                senders_tx.send(conn.senders.clone()).unwrap();
                let senders = conn.senders;
                let data_tx = data_tx.clone();
                Receivers::new(
                    move |id, _opcode, payload| {
                        data_tx.send((id, payload.clone())).unwrap();
                        senders.send_data(payload, 0);
                    },
                    |_, _, _| {},
                )
            },
        );
        (handler, Echoed { senders_rx, data_rx })
    }

    fn write_client_frame(client: &mut TcpStream, frame: Frame) {
        let mut buf = BytesMut::new();
        Encoder::encode(frame.with_mask(MASK), &mut buf);
        client.write_all(&buf).unwrap();
    }

    fn read_server_frame(client: &mut TcpStream) -> Frame {
        let mut decoder = Decoder::default();
        let mut buf = BytesMut::new();
        let mut scratch = [0u8; 4096];
        loop {
            if let Some(frame) = decoder.decode(&mut buf).unwrap() {
                return frame;
            }
            let n = client.read(&mut scratch).unwrap();
            assert!(n > 0, "connection closed while waiting for a frame");
            buf.extend_from_slice(&scratch[..n]);
        }
    }

    /// Reads until the peer closes the connection, returning any close
    /// frame observed on the way.
    fn read_until_eof(client: &mut TcpStream) -> Option<Frame> {
        let mut decoder = Decoder::default();
        let mut buf = BytesMut::new();
        let mut scratch = [0u8; 4096];
        let mut close = None;
        loop {
            while let Some(frame) = decoder.decode(&mut buf).unwrap() {
                if frame.opcode() == OpCode::Close {
                    close = Some(frame);
                }
            }
            match client.read(&mut scratch) {
                Ok(0) => return close,
                Ok(n) => buf.extend_from_slice(&scratch[..n]),
                Err(err) => panic!("read failed while awaiting eof: {err}"),
            }
        }
    }

    #[test]
    fn echoes_through_the_scheduler() {
        let scheduler = Scheduler::start().unwrap();
        let (handler, echoed) = echo_handler();
        let (mut client, server) = tcp_pair();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        scheduler.install(MaybeTlsStream::from(server), "/echo", 1024, &handler, &[]);

        write_client_frame(&mut client, Frame::text("hello"));
        let frame = read_server_frame(&mut client);
        assert_eq!(frame.opcode(), OpCode::Text);
        assert_eq!(frame.payload().as_ref(), b"hello");

        write_client_frame(&mut client, Frame::text("world"));
        let frame = read_server_frame(&mut client);
        assert_eq!(frame.payload().as_ref(), b"world");

        let (_, first) = echoed.data_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(first.as_ref(), b"hello");

        scheduler.teardown();
    }

    #[test]
    fn replays_extra_bytes_before_first_poll() {
        let scheduler = Scheduler::start().unwrap();
        let (handler, echoed) = echo_handler();
        let (mut client, server) = tcp_pair();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        // The client pipelined a frame right behind its upgrade request.
        let mut extra = BytesMut::new();
        Encoder::encode(Frame::text("pipelined").with_mask(MASK), &mut extra);
        scheduler.install(
            MaybeTlsStream::from(server),
            "/echo",
            1024,
            &handler,
            &extra,
        );

        let frame = read_server_frame(&mut client);
        assert_eq!(frame.payload().as_ref(), b"pipelined");
        let (_, payload) = echoed.data_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(payload.as_ref(), b"pipelined");

        scheduler.teardown();
    }

    #[test]
    fn close_timeout_destroys_the_session() {
        let scheduler = Scheduler::start().unwrap();
        let (handler, echoed) = echo_handler();
        let (mut client, server) = tcp_pair();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        scheduler.install(MaybeTlsStream::from(server), "/echo", 1024, &handler, &[]);
        let senders = echoed
            .senders_rx
            .recv_timeout(Duration::from_secs(1))
            .unwrap();

        let started = Instant::now();
        assert_eq!(
            senders.send_close(CloseCode::NORMAL, "bye"),
            SendResult::Success
        );
        assert_eq!(senders.send_data("after close", 0), SendResult::Closed);

        // The peer never echoes; the session must be gone within the close
        // timeout plus one poll cycle.
        let close = read_until_eof(&mut client);
        let elapsed = started.elapsed();
        assert_eq!(close.expect("close frame").close_code(), Some(CloseCode::NORMAL));
        assert!(
            elapsed >= Duration::from_millis(1900),
            "destroyed too early: {elapsed:?}"
        );
        assert!(
            elapsed <= Duration::from_millis(3500),
            "destroyed too late: {elapsed:?}"
        );

        scheduler.teardown();
    }

    #[test]
    fn close_echo_ends_the_session_promptly() {
        let scheduler = Scheduler::start().unwrap();
        let (handler, echoed) = echo_handler();
        let (mut client, server) = tcp_pair();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        scheduler.install(MaybeTlsStream::from(server), "/echo", 1024, &handler, &[]);
        let senders = echoed
            .senders_rx
            .recv_timeout(Duration::from_secs(1))
            .unwrap();

        assert_eq!(senders.send_close(CloseCode::NORMAL, ""), SendResult::Success);
        let close = read_server_frame(&mut client);
        assert_eq!(close.opcode(), OpCode::Close);

        let started = Instant::now();
        write_client_frame(&mut client, Frame::close(CloseCode::NORMAL, ""));
        assert!(read_until_eof(&mut client).is_none());
        assert!(started.elapsed() < Duration::from_millis(1500));

        scheduler.teardown();
    }

    #[test]
    fn teardown_sends_going_away() {
        let scheduler = Scheduler::start().unwrap();
        let (handler, _echoed) = echo_handler();
        let (mut client, server) = tcp_pair();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        scheduler.install(MaybeTlsStream::from(server), "/echo", 1024, &handler, &[]);
        // Make sure the session is registered before tearing down.
        write_client_frame(&mut client, Frame::text("warm-up"));
        let _ = read_server_frame(&mut client);

        scheduler.teardown();
        let close = read_until_eof(&mut client).expect("going-away close");
        assert_eq!(close.close_code(), Some(CloseCode::GOING_AWAY));
    }
}
