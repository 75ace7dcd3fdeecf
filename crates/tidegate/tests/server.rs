//! End-to-end tests driving a real server over loopback TCP with a
//! hand-rolled client: raw HTTP for the handshake, the public codec for the
//! frames.

use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use tidegate::{
    Config, Server,
    close::CloseCode,
    codec::{Decoder, Encoder},
    frame::{Frame, OpCode},
    http::{Request, Response},
    ws::{self, ConnectionId, ControlOpCode, DataOpCode, Receivers, SendResult, Senders},
};

const MASK: [u8; 4] = [0xAA, 0xBB, 0xCC, 0xDD];
const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
const SAMPLE_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn request_handler(_req: Request) -> Response {
    Response {
        code: 404,
        content: "This is a websocket echo server only. Regular http ignored.".into(),
    }
}

struct EchoSetup {
    senders_rx: mpsc::Receiver<Senders>,
    data_rx: mpsc::Receiver<(ConnectionId, DataOpCode, Bytes)>,
    control_rx: mpsc::Receiver<(ConnectionId, ControlOpCode, Bytes)>,
}

/// The wsEcho wiring: every URL accepted, text echoed, binary ignored.
fn echo_server() -> (Server, u16, EchoSetup) {
    let (senders_tx, senders_rx) = mpsc::channel();
    let (data_tx, data_rx) = mpsc::channel();
    let (control_tx, control_rx) = mpsc::channel();

    let handler = ws::Handler::new(
        |_url| true,
        move |conn| {
            senders_tx.send(conn.senders.clone()).unwrap();
            let senders = conn.senders;
            let data_tx = data_tx.clone();
            let control_tx = control_tx.clone();
            Receivers::new(
                move |id, opcode, payload| {
                    data_tx.send((id, opcode, payload.clone())).unwrap();
                    if opcode == DataOpCode::Binary {
                        return;
                    }
                    if senders.send_data(payload, 0) != SendResult::Success {
                        eprintln!("failed to echo data frame");
                    }
                },
                move |id, opcode, payload| {
                    control_tx.send((id, opcode, payload)).unwrap();
                },
            )
        },
    );

    let port = free_port();
    let server = Server::new(
        Config {
            port,
            ..Config::default()
        },
        request_handler,
        Some(handler),
    )
    .expect("server starts");

    (
        server,
        port,
        EchoSetup {
            senders_rx,
            data_rx,
            control_rx,
        },
    )
}

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

/// Reads one HTTP response head (through the blank line) as a string.
fn read_response_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).expect("response head");
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

fn upgrade(stream: &mut TcpStream, url: &str) {
    let request = format!(
        "GET {url} HTTP/1.1\r\n\
         Host: localhost\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: {SAMPLE_KEY}\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).unwrap();
    let head = read_response_head(stream);
    assert!(
        head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"),
        "unexpected response: {head}"
    );
    assert!(head.contains(&format!("Sec-WebSocket-Accept: {SAMPLE_ACCEPT}\r\n")));
}

fn write_masked_frame(stream: &mut TcpStream, frame: Frame) {
    let mut buf = BytesMut::new();
    Encoder::encode(frame.with_mask(MASK), &mut buf);
    stream.write_all(&buf).unwrap();
}

fn read_frame(stream: &mut TcpStream, decoder: &mut Decoder, buf: &mut BytesMut) -> Frame {
    let mut scratch = [0u8; 4096];
    loop {
        if let Some(frame) = decoder.decode(buf).unwrap() {
            return frame;
        }
        let n = stream.read(&mut scratch).unwrap();
        assert!(n > 0, "connection closed while waiting for a frame");
        buf.extend_from_slice(&scratch[..n]);
    }
}

/// Reads until EOF, returning the last close frame seen, if any.
fn read_until_eof(stream: &mut TcpStream, decoder: &mut Decoder, buf: &mut BytesMut) -> Option<Frame> {
    let mut scratch = [0u8; 4096];
    let mut close = None;
    loop {
        while let Some(frame) = decoder.decode(buf).unwrap() {
            if frame.opcode() == OpCode::Close {
                close = Some(frame);
            }
        }
        match stream.read(&mut scratch) {
            Ok(0) => return close,
            Ok(n) => buf.extend_from_slice(&scratch[..n]),
            Err(err) => panic!("read failed while awaiting eof: {err}"),
        }
    }
}

#[test]
fn plain_http_hits_the_request_handler() {
    let (_server, port, _setup) = echo_server();
    let mut stream = connect(port);

    stream
        .write_all(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .unwrap();
    let head = read_response_head(&mut stream);
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));

    let mut body = String::new();
    stream.read_to_string(&mut body).unwrap();
    assert!(body.contains("websocket echo server only"));
}

#[test]
fn upgrade_without_mandatory_header_is_not_switched() {
    let (_server, port, _setup) = echo_server();
    let mut stream = connect(port);

    // No Sec-WebSocket-Key: the request falls through to the handler.
    stream
        .write_all(
            b"GET /ws HTTP/1.1\r\n\
              Host: localhost\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .unwrap();
    let head = read_response_head(&mut stream);
    assert!(head.starts_with("HTTP/1.1 404 "), "got: {head}");
}

#[test]
fn echo_text_then_client_close() {
    let (_server, port, setup) = echo_server();
    let mut stream = connect(port);
    upgrade(&mut stream, "/echo");

    let mut decoder = Decoder::default();
    let mut buf = BytesMut::new();

    write_masked_frame(&mut stream, Frame::text("hello"));
    let frame = read_frame(&mut stream, &mut decoder, &mut buf);
    assert_eq!(frame.opcode(), OpCode::Text);
    assert_eq!(frame.payload().as_ref(), b"hello");
    assert!(frame.mask().is_none(), "server frames are unmasked");

    write_masked_frame(&mut stream, Frame::text("world"));
    let frame = read_frame(&mut stream, &mut decoder, &mut buf);
    assert_eq!(frame.payload().as_ref(), b"world");

    // Client-initiated close: the server echoes the payload exactly once
    // and tears the connection down.
    write_masked_frame(&mut stream, Frame::close(CloseCode::NORMAL, ""));
    let close = read_until_eof(&mut stream, &mut decoder, &mut buf).expect("close echo");
    assert_eq!(close.close_code(), Some(CloseCode::NORMAL));

    let (_, opcode, _) = setup.control_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(opcode, ControlOpCode::Close);
}

#[test]
fn fragmented_message_is_reassembled_once() {
    let (_server, port, setup) = echo_server();
    let mut stream = connect(port);
    upgrade(&mut stream, "/echo");

    write_masked_frame(&mut stream, Frame::text("ab").with_fin(false));
    write_masked_frame(&mut stream, Frame::continuation("cd").with_fin(false));
    write_masked_frame(&mut stream, Frame::continuation("ef"));

    let (_, opcode, payload) = setup.data_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(opcode, DataOpCode::Text);
    assert_eq!(payload.as_ref(), b"abcdef");
    assert!(
        setup.data_rx.try_recv().is_err(),
        "one message per FIN, not per frame"
    );

    // And the echo comes back as one frame.
    let mut decoder = Decoder::default();
    let mut buf = BytesMut::new();
    let frame = read_frame(&mut stream, &mut decoder, &mut buf);
    assert_eq!(frame.payload().as_ref(), b"abcdef");
}

#[test]
fn server_fragments_downstream_sends() {
    let (_server, port, setup) = echo_server();
    let mut stream = connect(port);
    upgrade(&mut stream, "/echo");

    let senders = setup
        .senders_rx
        .recv_timeout(Duration::from_secs(2))
        .unwrap();
    // 2 header bytes + 3 payload bytes per frame.
    assert_eq!(
        senders.send_data("abcdefghij", tidegate::frame::encoded_head_size(10, false) + 3),
        SendResult::Success
    );

    let mut decoder = Decoder::default();
    let mut buf = BytesMut::new();
    let expected = [
        (OpCode::Text, false, &b"abc"[..]),
        (OpCode::Continuation, false, b"def"),
        (OpCode::Continuation, false, b"ghi"),
        (OpCode::Continuation, true, b"j"),
    ];
    for (opcode, fin, payload) in expected {
        let frame = read_frame(&mut stream, &mut decoder, &mut buf);
        assert_eq!(frame.opcode(), opcode);
        assert_eq!(frame.is_fin(), fin);
        assert_eq!(frame.payload().as_ref(), payload);
        assert!(frame.mask().is_none());
    }
}

#[test]
fn ping_is_answered_and_reported() {
    let (_server, port, setup) = echo_server();
    let mut stream = connect(port);
    upgrade(&mut stream, "/echo");

    write_masked_frame(&mut stream, Frame::ping("xyz"));

    let mut decoder = Decoder::default();
    let mut buf = BytesMut::new();
    let pong = read_frame(&mut stream, &mut decoder, &mut buf);
    assert_eq!(pong.opcode(), OpCode::Pong);
    assert_eq!(pong.payload().as_ref(), b"xyz");

    let (_, opcode, payload) = setup
        .control_rx
        .recv_timeout(Duration::from_secs(1))
        .unwrap();
    assert_eq!(opcode, ControlOpCode::Ping);
    assert_eq!(payload.as_ref(), b"xyz");
}

#[test]
fn unmasked_frame_draws_1002_and_termination() {
    let (_server, port, _setup) = echo_server();
    let mut stream = connect(port);
    upgrade(&mut stream, "/echo");

    let mut raw = BytesMut::new();
    Encoder::encode(Frame::text("bare"), &mut raw);
    stream.write_all(&raw).unwrap();

    let mut decoder = Decoder::default();
    let mut buf = BytesMut::new();
    let close = read_until_eof(&mut stream, &mut decoder, &mut buf).expect("protocol close");
    assert_eq!(close.close_code(), Some(CloseCode::PROTOCOL_ERROR));
}

#[test]
fn binary_messages_are_not_echoed() {
    let (_server, port, setup) = echo_server();
    let mut stream = connect(port);
    upgrade(&mut stream, "/echo");

    write_masked_frame(&mut stream, Frame::binary(vec![1, 2, 3]));
    let (_, opcode, _) = setup.data_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(opcode, DataOpCode::Binary);

    // A text message sent afterwards is echoed first: nothing was queued
    // for the binary one.
    write_masked_frame(&mut stream, Frame::text("after"));
    let mut decoder = Decoder::default();
    let mut buf = BytesMut::new();
    let frame = read_frame(&mut stream, &mut decoder, &mut buf);
    assert_eq!(frame.opcode(), OpCode::Text);
    assert_eq!(frame.payload().as_ref(), b"after");
}

#[test]
fn server_close_without_echo_times_out() {
    let (_server, port, setup) = echo_server();
    let mut stream = connect(port);
    upgrade(&mut stream, "/echo");

    let senders = setup
        .senders_rx
        .recv_timeout(Duration::from_secs(2))
        .unwrap();

    let started = Instant::now();
    assert_eq!(senders.send_close(CloseCode::NORMAL, ""), SendResult::Success);
    assert_eq!(senders.send_data("too late", 0), SendResult::Closed);
    assert_eq!(senders.send_ping(""), SendResult::Closed);

    let mut decoder = Decoder::default();
    let mut buf = BytesMut::new();
    let close = read_until_eof(&mut stream, &mut decoder, &mut buf).expect("close frame");
    assert_eq!(close.close_code(), Some(CloseCode::NORMAL));

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(1900), "too early: {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(3500), "too late: {elapsed:?}");
}

#[test]
fn dropping_the_server_sends_going_away() {
    let (server, port, setup) = echo_server();
    let mut stream = connect(port);
    upgrade(&mut stream, "/echo");

    // Make sure the session is live before shutdown.
    write_masked_frame(&mut stream, Frame::text("warm-up"));
    let mut decoder = Decoder::default();
    let mut buf = BytesMut::new();
    let _ = read_frame(&mut stream, &mut decoder, &mut buf);

    drop(server);
    let close = read_until_eof(&mut stream, &mut decoder, &mut buf).expect("going-away close");
    assert_eq!(close.close_code(), Some(CloseCode::GOING_AWAY));
    drop(setup);
}

#[test]
fn keep_alive_serves_multiple_requests() {
    let (_server, port, _setup) = echo_server();
    let mut stream = connect(port);

    for _ in 0..2 {
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .unwrap();
        let head = read_response_head(&mut stream);
        assert!(head.starts_with("HTTP/1.1 404 "));
        assert!(head.contains("Connection: keep-alive\r\n"));

        // Drain the body by its Content-Length.
        let length: usize = head
            .lines()
            .find_map(|l| l.strip_prefix("Content-Length: "))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let mut body = vec![0u8; length];
        stream.read_exact(&mut body).unwrap();
    }
}
