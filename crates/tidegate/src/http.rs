//! The underlying HTTP/1.1 engine.
//!
//! This is the collaborator the WebSocket core sits behind: a blocking
//! accept loop, one handler thread per connection, `httparse`-based request
//! parsing, and plain request/response dispatch to the embedder's
//! [`RequestHandler`]. It is intentionally small — the interesting
//! engineering lives in the upgrade gate and the WebSocket session layer,
//! which take over the socket the moment an upgrade is accepted.

use std::{
    collections::HashMap,
    io::{self, Read, Write},
    net::{TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use bytes::Bytes;
use polling::Event;
use tracing::{debug, error, warn};

use crate::stream::MaybeTlsStream;

/// Largest request body the engine will buffer.
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Request methods recognized by the engine. Anything else terminates the
/// connection without a response.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
}

impl Method {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Self::Get),
            "HEAD" => Some(Self::Head),
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// HTTP protocol version of a request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    /// Whether this version is at least `major.minor`.
    pub fn at_least(&self, major: u8, minor: u8) -> bool {
        (self.major, self.minor) >= (major, minor)
    }
}

/// Request headers with their original names. Use [`Request::header`] for
/// case-insensitive lookup.
pub type Headers = HashMap<String, String>;

/// Decoded `application/x-www-form-urlencoded` POST fields.
pub type PostKeyValues = HashMap<String, String>;

/// A parsed HTTP request handed to the embedder's [`RequestHandler`].
#[derive(Debug)]
pub struct Request {
    /// Request target as it appeared on the request line.
    pub url: String,
    pub method: Method,
    pub version: Version,
    pub headers: Headers,
    /// Raw request body.
    pub payload: Bytes,
    /// Form fields, populated for url-encoded POST bodies.
    pub post_key_values: PostKeyValues,
}

impl Request {
    /// Case-insensitive header lookup (header field names are
    /// case-insensitive per RFC 9110).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether the named header's comma-separated value list contains
    /// `token`, compared case-insensitively.
    pub fn header_has_token(&self, name: &str, token: &str) -> bool {
        self.header(name)
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    }
}

/// The embedder's answer to a regular HTTP request.
#[derive(Debug, Clone)]
pub struct Response {
    /// HTTP status code.
    pub code: u16,
    /// Response body, sent verbatim with a `Content-Length` header.
    pub content: String,
}

/// Callback invoked for every non-upgrade HTTP request.
pub type RequestHandler = Arc<dyn Fn(Request) -> Response + Send + Sync>;

/// Hook through which the upgrade gate claims connections.
///
/// `accept` inspects a request and, when it satisfies the upgrade
/// preconditions, returns the `Sec-WebSocket-Accept` value for the 101
/// response. After the engine has written that response it calls `switched`,
/// surrendering the socket together with any bytes it over-read past the
/// request head.
pub(crate) trait ProtocolSwitch: Send + Sync {
    fn accept(&self, req: &Request) -> Option<String>;
    fn switched(&self, stream: MaybeTlsStream, req: &Request, extra: &[u8]);
}

pub(crate) struct EngineContext {
    pub(crate) request_handler: RequestHandler,
    pub(crate) switch: Option<Box<dyn ProtocolSwitch>>,
}

/// The accept loop and its shutdown plumbing.
pub(crate) struct Engine {
    running: Arc<AtomicBool>,
    poller: Arc<polling::Poller>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Engine {
    /// Starts the accept loop on its own thread. The listener is polled with
    /// a bounded wait so `stop` completes promptly.
    pub(crate) fn start(
        listener: TcpListener,
        tls: Option<Arc<rustls::ServerConfig>>,
        ctx: EngineContext,
    ) -> io::Result<Engine> {
        listener.set_nonblocking(true)?;
        let poller = Arc::new(polling::Poller::new()?);
        poller.add(&listener, Event::readable(0))?;

        let running = Arc::new(AtomicBool::new(true));
        let ctx = Arc::new(ctx);
        let thread = thread::Builder::new().name("tidegate-http".into()).spawn({
            let poller = Arc::clone(&poller);
            let running = Arc::clone(&running);
            move || accept_loop(listener, tls, ctx, poller, running)
        })?;

        Ok(Engine {
            running,
            poller,
            thread: Some(thread),
        })
    }

    pub(crate) fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        let _ = self.poller.notify();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listener: TcpListener,
    tls: Option<Arc<rustls::ServerConfig>>,
    ctx: Arc<EngineContext>,
    poller: Arc<polling::Poller>,
    running: Arc<AtomicBool>,
) {
    let mut events = Vec::new();
    while running.load(Ordering::Relaxed) {
        events.clear();
        if let Err(err) = poller.wait(&mut events, Some(Duration::from_millis(500))) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!("listener poll failed: {err}");
            thread::sleep(Duration::from_secs(2));
            continue;
        }
        if events.is_empty() {
            continue;
        }

        loop {
            match listener.accept() {
                Ok((sock, peer)) => {
                    debug!(%peer, "accepted connection");
                    let _ = sock.set_nodelay(true);
                    if let Err(err) = sock.set_nonblocking(false) {
                        warn!(%peer, "failed to restore blocking mode: {err}");
                        continue;
                    }
                    let stream = match wrap_stream(sock, tls.as_ref()) {
                        Ok(stream) => stream,
                        Err(err) => {
                            warn!(%peer, "tls setup failed: {err}");
                            continue;
                        }
                    };
                    let ctx = Arc::clone(&ctx);
                    let spawned = thread::Builder::new()
                        .name("tidegate-conn".into())
                        .spawn(move || serve_connection(stream, ctx));
                    if let Err(err) = spawned {
                        warn!("failed to spawn connection thread: {err}");
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!("accept failed: {err}");
                    break;
                }
            }
        }

        // Registrations are oneshot, so re-arm after consuming the event.
        let _ = poller.modify(&listener, Event::readable(0));
    }
    let _ = poller.delete(&listener);
}

fn wrap_stream(
    sock: TcpStream,
    tls: Option<&Arc<rustls::ServerConfig>>,
) -> Result<MaybeTlsStream, rustls::Error> {
    match tls {
        None => Ok(MaybeTlsStream::Plain(sock)),
        Some(config) => {
            let conn = rustls::ServerConnection::new(Arc::clone(config))?;
            Ok(MaybeTlsStream::from(rustls::StreamOwned::new(conn, sock)))
        }
    }
}

struct Head {
    method: Option<Method>,
    url: String,
    version: Version,
    headers: Headers,
    head_len: usize,
}

/// Attempts to parse a complete request head from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed, `Err` on malformed input.
fn parse_head(buf: &[u8]) -> Result<Option<Head>, ()> {
    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut header_storage);
    match req.parse(buf) {
        Ok(httparse::Status::Complete(head_len)) => {
            let method = Method::parse(req.method.unwrap_or(""));
            let url = req.path.unwrap_or("/").to_string();
            let version = Version {
                major: 1,
                minor: req.version.unwrap_or(0),
            };
            let mut headers = Headers::new();
            for h in req.headers.iter() {
                headers.insert(
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).into_owned(),
                );
            }
            Ok(Some(Head {
                method,
                url,
                version,
                headers,
                head_len,
            }))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(_) => Err(()),
    }
}

fn content_length(headers: &Headers) -> Option<usize> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse().ok())
}

fn decode_form(headers: &Headers, body: &[u8]) -> PostKeyValues {
    let is_form = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
        .map(|(_, v)| v.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false);
    if !is_form {
        return PostKeyValues::new();
    }
    url::form_urlencoded::parse(body).into_owned().collect()
}

fn status_text(code: u16) -> &'static str {
    match code {
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "",
    }
}

fn write_response<W: Write>(
    out: &mut W,
    response: &Response,
    keep_alive: bool,
    head_only: bool,
) -> io::Result<()> {
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: {}\r\n\r\n",
        response.code,
        status_text(response.code),
        response.content.len(),
        if keep_alive { "keep-alive" } else { "close" },
    );
    out.write_all(head.as_bytes())?;
    if !head_only {
        out.write_all(response.content.as_bytes())?;
    }
    out.flush()
}

/// Serves one connection to completion: a keep-alive request loop that ends
/// on close, error, or protocol switch.
fn serve_connection(mut stream: MaybeTlsStream, ctx: Arc<EngineContext>) {
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut scratch = [0u8; 4096];

    loop {
        // Accumulate until a complete request head is buffered.
        let head = loop {
            match parse_head(&buf) {
                Err(()) => {
                    debug!("malformed request, dropping connection");
                    return;
                }
                Ok(Some(head)) => break head,
                Ok(None) => match stream.read(&mut scratch) {
                    Ok(0) => return,
                    Ok(n) => buf.extend_from_slice(&scratch[..n]),
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => return,
                },
            }
        };

        let Some(method) = head.method else {
            debug!("unsupported method, dropping connection");
            return;
        };

        let body_len = content_length(&head.headers).unwrap_or(0);
        if body_len > MAX_BODY_SIZE {
            debug!("request body too large, dropping connection");
            return;
        }
        while buf.len() < head.head_len + body_len {
            match stream.read(&mut scratch) {
                Ok(0) => return,
                Ok(n) => buf.extend_from_slice(&scratch[..n]),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return,
            }
        }

        let request_end = head.head_len + body_len;
        let body = &buf[head.head_len..request_end];
        let post_key_values = if method == Method::Post {
            decode_form(&head.headers, body)
        } else {
            PostKeyValues::new()
        };
        let request = Request {
            url: head.url,
            method,
            version: head.version,
            headers: head.headers,
            payload: Bytes::copy_from_slice(body),
            post_key_values,
        };

        // The upgrade gate claims the socket before the request handler ever
        // sees the request.
        if let Some(switch) = ctx.switch.as_deref() {
            if let Some(accept) = switch.accept(&request) {
                let head_bytes = crate::handshake::switching_protocols_response(&accept);
                let written = stream
                    .write_all(head_bytes.as_bytes())
                    .and_then(|_| stream.flush());
                if written.is_err() {
                    return;
                }
                switch.switched(stream, &request, &buf[request_end..]);
                return;
            }
        }

        let keep_alive =
            request.version.at_least(1, 1) && !request.header_has_token("Connection", "close");
        let head_only = method == Method::Head;

        let response = (ctx.request_handler)(request);
        if write_response(&mut stream, &response, keep_alive, head_only).is_err() {
            return;
        }
        if !keep_alive {
            return;
        }
        buf.drain(..request_end);
    }
}
