//! The embedder-facing server: configuration, construction, and the upgrade
//! gate that bridges the HTTP engine to the WebSocket scheduler.

use std::{net::TcpListener, sync::Arc};

use tracing::debug;

use crate::{
    Error, Result, handshake,
    http::{Engine, EngineContext, ProtocolSwitch, Request, RequestHandler, Response},
    sched::Scheduler,
    stream::MaybeTlsStream,
    ws,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port to listen on. The usual 1..=65535 range; zero is rejected
    /// at construction.
    pub port: u16,
    /// Maximum number of bytes read from a WebSocket socket per poll-ready
    /// event; ultimately the size handed to `recv(2)`. Must be at least 1.
    pub max_socket_bytes_to_receive: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 0,
            max_socket_bytes_to_receive: 1024,
        }
    }
}

impl Config {
    fn sanity_check(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::InvalidPort);
        }
        if self.max_socket_bytes_to_receive == 0 {
            return Err(Error::InvalidReceiveChunk);
        }
        Ok(())
    }
}

/// An embeddable HTTP/1.1 (or HTTPS) server with WebSocket support.
///
/// One instance serves one port in one protocol mode; run two instances for
/// plain HTTP and HTTPS side by side. Every regular request is answered by
/// the `request_handler`; WebSocket upgrades are offered to the optional
/// [`ws::Handler`] first. Dropping the server stops it: the accept loop
/// terminates and every open WebSocket is closed with 1001 GoingAway.
pub struct Server {
    scheduler: Option<Arc<Scheduler>>,
    engine: Engine,
}

impl Server {
    /// Starts a plain-HTTP server.
    ///
    /// The request handler is mandatory and receives every URL request that
    /// is not claimed as a WebSocket upgrade. The `ws::Handler` is optional;
    /// without one, upgrade requests fall through to the request handler
    /// like any other request.
    pub fn new(
        config: Config,
        request_handler: impl Fn(Request) -> Response + Send + Sync + 'static,
        ws_handler: Option<ws::Handler>,
    ) -> Result<Self> {
        Self::start(config, None, Arc::new(request_handler), ws_handler)
    }

    /// Starts an HTTPS server. `https_cert` and `https_private_key` are the
    /// PEM contents of the certificate chain and private key.
    pub fn with_tls(
        config: Config,
        https_cert: &str,
        https_private_key: &str,
        request_handler: impl Fn(Request) -> Response + Send + Sync + 'static,
        ws_handler: Option<ws::Handler>,
    ) -> Result<Self> {
        let tls = tls_config(https_cert, https_private_key)?;
        Self::start(
            config,
            Some(Arc::new(tls)),
            Arc::new(request_handler),
            ws_handler,
        )
    }

    fn start(
        config: Config,
        tls: Option<Arc<rustls::ServerConfig>>,
        request_handler: RequestHandler,
        ws_handler: Option<ws::Handler>,
    ) -> Result<Self> {
        config.sanity_check()?;

        let listener = TcpListener::bind(("0.0.0.0", config.port))?;

        let scheduler = match ws_handler {
            Some(_) => Some(Scheduler::start()?),
            None => None,
        };
        let switch = ws_handler
            .zip(scheduler.clone())
            .map(|(handler, scheduler)| {
                Box::new(UpgradeGate {
                    handler,
                    scheduler,
                    chunk: config.max_socket_bytes_to_receive,
                }) as Box<dyn ProtocolSwitch>
            });

        let engine = Engine::start(
            listener,
            tls,
            EngineContext {
                request_handler,
                switch,
            },
        )?;

        Ok(Server { scheduler, engine })
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        // Stop polling sessions and force-close them first, then stop
        // accepting HTTP connections.
        if let Some(scheduler) = &self.scheduler {
            scheduler.teardown();
        }
        self.engine.stop();
    }
}

/// The HTTP-side filter that recognizes WebSocket upgrade requests and
/// installs new sessions in the scheduler on protocol switch.
struct UpgradeGate {
    handler: ws::Handler,
    scheduler: Arc<Scheduler>,
    chunk: usize,
}

impl ProtocolSwitch for UpgradeGate {
    fn accept(&self, req: &Request) -> Option<String> {
        if !self.handler.is_handled(&req.url) {
            return None;
        }
        if !handshake::is_upgrade_request(req) {
            return None;
        }
        let key = req.header("Sec-WebSocket-Key")?;
        Some(handshake::accept_key(key))
    }

    fn switched(&self, stream: MaybeTlsStream, req: &Request, extra: &[u8]) {
        debug!(url = %req.url, "upgrading connection to websocket");
        self.scheduler
            .install(stream, &req.url, self.chunk, &self.handler, extra);
    }
}

fn tls_config(cert_pem: &str, key_pem: &str) -> Result<rustls::ServerConfig> {
    let mut cert_reader = cert_pem.as_bytes();
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<std::io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(Error::MissingCertificate);
    }

    let mut key_reader = key_pem.as_bytes();
    let key = rustls_pemfile::private_key(&mut key_reader)?.ok_or(Error::MissingPrivateKey)?;

    Ok(rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn not_found(_req: Request) -> Response {
        Response {
            code: 404,
            content: String::new(),
        }
    }

    #[test]
    fn rejects_port_zero() {
        let config = Config::default();
        assert!(matches!(
            Server::new(config, not_found, None),
            Err(Error::InvalidPort)
        ));
    }

    #[test]
    fn rejects_zero_receive_chunk() {
        let config = Config {
            port: 2345,
            max_socket_bytes_to_receive: 0,
        };
        assert!(matches!(
            Server::new(config, not_found, None),
            Err(Error::InvalidReceiveChunk)
        ));
    }

    #[test]
    fn rejects_empty_tls_material() {
        assert!(matches!(
            tls_config("", ""),
            Err(Error::MissingCertificate)
        ));
    }

    #[test]
    fn rejects_cert_without_key() {
        // A syntactically valid but keyless PEM input.
        let cert = "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n";
        assert!(matches!(
            tls_config(cert, ""),
            Err(Error::MissingPrivateKey)
        ));
    }
}
