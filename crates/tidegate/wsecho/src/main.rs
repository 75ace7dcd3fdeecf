//! A WebSocket echo server: text messages come back on the same
//! connection, binary messages are ignored, and every plain HTTP request is
//! answered with a 404.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use clap::Parser;
use parking_lot::Mutex;
use tidegate::{
    Config, Server,
    http::{Request, Response},
    ws::{self, ConnectionId, ControlOpCode, DataOpCode, Receivers, SendResult, Senders},
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// WebSocket echo server
///
/// Echoes every received text message back to its sender. Binary messages
/// are accepted but not echoed. Regular HTTP requests get a 404.
#[derive(Parser)]
#[command(author, version)]
struct Cli {
    /// Port to listen on
    #[arg(long, default_value_t = 2345)]
    port: u16,

    /// Read chunk size per socket, in bytes
    #[arg(long, default_value_t = 1024)]
    receive_chunk: usize,
}

fn request_handler(_req: Request) -> Response {
    Response {
        code: 404,
        content: "This is a websocket echo server only. Regular http ignored.".into(),
    }
}

fn echo_handler() -> ws::Handler {
    // Senders per live connection, so the data receiver can route echoes.
    let connections: Arc<Mutex<HashMap<ConnectionId, Senders>>> =
        Arc::new(Mutex::new(HashMap::new()));

    ws::Handler::new(
        |_url| true,
        move |conn| {
            info!(id = %conn.id, url = %conn.url, "connection established");
            connections.lock().insert(conn.id, conn.senders);

            let data_connections = Arc::clone(&connections);
            let control_connections = Arc::clone(&connections);
            Receivers::new(
                move |id, opcode, payload| {
                    if opcode == DataOpCode::Binary {
                        // Only text messages are echoed.
                        return;
                    }
                    let senders = data_connections.lock().get(&id).cloned();
                    match senders {
                        Some(senders) => {
                            if senders.send_data(payload, 0) != SendResult::Success {
                                error!(%id, "failed to send data frame");
                            }
                        }
                        None => error!(%id, "unrecognised websocket connection id"),
                    }
                },
                move |id, opcode, _payload| {
                    if opcode == ControlOpCode::Close {
                        info!(%id, "connection closed");
                        control_connections.lock().remove(&id);
                    }
                },
            )
        },
    )
}

fn run(cli: Cli) -> tidegate::Result<()> {
    let term = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&term)).map_err(tidegate::Error::Io)?;
    }

    let _server = Server::new(
        Config {
            port: cli.port,
            max_socket_bytes_to_receive: cli.receive_chunk,
        },
        request_handler,
        Some(echo_handler()),
    )?;
    info!(port = cli.port, "wsecho listening");

    while !term.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(200));
    }
    info!("shutting down");

    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
