//! Socket abstraction over plain TCP and TLS-terminated connections.

use std::{
    io::{self, Read, Write},
    net::TcpStream,
    os::fd::{AsRawFd, RawFd},
};

use rustls::{ServerConnection, StreamOwned};

/// A connection stream that might be protected with TLS.
///
/// Sessions poll the raw file descriptor for readability but perform all
/// reads and writes through this wrapper so that TLS records are transparent
/// to the protocol layers above.
pub enum MaybeTlsStream {
    /// Unencrypted socket stream.
    Plain(TcpStream),
    /// Encrypted socket stream using `rustls` in the server role.
    Tls(Box<StreamOwned<ServerConnection, TcpStream>>),
}

impl From<TcpStream> for MaybeTlsStream {
    fn from(value: TcpStream) -> Self {
        Self::Plain(value)
    }
}

impl From<StreamOwned<ServerConnection, TcpStream>> for MaybeTlsStream {
    fn from(value: StreamOwned<ServerConnection, TcpStream>) -> Self {
        Self::Tls(Box::new(value))
    }
}

impl Read for MaybeTlsStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.read(buf),
            Self::Tls(s) => s.read(buf),
        }
    }
}

impl Write for MaybeTlsStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.write(buf),
            Self::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(s) => s.flush(),
            Self::Tls(s) => s.flush(),
        }
    }
}

impl AsRawFd for MaybeTlsStream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Self::Plain(s) => s.as_raw_fd(),
            Self::Tls(s) => s.sock.as_raw_fd(),
        }
    }
}
