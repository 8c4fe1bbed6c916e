//! The transport capability the Reader/Writer speak against:
//! `{ read, write_scatter, shutdown }`. Cleartext is a passthrough over
//! `TcpStream`; TLS wraps the same stream in a `tokio-rustls` session.
//! Neither `Reader` nor `Writer` branch on which one is in use — this
//! is the "double-dispatch on polymorphic transport" redesign from
//! spec.md §9 applied literally.
//!
//! The C core pumps an explicit BIO pair and tracks
//! `(current_buf_index, bytes_written_in_current_buf)` by hand because
//! its I/O is callback-driven. Under `async`/`.await` the equivalent
//! state is just the local variables of [`write_scatter`] below: a
//! suspended `.await` keeps them alive exactly as the manual state
//! fields did, which is why no separate resume bookkeeping is needed
//! here (documented as a deliberate simplification in DESIGN.md).

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};

use crate::error::{ChirpError, Result};
use crate::tls::TlsEnv;

pub enum Transport {
    Plain(TcpStream),
    TlsServer(Box<server::TlsStream<TcpStream>>),
    TlsClient(Box<client::TlsStream<TcpStream>>),
}

impl Transport {
    pub fn plain(stream: TcpStream) -> Self {
        Transport::Plain(stream)
    }

    pub async fn accept_tls(stream: TcpStream, env: &TlsEnv) -> Result<Transport> {
        let acceptor = TlsAcceptor::from(env.server.clone());
        let tls = acceptor
            .accept(stream)
            .await
            .map_err(|e| ChirpError::TlsError(e.to_string()))?;
        Ok(Transport::TlsServer(Box::new(tls)))
    }

    pub async fn connect_tls(
        stream: TcpStream,
        env: &TlsEnv,
        domain: &str,
    ) -> Result<Transport> {
        let connector = TlsConnector::from(env.client.clone());
        let dns_name = webpki::DNSNameRef::try_from_ascii_str(domain)
            .map_err(|_| ChirpError::TlsError(format!("invalid TLS server name {}", domain)))?;
        let tls = connector
            .connect(dns_name, stream)
            .await
            .map_err(|e| ChirpError::TlsError(e.to_string()))?;
        Ok(Transport::TlsClient(Box::new(tls)))
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Transport::Plain(s) => s.peer_addr(),
            Transport::TlsServer(s) => s.get_ref().0.peer_addr(),
            Transport::TlsClient(s) => s.get_ref().0.peer_addr(),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        !matches!(self, Transport::Plain(_))
    }

    /// Read whatever is immediately available into `buf`. `Ok(0)` means
    /// the peer closed the stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.read(buf).await,
            Transport::TlsServer(s) => s.read(buf).await,
            Transport::TlsClient(s) => s.read(buf).await,
        }
    }

    /// Write three buffers back to back, looping on partial writes.
    /// `header`/`data` may be empty.
    pub async fn write_scatter(
        &mut self,
        wire_header: &[u8],
        header: &[u8],
        data: &[u8],
    ) -> io::Result<()> {
        for buf in [wire_header, header, data].iter() {
            let mut written = 0;
            while written < buf.len() {
                let n = self.write(&buf[written..]).await?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "transport accepted zero bytes",
                    ));
                }
                written += n;
            }
        }
        self.flush().await
    }

    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.write(buf).await,
            Transport::TlsServer(s) => s.write(buf).await,
            Transport::TlsClient(s) => s.write(buf).await,
        }
    }

    async fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(s) => s.flush().await,
            Transport::TlsServer(s) => s.flush().await,
            Transport::TlsClient(s) => s.flush().await,
        }
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(s) => AsyncWriteExt::shutdown(s).await,
            Transport::TlsServer(s) => AsyncWriteExt::shutdown(s).await,
            Transport::TlsClient(s) => AsyncWriteExt::shutdown(s).await,
        }
    }

    pub fn set_nodelay(&self, on: bool) -> io::Result<()> {
        match self {
            Transport::Plain(s) => s.set_nodelay(on),
            Transport::TlsServer(s) => s.get_ref().0.set_nodelay(on),
            Transport::TlsClient(s) => s.get_ref().0.set_nodelay(on),
        }
    }
}
