//! Byte streams a connection can run on.
//!
//! [`Transport`] is the one capability seam of the engine: async read and
//! write from tokio plus file transmission. Plain TCP on Linux transmits
//! files with `sendfile(2)`; every other transport copies chunks through
//! user space.

use std::fs::File;
use std::future::Future;
use std::io::{self, BufReader, IoSlice};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::Context as _;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::server::TlsStream;

use crate::http::sendfile::{SendfileOperation, copy_file_chunks};

pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Transmits the rest of `op`, honouring its chunking and deadline.
    fn transmit_file<'a>(
        &'a mut self,
        op: &'a mut SendfileOperation,
    ) -> impl Future<Output = io::Result<u64>> + Send + 'a {
        copy_file_chunks(self, op)
    }
}

impl Transport for TcpStream {
    #[cfg(target_os = "linux")]
    fn transmit_file<'a>(
        &'a mut self,
        op: &'a mut SendfileOperation,
    ) -> impl Future<Output = io::Result<u64>> + Send + 'a {
        zero_copy::transmit(self, op)
    }
}

impl Transport for DuplexStream {}

/// Accepted connection: plain TCP or TLS over TCP.
pub enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Stream {
    pub fn is_tls(&self) -> bool {
        matches!(self, Stream::Tls(_))
    }
}

impl Transport for Stream {
    fn transmit_file<'a>(
        &'a mut self,
        op: &'a mut SendfileOperation,
    ) -> impl Future<Output = io::Result<u64>> + Send + 'a {
        async move {
            match self {
                Stream::Plain(stream) => stream.transmit_file(op).await,
                Stream::Tls(stream) => copy_file_chunks(stream.as_mut(), op).await,
            }
        }
    }
}

impl AsyncRead for Stream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(stream) => Pin::new(stream).poll_write_vectored(cx, bufs),
            Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Stream::Plain(stream) => stream.is_write_vectored(),
            Stream::Tls(stream) => stream.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Builds a TLS acceptor from PEM encoded certificate chain and private key.
pub fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> anyhow::Result<TlsAcceptor> {
    let cert_file = File::open(cert_path)
        .with_context(|| format!("opening certificate {}", cert_path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("reading certificate {}", cert_path.display()))?;

    let key_file = File::open(key_path)
        .with_context(|| format!("opening private key {}", key_path.display()))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .with_context(|| format!("reading private key {}", key_path.display()))?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", key_path.display()))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid certificate/key pair")?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(target_os = "linux")]
mod zero_copy {
    use std::fs::File;
    use std::io;
    use std::os::fd::{AsRawFd, RawFd};

    use tokio::io::Interest;
    use tokio::net::TcpStream;

    use crate::http::sendfile::{Resume, SendfileOperation, SendfileSink};

    struct SocketSink {
        fd: RawFd,
    }

    impl SendfileSink for SocketSink {
        fn send_chunk(&mut self, file: &File, offset: u64, len: usize) -> io::Result<usize> {
            let mut off = libc::off_t::try_from(offset)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "file offset out of range"))?;
            // SAFETY: both descriptors are open for the duration of the call
            // and `off` outlives it.
            let n = unsafe { libc::sendfile(self.fd, file.as_raw_fd(), &mut off, len) };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(n as usize)
        }
    }

    /// Resumes the operation whenever the socket reports write readiness.
    pub(super) async fn transmit(stream: &mut TcpStream, op: &mut SendfileOperation) -> io::Result<u64> {
        let mut sink = SocketSink {
            fd: stream.as_raw_fd(),
        };

        loop {
            let step = stream.try_io(Interest::WRITABLE, || match op.resume(&mut sink)? {
                Resume::Done(total) => Ok(total),
                Resume::WouldBlock => Err(io::ErrorKind::WouldBlock.into()),
            });

            match step {
                Ok(total) => return Ok(total),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    op.check_deadline()?;
                    tokio::time::timeout_at(op.deadline(), stream.writable())
                        .await
                        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "sendfile time limit exceeded"))??;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
