//! Byte stream over plain TCP or TLS.
//!
//! [`FlowStream`] lets the writer, the frame reader and the connection pool
//! treat plain and TLS connections alike.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{client, server};

/// A connected stream, plain or TLS.
pub enum FlowStream {
    /// Plain TCP.
    Tcp(TcpStream),
    /// TLS, negotiated as client.
    ClientTls(Box<client::TlsStream<TcpStream>>),
    /// TLS, negotiated as server.
    ServerTls(Box<server::TlsStream<TcpStream>>),
}

impl FlowStream {
    fn tcp(&self) -> &TcpStream {
        match self {
            FlowStream::Tcp(s) => s,
            FlowStream::ClientTls(s) => s.get_ref().0,
            FlowStream::ServerTls(s) => s.get_ref().0,
        }
    }

    /// Check if this stream is TLS.
    #[inline]
    pub fn is_tls(&self) -> bool {
        !matches!(self, FlowStream::Tcp(_))
    }

    /// Probe whether the stream can still be written to.
    ///
    /// Peers never send on an outbound flow connection, so readable data
    /// or end-of-stream both mean the connection is no longer usable.
    pub fn is_open(&self) -> bool {
        let mut probe = [0u8; 1];
        match self.tcp().try_read(&mut probe) {
            Ok(_) => false,
            Err(e) => e.kind() == io::ErrorKind::WouldBlock,
        }
    }
}

impl AsyncRead for FlowStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            FlowStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            FlowStream::ClientTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            FlowStream::ServerTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for FlowStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            FlowStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            FlowStream::ClientTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            FlowStream::ServerTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            FlowStream::Tcp(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            FlowStream::ClientTls(s) => Pin::new(s.as_mut()).poll_write_vectored(cx, bufs),
            FlowStream::ServerTls(s) => Pin::new(s.as_mut()).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            FlowStream::Tcp(s) => s.is_write_vectored(),
            FlowStream::ClientTls(s) => s.is_write_vectored(),
            FlowStream::ServerTls(s) => s.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            FlowStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            FlowStream::ClientTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            FlowStream::ServerTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            FlowStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            FlowStream::ClientTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            FlowStream::ServerTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
