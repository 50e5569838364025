use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// A client transport stream: plain TCP, TLS over TCP, or TLS through a
/// proxy tunnel.
#[pin_project(project = StreamProj)]
#[derive(Debug)]
pub(super) enum Stream {
    Plain(#[pin] TcpStream),
    Tls(#[pin] Box<TlsStream<TcpStream>>),
    Tunnel(#[pin] Box<TlsStream<TokioIo<Upgraded>>>),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            StreamProj::Plain(stream) => stream.poll_read(cx, buf),
            StreamProj::Tls(stream) => stream.poll_read(cx, buf),
            StreamProj::Tunnel(stream) => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        match self.project() {
            StreamProj::Plain(stream) => stream.poll_write(cx, buf),
            StreamProj::Tls(stream) => stream.poll_write(cx, buf),
            StreamProj::Tunnel(stream) => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.project() {
            StreamProj::Plain(stream) => stream.poll_flush(cx),
            StreamProj::Tls(stream) => stream.poll_flush(cx),
            StreamProj::Tunnel(stream) => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.project() {
            StreamProj::Plain(stream) => stream.poll_shutdown(cx),
            StreamProj::Tls(stream) => stream.poll_shutdown(cx),
            StreamProj::Tunnel(stream) => stream.poll_shutdown(cx),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<Result<usize, io::Error>> {
        match self.project() {
            StreamProj::Plain(stream) => stream.poll_write_vectored(cx, bufs),
            StreamProj::Tls(stream) => stream.poll_write_vectored(cx, bufs),
            StreamProj::Tunnel(stream) => stream.poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Stream::Plain(stream) => stream.is_write_vectored(),
            Stream::Tls(stream) => stream.is_write_vectored(),
            Stream::Tunnel(stream) => stream.is_write_vectored(),
        }
    }
}
