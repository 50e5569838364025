//! Client connection types.
//!
//! A [`ConnectionFactory`] builds a not-yet-started [`Connection`] bound to a
//! single [`Site`]. Starting the connection dials TCP (through a proxy when
//! configured), hands the socket to the TLS [`Verifier`] for secure sites,
//! applies socket options and finally performs the HTTP/1.1 handshake.
//!
//! The default factory is [`TcpConnector`], producing [`HttpConnection`]s.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use super::Site;
use crate::tls::{TlsError, Verifier};

mod connection;
pub mod proxy;
mod stream;
pub mod tcp;

pub use self::connection::HttpConnection;
pub use self::proxy::ProxyConfig;
pub use self::tcp::{ConnectionConfig, TcpConnectionError, TcpConnector};

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, but no transport is established.
    NotStarted,
    /// The transport and HTTP handshake are complete.
    Started,
    /// The connection has been finished and can't be used again.
    Closed,
}

/// A live transport handle bound to one site.
#[async_trait]
pub trait Connection: fmt::Debug + Send + Sync + 'static {
    /// Establish the connection, using `verifier` to set up TLS for secure sites.
    async fn start(&mut self, verifier: Option<&Verifier>) -> Result<(), ConnectionError>;

    /// Current lifecycle state.
    fn state(&self) -> ConnectionState;

    /// Whether [`Connection::start`] has completed and the connection has not been finished.
    fn is_started(&self) -> bool {
        self.state() == ConnectionState::Started
    }

    /// Whether the connection can still carry a request.
    fn is_open(&self) -> bool;

    /// Whether the peer was authenticated during the TLS handshake.
    fn is_peer_verified(&self) -> bool;

    /// Shut the connection down.
    fn finish(&mut self) -> Result<(), ConnectionError>;
}

/// Builds connections for the pool.
pub trait ConnectionFactory: fmt::Debug + Send + Sync + 'static {
    /// The connection type produced.
    type Connection: Connection;

    /// Create a new, not yet started, connection to `site`.
    fn create_connection(&self, site: &Site) -> Self::Connection;
}

/// Errors from establishing or using a connection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConnectionError {
    /// The connect phase (TCP, proxy and TLS) exceeded the connect timeout.
    #[error("connect timed out")]
    ConnectTimeout,

    /// Waiting for the response exceeded the read timeout.
    #[error("read timed out")]
    ReadTimeout,

    /// The peer closed the connection before the response completed.
    #[error("connection closed before message completed: {0}")]
    Interrupted(#[source] hyper::Error),

    /// The TCP transport failed.
    #[error(transparent)]
    Tcp(#[from] TcpConnectionError),

    /// TLS trust could not be established.
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// The proxy refused to open a tunnel.
    #[error("proxy: {0}")]
    Proxy(String),

    /// The HTTP/1.1 handshake failed.
    #[error("handshake: {0}")]
    Handshake(#[source] hyper::Error),

    /// The HTTP exchange failed.
    #[error("http: {0}")]
    Http(#[source] hyper::Error),

    /// The connection was used before it was started.
    #[error("connection is not started")]
    NotStarted,

    /// A secure site was dialled without a verifier.
    #[error("a verifier is required to connect to a secure site")]
    MissingVerifier,

    /// The request could not be built.
    #[error("invalid request: {0}")]
    Request(#[from] http::Error),
}

impl ConnectionError {
    pub(crate) fn from_hyper(error: hyper::Error) -> Self {
        if error.is_incomplete_message() || error.is_closed() || error.is_canceled() {
            ConnectionError::Interrupted(error)
        } else {
            ConnectionError::Http(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use static_assertions::assert_impl_all;

    assert_impl_all!(ConnectionError: std::error::Error, Send, Sync);
    assert_impl_all!(HttpConnection: Connection, Send, Sync);
}
