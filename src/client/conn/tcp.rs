//! TCP transport for client connections.
//!
//! [`TcpConnector`] is the default [`ConnectionFactory`]: it produces
//! [`HttpConnection`]s which dial TCP using the settings in
//! [`ConnectionConfig`]. Addresses returned by name resolution are tried in
//! order until one accepts the connection.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpSocket, TcpStream};
use tracing::{trace, warn};

use super::proxy::ProxyConfig;
use super::{ConnectionFactory, HttpConnection};
use crate::client::Site;
use crate::tls::TlsParameters;

/// Factory producing HTTP/1.1 connections over TCP, optionally wrapped in TLS.
///
/// # Example
/// ```no_run
/// # use servicedriver::client::conn::{ConnectionConfig, ConnectionFactory, TcpConnector};
/// # use servicedriver::client::Site;
/// let connector = TcpConnector::new(ConnectionConfig::default());
/// let site: Site = "https://puppet:8140".parse().unwrap();
/// let connection = connector.create_connection(&site);
/// ```
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    config: Arc<ConnectionConfig>,
}

impl TcpConnector {
    /// Create a new `TcpConnector` with the given configuration.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Get the configuration for the TCP connector.
    pub fn config(&self) -> &Arc<ConnectionConfig> {
        &self.config
    }
}

impl ConnectionFactory for TcpConnector {
    type Connection = HttpConnection;

    fn create_connection(&self, site: &Site) -> Self::Connection {
        HttpConnection::new(site.clone(), self.config.clone())
    }
}

/// Error type for TCP connections.
#[derive(Debug, Error)]
pub struct TcpConnectionError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TcpConnectionError {
    pub(super) fn new<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub(super) fn msg<S, E>(message: S) -> impl FnOnce(E) -> Self
    where
        S: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        move |error| Self {
            message: message.into(),
            source: Some(error.into()),
        }
    }
}

impl fmt::Display for TcpConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref source) = self.source {
            write!(f, "{}: {}", self.message, source)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

/// Configuration for connections made by a [`TcpConnector`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ConnectionConfig {
    /// Timeout for the whole connect phase: TCP, proxy tunnel and TLS handshake.
    pub connect_timeout: Option<Duration>,

    /// Timeout waiting for a complete response.
    pub read_timeout: Option<Duration>,

    /// The local address to bind to, when its family matches the destination.
    pub local_address: Option<IpAddr>,

    /// HTTP proxy to connect through.
    pub proxy: Option<ProxyConfig>,

    /// TLS handshake parameters.
    pub tls: TlsParameters,

    /// Whether to disable Nagle's algorithm.
    pub nodelay: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(120)),
            read_timeout: Some(Duration::from_secs(600)),
            local_address: None,
            proxy: None,
            tls: TlsParameters::default(),
            nodelay: true,
        }
    }
}

/// Resolve `host` and connect to the first address which accepts.
pub(super) async fn connect(
    host: &str,
    port: u16,
    config: &ConnectionConfig,
) -> Result<TcpStream, TcpConnectionError> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(TcpConnectionError::msg("dns resolution"))?;

    let mut last_error = None;
    for addr in addrs {
        match connect_addr(&addr, config).await {
            Ok(stream) => {
                trace!(peer.addr = %addr, "tcp connected");
                return Ok(stream);
            }
            Err(error) => {
                trace!(peer.addr = %addr, %error, "tcp connect failed");
                last_error = Some(error);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        TcpConnectionError::new(format!("no addresses found for {host}:{port}"))
    }))
}

fn bind_local_address(
    socket: &socket2::Socket,
    dst_addr: &SocketAddr,
    local_addr: Option<IpAddr>,
) -> io::Result<()> {
    match (dst_addr, local_addr) {
        (SocketAddr::V4(_), Some(addr @ IpAddr::V4(_)))
        | (SocketAddr::V6(_), Some(addr @ IpAddr::V6(_))) => {
            socket.bind(&SocketAddr::new(addr, 0).into())?;
        }
        _ => {}
    }

    Ok(())
}

#[tracing::instrument(skip(config), level = "debug")]
async fn connect_addr(
    addr: &SocketAddr,
    config: &ConnectionConfig,
) -> Result<TcpStream, TcpConnectionError> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = Domain::for_address(*addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(TcpConnectionError::msg("tcp open error"))?;

    // When constructing a Tokio `TcpSocket` from a std socket, the user is
    // responsible for ensuring O_NONBLOCK is set.
    socket
        .set_nonblocking(true)
        .map_err(TcpConnectionError::msg("tcp set_nonblocking error"))?;

    bind_local_address(&socket, addr, config.local_address)
        .map_err(TcpConnectionError::msg("tcp bind local address"))?;

    let socket = TcpSocket::from_std_stream(std::net::TcpStream::from(socket));

    if config.nodelay {
        if let Err(e) = socket.set_nodelay(true) {
            warn!("tcp set_nodelay error: {}", e);
        }
    }

    socket
        .connect(*addr)
        .await
        .map_err(TcpConnectionError::msg("tcp connect error"))
}
