use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::proxy::ProxyConfig;
use super::stream::Stream;
use super::tcp::{self, ConnectionConfig};
use super::{Connection, ConnectionError, ConnectionState};
use crate::client::request::Request;
use crate::client::Site;
use crate::tls::Verifier;

/// An HTTP/1.1 connection to a single site.
///
/// The connection is created unstarted. [`Connection::start`] dials the
/// site and spawns a task driving the HTTP/1.1 protocol; the task is aborted
/// when the connection is finished or dropped.
#[derive(Debug)]
pub struct HttpConnection {
    site: Site,
    config: Arc<ConnectionConfig>,
    state: ConnectionState,
    peer_verified: bool,
    sender: Option<http1::SendRequest<Full<Bytes>>>,
    driver: Option<JoinHandle<()>>,
}

impl HttpConnection {
    pub(crate) fn new(site: Site, config: Arc<ConnectionConfig>) -> Self {
        Self {
            site,
            config,
            state: ConnectionState::NotStarted,
            peer_verified: false,
            sender: None,
            driver: None,
        }
    }

    /// The site this connection is bound to.
    pub fn site(&self) -> &Site {
        &self.site
    }

    fn proxy(&self) -> Option<&ProxyConfig> {
        self.config
            .proxy
            .as_ref()
            .filter(|proxy| !proxy.bypass(self.site.bare_host(), self.site.port()))
    }

    /// Plain sites behind a proxy send absolute-form requests to the proxy.
    fn forward_proxy(&self) -> Option<&ProxyConfig> {
        self.proxy().filter(|_| !self.site.use_ssl())
    }

    async fn establish(&self, verifier: Option<&Verifier>) -> Result<(Stream, bool), ConnectionError> {
        let verifier = match (self.site.use_ssl(), verifier) {
            (true, None) => return Err(ConnectionError::MissingVerifier),
            (true, Some(verifier)) => Some(verifier),
            (false, _) => None,
        };

        let tcp = match self.proxy() {
            Some(proxy) => {
                trace!(site = %self.site, proxy.host = %proxy.host, "connecting through proxy");
                tcp::connect(&proxy.host, proxy.port, &self.config).await?
            }
            None => tcp::connect(self.site.host(), self.site.port(), &self.config).await?,
        };

        if let Err(error) = socket2::SockRef::from(&tcp).set_keepalive(true) {
            warn!("tcp set_keepalive error: {}", error);
        }

        match (verifier, self.proxy()) {
            (Some(verifier), Some(proxy)) => {
                let tunnel = proxy.tunnel(tcp, &self.site).await?;
                let tls = verifier.setup_connection(tunnel, &self.config.tls).await?;
                Ok((Stream::Tunnel(Box::new(tls)), verifier.verify_peer()))
            }
            (Some(verifier), None) => {
                let tls = verifier.setup_connection(tcp, &self.config.tls).await?;
                Ok((Stream::Tls(Box::new(tls)), verifier.verify_peer()))
            }
            (None, _) => Ok((Stream::Plain(tcp), false)),
        }
    }

    /// Send a request and collect the complete response.
    ///
    /// The read timeout covers waiting for the connection to be ready, the
    /// response head and the whole body.
    pub async fn send(&mut self, request: &Request) -> Result<http::Response<Bytes>, ConnectionError> {
        let request = request.to_http(self.forward_proxy())?;
        let read_timeout = self.config.read_timeout;

        let sender = match (self.state, self.sender.as_mut()) {
            (ConnectionState::Started, Some(sender)) => sender,
            _ => return Err(ConnectionError::NotStarted),
        };

        let exchange = async move {
            sender.ready().await.map_err(ConnectionError::from_hyper)?;
            let response = sender
                .send_request(request)
                .await
                .map_err(ConnectionError::from_hyper)?;
            let (parts, body) = response.into_parts();
            let body = body
                .collect()
                .await
                .map_err(ConnectionError::from_hyper)?
                .to_bytes();
            Ok::<_, ConnectionError>(http::Response::from_parts(parts, body))
        };

        match read_timeout {
            Some(timeout) => tokio::time::timeout(timeout, exchange)
                .await
                .map_err(|_| ConnectionError::ReadTimeout)?,
            None => exchange.await,
        }
    }
}

#[async_trait]
impl Connection for HttpConnection {
    #[tracing::instrument(skip_all, fields(site = %self.site), level = "debug")]
    async fn start(&mut self, verifier: Option<&Verifier>) -> Result<(), ConnectionError> {
        if self.state == ConnectionState::Started {
            return Ok(());
        }

        let connecting = self.establish(verifier);
        let (stream, peer_verified) = match self.config.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connecting)
                .await
                .map_err(|_| ConnectionError::ConnectTimeout)??,
            None => connecting.await?,
        };

        let (sender, connection) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(ConnectionError::Handshake)?;

        let site = self.site.clone();
        let driver = tokio::spawn(async move {
            if let Err(error) = connection.await {
                debug!(%site, %error, "connection closed with error");
            }
        });

        self.sender = Some(sender);
        self.driver = Some(driver);
        self.peer_verified = peer_verified;
        self.state = ConnectionState::Started;
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn is_open(&self) -> bool {
        self.state == ConnectionState::Started
            && self.sender.as_ref().is_some_and(|sender| !sender.is_closed())
    }

    fn is_peer_verified(&self) -> bool {
        self.peer_verified
    }

    fn finish(&mut self) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::Started {
            return Err(ConnectionError::NotStarted);
        }

        self.sender = None;
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        self.state = ConnectionState::Closed;
        Ok(())
    }
}

impl Drop for HttpConnection {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}
