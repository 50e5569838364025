//! HTTP proxy support.
//!
//! Secure sites are reached through a `CONNECT` tunnel; plain sites send
//! absolute-form request targets to the proxy. Hosts matching a `no_proxy`
//! pattern are connected to directly.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use http::header::{HOST, PROXY_AUTHORIZATION};
use http::{HeaderValue, Method};
use http_body_util::Empty;
use hyper::client::conn::http1;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

use super::ConnectionError;
use crate::client::Site;

/// Proxy settings for a connection factory.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct ProxyConfig {
    /// Proxy host.
    pub host: String,

    /// Proxy port.
    pub port: u16,

    /// Proxy user, for `Proxy-Authorization: Basic`.
    pub user: Option<String>,

    /// Proxy password.
    pub password: Option<String>,

    /// Hosts which bypass the proxy: `*`, `host`, `.domain` or `*.domain`,
    /// optionally with `:port`. Entries may be comma separated.
    pub no_proxy: Vec<String>,
}

impl ProxyConfig {
    /// A proxy at `host:port` without credentials.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Authenticate to the proxy with basic credentials.
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    /// Add `no_proxy` patterns.
    pub fn with_no_proxy<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.no_proxy.extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Should connections to `host:port` skip the proxy?
    pub fn bypass(&self, host: &str, port: u16) -> bool {
        self.no_proxy
            .iter()
            .flat_map(|entry| entry.split(','))
            .map(str::trim)
            .filter(|pattern| !pattern.is_empty())
            .any(|pattern| no_proxy_matches(pattern, host, port))
    }

    /// The `Proxy-Authorization` header value, when credentials are configured.
    pub fn authorization(&self) -> Option<HeaderValue> {
        let user = self.user.as_deref()?;
        let password = self.password.as_deref().unwrap_or_default();
        let token = STANDARD.encode(format!("{user}:{password}"));
        HeaderValue::from_str(&format!("Basic {token}")).ok()
    }

    /// Ask the proxy to open a tunnel to `site` over `stream`, returning the
    /// tunnelled transport.
    pub(super) async fn tunnel<S>(
        &self,
        stream: S,
        site: &Site,
    ) -> Result<TokioIo<Upgraded>, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let addr = site.addr();
        let mut request = http::Request::builder()
            .method(Method::CONNECT)
            .uri(addr.as_str())
            .header(HOST, addr.as_str());
        if let Some(authorization) = self.authorization() {
            request = request.header(PROXY_AUTHORIZATION, authorization);
        }
        let request = request.body(Empty::<Bytes>::new())?;

        trace!(%addr, proxy.host = %self.host, proxy.port = self.port, "opening proxy tunnel");
        let (mut sender, connection) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(ConnectionError::Handshake)?;

        let exchange = async {
            let response = sender
                .send_request(request)
                .await
                .map_err(ConnectionError::from_hyper)?;
            if !response.status().is_success() {
                return Err(ConnectionError::Proxy(format!(
                    "tunnel to {addr} refused: {}",
                    response.status()
                )));
            }
            hyper::upgrade::on(response)
                .await
                .map_err(ConnectionError::from_hyper)
        };
        let driver = async move {
            connection
                .with_upgrades()
                .await
                .map_err(ConnectionError::from_hyper)
        };

        let (upgraded, ()) = tokio::try_join!(exchange, driver)?;
        trace!(%addr, "proxy tunnel established");
        Ok(TokioIo::new(upgraded))
    }
}

fn no_proxy_matches(pattern: &str, host: &str, port: u16) -> bool {
    if pattern == "*" {
        return true;
    }

    let (pattern, pattern_port) = match pattern.rsplit_once(':') {
        Some((name, p)) if !name.is_empty() => match p.parse::<u16>() {
            Ok(p) => (name, Some(p)),
            Err(_) => (pattern, None),
        },
        _ => (pattern, None),
    };

    if pattern_port.is_some_and(|p| p != port) {
        return false;
    }

    let host = host.to_ascii_lowercase();
    let pattern = pattern.to_ascii_lowercase();

    if let Some(domain) = pattern
        .strip_prefix("*.")
        .or_else(|| pattern.strip_prefix('.'))
    {
        return host.ends_with(&format!(".{domain}"));
    }

    host == pattern || host.ends_with(&format!(".{pattern}"))
}
