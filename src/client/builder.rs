use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderName, HeaderValue, USER_AGENT};
use http::HeaderMap;
use tokio::sync::OnceCell;
use tracing::warn;

use super::conn::{ConnectionConfig, ProxyConfig, TcpConnector};
use super::pool::{Config as PoolConfig, Pool};
use super::{Client, ClientRef, Redirector, RetryAfterHandler};
use crate::dns::{DnsResolver, SrvLookup};
use crate::tls::SslContext;
use crate::Settings;

const DEFAULT_REDIRECT_LIMIT: u32 = 10;
const DEFAULT_RETRY_LIMIT: u32 = 100;

/// A builder for a [`Client`].
#[derive(Debug)]
pub struct Builder {
    settings: Settings,
    connection: ConnectionConfig,
    pool: PoolConfig,
    ssl_context: Option<Arc<SslContext>>,
    system_ssl_context: Option<Arc<SslContext>>,
    redirect_limit: u32,
    retry_limit: u32,
    dns: Option<Arc<DnsResolver>>,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            connection: ConnectionConfig::default(),
            pool: PoolConfig::default(),
            ssl_context: None,
            system_ssl_context: None,
            redirect_limit: DEFAULT_REDIRECT_LIMIT,
            retry_limit: DEFAULT_RETRY_LIMIT,
            dns: None,
        }
    }
}

impl Builder {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the provided agent settings.
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Use the provided connection configuration.
    pub fn with_connection_config(mut self, config: ConnectionConfig) -> Self {
        self.connection = config;
        self
    }

    /// Set the connect timeout. `None` waits forever.
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connection.connect_timeout = timeout;
        self
    }

    /// Set the read timeout. `None` waits forever.
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connection.read_timeout = timeout;
        self
    }

    /// Send requests through `proxy`.
    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.connection.proxy = Some(proxy);
        self
    }

    /// Use the provided pool configuration.
    pub fn with_pool(mut self, config: PoolConfig) -> Self {
        self.pool = config;
        self
    }

    /// How long released connections stay in the pool.
    pub fn with_keepalive_timeout(mut self, timeout: Duration) -> Self {
        self.pool.keepalive_timeout = timeout;
        self
    }

    /// The trust configuration used when a request does not supply one.
    pub fn with_ssl_context(mut self, context: Arc<SslContext>) -> Self {
        self.ssl_context = Some(context);
        self
    }

    /// The trust configuration used for requests which include the system
    /// store. By default it is derived from the client's context on first use.
    pub fn with_system_ssl_context(mut self, context: Arc<SslContext>) -> Self {
        self.system_ssl_context = Some(context);
        self
    }

    /// Follow at most `limit` redirects per request.
    pub fn with_redirect_limit(mut self, limit: u32) -> Self {
        self.redirect_limit = limit;
        self
    }

    /// Honour `Retry-After` at most `limit` times per request.
    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }

    /// Share `resolver` for SRV discovery.
    pub fn with_dns_resolver(mut self, resolver: Arc<DnsResolver>) -> Self {
        self.dns = Some(resolver);
        self
    }

    /// Discover SRV records with `lookup`.
    pub fn with_srv_lookup<L: SrvLookup + 'static>(self, lookup: L) -> Self {
        self.with_dns_resolver(Arc::new(DnsResolver::new(lookup)))
    }

    /// Build the client.
    pub fn build(self) -> Client {
        let default_headers = default_headers(&self.settings);
        let retry_after = RetryAfterHandler::new(self.retry_limit, self.settings.runinterval);

        Client {
            inner: Arc::new(ClientRef {
                pool: Pool::new(TcpConnector::new(self.connection), self.pool),
                default_headers,
                ssl_context: self.ssl_context.unwrap_or_default(),
                system_ssl_context: OnceCell::new_with(self.system_ssl_context),
                redirector: Redirector::new(self.redirect_limit),
                retry_after,
                settings: Arc::new(self.settings),
                dns: self.dns.unwrap_or_default(),
            }),
        }
    }
}

fn default_headers(settings: &Settings) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let values = [
        (USER_AGENT, &settings.http_user_agent),
        (HeaderName::from_static("x-puppet-version"), &settings.agent_version),
    ];

    for (name, value) in values {
        match HeaderValue::from_str(value) {
            Ok(value) => {
                headers.insert(name, value);
            }
            Err(_) => warn!("Ignoring invalid {name} header value: {value:?}"),
        }
    }

    headers
}
