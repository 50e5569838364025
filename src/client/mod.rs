//! HTTP client for reaching backend services.
//!
//! There are three levels of available APIs in this module:
//!
//! 1. The high-level [`Client`], which checks connections out of a shared
//!    [`Pool`](pool::Pool), follows redirects and honours `Retry-After`.
//! 2. The [`HttpClient`] trait, implemented by [`Client`] and by
//!    [`ExternalClient`], for code which should work with either.
//! 3. The [connection][self::conn] API, which dials sites and speaks
//!    HTTP/1.1 over a single connection.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderMap, Method};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use url::Url;

use self::conn::{ConnectionError, TcpConnector};
use self::pool::Pool;
use crate::dns::DnsResolver;
use crate::service::{Resolver, ServerList, SettingsResolver, Srv};
use crate::tls::{SslContext, Verifier};
use crate::{Error, Session, Settings};

mod builder;
pub mod conn;
mod external;
pub mod pool;
mod redirect;
mod request;
mod response;
mod retry_after;
mod site;

pub use self::builder::Builder;
pub use self::external::{ExternalClient, ExternalTransport};
pub use self::pool::Config as PoolConfig;
pub use self::redirect::Redirector;
pub use self::request::Request;
pub use self::response::Response;
pub use self::retry_after::RetryAfterHandler;
pub use self::site::{Site, UriError};

#[cfg(test)]
pub(crate) use self::response::response;

/// Credentials for HTTP basic authentication.
#[derive(Clone, PartialEq, Eq)]
pub struct BasicAuth {
    /// User name.
    pub user: String,
    /// Password.
    pub password: String,
}

impl BasicAuth {
    /// Credentials for `user`.
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    fn header_value(&self) -> Option<HeaderValue> {
        let encoded = STANDARD.encode(format!("{}:{}", self.user, self.password));
        HeaderValue::from_str(&format!("Basic {encoded}")).ok()
    }
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Per-request options.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct RequestOptions {
    /// Headers sent in addition to (and overriding) the client's defaults.
    pub headers: HeaderMap,

    /// Query parameters. When non-empty they replace the URL's query.
    pub params: Vec<(String, String)>,

    /// Trust configuration for this request, instead of the client's.
    pub ssl_context: Option<Arc<SslContext>>,

    /// Also trust the platform's certificate store.
    /// Cannot be combined with [`RequestOptions::ssl_context`].
    pub include_system_store: bool,

    /// Redirect limit for this request, instead of the client's.
    pub redirect_limit: Option<u32>,

    /// Credentials sent with the request. Without them, credentials in the
    /// URL are used.
    pub basic_auth: Option<BasicAuth>,
}

impl RequestOptions {
    /// Send `name: value`.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Add a query parameter.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    /// Use `context` to verify the server.
    pub fn with_ssl_context(mut self, context: Arc<SslContext>) -> Self {
        self.ssl_context = Some(context);
        self
    }

    /// Also trust the platform's certificate store.
    pub fn with_system_store(mut self) -> Self {
        self.include_system_store = true;
        self
    }

    /// Follow at most `limit` redirects.
    pub fn with_redirect_limit(mut self, limit: u32) -> Self {
        self.redirect_limit = Some(limit);
        self
    }

    /// Authenticate with `user` and `password`.
    pub fn with_basic_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some(BasicAuth::new(user, password));
        self
    }
}

/// The operations shared by every client flavour.
#[async_trait]
pub trait HttpClient: fmt::Debug + Send + Sync {
    /// `GET url`.
    async fn get(&self, url: &Url, options: RequestOptions) -> Result<Response, Error>;

    /// `HEAD url`.
    async fn head(&self, url: &Url, options: RequestOptions) -> Result<Response, Error>;

    /// `PUT body` to `url`. A `Content-Type` header is required.
    async fn put(&self, url: &Url, body: Bytes, options: RequestOptions) -> Result<Response, Error>;

    /// `POST body` to `url`. A `Content-Type` header is required.
    async fn post(&self, url: &Url, body: Bytes, options: RequestOptions)
        -> Result<Response, Error>;

    /// `DELETE url`.
    async fn delete(&self, url: &Url, options: RequestOptions) -> Result<Response, Error>;

    /// Open (or reuse) a connection to the site of `url` without sending a request.
    async fn connect(&self, url: &Url, options: RequestOptions) -> Result<(), Error>;

    /// Close every idle connection.
    fn close(&self);
}

/// A pooled HTTP client.
///
/// Cloning is cheap: clones share the connection pool, the DNS cache and the
/// trust configuration.
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<ClientRef>,
}

#[derive(Debug)]
struct ClientRef {
    pool: Pool<TcpConnector>,
    default_headers: HeaderMap,
    ssl_context: Arc<SslContext>,
    system_ssl_context: OnceCell<Arc<SslContext>>,
    redirector: Redirector,
    retry_after: RetryAfterHandler,
    settings: Arc<Settings>,
    dns: Arc<DnsResolver>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    /// A client with default settings.
    pub fn new() -> Self {
        Builder::default().build()
    }

    /// Configure a client.
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// The settings this client was built with.
    pub fn settings(&self) -> &Arc<Settings> {
        &self.inner.settings
    }

    /// The SRV resolver shared by sessions created from this client.
    pub fn dns(&self) -> &Arc<DnsResolver> {
        &self.inner.dns
    }

    /// The connection pool.
    pub fn pool(&self) -> &Pool<TcpConnector> {
        &self.inner.pool
    }

    /// The trust configuration used when a request does not supply one.
    pub fn ssl_context(&self) -> &Arc<SslContext> {
        &self.inner.ssl_context
    }

    /// Headers sent with every request.
    pub fn default_headers(&self) -> &HeaderMap {
        &self.inner.default_headers
    }

    /// Start a session resolving through the chain configured by the client's settings.
    pub fn create_session(&self) -> Session {
        Session::new(self.clone(), self.build_resolvers())
    }

    /// The resolver chain for this client's settings: SRV discovery when
    /// enabled, the server list when non-empty, then the static settings.
    pub fn build_resolvers(&self) -> Vec<Box<dyn Resolver>> {
        let settings = &self.inner.settings;
        let mut resolvers: Vec<Box<dyn Resolver>> = Vec::new();

        if settings.use_srv_records {
            let domain = settings.srv_domain.clone().unwrap_or_default();
            resolvers.push(Box::new(Srv::new(domain)));
        }

        if !settings.server_list.is_empty() {
            resolvers.push(Box::new(ServerList::from_settings(settings)));
        }

        resolvers.push(Box::new(SettingsResolver::new(settings.clone())));
        resolvers
    }

    /// `url` with its query replaced by `params`. Empty `params` leave the URL unchanged.
    pub fn encode_query(url: &Url, params: &[(String, String)]) -> Url {
        let mut url = url.clone();
        if !params.is_empty() {
            url.set_query(None);
            url.query_pairs_mut().extend_pairs(params);
        }
        url
    }

    /// `GET url`.
    pub async fn get(&self, url: &Url, options: RequestOptions) -> Result<Response, Error> {
        self.send(Method::GET, url, Bytes::new(), options).await
    }

    /// `HEAD url`.
    pub async fn head(&self, url: &Url, options: RequestOptions) -> Result<Response, Error> {
        self.send(Method::HEAD, url, Bytes::new(), options).await
    }

    /// `PUT body` to `url`. A `Content-Type` header is required.
    pub async fn put(
        &self,
        url: &Url,
        body: impl Into<Bytes>,
        options: RequestOptions,
    ) -> Result<Response, Error> {
        require_content_type("put", &options)?;
        self.send(Method::PUT, url, body.into(), options).await
    }

    /// `POST body` to `url`. A `Content-Type` header is required.
    pub async fn post(
        &self,
        url: &Url,
        body: impl Into<Bytes>,
        options: RequestOptions,
    ) -> Result<Response, Error> {
        require_content_type("post", &options)?;
        self.send(Method::POST, url, body.into(), options).await
    }

    /// `DELETE url`.
    pub async fn delete(&self, url: &Url, options: RequestOptions) -> Result<Response, Error> {
        self.send(Method::DELETE, url, Bytes::new(), options).await
    }

    /// Open (or reuse) a connection to the site of `url` and return it to the pool.
    pub async fn connect(&self, url: &Url, options: RequestOptions) -> Result<(), Error> {
        let start = Instant::now();
        let site = Site::from_url(url)?;
        let verifier = self.verifier(&site, &options).await?;

        let connection = self
            .inner
            .pool
            .checkout(&site, verifier.as_ref())
            .await
            .map_err(|error| request_error(url, start, error, false))?;
        connection.release();
        Ok(())
    }

    /// Close every idle connection.
    pub fn close(&self) {
        self.inner.pool.close();
    }

    async fn send(
        &self,
        method: Method,
        url: &Url,
        body: Bytes,
        options: RequestOptions,
    ) -> Result<Response, Error> {
        let url = Self::encode_query(url, &options.params);

        let mut headers = self.inner.default_headers.clone();
        headers.extend(options.headers.clone());
        let authorization = options
            .basic_auth
            .clone()
            .or_else(|| url_credentials(&url))
            .and_then(|auth| auth.header_value());
        if let Some(authorization) = authorization {
            headers.insert(AUTHORIZATION, authorization);
        }

        let mut request = Request::new(method, url).with_body(body);
        *request.headers_mut() = headers;

        self.execute(request, &options).await
    }

    async fn execute(&self, mut request: Request, options: &RequestOptions) -> Result<Response, Error> {
        let custom;
        let redirector = match options.redirect_limit {
            Some(limit) => {
                custom = Redirector::new(limit);
                &custom
            }
            None => &self.inner.redirector,
        };
        let retry_after = &self.inner.retry_after;

        let mut redirects = 0;
        let mut retries = 0;

        loop {
            let start = Instant::now();
            let site = Site::from_url(request.url())?;
            let verifier = self.verifier(&site, options).await?;

            let mut connection = self
                .inner
                .pool
                .checkout(&site, verifier.as_ref())
                .await
                .map_err(|error| request_error(request.url(), start, error, false))?;

            let response = connection
                .send(&request)
                .await
                .map_err(|error| request_error(request.url(), start, error, true))?;
            let response = Response::new(request.url().clone(), response);

            debug!(
                "HTTP {} {} returned {} {}",
                request.method(),
                request.url(),
                response.code(),
                response.reason()
            );

            if redirector.is_redirect(&response) {
                let next = redirector.redirect_to(&request, &response, redirects)?;
                connection.release();
                request = next;
                redirects += 1;
                continue;
            }

            if retry_after.is_retry_after(&response) {
                let interval = retry_after.retry_after_interval(&request, &response, retries)?;
                retries += 1;
                if let Some(interval) = interval {
                    connection.close();
                    warn!(
                        "Sleeping for {} seconds before retrying the request",
                        interval.as_secs()
                    );
                    tokio::time::sleep(interval).await;
                    continue;
                }
            }

            connection.release();
            info!(
                method = %request.method(),
                url = %request.url(),
                status = response.code(),
                reason = response.reason(),
                "HTTP request complete"
            );
            return Ok(response);
        }
    }

    async fn verifier(&self, site: &Site, options: &RequestOptions) -> Result<Option<Verifier>, Error> {
        if !site.use_ssl() {
            return Ok(None);
        }

        let context = self.resolve_ssl_context(options).await?;
        Ok(Some(Verifier::new(site.bare_host(), context)))
    }

    async fn resolve_ssl_context(&self, options: &RequestOptions) -> Result<Arc<SslContext>, Error> {
        match (&options.ssl_context, options.include_system_store) {
            (Some(_), true) => Err(Error::Argument(
                "The ssl_context and include_system_store parameters are mutually exclusive".into(),
            )),
            (Some(context), false) => Ok(context.clone()),
            (None, true) => self.system_ssl_context().await,
            (None, false) => Ok(self.inner.ssl_context.clone()),
        }
    }

    /// The client's trust configuration plus the platform's certificate
    /// store, loaded on first use.
    async fn system_ssl_context(&self) -> Result<Arc<SslContext>, Error> {
        let base = &self.inner.ssl_context;
        let context = self
            .inner
            .system_ssl_context
            .get_or_try_init(|| async { base.with_system_store().map(Arc::new) })
            .await?;
        Ok(context.clone())
    }
}

#[async_trait]
impl HttpClient for Client {
    async fn get(&self, url: &Url, options: RequestOptions) -> Result<Response, Error> {
        Client::get(self, url, options).await
    }

    async fn head(&self, url: &Url, options: RequestOptions) -> Result<Response, Error> {
        Client::head(self, url, options).await
    }

    async fn put(&self, url: &Url, body: Bytes, options: RequestOptions) -> Result<Response, Error> {
        Client::put(self, url, body, options).await
    }

    async fn post(
        &self,
        url: &Url,
        body: Bytes,
        options: RequestOptions,
    ) -> Result<Response, Error> {
        Client::post(self, url, body, options).await
    }

    async fn delete(&self, url: &Url, options: RequestOptions) -> Result<Response, Error> {
        Client::delete(self, url, options).await
    }

    async fn connect(&self, url: &Url, options: RequestOptions) -> Result<(), Error> {
        Client::connect(self, url, options).await
    }

    fn close(&self) {
        Client::close(self)
    }
}

pub(crate) fn require_content_type(method: &str, options: &RequestOptions) -> Result<(), Error> {
    if options.headers.contains_key(CONTENT_TYPE) {
        Ok(())
    } else {
        Err(Error::Argument(format!(
            "'{method}' requires a 'content-type' header"
        )))
    }
}

fn url_credentials(url: &Url) -> Option<BasicAuth> {
    match (url.username(), url.password()) {
        ("", _) | (_, None) => None,
        (user, Some(password)) => Some(BasicAuth::new(user, password)),
    }
}

/// Seconds since `start`, rounded to milliseconds.
fn elapsed(start: Instant) -> f64 {
    (start.elapsed().as_secs_f64() * 1000.0).round() / 1000.0
}

fn request_error(url: &Url, start: Instant, error: ConnectionError, connected: bool) -> Error {
    if let ConnectionError::Tls(tls) = error {
        return Error::Ssl(tls);
    }

    let elapsed = elapsed(start);
    let message = match &error {
        ConnectionError::ConnectTimeout => {
            format!("Request to {url} timed out connect operation after {elapsed} seconds")
        }
        ConnectionError::ReadTimeout => {
            format!("Request to {url} timed out read operation after {elapsed} seconds")
        }
        ConnectionError::Interrupted(_) => {
            format!("Request to {url} interrupted after {elapsed} seconds")
        }
        other => format!("Request to {url} failed after {elapsed} seconds: {other}"),
    };

    if connected {
        Error::http(message, Some(error.into()))
    } else {
        Error::connection(message, Some(error.into()))
    }
}
