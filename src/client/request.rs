use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, HOST, PROXY_AUTHORIZATION};
use http::{HeaderMap, Method};
use http_body_util::Full;
use url::Url;

use super::conn::ProxyConfig;

/// An outbound request.
///
/// The request remembers the URL it was originally issued for, so that a
/// chain of redirects can report where it started.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    url: Url,
    origin: Url,
    headers: HeaderMap,
    body: Bytes,
}

impl Request {
    /// A request with no headers and an empty body.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            origin: url.clone(),
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Set the request body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Set a header, replacing any previous value.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The URL this request is sent to.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The URL which started this request's redirect chain.
    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// Request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable request headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// The request body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The same request, sent to another URL.
    pub(crate) fn redirected(&self, url: Url) -> Self {
        Self {
            url,
            ..self.clone()
        }
    }

    /// Build the wire request. Requests through a forward proxy use the
    /// absolute-form target.
    pub(crate) fn to_http(
        &self,
        proxy: Option<&ProxyConfig>,
    ) -> Result<http::Request<Full<Bytes>>, http::Error> {
        let target = match proxy {
            Some(_) => {
                let mut absolute = self.url.clone();
                absolute.set_fragment(None);
                let _ = absolute.set_username("");
                let _ = absolute.set_password(None);
                absolute.to_string()
            }
            None => match self.url.query() {
                Some(query) => format!("{}?{}", self.url.path(), query),
                None => self.url.path().to_owned(),
            },
        };

        let mut builder = http::Request::builder()
            .method(self.method.clone())
            .uri(target);

        if let Some(headers) = builder.headers_mut() {
            headers.extend(self.headers.clone());
            if !headers.contains_key(HOST) {
                headers.insert(HOST, HeaderValue::from_str(&host_header(&self.url))?);
            }
            if let Some(authorization) = proxy.and_then(ProxyConfig::authorization) {
                headers.insert(PROXY_AUTHORIZATION, authorization);
            }
        }

        builder.body(Full::new(self.body.clone()))
    }
}

fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    }
}
