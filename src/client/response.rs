use std::borrow::Cow;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use url::Url;

use crate::Error;

/// A complete response, with its body collected.
#[derive(Debug, Clone)]
pub struct Response {
    url: Url,
    status: StatusCode,
    reason: String,
    headers: HeaderMap,
    body: Bytes,
}

impl Response {
    pub(crate) fn new(url: Url, response: http::Response<Bytes>) -> Self {
        let (parts, body) = response.into_parts();
        let reason = parts
            .extensions
            .get::<hyper::ext::ReasonPhrase>()
            .map(|phrase| String::from_utf8_lossy(phrase.as_bytes()).into_owned())
            .or_else(|| parts.status.canonical_reason().map(str::to_owned))
            .unwrap_or_default();

        Self {
            url,
            status: parts.status,
            reason,
            headers: parts.headers,
            body,
        }
    }

    /// The URL the response was received from.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Response status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Numeric status code.
    pub fn code(&self) -> u16 {
        self.status.as_u16()
    }

    /// The reason phrase sent by the server, or the canonical one.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// A header value, if present and valid text.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// The response body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Turn an unsuccessful response into [`Error::Response`].
    pub fn error_for_status(self) -> Result<Self, Error> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(Error::Response {
                url: self.url,
                status: self.status,
                reason: self.reason,
            })
        }
    }
}

#[cfg(test)]
pub(crate) fn response(url: &str, status: u16, headers: &[(&'static str, &str)]) -> Response {
    let mut builder = http::Response::builder().status(status);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    Response::new(url.parse().unwrap(), builder.body(Bytes::new()).unwrap())
}
