use std::{fmt, str::FromStr};

use http::uri::Scheme;
use url::Url;

/// The URL used for connecting to a server does not name a site.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum UriError {
    /// Only `http` and `https` are supported.
    #[error("unsupported scheme in url: {0}")]
    UnsupportedScheme(String),

    /// The URL has no host component.
    #[error("missing host in url: {0}")]
    MissingHost(Url),

    /// The connection string could not be parsed.
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Pool key which identifies a network destination, using scheme, host and port.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct Site {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl Site {
    /// Create a site from its parts.
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    /// Build the site a URL points at. The port falls back to the scheme's default.
    pub fn from_url(url: &Url) -> Result<Self, UriError> {
        let scheme = match url.scheme() {
            "http" => Scheme::HTTP,
            "https" => Scheme::HTTPS,
            other => return Err(UriError::UnsupportedScheme(other.to_owned())),
        };

        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| UriError::MissingHost(url.clone()))?;

        let port = url
            .port_or_known_default()
            .ok_or_else(|| UriError::UnsupportedScheme(url.scheme().to_owned()))?;

        Ok(Self::new(scheme, host, port))
    }

    /// The site's scheme.
    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    /// The site's host, as it appears in a URL (IPv6 hosts keep their brackets).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The site's port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether connections to this site use TLS.
    pub fn use_ssl(&self) -> bool {
        self.scheme == Scheme::HTTPS
    }

    /// `host:port`, as used in `Host` headers and `CONNECT` requests.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The host with IPv6 brackets removed, suitable for name resolution and TLS SNI.
    pub(crate) fn bare_host(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl TryFrom<&Url> for Site {
    type Error = UriError;

    fn try_from(value: &Url) -> Result<Self, Self::Error> {
        Site::from_url(value)
    }
}

impl FromStr for Site {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s)?;
        Site::from_url(&url)
    }
}
