use http::StatusCode;
use thiserror::Error;
use url::Url;

use crate::client::UriError;
use crate::service::ServiceName;
use crate::tls::TlsError;
use crate::BoxError;

/// Errors surfaced by the client, the session and the resolvers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// No connection could be established to the remote site.
    #[error("{message}")]
    Connection {
        /// Human readable description, including the request URL and elapsed time.
        message: String,
        /// Underlying cause.
        #[source]
        source: Option<BoxError>,
    },

    /// A connection was established, but the exchange failed.
    #[error("{message}")]
    Http {
        /// Human readable description, including the request URL and elapsed time.
        message: String,
        /// Underlying cause.
        #[source]
        source: Option<BoxError>,
    },

    /// TLS trust could not be established.
    #[error(transparent)]
    Ssl(#[from] TlsError),

    /// The server sent a response we could not act on.
    #[error("{0}")]
    Protocol(String),

    /// Every resolver failed to find a working route to the service.
    #[error("No more routes to {service}")]
    Route {
        /// The service which could not be reached.
        service: ServiceName,
        /// Each failure recorded while resolving, in order.
        failures: Vec<String>,
    },

    /// The redirect limit was reached.
    #[error("Too many HTTP redirections for {addr}")]
    TooManyRedirects {
        /// The address of the request which started the redirect chain.
        addr: Url,
    },

    /// The `Retry-After` limit was reached.
    #[error("Too many HTTP retries for {addr}")]
    TooManyRetryAfters {
        /// The address of the original request, before any redirects.
        addr: Url,
    },

    /// The server returned an unsuccessful status.
    #[error("{} {reason} for {url}", .status.as_u16())]
    Response {
        /// Response URL.
        url: Url,
        /// Response status.
        status: StatusCode,
        /// Reason phrase.
        reason: String,
    },

    /// The request URL does not name a reachable site.
    #[error(transparent)]
    Uri(#[from] UriError),

    /// The URL could not be parsed or joined.
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    /// The caller passed inconsistent arguments.
    #[error("{0}")]
    Argument(String),

    /// The operation is not supported by this client.
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),
}

impl Error {
    /// Is this a failure to connect, which a caller may recover from by
    /// trying another route?
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection { .. })
    }

    /// Is this an error from an established HTTP exchange?
    pub fn is_http(&self) -> bool {
        matches!(self, Error::Http { .. })
    }

    pub(crate) fn connection<S: Into<String>>(message: S, source: Option<BoxError>) -> Self {
        Error::Connection {
            message: message.into(),
            source,
        }
    }

    pub(crate) fn http<S: Into<String>>(message: S, source: Option<BoxError>) -> Self {
        Error::Http {
            message: message.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use static_assertions::assert_impl_all;

    assert_impl_all!(Error: std::error::Error, Send, Sync, Into<BoxError>);

    #[test]
    fn route_error_names_service() {
        let error = Error::Route {
            service: ServiceName::Ca,
            failures: vec!["boom".into()],
        };
        assert_eq!(error.to_string(), "No more routes to ca");
    }

    #[test]
    fn limit_errors_carry_address() {
        let addr: Url = "https://puppet:8140/puppet/v3/catalog".parse().unwrap();
        let error = Error::TooManyRedirects { addr: addr.clone() };
        assert_eq!(
            error.to_string(),
            "Too many HTTP redirections for https://puppet:8140/puppet/v3/catalog"
        );

        let error = Error::TooManyRetryAfters { addr };
        assert_eq!(
            error.to_string(),
            "Too many HTTP retries for https://puppet:8140/puppet/v3/catalog"
        );
    }

    #[test]
    fn classify() {
        assert!(Error::connection("nope", None).is_connection());
        assert!(!Error::http("nope", None).is_connection());
        assert!(Error::http("nope", None).is_http());
        assert!(!Error::Protocol("bad".into()).is_connection());
    }
}
