use http::header::LOCATION;
use tracing::debug;
use url::Url;

use super::{Request, Response};
use crate::Error;

/// Decides whether a response is a redirect and builds the follow-up request.
#[derive(Debug, Clone)]
pub struct Redirector {
    redirect_limit: u32,
}

impl Redirector {
    /// A redirector following at most `redirect_limit` redirects per request.
    pub fn new(redirect_limit: u32) -> Self {
        Self { redirect_limit }
    }

    /// The configured limit.
    pub fn redirect_limit(&self) -> u32 {
        self.redirect_limit
    }

    /// 301, 302 and 307 are followed. Other 3xx statuses are returned to the caller.
    pub fn is_redirect(&self, response: &Response) -> bool {
        matches!(response.code(), 301 | 302 | 307)
    }

    /// Build the request to send after `response`, given `redirects` have already been followed.
    ///
    /// The method, headers and body are carried over. The original query
    /// string replaces any query in the `Location`.
    pub fn redirect_to(
        &self,
        request: &Request,
        response: &Response,
        redirects: u32,
    ) -> Result<Request, Error> {
        if redirects >= self.redirect_limit {
            return Err(Error::TooManyRedirects {
                addr: request.origin().clone(),
            });
        }

        let location = response
            .headers()
            .get(LOCATION)
            .ok_or_else(|| Error::Protocol("Location response header is missing".into()))?;
        let location = location
            .to_str()
            .map_err(|error| Error::Protocol(format!("Location URI is invalid: {error}")))?;

        let mut url = match Url::parse(location) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => request.url().join(location),
            Err(error) => Err(error),
        }
        .map_err(|error| Error::Protocol(format!("Location URI is invalid: {error}")))?;

        url.set_query(request.url().query());

        debug!(from = %request.url(), to = %url, "following redirect");
        Ok(request.redirected(url))
    }
}

impl Default for Redirector {
    fn default() -> Self {
        Self::new(10)
    }
}
