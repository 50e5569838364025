//! Logically named backend services.
//!
//! A [`Service`] binds a [`ServiceName`] to the concrete URL a resolver chose
//! for it. Services are created by the resolvers in [`resolver`] and handed
//! out by a [`Session`](crate::Session).

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use url::Url;

use crate::client::{Client, RequestOptions, Response};
use crate::tls::SslContext;
use crate::Error;

pub mod resolver;

pub use self::resolver::{Resolution, Resolver, ServerList, SettingsResolver, Srv};

/// The backend services an agent talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServiceName {
    /// Certificate authority.
    Ca,
    /// File content and metadata.
    Fileserver,
    /// The controller: catalogs, nodes, facts.
    Puppet,
    /// Server status.
    Puppetserver,
    /// Report submission.
    Report,
}

impl ServiceName {
    /// Every service, in name order.
    pub const ALL: [ServiceName; 5] = [
        ServiceName::Ca,
        ServiceName::Fileserver,
        ServiceName::Puppet,
        ServiceName::Puppetserver,
        ServiceName::Report,
    ];

    /// The lowercase service name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceName::Ca => "ca",
            ServiceName::Fileserver => "fileserver",
            ServiceName::Puppet => "puppet",
            ServiceName::Puppetserver => "puppetserver",
            ServiceName::Report => "report",
        }
    }

    /// The API path prefix of the service.
    pub fn prefix(&self) -> &'static str {
        match self {
            ServiceName::Ca => "/puppet-ca/v1",
            ServiceName::Fileserver | ServiceName::Puppet | ServiceName::Report => "/puppet/v3",
            ServiceName::Puppetserver => "/status/v1",
        }
    }

    /// The name used for SRV discovery. The controller uses the generic
    /// record; every other service has its own, falling back to the generic
    /// record when it is empty.
    pub fn srv_service(&self) -> &'static str {
        match self {
            ServiceName::Puppet => crate::dns::GENERIC_SERVICE,
            other => other.as_str(),
        }
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServiceName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| Error::Argument(format!("Unknown service {s}")))
    }
}

/// A resolved service: a name, its base URL and the client used to reach it.
#[derive(Debug, Clone)]
pub struct Service {
    name: ServiceName,
    url: Url,
    client: Client,
}

impl Service {
    /// The service `name` served at `https://host:port`.
    pub fn new(client: Client, name: ServiceName, host: &str, port: u16) -> Result<Self, Error> {
        let host = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]")
        } else {
            host.to_owned()
        };

        // Trailing slash, so relative paths join beneath the prefix.
        let url = Url::parse(&format!("https://{host}:{port}{}/", name.prefix()))?;
        Ok(Self { name, url, client })
    }

    /// The service name.
    pub fn name(&self) -> ServiceName {
        self.name
    }

    /// The service's base URL, ending in `/`.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The client used to reach the service.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Open (or reuse) a connection to the service's site.
    pub async fn connect(&self, ssl_context: Option<&Arc<SslContext>>) -> Result<(), Error> {
        let options = RequestOptions {
            ssl_context: ssl_context.cloned(),
            ..Default::default()
        };
        self.client.connect(&self.url, options).await
    }

    /// `GET /status/v1/simple/master` on the service's host, failing on a
    /// non-success status.
    pub async fn get_simple_status(
        &self,
        ssl_context: Option<&Arc<SslContext>>,
    ) -> Result<Response, Error> {
        let url = self.url.join("/status/v1/simple/master")?;
        let options = RequestOptions {
            ssl_context: ssl_context.cloned(),
            ..Default::default()
        };
        self.client.get(&url, options).await?.error_for_status()
    }
}
