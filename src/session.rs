//! Per-run service routing.
//!
//! A [`Session`] resolves each service at most once, walking its resolver
//! chain in order. It also remembers the server version each site reports,
//! so callers can ask whether a resolved service supports a capability.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error};
use url::Url;

use crate::client::{Client, Response, Site};
use crate::service::{Resolution, Resolver, Service, ServiceName};
use crate::tls::SslContext;
use crate::Error;

/// Header carrying the server's version.
pub const VERSION_HEADER: &str = "X-Puppet-Version";

/// Version assumed for servers which never reported one.
pub const BASELINE_VERSION: &str = "5.0.0";

const LOCALES_VERSION: &str = "5.3.4";
const JSON_VERSION: &str = "5.0.0";

/// Optional server features.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Capability {
    /// The server can serve locale files to agents.
    Locales,
    /// The server accepts JSON by default.
    Json,
}

/// Resolves services and tracks server versions for one agent run.
#[derive(Debug)]
pub struct Session {
    client: Client,
    resolvers: Vec<Box<dyn Resolver>>,
    resolved_services: HashMap<ServiceName, Service>,
    resolution_exceptions: Vec<Error>,
    server_versions: HashMap<Site, String>,
}

impl Session {
    /// A session resolving through `resolvers`, in order.
    pub fn new(client: Client, resolvers: Vec<Box<dyn Resolver>>) -> Self {
        Self {
            client,
            resolvers,
            resolved_services: HashMap::new(),
            resolution_exceptions: Vec::new(),
            server_versions: HashMap::new(),
        }
    }

    /// The client this session resolves with.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Failures recorded by the most recent resolution.
    pub fn resolution_exceptions(&self) -> &[Error] {
        &self.resolution_exceptions
    }

    /// Find a reachable instance of `name`.
    ///
    /// When `url` names a host, the service is built from it directly and
    /// connected; connection errors are returned as-is and nothing is cached.
    /// Otherwise a service resolved earlier in this session is returned, or
    /// the resolver chain is walked until a resolver succeeds or cancels.
    pub async fn route_to(
        &mut self,
        name: ServiceName,
        url: Option<&Url>,
        ssl_context: Option<&Arc<SslContext>>,
    ) -> Result<Service, Error> {
        let explicit = url.and_then(|url| explicit_endpoint(url, self.client.settings().serverport));
        if let Some((host, port)) = explicit {
            let service = Service::new(self.client.clone(), name, host, port)?;
            service.connect(ssl_context).await?;
            return Ok(service);
        }

        if let Some(service) = self.resolved_services.get(&name) {
            return Ok(service.clone());
        }

        self.resolution_exceptions.clear();
        for resolver in &mut self.resolvers {
            debug!("Resolving service '{name}' using {resolver:?}");
            match resolver.resolve(&self.client, name, ssl_context).await? {
                Resolution::Resolved(service) => {
                    debug!("Resolved service '{name}' to {}", service.url());
                    self.resolved_services.insert(name, service.clone());
                    return Ok(service);
                }
                Resolution::Failed(failures) => {
                    self.resolution_exceptions.extend(failures);
                }
                Resolution::Cancelled(failures) => {
                    self.resolution_exceptions.extend(failures);
                    break;
                }
            }
        }

        for exception in &self.resolution_exceptions {
            error!("{exception}");
        }

        Err(Error::Route {
            service: name,
            failures: self
                .resolution_exceptions
                .iter()
                .map(ToString::to_string)
                .collect(),
        })
    }

    /// Record the server version reported by `response`.
    pub fn process_response(&mut self, response: &Response) {
        let Some(version) = response.header(VERSION_HEADER) else {
            return;
        };

        match Site::from_url(response.url()) {
            Ok(site) => {
                self.server_versions.insert(site, version.to_owned());
            }
            Err(error) => debug!("Ignoring server version from {}: {error}", response.url()),
        }
    }

    /// The version reported by the server at `url`, or [`BASELINE_VERSION`].
    pub fn server_version(&self, url: &Url) -> &str {
        self.recorded_version(url).unwrap_or(BASELINE_VERSION)
    }

    /// Whether the resolved service `name` supports `capability`.
    ///
    /// Unresolved services support nothing.
    pub fn supports(&self, name: ServiceName, capability: Capability) -> bool {
        let Some(service) = self.resolved_services.get(&name) else {
            return false;
        };

        let version = self.recorded_version(service.url());
        match capability {
            Capability::Locales => version.is_some_and(|v| at_least(v, LOCALES_VERSION)),
            Capability::Json => version.map_or(true, |v| at_least(v, JSON_VERSION)),
        }
    }

    fn recorded_version(&self, url: &Url) -> Option<&str> {
        let site = Site::from_url(url).ok()?;
        self.server_versions.get(&site).map(String::as_str)
    }
}

/// Compare dotted versions numerically. Non-numeric suffixes on a component
/// are ignored; missing components count as zero.
fn compare_versions(left: &str, right: &str) -> Ordering {
    let parse = |version: &str| -> Vec<u64> {
        version
            .split('.')
            .map(|part| {
                let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
                digits.parse().unwrap_or(0)
            })
            .collect()
    };

    let (left, right) = (parse(left), parse(right));
    let len = left.len().max(right.len());
    (0..len)
        .map(|i| {
            let l = left.get(i).copied().unwrap_or(0);
            let r = right.get(i).copied().unwrap_or(0);
            l.cmp(&r)
        })
        .find(|ordering| ordering.is_ne())
        .unwrap_or(Ordering::Equal)
}

fn at_least(version: &str, minimum: &str) -> bool {
    compare_versions(version, minimum).is_ge()
}

/// Host and port named by an explicit URL. Without a port, the scheme's
/// default is used, then `default_port`.
fn explicit_endpoint(url: &Url, default_port: u16) -> Option<(&str, u16)> {
    let host = url.host_str().filter(|host| !host.is_empty())?;
    let port = url.port_or_known_default().unwrap_or(default_port);
    Some((host.trim_start_matches('[').trim_end_matches(']'), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_endpoints() {
        let endpoint = |url: &str| {
            let url: Url = url.parse().unwrap();
            explicit_endpoint(&url, 8140).map(|(host, port)| (host.to_owned(), port))
        };

        assert_eq!(endpoint("https://puppet:8141/x"), Some(("puppet".into(), 8141)));
        assert_eq!(endpoint("https://puppet:443/x"), Some(("puppet".into(), 443)));
        assert_eq!(endpoint("https://puppet/x"), Some(("puppet".into(), 443)));
        assert_eq!(endpoint("http://puppet/x"), Some(("puppet".into(), 80)));
        assert_eq!(endpoint("puppet://server/x"), Some(("server".into(), 8140)));
        assert_eq!(endpoint("https://[::1]:8140/"), Some(("::1".into(), 8140)));
        assert_eq!(endpoint("file:///etc/puppet"), None);
    }

    #[test]
    fn version_ordering() {
        assert!(at_least("5.3.4", "5.3.4"));
        assert!(at_least("5.10.0", "5.3.4"));
        assert!(at_least("6", "5.3.4"));
        assert!(!at_least("5.3.3", "5.3.4"));
        assert!(!at_least("4.10.12", "5.0.0"));
        assert!(at_least("5.0", "5.0.0"));
        assert!(at_least("7.1.0-rc1", "7.1.0"));
    }

    #[test]
    fn server_versions_by_site() {
        let mut session = Session::new(Client::new(), Vec::new());
        let url: Url = "https://puppet:8140/puppet/v3/".parse().unwrap();
        assert_eq!(session.server_version(&url), BASELINE_VERSION);

        let response = crate::client::response(
            "https://puppet:8140/puppet/v3/catalog/foo",
            200,
            &[("X-Puppet-Version", "6.4.0")],
        );
        session.process_response(&response);

        assert_eq!(session.server_version(&url), "6.4.0");
        let other: Url = "https://puppet:8141/".parse().unwrap();
        assert_eq!(session.server_version(&other), BASELINE_VERSION);
    }

    #[test]
    fn unresolved_supports_nothing() {
        let session = Session::new(Client::new(), Vec::new());
        assert!(!session.supports(ServiceName::Puppet, Capability::Json));
        assert!(!session.supports(ServiceName::Puppet, Capability::Locales));
    }

    #[tokio::test]
    async fn empty_chain_is_a_route_error() {
        let mut session = Session::new(Client::new(), Vec::new());
        let error = session
            .route_to(ServiceName::Ca, None, None)
            .await
            .unwrap_err();
        assert_eq!(error.to_string(), "No more routes to ca");
    }
}
