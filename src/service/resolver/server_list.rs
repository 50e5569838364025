use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

use super::{Resolution, Resolver};
use crate::client::Client;
use crate::service::{Service, ServiceName};
use crate::tls::SslContext;
use crate::{Error, Settings};

const TRY_NEXT: &str = "Trying with next server from server_list.";

/// Resolves services to the first reachable entry of `server_list`.
///
/// Each entry is probed with a simple status request. The first server that
/// answers successfully serves every handled service for the rest of the
/// session. When no entry answers, resolution is cancelled rather than
/// falling through to later resolvers.
#[derive(Debug, Clone)]
pub struct ServerList {
    servers: Vec<(String, Option<u16>)>,
    default_port: u16,
    services: HashSet<ServiceName>,
    resolved: Option<(String, u16)>,
}

impl ServerList {
    /// Probe `servers` in order. Entries without a port use `default_port`.
    pub fn new(servers: Vec<(String, Option<u16>)>, default_port: u16) -> Self {
        Self {
            servers,
            default_port,
            services: ServiceName::ALL.into_iter().collect(),
            resolved: None,
        }
    }

    /// The list built from `settings`. Services with a dedicated server
    /// configured are left to other resolvers.
    pub fn from_settings(settings: &Settings) -> Self {
        let mut resolver = Self::new(settings.server_list.clone(), settings.serverport);
        if settings.ca_server.is_some() {
            resolver.services.remove(&ServiceName::Ca);
        }
        if settings.report_server.is_some() {
            resolver.services.remove(&ServiceName::Report);
        }
        resolver
    }

    /// Whether this resolver handles `name`.
    pub fn handles(&self, name: ServiceName) -> bool {
        self.services.contains(&name)
    }

    /// The server chosen by a previous successful probe.
    pub fn resolved(&self) -> Option<(&str, u16)> {
        self.resolved
            .as_ref()
            .map(|(host, port)| (host.as_str(), *port))
    }
}

#[async_trait]
impl Resolver for ServerList {
    async fn resolve(
        &mut self,
        client: &Client,
        name: ServiceName,
        ssl_context: Option<&Arc<SslContext>>,
    ) -> Result<Resolution, Error> {
        if !self.handles(name) {
            return Ok(Resolution::Failed(Vec::new()));
        }

        if let Some((host, port)) = &self.resolved {
            return Ok(Resolution::Resolved(Service::new(
                client.clone(),
                name,
                host,
                *port,
            )?));
        }

        let mut failures = Vec::new();
        let last = self.servers.len().saturating_sub(1);
        for (index, (host, port)) in self.servers.iter().enumerate() {
            let port = port.unwrap_or(self.default_port);
            let status = Service::new(client.clone(), ServiceName::Puppetserver, host, port)?;

            let message = match status.get_simple_status(ssl_context).await {
                Ok(_) => {
                    self.resolved = Some((host.clone(), port));
                    return Ok(Resolution::Resolved(Service::new(
                        client.clone(),
                        name,
                        host,
                        port,
                    )?));
                }
                Err(Error::Response {
                    status: code,
                    ref reason,
                    ..
                }) => format!(
                    "Puppet server {host}:{port} is unavailable: {} {reason}",
                    code.as_u16()
                ),
                Err(ref detail) if detail.is_connection() || detail.is_http() => {
                    format!("Unable to connect to server from server_list setting: {detail}")
                }
                Err(other) => return Err(other),
            };

            if index < last {
                warn!("{message} {TRY_NEXT}");
            } else {
                error!("{message}");
            }
            failures.push(Error::connection(message, None));
        }

        Ok(Resolution::Cancelled(failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedicated_servers_are_excluded() {
        let settings = Settings::default()
            .with_server_list([("a", None), ("b", Some(8141))])
            .with_ca_server("ca", None);

        let resolver = ServerList::from_settings(&settings);
        assert!(!resolver.handles(ServiceName::Ca));
        assert!(resolver.handles(ServiceName::Report));
        assert!(resolver.handles(ServiceName::Puppet));
        assert!(resolver.resolved().is_none());
    }

    #[tokio::test]
    async fn unhandled_service_fails_without_probing() {
        let settings = Settings::default()
            .with_server_list([("127.0.0.1", Some(1))])
            .with_report_server("reports", None);

        let mut resolver = ServerList::from_settings(&settings);
        let resolution = resolver
            .resolve(&Client::new(), ServiceName::Report, None)
            .await
            .unwrap();
        assert!(matches!(resolution, Resolution::Failed(failures) if failures.is_empty()));
    }
}
