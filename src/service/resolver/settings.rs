use std::sync::Arc;

use async_trait::async_trait;

use super::{check_connection, Resolution, Resolver};
use crate::client::Client;
use crate::service::{Service, ServiceName};
use crate::tls::SslContext;
use crate::{Error, Settings};

/// Resolves services to the servers named in [`Settings`].
///
/// `ca` and `report` use their dedicated servers when configured; everything
/// else goes to `server:serverport`.
#[derive(Debug, Clone)]
pub struct SettingsResolver {
    settings: Arc<Settings>,
}

impl SettingsResolver {
    /// Resolve from `settings`.
    pub fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Resolver for SettingsResolver {
    async fn resolve(
        &mut self,
        client: &Client,
        name: ServiceName,
        ssl_context: Option<&Arc<SslContext>>,
    ) -> Result<Resolution, Error> {
        let (host, port) = self.settings.endpoint(name);
        let service = Service::new(client.clone(), name, host, port)?;

        let mut failures = Vec::new();
        if check_connection(&service, ssl_context, &mut failures).await? {
            Ok(Resolution::Resolved(service))
        } else {
            Ok(Resolution::Failed(failures))
        }
    }
}
