//! Strategies mapping a [`ServiceName`] to a concrete [`Service`].
//!
//! A [`Session`](crate::Session) walks its resolvers in order until one
//! resolves the service or cancels the walk.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{Service, ServiceName};
use crate::client::Client;
use crate::tls::SslContext;
use crate::Error;

mod server_list;
mod settings;
mod srv;

pub use self::server_list::ServerList;
pub use self::settings::SettingsResolver;
pub use self::srv::Srv;

/// Outcome of a single resolver.
#[derive(Debug)]
pub enum Resolution {
    /// The service is reachable here.
    Resolved(Service),

    /// This resolver found nothing; the next one should be tried.
    Failed(Vec<Error>),

    /// This resolver found nothing, and no later resolver should be tried.
    Cancelled(Vec<Error>),
}

/// A strategy for locating a service.
#[async_trait]
pub trait Resolver: fmt::Debug + Send + Sync {
    /// Try to resolve `name`, connecting with `ssl_context` when given.
    ///
    /// Connection failures are reported through [`Resolution::Failed`] or
    /// [`Resolution::Cancelled`]. Any other error aborts resolution.
    async fn resolve(
        &mut self,
        client: &Client,
        name: ServiceName,
        ssl_context: Option<&Arc<SslContext>>,
    ) -> Result<Resolution, Error>;
}

/// Connect to `service`. Connection failures are recorded in `failures` and
/// reported as `false`; other errors are returned.
pub async fn check_connection(
    service: &Service,
    ssl_context: Option<&Arc<SslContext>>,
    failures: &mut Vec<Error>,
) -> Result<bool, Error> {
    match service.connect(ssl_context).await {
        Ok(()) => Ok(true),
        Err(error) if error.is_connection() => {
            debug!(
                "Connection to {} failed, trying next route: {error}",
                service.url()
            );
            failures.push(error);
            Ok(false)
        }
        Err(error) => Err(error),
    }
}
