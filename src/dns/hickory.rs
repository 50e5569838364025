//! SRV lookups backed by [`hickory_resolver`], using the system resolver configuration.

use std::time::Instant;

use async_trait::async_trait;
use hickory_resolver::{Resolver, TokioResolver};
use tokio::sync::OnceCell;

use super::{SrvLookup, SrvRecord};
use crate::BoxError;

/// Queries the system's DNS servers.
///
/// The underlying resolver is built on first use.
#[derive(Debug, Default)]
pub struct HickoryLookup {
    resolver: OnceCell<TokioResolver>,
}

impl HickoryLookup {
    /// A lookup which reads the system resolver configuration lazily.
    pub fn new() -> Self {
        Self::default()
    }

    async fn resolver(&self) -> Result<&TokioResolver, BoxError> {
        self.resolver
            .get_or_try_init(|| async { Ok::<_, BoxError>(Resolver::builder_tokio()?.build()) })
            .await
    }
}

#[async_trait]
impl SrvLookup for HickoryLookup {
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>, BoxError> {
        let resolver = self.resolver().await?;
        let lookup = match resolver.srv_lookup(name).await {
            Ok(lookup) => lookup,
            Err(error) if error.is_no_records_found() => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };

        let ttl = lookup
            .as_lookup()
            .valid_until()
            .saturating_duration_since(Instant::now());

        Ok(lookup
            .iter()
            .map(|srv| {
                let target = srv.target().to_utf8();
                SrvRecord::new(
                    target.trim_end_matches('.'),
                    srv.port(),
                    srv.priority(),
                    srv.weight(),
                    ttl,
                )
            })
            .collect())
    }
}
