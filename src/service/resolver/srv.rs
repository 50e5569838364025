use std::sync::Arc;

use async_trait::async_trait;

use super::{check_connection, Resolution, Resolver};
use crate::client::Client;
use crate::service::{Service, ServiceName};
use crate::tls::SslContext;
use crate::Error;

/// Resolves services from DNS SRV records in a domain.
///
/// Candidates are tried in the order produced by the client's
/// [`DnsResolver`](crate::dns::DnsResolver); the first one which connects wins.
#[derive(Debug, Clone)]
pub struct Srv {
    domain: String,
}

impl Srv {
    /// Search `domain` for SRV records.
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
        }
    }

    /// The domain searched.
    pub fn domain(&self) -> &str {
        &self.domain
    }
}

#[async_trait]
impl Resolver for Srv {
    async fn resolve(
        &mut self,
        client: &Client,
        name: ServiceName,
        ssl_context: Option<&Arc<SslContext>>,
    ) -> Result<Resolution, Error> {
        let mut failures = Vec::new();
        let candidates = client
            .dns()
            .each_srv_record(&self.domain, name.srv_service())
            .await;

        for (host, port) in candidates {
            let service = Service::new(client.clone(), name, &host, port)?;
            if check_connection(&service, ssl_context, &mut failures).await? {
                return Ok(Resolution::Resolved(service));
            }
        }

        Ok(Resolution::Failed(failures))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::dns::mock::StaticLookup;
    use crate::dns::SrvRecord;

    #[tokio::test]
    async fn puppetserver_queries_its_own_record_first() {
        let _ = tracing_subscriber::fmt::try_init();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let lookup = StaticLookup::default()
            .with("_x-puppet-puppetserver._tcp.example.com", vec![])
            .with(
                "_x-puppet._tcp.example.com",
                vec![SrvRecord::new("127.0.0.1", port, 0, 0, Duration::from_secs(60))],
            );
        let queries = lookup.counter();
        let client = Client::builder().with_srv_lookup(lookup).build();

        let resolution = Srv::new("example.com")
            .resolve(&client, ServiceName::Puppetserver, None)
            .await
            .unwrap();

        match resolution {
            Resolution::Failed(failures) => {
                assert_eq!(failures.len(), 1);
                assert!(failures[0]
                    .to_string()
                    .contains(&format!("127.0.0.1:{port}/status/v1/")));
            }
            other => panic!("unexpected resolution: {other:?}"),
        }
        assert_eq!(queries.load(Ordering::SeqCst), 2);
        assert!(client.dns().is_expired("puppetserver"));
        assert!(!client.dns().is_expired("puppet"));
    }
}
