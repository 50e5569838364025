//! Connection Pooling for Clients
//!
//! The pool keeps started connections which are idle, keyed by [`Site`], so
//! that consecutive requests to the same server share a persistent HTTP
//! connection. Each idle connection is remembered alongside the TLS
//! [`Verifier`] which established it, and is only handed out again to a
//! borrower whose verifier is reusable with it.
//!
//! Idle connections expire after the pool's keepalive timeout. Expired
//! entries are closed lazily, the next time their site is borrowed.
//!
//! Pool configuration happens in the [`Config`] type.

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

mod idle;
#[cfg(test)]
pub(crate) mod mock;

use self::idle::{IdleConnections, PoolEntry};
use super::conn::{Connection, ConnectionError, ConnectionFactory};
use super::Site;
use crate::tls::Verifier;

/// A pool of connections to remote sites.
///
/// Connections are borrowed with [`Pool::borrow`] (or [`Pool::checkout`],
/// which wraps the connection in a [`Pooled`] guard) and returned with
/// [`Pool::release`]. When no idle connection can be reused, a new one is
/// created by the pool's [`ConnectionFactory`] and started. Concurrent
/// borrowers of the same site never wait on each other: each gets its own
/// connection.
pub struct Pool<F: ConnectionFactory> {
    factory: F,
    config: Config,
    idle: Mutex<HashMap<Site, IdleConnections<F::Connection>>>,
}

impl<F: ConnectionFactory> fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let idle = self.idle.lock();
        f.debug_struct("Pool")
            .field("factory", &self.factory)
            .field("config", &self.config)
            .field("sites", &idle.len())
            .finish()
    }
}

impl<F: ConnectionFactory> Pool<F> {
    /// Create a pool using `factory` for new connections.
    pub fn new(factory: F, config: Config) -> Self {
        Self {
            factory,
            config,
            idle: Mutex::new(HashMap::new()),
        }
    }

    /// The factory used to create new connections.
    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// The pool's configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of idle connections held for `site`.
    pub fn idle_count(&self, site: &Site) -> usize {
        self.idle.lock().get(site).map_or(0, IdleConnections::len)
    }

    /// Take a started connection to `site`.
    ///
    /// Expired idle connections for the site are closed first. Then the most
    /// recently released open connection whose verifier is reusable with
    /// `verifier` is returned, or a new connection is created and started.
    #[tracing::instrument(skip_all, fields(%site), level = "debug")]
    pub async fn borrow(
        &self,
        site: &Site,
        verifier: Option<&Verifier>,
    ) -> Result<F::Connection, ConnectionError> {
        let (reused, expired) = self.take_idle(site, verifier);

        for entry in expired {
            debug!("Connection for {site} expired");
            self.close_connection(site, entry.connection);
        }

        if let Some(connection) = reused {
            debug!("Using cached connection for {site}");
            return Ok(connection);
        }

        debug!("Starting connection for {site}");
        let mut connection = self.factory.create_connection(site);
        connection.start(verifier).await?;
        Ok(connection)
    }

    fn take_idle(
        &self,
        site: &Site,
        verifier: Option<&Verifier>,
    ) -> (Option<F::Connection>, Vec<PoolEntry<F::Connection>>) {
        let mut idle = self.idle.lock();
        let Some(entries) = idle.get_mut(site) else {
            return (None, Vec::new());
        };

        let expired = entries.evict_expired(Instant::now());
        let reused = entries.take_reusable(verifier);
        if entries.is_empty() {
            trace!(%site, "removing empty idle list");
            idle.remove(site);
        }

        (reused, expired)
    }

    /// Return a started connection to the pool. It expires after the keepalive timeout.
    pub fn release(&self, site: &Site, verifier: Option<&Verifier>, connection: F::Connection) {
        let expires_at = Instant::now() + self.config.keepalive_timeout;
        debug!("Caching connection for {site}");
        self.idle
            .lock()
            .entry(site.clone())
            .or_default()
            .push(PoolEntry::new(connection, verifier.cloned(), expires_at));
    }

    /// Close every idle connection and empty the pool.
    pub fn close(&self) {
        let idle: Vec<_> = self.idle.lock().drain().collect();
        for (site, entries) in idle {
            for entry in entries {
                self.close_connection(&site, entry.connection);
            }
        }
    }

    /// Close `connection`. Returns `false` without doing anything if it was never started.
    ///
    /// Failures are logged, not returned.
    pub fn close_connection(&self, site: &Site, mut connection: F::Connection) -> bool {
        if !connection.is_started() {
            return false;
        }

        debug!("Closing connection for {site}");
        if let Err(error) = connection.finish() {
            warn!("Failed to close connection for {site}: {error}");
        }
        true
    }

    /// Borrow a connection wrapped in a guard which closes it unless it is
    /// explicitly released.
    pub async fn checkout(
        &self,
        site: &Site,
        verifier: Option<&Verifier>,
    ) -> Result<Pooled<'_, F>, ConnectionError> {
        let connection = self.borrow(site, verifier).await?;
        let reusable = !site.use_ssl() || connection.is_peer_verified();
        if !reusable {
            trace!(%site, "connection is not peer verified and will not be reused");
        }

        Ok(Pooled {
            pool: self,
            site: site.clone(),
            verifier: verifier.cloned(),
            connection: Some(connection),
            reusable,
        })
    }
}

/// A connection checked out of a [`Pool`].
///
/// Call [`Pooled::release`] once the response has been consumed to return the
/// connection to the pool. Dropping the guard without releasing it closes the
/// connection.
pub struct Pooled<'p, F: ConnectionFactory> {
    pool: &'p Pool<F>,
    site: Site,
    verifier: Option<Verifier>,
    /// Only emptied by `take`, which consumes the guard.
    connection: Option<F::Connection>,
    reusable: bool,
}

impl<F: ConnectionFactory> fmt::Debug for Pooled<'_, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("site", &self.site)
            .field("connection", &self.connection)
            .field("reusable", &self.reusable)
            .finish()
    }
}

impl<F: ConnectionFactory> Pooled<'_, F> {
    /// The site this connection is bound to.
    pub fn site(&self) -> &Site {
        &self.site
    }

    /// Whether this connection will return to the pool on release.
    pub fn is_reusable(&self) -> bool {
        self.reusable
    }

    /// Return the connection to the pool if it is reusable and still started,
    /// otherwise close it.
    pub fn release(self) {
        let pool = self.pool;
        let site = self.site.clone();
        let verifier = self.verifier.clone();
        let reusable = self.reusable;

        if let Some(connection) = self.take() {
            if reusable && connection.is_started() {
                pool.release(&site, verifier.as_ref(), connection);
            } else {
                pool.close_connection(&site, connection);
            }
        }
    }

    /// Close the connection rather than returning it to the pool.
    pub fn close(self) -> bool {
        let pool = self.pool;
        let site = self.site.clone();
        match self.take() {
            Some(connection) => pool.close_connection(&site, connection),
            None => false,
        }
    }

    /// Detach the connection so that dropping the guard leaves it alone.
    fn take(mut self) -> Option<F::Connection> {
        self.connection.take()
    }
}

impl<F: ConnectionFactory> Deref for Pooled<'_, F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        self.connection
            .as_ref()
            .expect("connection only taken when the guard is consumed")
    }
}

impl<F: ConnectionFactory> DerefMut for Pooled<'_, F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection
            .as_mut()
            .expect("connection only taken when the guard is consumed")
    }
}

impl<F: ConnectionFactory> Drop for Pooled<'_, F> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            trace!(site = %self.site, "pooled connection dropped without release");
            self.pool.close_connection(&self.site, connection);
        }
    }
}

/// Configuration for a connection pool.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// How long a released connection stays usable in the pool.
    pub keepalive_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            keepalive_timeout: Duration::from_secs(4),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::mock::{MockConnection, MockFactory};
    use super::*;
    use crate::tls::SslContext;

    use static_assertions::assert_impl_all;

    assert_impl_all!(Pool<MockFactory>: Send, Sync);

    fn site(url: &str) -> Site {
        url.parse().unwrap()
    }

    #[test]
    fn default_keepalive() {
        assert_eq!(Config::default().keepalive_timeout, Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn reuse_released_connection() {
        let _ = tracing_subscriber::fmt::try_init();

        let pool = Pool::new(MockFactory::default(), Config::default());
        let site = site("http://puppet:8140");

        let conn = pool.borrow(&site, None).await.unwrap();
        assert_eq!(conn.id(), 1);
        pool.release(&site, None, conn);
        assert_eq!(pool.idle_count(&site), 1);

        let conn = pool.borrow(&site, None).await.unwrap();
        assert_eq!(conn.id(), 1);
        assert_eq!(pool.factory().counters.created(), 1);
        assert_eq!(pool.idle_count(&site), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_connection_is_closed() {
        let _ = tracing_subscriber::fmt::try_init();

        let pool = Pool::new(MockFactory::default(), Config::default());
        let site = site("http://puppet:8140");

        let conn = pool.borrow(&site, None).await.unwrap();
        pool.release(&site, None, conn);

        tokio::time::advance(Duration::from_secs(4)).await;

        let conn = pool.borrow(&site, None).await.unwrap();
        assert_eq!(conn.id(), 2);
        assert_eq!(pool.factory().counters.finished(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_alive_before_keepalive() {
        let pool = Pool::new(MockFactory::default(), Config::default());
        let site = site("http://puppet:8140");

        let conn = pool.borrow(&site, None).await.unwrap();
        pool.release(&site, None, conn);

        tokio::time::advance(Duration::from_millis(3999)).await;

        let conn = pool.borrow(&site, None).await.unwrap();
        assert_eq!(conn.id(), 1);
        assert_eq!(pool.factory().counters.finished(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn most_recently_released_first() {
        let pool = Pool::new(MockFactory::default(), Config::default());
        let site = site("http://puppet:8140");

        let first = pool.borrow(&site, None).await.unwrap();
        let second = pool.borrow(&site, None).await.unwrap();
        assert_eq!(pool.factory().counters.created(), 2);

        pool.release(&site, None, first);
        pool.release(&site, None, second);

        assert_eq!(pool.borrow(&site, None).await.unwrap().id(), 2);
        assert_eq!(pool.borrow(&site, None).await.unwrap().id(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn verifier_mismatch_creates_new_connection() {
        let pool = Pool::new(MockFactory::default(), Config::default());
        let site = site("https://puppet:8140");
        let verified = Verifier::new("puppet", Arc::new(SslContext::default()));
        let insecure = Verifier::new("puppet", Arc::new(SslContext::insecure()));

        let conn = pool.borrow(&site, Some(&verified)).await.unwrap();
        pool.release(&site, Some(&verified), conn);

        let conn = pool.borrow(&site, Some(&insecure)).await.unwrap();
        assert_eq!(conn.id(), 2);
        assert_eq!(pool.idle_count(&site), 1);

        let conn = pool.borrow(&site, None).await.unwrap();
        assert_eq!(conn.id(), 3);

        let equivalent = Verifier::new("puppet", Arc::new(SslContext::default()));
        let conn = pool.borrow(&site, Some(&equivalent)).await.unwrap();
        assert_eq!(conn.id(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sites_are_independent() {
        let pool = Pool::new(MockFactory::default(), Config::default());
        let a = site("http://a:8140");
        let b = site("http://b:8140");

        let conn = pool.borrow(&a, None).await.unwrap();
        pool.release(&a, None, conn);

        let conn = pool.borrow(&b, None).await.unwrap();
        assert_eq!(conn.id(), 2);
        assert_eq!(pool.idle_count(&a), 1);
    }

    #[tokio::test]
    async fn start_failure_propagates() {
        let pool = Pool::new(MockFactory::failing(), Config::default());
        let site = site("http://puppet:8140");
        let error = pool.borrow(&site, None).await.unwrap_err();
        assert!(matches!(error, ConnectionError::ConnectTimeout));
        assert_eq!(pool.idle_count(&site), 0);
    }

    #[tokio::test]
    async fn close_connection_not_started() {
        let pool = Pool::new(MockFactory::default(), Config::default());
        let site = site("http://puppet:8140");

        let unstarted = pool.factory().create_connection(&site);
        assert!(!pool.close_connection(&site, unstarted));

        let started = MockConnection::started(7);
        assert!(pool.close_connection(&site, started));
    }

    #[tokio::test(start_paused = true)]
    async fn close_closes_every_connection_once() {
        let pool = Pool::new(MockFactory::default(), Config::default());
        let a = site("http://a:8140");
        let b = site("http://b:8140");

        let first = pool.borrow(&a, None).await.unwrap();
        let second = pool.borrow(&a, None).await.unwrap();
        let third = pool.borrow(&b, None).await.unwrap();
        pool.release(&a, None, first);
        pool.release(&a, None, second);
        pool.release(&b, None, third);

        pool.close();
        assert_eq!(pool.factory().counters.finished(), 3);
        assert_eq!(pool.idle_count(&a), 0);
        assert_eq!(pool.idle_count(&b), 0);

        pool.close();
        assert_eq!(pool.factory().counters.finished(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn pooled_release_and_drop() {
        let pool = Pool::new(MockFactory::default(), Config::default());
        let site = site("http://puppet:8140");

        let pooled = pool.checkout(&site, None).await.unwrap();
        assert!(pooled.is_reusable());
        pooled.release();
        assert_eq!(pool.idle_count(&site), 1);

        let pooled = pool.checkout(&site, None).await.unwrap();
        assert_eq!(pooled.id(), 1);
        drop(pooled);
        assert_eq!(pool.idle_count(&site), 0);
        assert_eq!(pool.factory().counters.finished(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pooled_close_finishes_once() {
        let pool = Pool::new(MockFactory::default(), Config::default());
        let site = site("http://puppet:8140");

        let mut pooled = pool.checkout(&site, None).await.unwrap();
        let connection: &mut MockConnection = &mut pooled;
        assert_eq!(connection.id(), 1);

        assert!(pooled.close());
        assert_eq!(pool.factory().counters.finished(), 1);
        assert_eq!(pool.idle_count(&site), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unverified_secure_connection_not_reused() {
        let pool = Pool::new(MockFactory::default(), Config::default());
        let site = site("https://puppet:8140");
        let insecure = Verifier::new("puppet", Arc::new(SslContext::insecure()));

        let pooled = pool.checkout(&site, Some(&insecure)).await.unwrap();
        assert!(!pooled.is_reusable());
        pooled.release();
        assert_eq!(pool.idle_count(&site), 0);
        assert_eq!(pool.factory().counters.finished(), 1);

        let verified = Verifier::new("puppet", Arc::new(SslContext::default()));
        let pooled = pool.checkout(&site, Some(&verified)).await.unwrap();
        assert!(pooled.is_reusable());
        pooled.release();
        assert_eq!(pool.idle_count(&site), 1);
    }
}
