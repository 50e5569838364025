use std::collections::VecDeque;

use tokio::time::Instant;
use tracing::trace;

use crate::client::conn::Connection;
use crate::tls::Verifier;

/// A pooled connection, the verifier which established it and when it expires.
#[derive(Debug)]
pub(super) struct PoolEntry<C> {
    pub(super) connection: C,
    verifier: Option<Verifier>,
    expires_at: Instant,
}

impl<C> PoolEntry<C> {
    pub(super) fn new(connection: C, verifier: Option<Verifier>, expires_at: Instant) -> Self {
        Self {
            connection,
            verifier,
            expires_at,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }

    /// `None` only matches `None`.
    fn matches(&self, verifier: Option<&Verifier>) -> bool {
        match (&self.verifier, verifier) {
            (None, None) => true,
            (Some(ours), Some(theirs)) => theirs.reusable(ours),
            _ => false,
        }
    }
}

/// Idle connections for a single site, most recently released first.
#[derive(Debug)]
pub(super) struct IdleConnections<C> {
    inner: VecDeque<PoolEntry<C>>,
}

impl<C> Default for IdleConnections<C> {
    fn default() -> Self {
        Self {
            inner: VecDeque::new(),
        }
    }
}

impl<C> IdleConnections<C> {
    pub(super) fn push(&mut self, entry: PoolEntry<C>) {
        self.inner.push_front(entry);
    }

    /// Remove and return every entry which has expired at `now`.
    pub(super) fn evict_expired(&mut self, now: Instant) -> Vec<PoolEntry<C>> {
        let (expired, live): (Vec<_>, Vec<_>) =
            self.inner.drain(..).partition(|entry| entry.is_expired(now));
        self.inner = live.into();
        expired
    }

    /// Take the most recently released open connection whose verifier is
    /// reusable with `verifier`. Closed connections found on the way are dropped.
    pub(super) fn take_reusable(&mut self, verifier: Option<&Verifier>) -> Option<C>
    where
        C: Connection,
    {
        self.inner.retain(|entry| {
            let open = entry.connection.is_open();
            if !open {
                trace!("dropping closed idle connection");
            }
            open
        });

        let index = self.inner.iter().position(|entry| entry.matches(verifier))?;
        self.inner.remove(index).map(|entry| entry.connection)
    }

    pub(super) fn len(&self) -> usize {
        self.inner.len()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<C> IntoIterator for IdleConnections<C> {
    type Item = PoolEntry<C>;
    type IntoIter = std::collections::vec_deque::IntoIter<PoolEntry<C>>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::client::pool::mock::MockConnection;
    use crate::tls::SslContext;

    fn entry(id: usize, verifier: Option<Verifier>, expires_at: Instant) -> PoolEntry<MockConnection> {
        PoolEntry::new(MockConnection::started(id), verifier, expires_at)
    }

    #[tokio::test(start_paused = true)]
    async fn most_recent_first() {
        let later = Instant::now() + Duration::from_secs(4);
        let mut idle = IdleConnections::default();
        idle.push(entry(1, None, later));
        idle.push(entry(2, None, later));
        assert_eq!(idle.len(), 2);

        assert_eq!(idle.take_reusable(None).unwrap().id(), 2);
        assert_eq!(idle.take_reusable(None).unwrap().id(), 1);
        assert!(idle.take_reusable(None).is_none());
        assert!(idle.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_is_inclusive() {
        let now = Instant::now();
        let mut idle = IdleConnections::default();
        idle.push(entry(1, None, now));
        idle.push(entry(2, None, now + Duration::from_secs(1)));

        let expired = idle.evict_expired(now);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].connection.id(), 1);
        assert_eq!(idle.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn verifier_matching() {
        let later = Instant::now() + Duration::from_secs(4);
        let context = Arc::new(SslContext::default());
        let verifier = Verifier::new("puppet", context.clone());
        let insecure = Verifier::new("puppet", Arc::new(SslContext::insecure()));

        let mut idle = IdleConnections::default();
        idle.push(entry(1, None, later));
        idle.push(entry(2, Some(verifier.clone()), later));

        assert!(idle.take_reusable(Some(&insecure)).is_none());
        assert_eq!(idle.take_reusable(Some(&verifier)).unwrap().id(), 2);
        assert!(idle.take_reusable(Some(&verifier)).is_none());
        assert_eq!(idle.take_reusable(None).unwrap().id(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_connections_skipped() {
        let later = Instant::now() + Duration::from_secs(4);
        let mut idle = IdleConnections::default();
        idle.push(entry(1, None, later));
        let mut closed = entry(2, None, later);
        closed.connection.close();
        idle.push(closed);

        assert_eq!(idle.take_reusable(None).unwrap().id(), 1);
        assert!(idle.is_empty());
    }
}
