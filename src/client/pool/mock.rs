use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::client::conn::{Connection, ConnectionError, ConnectionFactory, ConnectionState};
use crate::client::Site;
use crate::tls::Verifier;

/// Counters shared between a [`MockFactory`] and the connections it creates.
#[derive(Debug, Default)]
pub(crate) struct MockCounters {
    pub(crate) created: AtomicUsize,
    pub(crate) started: AtomicUsize,
    pub(crate) finished: AtomicUsize,
}

impl MockCounters {
    pub(crate) fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub(crate) fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub(crate) fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub(crate) struct MockConnection {
    id: usize,
    state: ConnectionState,
    peer_verified: bool,
    fail_start: bool,
    counters: Arc<MockCounters>,
}

impl MockConnection {
    pub(crate) fn started(id: usize) -> Self {
        Self {
            id,
            state: ConnectionState::Started,
            peer_verified: false,
            fail_start: false,
            counters: Arc::default(),
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// Simulate the peer closing the connection.
    pub(crate) fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn start(&mut self, verifier: Option<&Verifier>) -> Result<(), ConnectionError> {
        if self.fail_start {
            return Err(ConnectionError::ConnectTimeout);
        }
        self.counters.started.fetch_add(1, Ordering::SeqCst);
        self.peer_verified = verifier.is_some_and(Verifier::verify_peer);
        self.state = ConnectionState::Started;
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn is_open(&self) -> bool {
        self.state == ConnectionState::Started
    }

    fn is_peer_verified(&self) -> bool {
        self.peer_verified
    }

    fn finish(&mut self) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::Started {
            return Err(ConnectionError::NotStarted);
        }
        self.counters.finished.fetch_add(1, Ordering::SeqCst);
        self.state = ConnectionState::Closed;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub(crate) struct MockFactory {
    pub(crate) counters: Arc<MockCounters>,
    pub(crate) fail_start: bool,
}

impl MockFactory {
    pub(crate) fn failing() -> Self {
        Self {
            fail_start: true,
            ..Default::default()
        }
    }
}

impl ConnectionFactory for MockFactory {
    type Connection = MockConnection;

    fn create_connection(&self, _site: &Site) -> Self::Connection {
        let id = self.counters.created.fetch_add(1, Ordering::SeqCst) + 1;
        MockConnection {
            id,
            state: ConnectionState::NotStarted,
            peer_verified: false,
            fail_start: self.fail_start,
            counters: self.counters.clone(),
        }
    }
}
