//! DNS SRV service discovery.
//!
//! Services are advertised as `_x-puppet._tcp.<domain>` (the generic
//! service) or `_x-puppet-<service>._tcp.<domain>`. Records are grouped by
//! ascending priority; inside a group, servers are picked by weighted random
//! selection without replacement, so heavier servers tend to be tried first.
//!
//! Results are cached per service name for the minimum TTL of the returned
//! records. When a specific service has no records, the generic service is
//! used instead.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::BoxError;

mod hickory;

pub use self::hickory::HickoryLookup;

/// The service every other service falls back to.
pub const GENERIC_SERVICE: &str = "puppet";

/// One SRV record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    /// Target host, without a trailing dot.
    pub target: String,
    /// Target port.
    pub port: u16,
    /// Lower is preferred.
    pub priority: u16,
    /// Relative weight within a priority group.
    pub weight: u16,
    /// How long the record may be cached.
    pub ttl: Duration,
}

impl SrvRecord {
    /// A record with the given fields.
    pub fn new(target: impl Into<String>, port: u16, priority: u16, weight: u16, ttl: Duration) -> Self {
        Self {
            target: target.into(),
            port,
            priority,
            weight,
            ttl,
        }
    }

    /// Weight used for selection: zero-weight records still get a small chance.
    fn effective_weight(&self) -> u32 {
        match self.weight {
            0 => 1,
            weight => u32::from(weight) * 10,
        }
    }
}

/// Looks up SRV records by fully qualified record name.
#[async_trait]
pub trait SrvLookup: fmt::Debug + Send + Sync {
    /// Query `name`. An empty result means the name has no SRV records.
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>, BoxError>;
}

#[derive(Debug)]
struct CacheEntry {
    records: Arc<[SrvRecord]>,
    ttl: Duration,
    resolved_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.resolved_at + self.ttl
    }
}

/// Resolves logical service names to candidate servers via SRV records.
#[derive(Debug)]
pub struct DnsResolver {
    lookup: Box<dyn SrvLookup>,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new(HickoryLookup::default())
    }
}

impl DnsResolver {
    /// A resolver using `lookup` for queries.
    pub fn new<L: SrvLookup + 'static>(lookup: L) -> Self {
        Self {
            lookup: Box::new(lookup),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The SRV record name for `service` in `domain`.
    pub fn srv_name(domain: &str, service: &str) -> String {
        if service == GENERIC_SERVICE {
            format!("_x-puppet._tcp.{domain}")
        } else {
            format!("_x-puppet-{service}._tcp.{domain}")
        }
    }

    /// Candidate `(host, port)` pairs for `service` in `domain`, in the order
    /// they should be tried.
    ///
    /// Each call re-runs the weighted ordering; lookups are served from the
    /// cache while it is fresh.
    pub async fn each_srv_record(&self, domain: &str, service: &str) -> SrvRecords {
        if domain.is_empty() {
            debug!("Domain not known; skipping SRV lookup");
            return SrvRecords::new(&[]);
        }

        let mut service = service;
        loop {
            let records = self.records_for(domain, service).await;
            if !records.is_empty() || service == GENERIC_SERVICE {
                return SrvRecords::new(&records);
            }

            debug!("No SRV records found for {service}; falling back to {GENERIC_SERVICE}");
            service = GENERIC_SERVICE;
        }
    }

    /// The TTL of the cached records for `service`.
    pub fn ttl(&self, service: &str) -> Option<Duration> {
        self.cache.lock().get(service).map(|entry| entry.ttl)
    }

    /// Whether the cached records for `service` are missing or stale.
    pub fn is_expired(&self, service: &str) -> bool {
        self.cache
            .lock()
            .get(service)
            .map_or(true, |entry| entry.is_expired(Instant::now()))
    }

    async fn records_for(&self, domain: &str, service: &str) -> Arc<[SrvRecord]> {
        if let Some(records) = self.cached(service) {
            debug!("Using cached SRV records for {service}");
            return records;
        }

        let name = Self::srv_name(domain, service);
        debug!("Searching for SRV records for domain: {name}");

        let records = match self.lookup.lookup_srv(&name).await {
            Ok(records) => records,
            Err(error) => {
                warn!("SRV lookup for {name} failed: {error}");
                Vec::new()
            }
        };

        if records.is_empty() {
            return Arc::from(records);
        }

        let ttl = records
            .iter()
            .map(|record| record.ttl)
            .min()
            .unwrap_or_default();
        let records: Arc<[SrvRecord]> = Arc::from(records);
        self.cache.lock().insert(
            service.to_owned(),
            CacheEntry {
                records: records.clone(),
                ttl,
                resolved_at: Instant::now(),
            },
        );

        records
    }

    fn cached(&self, service: &str) -> Option<Arc<[SrvRecord]>> {
        let cache = self.cache.lock();
        cache
            .get(service)
            .filter(|entry| !entry.is_expired(Instant::now()))
            .map(|entry| entry.records.clone())
    }
}

/// Pick a record from `records` by weight, using a draw from `rng`.
///
/// A single record is returned without drawing.
pub fn find_weighted_server<'r, R: Rng + ?Sized>(
    records: &'r [SrvRecord],
    rng: &mut R,
) -> Option<&'r SrvRecord> {
    weighted_index(records, rng).map(|index| &records[index])
}

fn weighted_index<R: Rng + ?Sized>(records: &[SrvRecord], rng: &mut R) -> Option<usize> {
    match records.len() {
        0 => None,
        1 => Some(0),
        _ => {
            let total: u32 = records.iter().map(SrvRecord::effective_weight).sum();
            let chosen = rng.random_range(1..=total);
            select_weighted(records, chosen)
        }
    }
}

/// The index of the first record whose running weight total reaches `chosen`.
pub fn select_weighted(records: &[SrvRecord], chosen: u32) -> Option<usize> {
    let mut running = 0;
    records.iter().position(|record| {
        running += record.effective_weight();
        running >= chosen
    })
}

/// Candidate servers in the order they should be tried.
///
/// Priority groups are exhausted in ascending order. Within a group, each
/// step removes one server chosen by weight.
#[derive(Debug)]
pub struct SrvRecords {
    groups: VecDeque<Vec<SrvRecord>>,
    current: Vec<SrvRecord>,
    rng: StdRng,
}

impl SrvRecords {
    fn new(records: &[SrvRecord]) -> Self {
        Self::with_rng(records, StdRng::from_rng(&mut rand::rng()))
    }

    /// Order `records` using `rng` for weighted selection.
    pub fn with_rng(records: &[SrvRecord], rng: StdRng) -> Self {
        let mut groups: BTreeMap<u16, Vec<SrvRecord>> = BTreeMap::new();
        for record in records {
            groups
                .entry(record.priority)
                .or_default()
                .push(record.clone());
        }

        Self {
            groups: groups.into_values().collect(),
            current: Vec::new(),
            rng,
        }
    }
}

impl Iterator for SrvRecords {
    type Item = (String, u16);

    fn next(&mut self) -> Option<Self::Item> {
        while self.current.is_empty() {
            self.current = self.groups.pop_front()?;
        }

        let index = weighted_index(&self.current, &mut self.rng)?;
        let record = self.current.remove(index);
        Some((record.target, record.port))
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves fixed answers and counts queries.
    #[derive(Debug, Default)]
    pub(crate) struct StaticLookup {
        answers: HashMap<String, Vec<SrvRecord>>,
        pub(crate) queries: Arc<AtomicUsize>,
    }

    impl StaticLookup {
        pub(crate) fn with(mut self, name: &str, records: Vec<SrvRecord>) -> Self {
            self.answers.insert(name.to_owned(), records);
            self
        }

        pub(crate) fn counter(&self) -> Arc<AtomicUsize> {
            self.queries.clone()
        }
    }

    #[async_trait]
    impl SrvLookup for StaticLookup {
        async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>, BoxError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            match self.answers.get(name) {
                Some(records) => Ok(records.clone()),
                None => Err(format!("no such name: {name}").into()),
            }
        }
    }
}
