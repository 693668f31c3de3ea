use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::error::{ProbeError, Result};

/// Read side of the analysis store as seen by the refresh scheduler.
///
/// Offsets are positions within an interval's repeating cycle, measured from
/// the cycle start. Windows are half-open `(since, until]` and wrap past the
/// end of the cycle when `until < since`; equal bounds select nothing.
#[async_trait]
pub trait AnalysisStore: Send + Sync {
    /// Every refresh interval at least one stored name uses.
    async fn distinct_refresh_intervals(&self) -> Result<BTreeSet<Duration>>;

    /// Current position within `interval`'s cycle. Pure apart from reading
    /// the clock.
    fn offset_for_interval(&self, interval: Duration) -> Duration;

    /// Names on `interval` whose refresh offset falls in `(since, until]`.
    async fn names_due_for_refresh(
        &self,
        interval: Duration,
        since: Duration,
        until: Duration,
    ) -> Result<BTreeSet<String>>;
}

impl fmt::Debug for dyn AnalysisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AnalysisStore")
    }
}

/// Whether `offset` lies in the half-open window `(since, until]`.
pub fn window_contains(since: Duration, until: Duration, offset: Duration) -> bool {
    if since <= until {
        since < offset && offset <= until
    } else {
        offset > since || offset <= until
    }
}

/// Wall-clock source, in whole seconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_epoch_secs(&self) -> u64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_secs(&self) -> u64 {
        u64::try_from(Utc::now().timestamp()).unwrap_or(0)
    }
}

/// Settable clock for driving a store through cycles by hand.
#[derive(Debug, Default)]
pub struct ManualClock {
    secs: AtomicU64,
}

impl ManualClock {
    pub fn new(secs: u64) -> Self {
        Self {
            secs: AtomicU64::new(secs),
        }
    }

    pub fn set(&self, secs: u64) {
        self.secs.store(secs, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.secs.fetch_add(by.as_secs(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_epoch_secs(&self) -> u64 {
        self.secs.load(Ordering::SeqCst)
    }
}

/// One stored name and where in its interval's cycle it is refreshed.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DomainEntry {
    pub name: String,
    pub refresh_interval: Duration,
    pub refresh_offset: Duration,
}

impl DomainEntry {
    /// Places the name at a stable, hash-derived offset so names sharing an
    /// interval spread over its cycle.
    pub fn new(name: impl Into<String>, refresh_interval: Duration) -> Self {
        let name = normalize(&name.into());
        let refresh_offset = hashed_offset(&name, refresh_interval);
        Self {
            name,
            refresh_interval,
            refresh_offset,
        }
    }

    pub fn with_offset(mut self, offset: Duration) -> Self {
        self.refresh_offset = offset;
        self
    }
}

fn normalize(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

fn hashed_offset(name: &str, interval: Duration) -> Duration {
    let secs = interval.as_secs();
    if secs == 0 {
        return Duration::ZERO;
    }
    let digest = Sha256::digest(name.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    Duration::from_secs(u64::from_be_bytes(prefix) % secs)
}

/// Process-local store keyed by lowercased name.
pub struct MemoryStore<C: Clock = SystemClock> {
    entries: RwLock<BTreeMap<String, DomainEntry>>,
    clock: C,
}

impl<C: Clock> fmt::Debug for MemoryStore<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("now_epoch_secs", &self.clock.now_epoch_secs())
            .finish_non_exhaustive()
    }
}

impl MemoryStore<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for MemoryStore<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> MemoryStore<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            clock,
        }
    }

    /// Builds a store from entries up front; later duplicates replace
    /// earlier ones.
    pub fn from_entries<I>(clock: C, entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = DomainEntry>,
    {
        let mut map = BTreeMap::new();
        for entry in entries {
            let entry = checked(entry)?;
            map.insert(entry.name.clone(), entry);
        }
        Ok(Self {
            entries: RwLock::new(map),
            clock,
        })
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub async fn insert(&self, entry: DomainEntry) -> Result<()> {
        let entry = checked(entry)?;
        self.entries.write().await.insert(entry.name.clone(), entry);
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> Option<DomainEntry> {
        self.entries.write().await.remove(&normalize(name))
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

fn checked(mut entry: DomainEntry) -> Result<DomainEntry> {
    entry.name = normalize(&entry.name);
    if entry.name.is_empty() {
        return Err(ProbeError::Store("empty domain name".into()));
    }
    let secs = entry.refresh_interval.as_secs();
    if secs == 0 {
        return Err(ProbeError::Store(format!(
            "refresh interval for {} must be at least one second",
            entry.name
        )));
    }
    entry.refresh_interval = Duration::from_secs(secs);
    if entry.refresh_offset >= entry.refresh_interval {
        return Err(ProbeError::Store(format!(
            "refresh offset for {} lies outside its interval",
            entry.name
        )));
    }
    Ok(entry)
}

#[async_trait]
impl<C: Clock> AnalysisStore for MemoryStore<C> {
    async fn distinct_refresh_intervals(&self) -> Result<BTreeSet<Duration>> {
        Ok(self
            .entries
            .read()
            .await
            .values()
            .map(|entry| entry.refresh_interval)
            .collect())
    }

    fn offset_for_interval(&self, interval: Duration) -> Duration {
        match interval.as_secs() {
            0 => Duration::ZERO,
            secs => Duration::from_secs(self.clock.now_epoch_secs() % secs),
        }
    }

    async fn names_due_for_refresh(
        &self,
        interval: Duration,
        since: Duration,
        until: Duration,
    ) -> Result<BTreeSet<String>> {
        Ok(self
            .entries
            .read()
            .await
            .values()
            .filter(|entry| entry.refresh_interval == interval)
            .filter(|entry| window_contains(since, until, entry.refresh_offset))
            .map(|entry| entry.name.clone())
            .collect())
    }
}
